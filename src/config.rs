use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Bytes accumulated by the stream sink before a chunk is flushed to the client.
pub const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Number of in-flight chunks the streaming channel may hold before the
/// archive producer blocks. Bounds memory use per download.
pub const STREAM_CHANNEL_CAPACITY: usize = 8;

/// Route prefix for the download API.
pub const API_PREFIX: &str = "/api/v1";

/// Top-level configuration for the download service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub host: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Base directory for service data.
    pub base_path: PathBuf,
    /// Directory holding one subdirectory per compendium.
    pub compendium_path: PathBuf,
    /// JSON registry file with compendium and job records.
    pub registry_file: PathBuf,
    /// Container engine endpoint, `tcp://` or `http://`.
    pub docker_host: String,
    /// Prefix prepended to a job id to form the image tag.
    pub image_prefix: String,
    /// Relative path of the cached image tarball inside a compendium directory.
    pub image_tarball_file: String,
    /// Whether downloads include the image tarball when the request does not say.
    pub include_image_default: bool,
    /// Whether image materialization only considers successfully finished jobs.
    pub require_successful_job: bool,
    /// Maximum concurrent stat calls during the archive tree scan.
    pub stat_concurrency: usize,
    /// Upper bound in seconds for fetching and persisting an image tarball.
    pub materialize_timeout_secs: u64,
    /// Upper bound in seconds for one archive download stream.
    pub stream_deadline_secs: u64,
    /// Include raw error detail in 500 response bodies.
    pub debug_errors: bool,
    /// Service name used in provenance metadata (ZIP archive comment).
    pub service_name: String,
}

impl Default for Config {
    fn default() -> Self {
        let base_path = PathBuf::from("/tmp/transporter");
        Self {
            host: "0.0.0.0".to_string(),
            port: 8086,
            compendium_path: base_path.join("compendium"),
            registry_file: base_path.join("registry.json"),
            base_path,
            docker_host: "http://localhost:2375".to_string(),
            image_prefix: "compendium:".to_string(),
            image_tarball_file: "image.tar".to_string(),
            include_image_default: true,
            require_successful_job: true,
            stat_concurrency: 4,
            materialize_timeout_secs: 600,
            stream_deadline_secs: 3600,
            debug_errors: false,
            service_name: "transporter".to_string(),
        }
    }
}

impl Config {
    /// Builds a configuration from defaults overridden by `TRANSPORTER_*`
    /// environment variables (plus `DOCKER_HOST` for the engine endpoint).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(host) = env_var("TRANSPORTER_HOST") {
            cfg.host = host;
        }
        if let Some(port) = env_parse("TRANSPORTER_PORT") {
            cfg.port = port;
        }
        if let Some(base) = env_var("TRANSPORTER_BASEPATH") {
            cfg.base_path = PathBuf::from(base);
            cfg.compendium_path = cfg.base_path.join("compendium");
            cfg.registry_file = cfg.base_path.join("registry.json");
        }
        if let Some(registry) = env_var("TRANSPORTER_REGISTRY") {
            cfg.registry_file = PathBuf::from(registry);
        }
        if let Some(docker) = env_var("DOCKER_HOST") {
            cfg.docker_host = docker;
        }
        if let Some(prefix) = env_var("TRANSPORTER_IMAGE_PREFIX") {
            cfg.image_prefix = prefix;
        }
        if let Some(file) = env_var("TRANSPORTER_IMAGE_FILE") {
            cfg.image_tarball_file = file;
        }
        if let Some(include) = env_parse("TRANSPORTER_INCLUDE_IMAGE") {
            cfg.include_image_default = include;
        }
        if let Some(require) = env_parse("TRANSPORTER_REQUIRE_SUCCESS") {
            cfg.require_successful_job = require;
        }
        if let Some(n) = env_parse("TRANSPORTER_STAT_CONCURRENCY") {
            cfg.stat_concurrency = n;
        }
        if let Some(secs) = env_parse("TRANSPORTER_MATERIALIZE_TIMEOUT") {
            cfg.materialize_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("TRANSPORTER_STREAM_DEADLINE") {
            cfg.stream_deadline_secs = secs;
        }
        if let Some(debug) = env_parse("TRANSPORTER_DEBUG_ERRORS") {
            cfg.debug_errors = debug;
        }
        cfg
    }

    /// Directory that holds the given compendium's file tree.
    pub fn compendium_dir(&self, compendium_id: &str) -> PathBuf {
        self.compendium_path.join(compendium_id)
    }

    /// Absolute path of the cached image tarball for a compendium directory.
    pub fn artifact_path(&self, compendium_dir: &Path) -> PathBuf {
        compendium_dir.join(&self.image_tarball_file)
    }

    pub fn materialize_timeout(&self) -> Duration {
        Duration::from_secs(self.materialize_timeout_secs)
    }

    pub fn stream_deadline(&self) -> Duration {
        Duration::from_secs(self.stream_deadline_secs)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}
