use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Raw image tarball bytes in the engine's save format.
pub type ImageStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("image {0} not present in the container engine")]
    ImageNotFound(String),
    #[error("container engine returned HTTP {0}")]
    Status(StatusCode),
    #[error("container engine request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Subset of the engine's image inspection payload we care about.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
}

/// The container engine as seen by the materializer. Inspection is
/// best-effort metadata; export is the byte stream that gets persisted.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn inspect_image(&self, tag: &str) -> Result<ImageInfo, EngineError>;
    async fn export_image(&self, tag: &str) -> Result<ImageStream, EngineError>;
}

/// Talks to a Docker-compatible engine over its HTTP API
/// (`GET /images/{tag}/json`, `GET /images/{tag}/get`).
pub struct DockerEngine {
    client: Client,
    base_url: String,
}

impl DockerEngine {
    pub fn new(docker_host: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: normalize_host(docker_host),
        }
    }

    fn image_url(&self, tag: &str, op: &str) -> String {
        format!("{}/images/{}/{}", self.base_url, encode_tag(tag), op)
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn inspect_image(&self, tag: &str) -> Result<ImageInfo, EngineError> {
        let resp = self.client.get(self.image_url(tag, "json")).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::ImageNotFound(tag.to_string()));
        }
        if !status.is_success() {
            warn!("image inspect failed status={} tag={}", status.as_u16(), tag);
            return Err(EngineError::Status(status));
        }
        let info: ImageInfo = resp.json().await?;
        debug!("image inspect tag={} id={} size={}", tag, info.id, info.size);
        Ok(info)
    }

    async fn export_image(&self, tag: &str) -> Result<ImageStream, EngineError> {
        let resp = self.client.get(self.image_url(tag, "get")).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::ImageNotFound(tag.to_string()));
        }
        if !status.is_success() {
            warn!("image export failed status={} tag={}", status.as_u16(), tag);
            return Err(EngineError::Status(status));
        }
        let stream = resp
            .bytes_stream()
            .map_err(io::Error::other)
            .boxed();
        Ok(stream)
    }
}

/// `DOCKER_HOST` conventionally uses a `tcp://` scheme for the HTTP API.
fn normalize_host(docker_host: &str) -> String {
    let host = docker_host.trim_end_matches('/');
    if let Some(rest) = host.strip_prefix("tcp://") {
        return format!("http://{}", rest);
    }
    if host.starts_with("unix://") {
        warn!("unix socket engine endpoints are not supported, set DOCKER_HOST to tcp://");
    }
    host.to_string()
}

/// Keeps an image tag a single path segment. Tags may carry a registry
/// prefix with slashes (`registry/repo:tag`).
fn encode_tag(tag: &str) -> String {
    let mut out = String::with_capacity(tag.len());
    for ch in tag.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '?' => out.push_str("%3F"),
            '#' => out.push_str("%23"),
            ' ' => out.push_str("%20"),
            _ => out.push(ch),
        }
    }
    out
}
