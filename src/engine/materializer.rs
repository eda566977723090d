use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::TryStreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::docker::{ContainerEngine, EngineError};
use crate::store::JobStore;

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("no job found for this compendium")]
    NoJob,
    #[error("image {0} not found in the container engine")]
    ImageNotFound(String),
    #[error("writing image tarball failed: {0}")]
    WriteFailed(#[from] io::Error),
    #[error("container engine error: {0}")]
    Engine(EngineError),
    #[error("job lookup failed: {0}")]
    Store(#[source] anyhow::Error),
    #[error("image fetch timed out")]
    Timeout,
}

/// Fetches a compendium's container image from the engine and persists it as
/// the cached tarball inside the compendium directory. The on-disk file is a
/// persistent cache: once present it is reused and the engine is never asked
/// again. Concurrent requests for the same compendium share one fetch; the
/// first caller becomes the leader, the rest wait and then re-check the
/// artifact.
pub struct ImageMaterializer {
    config: Arc<Config>,
    jobs: Arc<dyn JobStore>,
    engine: Arc<dyn ContainerEngine>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ImageMaterializer {
    pub fn new(
        config: Arc<Config>,
        jobs: Arc<dyn JobStore>,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        Self {
            config,
            jobs,
            engine,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures the image tarball exists under `compendium_dir` and returns
    /// its path. Must complete before any tree traversal: the archive scan
    /// cannot pick up a file that is not on disk yet.
    pub async fn materialize(
        &self,
        compendium_id: &str,
        compendium_dir: &Path,
    ) -> Result<PathBuf, MaterializeError> {
        let artifact = self.config.artifact_path(compendium_dir);
        loop {
            if tokio::fs::try_exists(&artifact).await? {
                debug!(
                    "image tarball already on disk at {}, skipping fetch",
                    artifact.display()
                );
                return Ok(artifact);
            }

            // A waiter's Notified future must be created while the entry
            // is still in the map: the leader notifies only after removing
            // the entry under the same lock, so a future created here
            // cannot miss that wakeup, while one created after release
            // could snapshot a generation that already includes it and
            // park forever.
            let notify: Arc<Notify>;
            let waiter = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(compendium_id) {
                    Some(existing) => {
                        notify = Arc::clone(existing);
                        Some(notify.notified())
                    }
                    None => {
                        in_flight.insert(compendium_id.to_string(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            match waiter {
                Some(notified) => {
                    // Completes immediately when the leader finished before
                    // this task got to await; the artifact check on the
                    // next loop pass settles it either way.
                    notified.await;
                    debug!("materialization leader finished for {}", compendium_id);
                }
                None => {
                    let result = self.fetch_and_persist(compendium_id, &artifact).await;
                    let removed = self.in_flight.lock().remove(compendium_id);
                    if let Some(removed) = removed {
                        removed.notify_waiters();
                    }
                    return result;
                }
            }
        }
    }

    async fn fetch_and_persist(
        &self,
        compendium_id: &str,
        artifact: &Path,
    ) -> Result<PathBuf, MaterializeError> {
        let job = self
            .jobs
            .latest_job(compendium_id, self.config.require_successful_job)
            .await
            .map_err(MaterializeError::Store)?
            .ok_or(MaterializeError::NoJob)?;
        let tag = format!("{}{}", self.config.image_prefix, job.id);
        info!(
            "materializing image tag={} for compendium {} (job updated {})",
            tag, compendium_id, job.updated_at
        );

        match tokio::time::timeout(
            self.config.materialize_timeout(),
            self.write_image(&tag, artifact),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("image fetch timed out tag={}", tag);
                Err(MaterializeError::Timeout)
            }
        }
    }

    async fn write_image(&self, tag: &str, artifact: &Path) -> Result<PathBuf, MaterializeError> {
        // Inspection is informational; the export below can still succeed
        // when it fails.
        match self.engine.inspect_image(tag).await {
            Ok(info) => debug!("image inspect tag={} id={} size={}", tag, info.id, info.size),
            Err(err) => warn!("image inspection failed for {}: {}", tag, err),
        }

        let mut stream = self.engine.export_image(tag).await.map_err(|err| match err {
            EngineError::ImageNotFound(tag) => MaterializeError::ImageNotFound(tag),
            other => MaterializeError::Engine(other),
        })?;

        if let Some(parent) = artifact.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(artifact);
        let write = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut written = 0u64;
            while let Some(chunk) = stream.try_next().await? {
                written += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            // Rename is atomic, so a concurrent reader sees either no
            // artifact or the complete one, never a partial write.
            tokio::fs::rename(&partial, artifact).await?;
            Ok::<u64, io::Error>(written)
        }
        .await;

        match write {
            Ok(written) => {
                info!(
                    "saved image tarball to {} ({} bytes)",
                    artifact.display(),
                    written
                );
                Ok(artifact.to_path_buf())
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                warn!("saving image tarball failed: {}", err);
                Err(MaterializeError::WriteFailed(err))
            }
        }
    }
}

/// Temp path next to the destination so the final rename stays on one
/// filesystem.
pub(crate) fn partial_path(destination: &Path) -> PathBuf {
    let mut path = destination.to_path_buf();
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => path.set_extension(format!("{}.partial", ext)),
        None => path.set_extension("partial"),
    };
    path
}
