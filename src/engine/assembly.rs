use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::writer::provenance_comment;
use crate::archive::{
    scan, ArchiveFormat, ArchiveOptions, ArchiveWriter, ChannelWriter, TreeEntry,
};
use crate::config::{Config, STREAM_CHANNEL_CAPACITY};
use crate::engine::docker::ContainerEngine;
use crate::engine::materializer::{partial_path, ImageMaterializer, MaterializeError};
use crate::store::{CompendiumStore, JobStore};

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("no compendium with this id")]
    NotFound,
    #[error("compendium directory {} is missing", .0.display())]
    DirectoryMissing(PathBuf),
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error("reading compendium tree failed: {0}")]
    Scan(#[source] io::Error),
    #[error("compendium lookup failed: {0}")]
    Store(#[source] anyhow::Error),
}

/// Parameters of one download, as resolved by the HTTP boundary.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub compendium_id: String,
    pub format: ArchiveFormat,
    pub gzip: bool,
    /// None means "use the configured default".
    pub include_image: Option<bool>,
    /// Originating URL, kept as provenance metadata in ZIP output.
    pub origin: String,
}

/// A live archive stream, ready to be wired to a response body. Dropping
/// the receiver tears the producer down.
pub struct ArchiveStream {
    pub filename: String,
    pub content_type: &'static str,
    pub body: mpsc::Receiver<io::Result<Bytes>>,
}

/// Drives one download from lookup to streaming: resolve the compendium,
/// apply the image policy, materialize if needed, then hand the scanned
/// tree to an archive writer on a blocking task. Everything up to that
/// hand-off can still fail into a clean JSON response; afterwards errors
/// only truncate the stream.
pub struct Assembler {
    config: Arc<Config>,
    compendia: Arc<dyn CompendiumStore>,
    materializer: ImageMaterializer,
}

impl Assembler {
    pub fn new(
        config: Arc<Config>,
        compendia: Arc<dyn CompendiumStore>,
        jobs: Arc<dyn JobStore>,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        let materializer = ImageMaterializer::new(Arc::clone(&config), jobs, engine);
        Self {
            config,
            compendia,
            materializer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn assemble(&self, request: ArchiveRequest) -> Result<ArchiveStream, AssemblyError> {
        self.compendia
            .find_by_id(&request.compendium_id)
            .await
            .map_err(AssemblyError::Store)?
            .ok_or(AssemblyError::NotFound)?;

        let dir = self.config.compendium_dir(&request.compendium_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(AssemblyError::DirectoryMissing(dir));
        }

        let include_image = request
            .include_image
            .unwrap_or(self.config.include_image_default);
        let gzip = request.gzip && request.format == ArchiveFormat::Tar;
        debug!(
            "assembling {} format={:?} gzip={} image={}",
            request.compendium_id, request.format, gzip, include_image
        );

        if include_image {
            self.materializer
                .materialize(&request.compendium_id, &dir)
                .await?;
        }

        // The artifact is always excluded from the walk; when included it is
        // queued explicitly below, so the archive can never carry a stale
        // copy when the image is off nor a duplicate when it is on. Its
        // in-progress sibling is excluded too, so a request racing another
        // request's materialization never archives a half-written download.
        let artifact = self.config.artifact_path(&dir);
        let mut excludes = vec![self.config.image_tarball_file.clone()];
        if let Some(partial) = partial_path(&artifact).file_name().and_then(|n| n.to_str()) {
            excludes.push(partial.to_string());
        }
        let mut entries = scan::scan_tree(&dir, &excludes, self.config.stat_concurrency)
            .await
            .map_err(AssemblyError::Scan)?;
        if include_image {
            let entry = scan::file_entry(&artifact, &self.config.image_tarball_file)
                .await
                .map_err(AssemblyError::Scan)?;
            entries.push(entry);
        }

        let options = ArchiveOptions {
            format: request.format,
            gzip,
            comment: match request.format {
                ArchiveFormat::Zip => Some(provenance_comment(
                    &self.config.service_name,
                    &request.origin,
                )),
                ArchiveFormat::Tar => None,
            },
        };

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let written = Arc::new(AtomicU64::new(0));
        let sink = ChannelWriter::new(tx.clone(), cancel.clone(), written);

        let deadline = self.config.stream_deadline();
        let watchdog = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watchdog.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    warn!("stream deadline of {:?} exceeded, cancelling", deadline);
                    watchdog.cancel();
                }
            }
        });

        let compendium_id = request.compendium_id.clone();
        tokio::task::spawn_blocking(move || {
            let t0 = Instant::now();
            match write_archive(sink, &options, &entries) {
                Ok(total) => info!(
                    "archive for {} wrote {} bytes in {} ms",
                    compendium_id,
                    total,
                    t0.elapsed().as_millis()
                ),
                Err(err) => {
                    // Headers are on the wire by now; ending the stream
                    // early is the only signal the client gets.
                    error!("archive stream for {} aborted: {}", compendium_id, err);
                    let _ = tx.blocking_send(Err(err));
                }
            }
            cancel.cancel();
        });

        Ok(ArchiveStream {
            filename: request
                .format
                .attachment_filename(&request.compendium_id, gzip),
            content_type: request.format.content_type(gzip),
            body: rx,
        })
    }
}

fn write_archive(
    sink: ChannelWriter,
    options: &ArchiveOptions,
    entries: &[TreeEntry],
) -> io::Result<u64> {
    let mut writer = ArchiveWriter::new(sink, options);
    for entry in entries {
        writer.add_entry(entry)?;
    }
    writer.finish()
}
