use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::STREAM_CHUNK_BYTES;

/// Blocking `Write` end of the download stream. The archive writer runs on a
/// blocking task and pushes compressed chunks into a bounded channel; the
/// HTTP body drains the other end. A full channel blocks the producer, which
/// is the backpressure that keeps memory use flat. A dropped receiver means
/// the client went away and surfaces here as an I/O error so the archive
/// writer unwinds instead of compressing into the void.
pub struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
    cancel: CancellationToken,
    written: Arc<AtomicU64>,
}

impl ChannelWriter {
    pub fn new(
        tx: mpsc::Sender<io::Result<Bytes>>,
        cancel: CancellationToken,
        written: Arc<AtomicU64>,
    ) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(STREAM_CHUNK_BYTES),
            cancel,
            written,
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(STREAM_CHUNK_BYTES),
        ));
        let len = chunk.len() as u64;
        if self.tx.blocking_send(Ok(chunk)).is_err() {
            debug!("stream receiver dropped (client disconnected)");
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client disconnected",
            ));
        }
        self.written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes the tail and reports the total number of bytes handed to the
    /// client side.
    pub fn finish(mut self) -> io::Result<u64> {
        self.send_buffered()?;
        Ok(self.written.load(Ordering::Relaxed))
    }
}

impl io::Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "download stream cancelled",
            ));
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() >= STREAM_CHUNK_BYTES {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}
