use std::fs::File;
use std::io;
use std::time::UNIX_EPOCH;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::trace;

use super::scan::{EntryKind, TreeEntry};
use super::sink::ChannelWriter;
use super::zip::ZipStreamWriter;
use super::ArchiveFormat;

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub format: ArchiveFormat,
    pub gzip: bool,
    /// Provenance string stored as the ZIP archive comment; ignored for TAR.
    pub comment: Option<String>,
}

enum Container {
    Zip(ZipStreamWriter<ChannelWriter>),
    Tar(tar::Builder<ChannelWriter>),
    TarGz(tar::Builder<GzEncoder<ChannelWriter>>),
}

/// One-shot archive producer feeding a [`ChannelWriter`]. Entries go in one
/// at a time; `finish` seals the container, flushes the sink, and reports
/// the total bytes that reached the client side. Runs on a blocking task;
/// every `io::Error` bubbling out of here either aborts the stream (write
/// side) or was already a failed filesystem read.
pub struct ArchiveWriter {
    container: Container,
}

impl ArchiveWriter {
    pub fn new(sink: ChannelWriter, options: &ArchiveOptions) -> Self {
        let container = match options.format {
            ArchiveFormat::Zip => Container::Zip(ZipStreamWriter::new(
                sink,
                options.comment.clone().unwrap_or_default(),
            )),
            ArchiveFormat::Tar if options.gzip => {
                let encoder = GzEncoder::new(sink, Compression::default());
                Container::TarGz(tar::Builder::new(encoder))
            }
            ArchiveFormat::Tar => Container::Tar(tar::Builder::new(sink)),
        };
        Self { container }
    }

    pub fn add_entry(&mut self, entry: &TreeEntry) -> io::Result<()> {
        trace!("archive entry {}", entry.rel_path);
        match entry.kind {
            EntryKind::Directory => self.add_directory(entry),
            EntryKind::File => self.add_file(entry),
        }
    }

    fn add_directory(&mut self, entry: &TreeEntry) -> io::Result<()> {
        match &mut self.container {
            Container::Zip(zip) => zip.add_directory(&entry.rel_path, entry.mode, entry.mtime),
            Container::Tar(tar) => append_tar_dir(tar, entry),
            Container::TarGz(tar) => append_tar_dir(tar, entry),
        }
    }

    fn add_file(&mut self, entry: &TreeEntry) -> io::Result<()> {
        let mut file = File::open(&entry.abs_path)?;
        match &mut self.container {
            Container::Zip(zip) => {
                let len = file.metadata()?.len();
                zip.add_file(&entry.rel_path, entry.mode, entry.mtime, len, &mut file)?;
                Ok(())
            }
            Container::Tar(tar) => append_tar_file(tar, entry, &mut file),
            Container::TarGz(tar) => append_tar_file(tar, entry, &mut file),
        }
    }

    /// Seals the container and returns the number of bytes streamed out.
    pub fn finish(self) -> io::Result<u64> {
        match self.container {
            Container::Zip(zip) => zip.finish()?.finish(),
            Container::Tar(tar) => tar.into_inner()?.finish(),
            Container::TarGz(tar) => tar.into_inner()?.finish()?.finish(),
        }
    }
}

fn tar_header(entry: &TreeEntry) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_mode(entry.mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(
        entry
            .mtime
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    );
    header
}

fn append_tar_dir<W: io::Write>(builder: &mut tar::Builder<W>, entry: &TreeEntry) -> io::Result<()> {
    let mut header = tar_header(entry);
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    builder.append_data(
        &mut header,
        format!("{}/", entry.rel_path),
        io::empty(),
    )
}

fn append_tar_file<W: io::Write>(
    builder: &mut tar::Builder<W>,
    entry: &TreeEntry,
    file: &mut File,
) -> io::Result<()> {
    // Size comes from the file handle, not the scan, in case the tree
    // changed in between. A mismatch would corrupt the whole stream.
    let len = file.metadata()?.len();
    let mut header = tar_header(entry);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(len);
    builder.append_data(&mut header, &entry.rel_path, file)
}

/// Provenance comment embedded in ZIP output.
pub fn provenance_comment(service_name: &str, origin: &str) -> String {
    format!("Created by {} [{}]", service_name, origin)
}
