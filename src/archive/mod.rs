pub mod scan;
pub mod sink;
pub mod writer;
pub mod zip;

pub use scan::{scan_tree, EntryKind, TreeEntry};
pub use sink::ChannelWriter;
pub use writer::{ArchiveOptions, ArchiveWriter};

/// Container format of a download. Gzip is an orthogonal flag on TAR, not a
/// format of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
}

impl ArchiveFormat {
    pub fn content_type(self, gzip: bool) -> &'static str {
        match (self, gzip) {
            (ArchiveFormat::Zip, _) => "application/zip",
            (ArchiveFormat::Tar, false) => "application/x-tar",
            (ArchiveFormat::Tar, true) => "application/octet-stream",
        }
    }

    /// Filename for the attachment header; reflects the actual output, so
    /// gzipped tar gains a `.gz`.
    pub fn attachment_filename(self, compendium_id: &str, gzip: bool) -> String {
        match (self, gzip) {
            (ArchiveFormat::Zip, _) => format!("{}.zip", compendium_id),
            (ArchiveFormat::Tar, false) => format!("{}.tar", compendium_id),
            (ArchiveFormat::Tar, true) => format!("{}.tar.gz", compendium_id),
        }
    }
}
