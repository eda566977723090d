use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// One archive entry candidate produced by the tree scan.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Slash-separated path relative to the scan root.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub kind: EntryKind,
    pub len: u64,
    pub mode: u32,
    pub mtime: SystemTime,
}

/// Walks the compendium tree and returns its entries sorted by relative
/// path, so parents precede children and repeated scans of an unchanged
/// tree produce identical archives. Paths listed in `excludes` (relative,
/// slash-separated) are skipped. Stat calls run concurrently, bounded by
/// `stat_concurrency` so large trees do not swamp the filesystem.
///
/// Symlinks are dereferenced: a link to a file is archived as that file's
/// content, a link to a directory becomes a directory entry without
/// descending, and a dangling link is an error.
pub async fn scan_tree(
    root: &Path,
    excludes: &[String],
    stat_concurrency: usize,
) -> io::Result<Vec<TreeEntry>> {
    let mut candidates: Vec<(PathBuf, String)> = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let abs = entry.path();
            let rel = relative_name(root, &abs)?;
            if excludes.iter().any(|e| *e == rel) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(abs.clone());
            }
            candidates.push((abs, rel));
        }
    }

    let semaphore = Arc::new(Semaphore::new(stat_concurrency.max(1)));
    let mut join = JoinSet::new();
    for (idx, (abs, rel)) in candidates.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        join.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| io::Error::other("stat semaphore closed"))?;
            // Follows symlinks, so a dangling link fails the scan here.
            let meta = tokio::fs::metadata(&abs).await?;
            Ok::<_, io::Error>((idx, entry_from_metadata(abs, rel, &meta)))
        });
    }

    let mut slots: Vec<Option<TreeEntry>> = Vec::new();
    while let Some(result) = join.join_next().await {
        let (idx, entry) = result.map_err(io::Error::other)??;
        if slots.len() <= idx {
            slots.resize(idx + 1, None);
        }
        slots[idx] = Some(entry);
    }

    let mut entries: Vec<TreeEntry> = slots.into_iter().flatten().collect();
    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

/// Entry for one file outside the tree walk, used to queue the image
/// artifact explicitly.
pub async fn file_entry(abs: &Path, rel: &str) -> io::Result<TreeEntry> {
    let meta = tokio::fs::metadata(abs).await?;
    Ok(entry_from_metadata(abs.to_path_buf(), rel.to_string(), &meta))
}

fn entry_from_metadata(abs_path: PathBuf, rel_path: String, meta: &Metadata) -> TreeEntry {
    TreeEntry {
        rel_path,
        abs_path,
        kind: if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        len: meta.len(),
        mode: unix_mode(meta),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

fn relative_name(root: &Path, abs: &Path) -> io::Result<String> {
    let rel = abs
        .strip_prefix(root)
        .map_err(|_| io::Error::other(format!("path {} escapes scan root", abs.display())))?;
    let mut parts = Vec::new();
    for component in rel.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("non-utf8 file name under {}", root.display()),
            )
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn unix_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn unix_mode(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}
