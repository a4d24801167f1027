//! Client-side manifest construction: walk the sync root and emit one
//! [`FileEntry`] per regular file.

use crate::error::ClientError;
use crate::protocol::FileEntry;
use crate::state::SyncState;
use chrono::{DateTime, Utc};
use std::path::Path;
use walkdir::WalkDir;

/// Scan `root` recursively and build the manifest entries, sorted by path.
///
/// Symlinks are not followed. Entries that cannot be read are skipped.
/// Hashes are not computed here — the authoritative hash is derived from the
/// upload stream — but a prior state entry's hash is carried forward when
/// size and mtime are unchanged, so the server's equal-mtime tiebreak has
/// data to work with.
pub fn build(root: &Path, prior: &SyncState) -> Result<Vec<FileEntry>, ClientError> {
    if !root.is_dir() {
        return Err(ClientError::Config(format!(
            "sync root {} is not a directory",
            root.display()
        )));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue; // unreadable entries are skipped
        };
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(path) = posix_relative(relative) else {
            continue; // non-UTF-8 names cannot cross the wire
        };

        let size = metadata.len();
        let last_write_utc: DateTime<Utc> = match metadata.modified() {
            Ok(t) => t.into(),
            Err(_) => continue,
        };

        let sha256 = prior.files.get(&path).and_then(|old| {
            (old.size == size && old.last_write_utc == last_write_utc)
                .then(|| old.sha256.clone())
                .flatten()
        });

        entries.push(FileEntry {
            path,
            size,
            last_write_utc,
            sha256,
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn posix_relative(path: &Path) -> Option<String> {
    let mut segments = Vec::new();
    for component in path.components() {
        segments.push(component.as_os_str().to_str()?);
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}
