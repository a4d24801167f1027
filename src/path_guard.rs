//! Relative-path validation, safe joining under a root, and base64url path
//! tokens for the wire format.
//!
//! Every path that crosses the protocol boundary goes through [`validate`]
//! before it is allowed anywhere near the filesystem. The rules are the
//! strictest common denominator across platforms: POSIX separators on the
//! wire, no traversal, no rooted paths, no characters that any supported
//! filesystem rejects.

use crate::error::SyncError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::path::{Path, PathBuf};

/// Characters rejected inside any path segment (Windows-reserved set).
const INVALID_SEGMENT_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Validate a candidate relative path and return its normalized POSIX form.
///
/// Normalization replaces `\` with `/` and collapses `.` and empty
/// segments. Rejected: empty or whitespace-only input, rooted paths
/// (absolute, drive-letter, UNC), any `..` segment, NUL or control
/// characters, and the reserved character set in any segment.
pub fn validate(candidate: &str) -> Result<String, SyncError> {
    if candidate.trim().is_empty() {
        return Err(SyncError::InvalidPath("empty path".into()));
    }
    if candidate.contains('\0') {
        return Err(SyncError::InvalidPath("path contains NUL".into()));
    }

    let normalized = candidate.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(SyncError::InvalidPath(format!("rooted path: {candidate}")));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in normalized.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." {
            return Err(SyncError::InvalidPath(format!(
                "parent traversal in {candidate}"
            )));
        }
        if segment.trim().is_empty() {
            return Err(SyncError::InvalidPath(format!(
                "whitespace-only segment in {candidate}"
            )));
        }
        if let Some(bad) = segment
            .chars()
            .find(|c| c.is_control() || INVALID_SEGMENT_CHARS.contains(c))
        {
            return Err(SyncError::InvalidPath(format!(
                "illegal character {bad:?} in {candidate}"
            )));
        }
        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(SyncError::InvalidPath(format!(
            "path has no usable segments: {candidate}"
        )));
    }
    Ok(segments.join("/"))
}

/// Validate a dataset or client identifier: one valid path segment, since
/// ids name directories under the server roots.
pub fn validate_id(id: &str) -> Result<(), SyncError> {
    let normalized = validate(id)?;
    if normalized != id || id.contains('/') {
        return Err(SyncError::InvalidPath(format!("invalid identifier: {id}")));
    }
    Ok(())
}

/// Case-folded comparison key. Path comparison is case-insensitive
/// throughout the protocol; two paths that differ only by case collide.
pub fn fold_case(path: &str) -> String {
    path.to_lowercase()
}

/// Join a validated relative path under `root` and confirm the result stays
/// inside the canonicalized root.
///
/// For paths that do not exist yet, the deepest existing ancestor is
/// canonicalized and the remainder re-appended, so symlinks inside the tree
/// cannot smuggle a write outside the root.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf, SyncError> {
    let normalized = validate(relative)?;
    let canonical_root = root
        .canonicalize()
        .map_err(|e| SyncError::InvalidPath(format!("root {}: {e}", root.display())))?;

    let mut joined = canonical_root.clone();
    for segment in normalized.split('/') {
        joined.push(segment);
    }

    let resolved = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| SyncError::InvalidPath(format!("{}: {e}", joined.display())))?
    } else {
        // Canonicalize the deepest existing ancestor, keep the rest as-is.
        let mut existing = joined.clone();
        let mut tail: Vec<std::ffi::OsString> = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => break,
            }
        }
        let mut resolved = existing
            .canonicalize()
            .map_err(|e| SyncError::InvalidPath(format!("{}: {e}", existing.display())))?;
        for name in tail.iter().rev() {
            resolved.push(name);
        }
        resolved
    };

    if !resolved.starts_with(&canonical_root) {
        return Err(SyncError::InvalidPath(format!(
            "path {relative} escapes the dataset root"
        )));
    }
    Ok(resolved)
}

/// Encode a relative path as a padless URL-safe base64 token.
pub fn encode_path(path: &str) -> String {
    URL_SAFE_NO_PAD.encode(path.as_bytes())
}

/// Decode a base64url path token back to the UTF-8 relative path.
pub fn decode_path(token: &str) -> Result<String, SyncError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .map_err(|e| SyncError::InvalidPath(format!("bad path token: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| SyncError::InvalidPath("path token is not UTF-8".into()))
}
