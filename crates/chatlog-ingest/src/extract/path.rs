//! Entry-name normalization and containment checks for untrusted archives.

use std::path::{Component, Path, PathBuf};

use crate::error::ExtractError;

fn unsafe_path(entry: &str, reason: &'static str) -> ExtractError {
    ExtractError::UnsafePath {
        entry: entry.to_string(),
        reason,
    }
}

/// Normalizes a raw archive entry name into a relative path.
///
/// Backslashes count as separators and `.` segments are dropped. Names with a
/// `..` segment, a leading separator or a drive prefix are rejected, as are
/// names that normalize to nothing.
pub fn normalize_entry_name(raw: &str) -> Result<PathBuf, ExtractError> {
    if raw.contains('\0') {
        return Err(unsafe_path(raw, "contains a NUL byte"));
    }

    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(unsafe_path(raw, "absolute path"));
    }
    if has_drive_prefix(&unified) {
        return Err(unsafe_path(raw, "absolute path"));
    }

    let mut normalized = PathBuf::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(unsafe_path(raw, "parent directory segment")),
            other => normalized.push(other),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(unsafe_path(raw, "empty path"));
    }

    // Anything that still does not parse as plain names is refused.
    if !normalized
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(unsafe_path(raw, "non-normal path component"));
    }

    Ok(normalized)
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Joins `relative` onto `root` and confirms the result stays strictly inside `root`.
///
/// `root` must already exist. The deepest existing ancestor of the target is
/// resolved, so a pre-existing symlink that points outside the root is caught,
/// and an existing symlink at the target itself is refused.
pub fn resolve_within(root: &Path, relative: &Path, entry: &str) -> Result<PathBuf, ExtractError> {
    let canonical_root = root
        .canonicalize()
        .map_err(|_| unsafe_path(entry, "destination directory cannot be resolved"))?;
    let target = root.join(relative);

    if target == root {
        return Err(unsafe_path(entry, "resolves to the destination directory"));
    }

    if let Ok(meta) = target.symlink_metadata() {
        if meta.file_type().is_symlink() {
            return Err(unsafe_path(entry, "target is a symbolic link"));
        }
    }

    let mut anchor = target.parent();
    while let Some(dir) = anchor {
        if dir.exists() {
            break;
        }
        anchor = dir.parent();
    }
    let anchor = anchor.unwrap_or(root);

    let canonical_anchor = anchor
        .canonicalize()
        .map_err(|_| unsafe_path(entry, "parent directory cannot be resolved"))?;
    if !canonical_anchor.starts_with(&canonical_root) {
        return Err(unsafe_path(entry, "escapes the destination directory"));
    }

    Ok(target)
}

/// Forward-slash form used for stored relative paths.
pub fn to_storage_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
