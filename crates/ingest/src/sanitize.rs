//! Zip-slip protection for archive entry names.

use crate::error::{IngestError, Result};
use std::path::{Path, PathBuf};

/// Resolve `entry_name` against `root` without touching the filesystem.
///
/// Both `/` and `\` count as separators. Absolute names, Windows drive or UNC
/// prefixes, and `..` components that climb above `root` are rejected with
/// [`IngestError::PathTraversal`]. `..` that stays inside the root is allowed.
pub fn resolve_entry_path(root: &Path, entry_name: &str) -> Result<PathBuf> {
    let traversal = || IngestError::PathTraversal {
        entry: entry_name.to_string(),
    };

    if entry_name.starts_with('/') || entry_name.starts_with('\\') || has_drive_prefix(entry_name)
    {
        return Err(traversal());
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in entry_name.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(traversal());
                }
            }
            // A colon inside a component is a drive or stream on Windows.
            other if other.contains(':') => return Err(traversal()),
            other => parts.push(other),
        }
    }

    let mut path = root.to_path_buf();
    path.extend(parts);
    Ok(path)
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
