use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::hash::ContentHash;

/// Suffix marking an in-progress write. Any file carrying it at scan time
/// is a leftover from a crash and is deleted unconditionally.
pub const TMP_SUFFIX: &str = ".tmp";

/// A cache filename parsed back into its logical parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCacheName {
    /// File-name component of the logical name (directories excluded).
    pub name: String,
    pub hash: Option<ContentHash>,
    pub is_temporary: bool,
}

/// Builds the on-disk cache path for a logical name:
/// `<stem>.<hash-hex>.<ext>` with hash invalidation, `<stem>.<ext>`
/// without. Extensionless names collapse the trailing period.
pub fn make_cache_path(root: &Path, name: &str, hash: Option<&ContentHash>) -> PathBuf {
    let (dir, file_name) = match name.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, name),
    };

    let encoded = match hash {
        Some(hash) => match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                format!("{}.{}.{}", stem, hash.to_hex(), ext)
            }
            _ => format!("{}.{}", file_name, hash.to_hex()),
        },
        None => file_name.to_string(),
    };

    let mut path = root.to_path_buf();
    if let Some(dir) = dir {
        for part in dir.split('/').filter(|part| !part.is_empty()) {
            path.push(part);
        }
    }
    path.push(encoded);
    path
}

/// Inverse of [`make_cache_path`] for one file-name component. Returns
/// `None` for names that cannot have come from the encoder (empty).
pub fn parse_cache_file_name(file_name: &str) -> Option<ParsedCacheName> {
    if file_name.is_empty() {
        return None;
    }

    let (trimmed, is_temporary) = match file_name.strip_suffix(TMP_SUFFIX) {
        Some(rest) if !rest.is_empty() => (rest, true),
        Some(_) => return None,
        None => (file_name, false),
    };

    let segments: Vec<&str> = trimmed.split('.').collect();

    // Hash sits before the extension, or last for extensionless names.
    if segments.len() >= 3 {
        if let Some(hash) = ContentHash::from_hex(segments[segments.len() - 2]) {
            let mut name_parts = segments[..segments.len() - 2].to_vec();
            name_parts.push(segments[segments.len() - 1]);
            return Some(ParsedCacheName {
                name: name_parts.join("."),
                hash: Some(hash),
                is_temporary,
            });
        }
    }
    if segments.len() >= 2 {
        if let Some(hash) = ContentHash::from_hex(segments[segments.len() - 1]) {
            return Some(ParsedCacheName {
                name: segments[..segments.len() - 1].join("."),
                hash: Some(hash),
                is_temporary,
            });
        }
    }

    Some(ParsedCacheName {
        name: trimmed.to_string(),
        hash: None,
        is_temporary,
    })
}

/// Deletes a file, logging instead of propagating failures. Returns true
/// when the file no longer exists afterwards.
pub fn remove_file_quiet(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::warn!("failed to delete {}: {}", path.display(), err);
            false
        }
    }
}

/// Removes directories under `root` that are (or become) empty. `root`
/// itself is kept.
pub fn remove_empty_dirs(root: &Path) {
    fn sweep(dir: &Path) -> bool {
        let Ok(entries) = fs::read_dir(dir) else {
            return false;
        };
        let mut empty = true;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if sweep(&path) {
                    if let Err(err) = fs::remove_dir(&path) {
                        tracing::warn!("failed to remove {}: {}", path.display(), err);
                        empty = false;
                    }
                } else {
                    empty = false;
                }
            } else {
                empty = false;
            }
        }
        empty
    }

    sweep(root);
}

/// Human-readable cause for an I/O failure, used in error callbacks to
/// distinguish a missing source file from a failed read.
pub fn describe_io_error(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::NotFound => "source file missing",
        io::ErrorKind::PermissionDenied => "permission denied",
        io::ErrorKind::WriteZero => "storage full or write refused",
        io::ErrorKind::UnexpectedEof => "file truncated",
        _ => "io failure",
    }
}

pub fn is_missing(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}
