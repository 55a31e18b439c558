use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::hash::ContentHash;
use crate::utils::file::{parse_cache_file_name, remove_empty_dirs, remove_file_quiet};

/// One physical cache file, keyed by logical name in the index.
#[derive(Clone, Debug)]
pub struct CacheIndexEntry {
    pub hash: Option<ContentHash>,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub entries: HashMap<String, CacheIndexEntry>,
    pub removed_temp_files: usize,
    pub removed_duplicates: usize,
    pub total_bytes: u64,
}

/// One-shot rebuild of the cache index from what is physically on disk.
/// Runs entirely on the calling thread (the cache drives it from a
/// background thread). Stray `.tmp` files are deleted outright; a
/// duplicate logical name deletes *both* conflicting files, since picking
/// one would risk serving a stale copy forever.
pub fn build(root: &Path, use_hash: bool) -> ScanReport {
    let mut report = ScanReport::default();
    let mut poisoned: HashSet<String> = HashSet::new();

    if root.is_dir() {
        visit(root, "", &mut report, &mut poisoned);
        remove_empty_dirs(root);
    }

    if use_hash {
        // Hashless files cannot be validated against a manifest; they only
        // survive until reconciliation.
        let unkeyed = report
            .entries
            .values()
            .filter(|entry| entry.hash.is_none())
            .count();
        if unkeyed > 0 {
            tracing::warn!("cache scan found {} entries without a content hash", unkeyed);
        }
    }

    tracing::info!(
        "cache scan: {} entries, {} bytes, {} temp files removed, {} duplicates removed",
        report.entries.len(),
        report.total_bytes,
        report.removed_temp_files,
        report.removed_duplicates
    );
    report
}

fn visit(dir: &Path, rel: &str, report: &mut ScanReport, poisoned: &mut HashSet<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        tracing::warn!("cache scan could not list {}", dir.display());
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|value| value.to_str()) else {
            continue;
        };

        if path.is_dir() {
            let child_rel = if rel.is_empty() {
                file_name.to_string()
            } else {
                format!("{}/{}", rel, file_name)
            };
            visit(&path, &child_rel, report, poisoned);
            continue;
        }

        let Some(parsed) = parse_cache_file_name(file_name) else {
            continue;
        };

        if parsed.is_temporary {
            // Leftover of an interrupted write.
            remove_file_quiet(&path);
            report.removed_temp_files += 1;
            continue;
        }

        let logical_name = if rel.is_empty() {
            parsed.name
        } else {
            format!("{}/{}", rel, parsed.name)
        };

        if poisoned.contains(&logical_name) {
            remove_file_quiet(&path);
            report.removed_duplicates += 1;
            continue;
        }

        if let Some(existing) = report.entries.remove(&logical_name) {
            // Structurally impossible unless the cache was corrupted by
            // hand; ambiguity loses both copies.
            tracing::warn!(
                "duplicate cache entries for {}: deleting {} and {}",
                logical_name,
                existing.path.display(),
                path.display()
            );
            remove_file_quiet(&existing.path);
            remove_file_quiet(&path);
            report.total_bytes = report.total_bytes.saturating_sub(existing.size_bytes);
            report.removed_duplicates += 2;
            poisoned.insert(logical_name);
            continue;
        }

        let size_bytes = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        report.total_bytes = report.total_bytes.saturating_add(size_bytes);
        report.entries.insert(
            logical_name,
            CacheIndexEntry {
                hash: parsed.hash,
                path,
                size_bytes,
            },
        );
    }
}
