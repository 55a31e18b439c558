pub mod scanner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::hash::ContentHash;
use crate::manifest::AssetFileDatabase;
use crate::utils::file::{make_cache_path, remove_empty_dirs, remove_file_quiet};

pub use scanner::{CacheIndexEntry, ScanReport};

/// Persistent disk-cache index: logical name → content hash + path. The
/// index is rebuilt from disk by the scanner at startup and optionally
/// reconciled against the remote manifest; both run on a single-slot
/// background thread that every accessor joins first, so callers may see a
/// one-time latency spike after `start`.
pub struct StorageCache {
    root: PathBuf,
    use_hash: bool,
    index: Arc<Mutex<HashMap<String, CacheIndexEntry>>>,
    total_bytes: Arc<AtomicU64>,
    task: Mutex<Option<thread::JoinHandle<()>>>,
}

impl StorageCache {
    pub fn new(root: impl Into<PathBuf>, use_hash: bool) -> Self {
        Self {
            root: root.into(),
            use_hash,
            index: Arc::new(Mutex::new(HashMap::new())),
            total_bytes: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn use_hash_invalidation(&self) -> bool {
        self.use_hash
    }

    /// On-disk path a file with this name and hash is cached under.
    pub fn cache_path(&self, name: &str, hash: Option<&ContentHash>) -> PathBuf {
        let hash = if self.use_hash { hash } else { None };
        make_cache_path(&self.root, name, hash)
    }

    /// Kicks off the background scan, then reconciliation when a manifest
    /// database is supplied. Joins any previous background pass first, so
    /// at most one runs at a time.
    pub fn start(&self, database: Option<Arc<dyn AssetFileDatabase>>) {
        self.join_background();

        let root = self.root.clone();
        let use_hash = self.use_hash;
        let index = Arc::clone(&self.index);
        let total_bytes = Arc::clone(&self.total_bytes);

        let handle = thread::Builder::new()
            .name("assetflow-cache-scan".to_string())
            .spawn(move || {
                let mut report = scanner::build(&root, use_hash);
                if let Some(database) = database {
                    reconcile(&mut report, use_hash, database.as_ref());
                }
                total_bytes.store(report.total_bytes, Ordering::SeqCst);
                if let Ok(mut guard) = index.lock() {
                    *guard = report.entries;
                }
            });
        match handle {
            Ok(handle) => {
                if let Ok(mut slot) = self.task.lock() {
                    *slot = Some(handle);
                }
            }
            Err(err) => tracing::error!("failed to spawn cache scan thread: {}", err),
        }
    }

    /// True when the cache holds `name` under the expected hash (or under
    /// any name match when hash invalidation is off).
    pub fn has(&self, name: &str, hash: Option<&ContentHash>) -> bool {
        self.join_background();
        let guard = match self.index.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match guard.get(name) {
            Some(entry) if self.use_hash => entry.hash.as_ref() == hash,
            Some(_) => true,
            None => false,
        }
    }

    /// Records a completed cache write: drops any stale file cached under
    /// the previous hash, then indexes the new one.
    pub fn on_file_saved(&self, name: &str, hash: Option<ContentHash>, size_bytes: u64) {
        self.join_background();
        let path = self.cache_path(name, hash.as_ref());
        let Ok(mut guard) = self.index.lock() else {
            return;
        };
        if let Some(old) = guard.remove(name) {
            if old.path != path {
                remove_file_quiet(&old.path);
            }
            sub_saturating(&self.total_bytes, old.size_bytes);
        }
        self.total_bytes.fetch_add(size_bytes, Ordering::SeqCst);
        guard.insert(
            name.to_string(),
            CacheIndexEntry {
                hash,
                path,
                size_bytes,
            },
        );
    }

    /// Removes one entry and its file. Returns false when the name is not
    /// cached.
    pub fn try_delete(&self, name: &str) -> bool {
        self.join_background();
        let Ok(mut guard) = self.index.lock() else {
            return false;
        };
        match guard.remove(name) {
            Some(entry) => {
                remove_file_quiet(&entry.path);
                sub_saturating(&self.total_bytes, entry.size_bytes);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the index, sorted by logical name.
    pub fn dump(&self) -> Vec<(String, Option<ContentHash>)> {
        self.join_background();
        let mut snapshot: Vec<(String, Option<ContentHash>)> = self
            .index
            .lock()
            .map(|guard| {
                guard
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.hash))
                    .collect()
            })
            .unwrap_or_default();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Estimated bytes held by indexed files. An estimate: sizes are taken
    /// at scan/save time, not re-measured.
    pub fn estimated_size_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    /// Deletes every indexed file on a background thread. The index is
    /// emptied immediately.
    pub fn clear(&self) {
        self.join_background();
        let paths: Vec<PathBuf> = {
            let Ok(mut guard) = self.index.lock() else {
                return;
            };
            let paths = guard.values().map(|entry| entry.path.clone()).collect();
            guard.clear();
            paths
        };
        self.total_bytes.store(0, Ordering::SeqCst);

        let root = self.root.clone();
        let handle = thread::Builder::new()
            .name("assetflow-cache-clear".to_string())
            .spawn(move || {
                for path in &paths {
                    remove_file_quiet(path);
                }
                remove_empty_dirs(&root);
                tracing::info!("cache cleared: {} files removed", paths.len());
            });
        match handle {
            Ok(handle) => {
                if let Ok(mut slot) = self.task.lock() {
                    *slot = Some(handle);
                }
            }
            Err(err) => tracing::error!("failed to spawn cache clear thread: {}", err),
        }
    }

    /// Waits for the in-flight scan or clear pass, if any. Accessors call
    /// this before touching the index; the pipeline calls it on shutdown.
    pub(crate) fn join_background(&self) {
        let handle = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("cache background thread panicked");
            }
        }
    }
}

fn sub_saturating(total: &AtomicU64, amount: u64) {
    let _ = total.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
        Some(value.saturating_sub(amount))
    });
}

/// Drops every entry the manifest no longer vouches for, deleting the
/// file. This is the cache's only eviction path.
fn reconcile(report: &mut ScanReport, use_hash: bool, database: &dyn AssetFileDatabase) {
    let mut removed = 0_usize;
    report.entries.retain(|name, entry| {
        let keep = match database.get_file_metadata(name) {
            Some(meta) if use_hash => entry.hash == Some(meta.hash),
            Some(_) => true,
            None => false,
        };
        if !keep {
            remove_file_quiet(&entry.path);
            report.total_bytes = report.total_bytes.saturating_sub(entry.size_bytes);
            removed += 1;
        }
        keep
    });
    if removed > 0 {
        tracing::info!("cache reconciliation removed {} stale entries", removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileMetaData;
    use crate::testutil;
    use std::fs;

    fn hash_of(tag: &str) -> ContentHash {
        ContentHash::of_slice(tag.as_bytes())
    }

    struct StubDatabase {
        entries: HashMap<String, FileMetaData>,
    }

    impl StubDatabase {
        fn new(files: &[(&str, ContentHash)]) -> Self {
            let entries = files
                .iter()
                .map(|(name, hash)| {
                    (
                        name.to_string(),
                        FileMetaData {
                            hash: *hash,
                            size_bytes: 0,
                            sha256: None,
                            dependencies: Vec::new(),
                        },
                    )
                })
                .collect();
            Self { entries }
        }
    }

    impl AssetFileDatabase for StubDatabase {
        fn get_file_metadata(&self, name: &str) -> Option<FileMetaData> {
            self.entries.get(name).cloned()
        }
    }

    #[test]
    fn scan_then_has_round_trip() {
        let root = testutil::temp_dir("cache");
        let cache = StorageCache::new(&root, true);
        let hash = hash_of("level1");
        let path = cache.cache_path("level1.bundle", Some(&hash));
        fs::write(&path, b"payload").expect("seed cache file");

        cache.start(None);

        assert!(cache.has("level1.bundle", Some(&hash)));
        assert!(!cache.has("level1.bundle", Some(&hash_of("other"))));
        assert!(!cache.has("absent.bundle", Some(&hash)));
        assert_eq!(cache.estimated_size_bytes(), 7);
    }

    #[test]
    fn on_file_saved_replaces_the_stale_hash() {
        let root = testutil::temp_dir("cache-save");
        let cache = StorageCache::new(&root, true);
        let old_hash = hash_of("v1");
        let new_hash = hash_of("v2");

        let old_path = cache.cache_path("ui.bundle", Some(&old_hash));
        fs::write(&old_path, b"old").expect("seed old file");
        cache.start(None);
        assert!(cache.has("ui.bundle", Some(&old_hash)));

        let new_path = cache.cache_path("ui.bundle", Some(&new_hash));
        fs::write(&new_path, b"newer").expect("seed new file");
        cache.on_file_saved("ui.bundle", Some(new_hash), 5);

        assert!(!old_path.exists(), "stale file deleted");
        assert!(cache.has("ui.bundle", Some(&new_hash)));
        assert!(!cache.has("ui.bundle", Some(&old_hash)));
        assert_eq!(cache.estimated_size_bytes(), 5);
    }

    #[test]
    fn reconciliation_evicts_unknown_and_mismatched_entries() {
        let root = testutil::temp_dir("cache-reconcile");
        let cache = StorageCache::new(&root, true);
        let kept_hash = hash_of("kept");
        let stale_hash = hash_of("stale");

        let kept = cache.cache_path("kept.bundle", Some(&kept_hash));
        let stale = cache.cache_path("stale.bundle", Some(&stale_hash));
        let orphan = cache.cache_path("orphan.bundle", Some(&hash_of("orphan")));
        fs::write(&kept, b"kept").expect("seed kept");
        fs::write(&stale, b"stale").expect("seed stale");
        fs::write(&orphan, b"orphan").expect("seed orphan");

        // Manifest knows kept (same hash) and stale (different hash).
        let database = Arc::new(StubDatabase::new(&[
            ("kept.bundle", kept_hash),
            ("stale.bundle", hash_of("stale-v2")),
        ]));
        cache.start(Some(database));

        assert!(cache.has("kept.bundle", Some(&kept_hash)));
        assert!(!cache.has("stale.bundle", Some(&stale_hash)));
        assert!(!stale.exists());
        assert!(!orphan.exists());
        assert_eq!(cache.dump().len(), 1);
    }

    #[test]
    fn try_delete_and_clear() {
        let root = testutil::temp_dir("cache-delete");
        let cache = StorageCache::new(&root, true);
        let hash = hash_of("x");
        let path = cache.cache_path("x.bundle", Some(&hash));
        fs::write(&path, b"x").expect("seed file");
        cache.start(None);

        assert!(cache.try_delete("x.bundle"));
        assert!(!path.exists());
        assert!(!cache.try_delete("x.bundle"));

        let other = cache.cache_path("y.bundle", Some(&hash));
        fs::write(&other, b"y").expect("seed other");
        cache.on_file_saved("y.bundle", Some(hash), 1);
        cache.clear();
        // Accessors join the clear thread before reading.
        assert!(cache.dump().is_empty());
        assert!(!other.exists());
        assert_eq!(cache.estimated_size_bytes(), 0);
    }
}
