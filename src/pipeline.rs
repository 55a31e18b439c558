use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::asset::AssetHandle;
use crate::cache::StorageCache;
use crate::config::PipelineConfig;
use crate::download::{DownloadHandle, DownloadRequest, RemoteSource};
use crate::errors::{ErrorCallback, PipelineError, ProgressCallback, Result};
use crate::file_handle::FileHandle;
use crate::hash::ContentHash;
use crate::loaded::AssetKind;
use crate::manifest::AssetFileDatabase;
use crate::refcount::{Ref, RefCounted};
use crate::writer::FileWriter;

/// Front door of the content delivery pipeline. Owns the disk cache, the
/// buffered writer and the live handle registries, and deduplicates work:
/// one download per `(name, hash)`, one file handle per name, one asset
/// handle per `(file, asset, kind)`. Callers hold [`Ref`] guards; dropping
/// the last guard lets the next `update()` dispose the handle.
pub struct AssetPipeline {
    config: PipelineConfig,
    source: Arc<dyn RemoteSource>,
    database: Arc<dyn AssetFileDatabase>,
    cache: Arc<StorageCache>,
    writer: Arc<FileWriter>,
    downloads: Mutex<HashMap<String, Arc<DownloadHandle>>>,
    files: Mutex<HashMap<String, Arc<FileHandle>>>,
    assets: Mutex<HashMap<String, Arc<AssetHandle>>>,
    on_error: ErrorCallback,
    on_progress: Option<ProgressCallback>,
}

impl AssetPipeline {
    /// Spins up the writer thread and kicks off the background cache scan.
    /// Must be constructed on a runtime thread.
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn RemoteSource>,
        database: Arc<dyn AssetFileDatabase>,
        on_error: ErrorCallback,
        on_progress: Option<ProgressCallback>,
    ) -> Result<Self> {
        let writer = Arc::new(FileWriter::new(&config)?);
        let cache = Arc::new(StorageCache::new(
            config.cache_root.clone(),
            config.use_hash_invalidation,
        ));
        cache.start(Some(Arc::clone(&database)));
        Ok(Self {
            config,
            source,
            database,
            cache,
            writer,
            downloads: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            assets: Mutex::new(HashMap::new()),
            on_error,
            on_progress,
        })
    }

    pub fn cache(&self) -> &StorageCache {
        &self.cache
    }

    /// Requests one named asset out of a file. The returned guard keeps
    /// the handle alive; everything upstream (file, dependencies,
    /// download) is pinned by the handle itself.
    pub fn request_asset(
        &self,
        file_name: &str,
        asset_name: &str,
        expected: Option<AssetKind>,
    ) -> Result<Ref<AssetHandle>> {
        let key = asset_key(file_name, asset_name, expected);
        if let Ok(assets) = self.assets.lock() {
            if let Some(existing) = assets.get(&key) {
                if !existing.failed() {
                    return Ok(Ref::acquire(Arc::clone(existing)));
                }
            }
        }

        let file = self.request_file(file_name)?;
        let handle = Arc::new(AssetHandle::new(
            asset_name,
            expected,
            file,
            Arc::clone(&self.on_error),
        ));
        let guard = Ref::acquire(Arc::clone(&handle));
        if let Ok(mut assets) = self.assets.lock() {
            assets.insert(key, handle);
        }
        Ok(guard)
    }

    /// Requests a file together with its manifest dependencies. Returns a
    /// shared handle when one is already live.
    pub fn request_file(&self, name: &str) -> Result<Ref<FileHandle>> {
        let mut stack = Vec::new();
        self.request_file_inner(name, &mut stack)
    }

    fn request_file_inner(&self, name: &str, stack: &mut Vec<String>) -> Result<Ref<FileHandle>> {
        if let Ok(files) = self.files.lock() {
            if let Some(existing) = files.get(name) {
                return Ok(Ref::acquire(Arc::clone(existing)));
            }
        }

        let metadata = self.database.get_file_metadata(name);
        let hash = match &metadata {
            Some(meta) if self.config.use_hash_invalidation => Some(meta.hash),
            _ => None,
        };
        let path = self.cache.cache_path(name, hash.as_ref());
        let cached = self.cache.has(name, hash.as_ref());
        if metadata.is_none() && !cached {
            return Err(PipelineError::NotFound(name.to_string()));
        }

        // Dependencies load alongside the file; self references and cycles
        // through the current chain are skipped.
        stack.push(name.to_string());
        let mut dependencies = Vec::new();
        if let Some(meta) = &metadata {
            for dep in &meta.dependencies {
                if stack.iter().any(|seen| seen == dep) {
                    continue;
                }
                dependencies.push(self.request_file_inner(dep, stack)?);
            }
        }
        stack.pop();

        let download = if cached {
            None
        } else {
            Some(self.request_download(name, hash, metadata.as_ref().and_then(|m| m.sha256.clone()))?)
        };

        let handle = Arc::new(FileHandle::new(
            name,
            &path,
            download,
            dependencies,
            Arc::clone(&self.on_error),
        ));
        let guard = Ref::acquire(Arc::clone(&handle));
        if let Ok(mut files) = self.files.lock() {
            files.insert(name.to_string(), handle);
        }
        Ok(guard)
    }

    fn request_download(
        &self,
        name: &str,
        hash: Option<ContentHash>,
        sha256: Option<String>,
    ) -> Result<Ref<DownloadHandle>> {
        let key = download_key(name, hash.as_ref());
        if let Ok(downloads) = self.downloads.lock() {
            if let Some(existing) = downloads.get(&key) {
                if !existing.failed() {
                    return Ok(Ref::acquire(Arc::clone(existing)));
                }
            }
        }

        let final_path = self.cache.cache_path(name, hash.as_ref());
        let cache = Arc::clone(&self.cache);
        let index_name = name.to_string();
        let index_path = final_path.clone();
        let on_complete = Box::new(move || {
            let size = std::fs::metadata(&index_path)
                .map(|meta| meta.len())
                .unwrap_or(0);
            cache.on_file_saved(&index_name, hash, size);
        });

        let handle = Arc::new(DownloadHandle::new(
            DownloadRequest {
                name: name.to_string(),
                final_path,
                hash,
                sha256,
            },
            Arc::clone(&self.source),
            Arc::clone(&self.writer),
            self.config.retry_count,
            self.config.timeout,
            Arc::clone(&self.on_error),
            self.on_progress.clone(),
            Some(on_complete),
        ));
        handle.start();
        let guard = Ref::acquire(Arc::clone(&handle));
        if let Ok(mut downloads) = self.downloads.lock() {
            downloads.insert(key, handle);
        }
        Ok(guard)
    }

    /// One pipeline tick: polls every live handle top-down, then disposes
    /// and drops the ones that are terminal and unreferenced.
    pub fn update(&self) {
        let downloads: Vec<_> = self
            .downloads
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        for download in &downloads {
            download.update();
        }

        let files: Vec<_> = self
            .files
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        for file in &files {
            file.update();
        }

        let assets: Vec<_> = self
            .assets
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        for asset in &assets {
            asset.update();
        }

        self.prune();
    }

    fn prune(&self) {
        // Assets go first so their file and download pins drop before the
        // upstream maps are swept.
        if let Ok(mut assets) = self.assets.lock() {
            assets.retain(|_, handle| {
                if handle.disposable() {
                    handle.dispose();
                    false
                } else {
                    true
                }
            });
        }
        if let Ok(mut files) = self.files.lock() {
            files.retain(|_, handle| {
                if handle.disposable() {
                    handle.dispose();
                    false
                } else {
                    true
                }
            });
        }
        if let Ok(mut downloads) = self.downloads.lock() {
            downloads.retain(|_, handle| {
                if handle.is_done() && handle.ref_count().count() <= 0 {
                    handle.dispose();
                    false
                } else {
                    true
                }
            });
        }
    }

    pub fn live_downloads(&self) -> usize {
        self.downloads.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn live_files(&self) -> usize {
        self.files.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn live_assets(&self) -> usize {
        self.assets.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Rough decoded footprint of every live asset.
    pub fn estimated_asset_memory(&self) -> usize {
        self.assets
            .lock()
            .map(|map| {
                map.values()
                    .map(|handle| handle.estimate_memory_size())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Drains the writer queue and joins the background scan. Call before
    /// process exit; in-flight downloads are abandoned.
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
        self.cache.join_background();
    }
}

fn asset_key(file_name: &str, asset_name: &str, expected: Option<AssetKind>) -> String {
    format!(
        "{}::{}::{}",
        file_name,
        asset_name,
        expected.map(|kind| kind.as_str()).unwrap_or("any")
    )
}

fn download_key(name: &str, hash: Option<&ContentHash>) -> String {
    match hash {
        Some(hash) => format!("{}:{}", name, hash),
        None => format!("{}:-", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::ByteStream;
    use crate::loaded::AssetObject;
    use crate::manifest::JsonAssetDatabase;
    use crate::testutil;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    struct CountingSource {
        payloads: HashMap<String, Vec<u8>>,
        fetches: AtomicUsize,
    }

    impl RemoteSource for CountingSource {
        fn fetch(&self, name: &str) -> BoxFuture<'static, Result<ByteStream>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let payload = self.payloads.get(name).cloned();
            Box::pin(async move {
                let payload =
                    payload.ok_or_else(|| PipelineError::Http("404".to_string()))?;
                Ok(Box::pin(futures_util::stream::once(async move { Ok(payload) }))
                    as ByteStream)
            })
        }
    }

    fn manifest_json(files: &[(&str, &[u8], &[&str])]) -> String {
        let entries: Vec<String> = files
            .iter()
            .map(|(name, payload, deps)| {
                let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();
                format!(
                    r#"{{"name": "{}", "hash": "{}", "size": {}, "dependencies": [{}]}}"#,
                    name,
                    ContentHash::of_slice(payload).to_hex(),
                    payload.len(),
                    deps.join(",")
                )
            })
            .collect();
        format!(
            r#"{{"version": "1", "files": [{}]}}"#,
            entries.join(",")
        )
    }

    struct World {
        pipeline: AssetPipeline,
        source: Arc<CountingSource>,
        errors: Arc<AtomicUsize>,
    }

    fn world(root: std::path::PathBuf, files: &[(&str, &[u8], &[&str])]) -> World {
        let payloads = files
            .iter()
            .map(|(name, payload, _)| (name.to_string(), payload.to_vec()))
            .collect();
        let source = Arc::new(CountingSource {
            payloads,
            fetches: AtomicUsize::new(0),
        });
        let database =
            Arc::new(JsonAssetDatabase::from_json(&manifest_json(files)).expect("manifest"));
        let errors = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&errors);
        let pipeline = AssetPipeline::new(
            PipelineConfig::new(root),
            Arc::clone(&source) as Arc<dyn RemoteSource>,
            database,
            Arc::new(move |kind, name, detail| {
                cloned.fetch_add(1, Ordering::SeqCst);
                eprintln!("error {} {} {}", kind.as_str(), name, detail);
            }),
            None,
        )
        .expect("pipeline");
        World {
            pipeline,
            source,
            errors,
        }
    }

    async fn tick_until<F: Fn() -> bool>(pipeline: &AssetPipeline, ready: F) {
        for _ in 0..4_000 {
            pipeline.update();
            if ready() {
                return;
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("pipeline never converged");
    }

    #[tokio::test]
    async fn cache_miss_downloads_once_then_serves_from_cache() {
        let root = testutil::temp_dir("pipe-miss");
        let bundle = testutil::bundle_bytes(&[(
            "motd",
            AssetKind::Text,
            b"hello from cache".to_vec(),
        )]);
        let world = world(root.clone(), &[("level1.bundle", &bundle, &[])]);

        let asset = world
            .pipeline
            .request_asset("level1.bundle", "motd", Some(AssetKind::Text))
            .expect("request");
        tick_until(&world.pipeline, || asset.is_done()).await;

        assert!(!asset.failed());
        match asset.asset() {
            Some(AssetObject::Text(text)) => assert_eq!(text.as_str(), "hello from cache"),
            other => panic!("unexpected asset: {:?}", other.map(|a| a.kind())),
        }
        assert_eq!(world.source.fetches.load(Ordering::SeqCst), 1);
        let hash = ContentHash::of_slice(&bundle);
        assert!(world.pipeline.cache().has("level1.bundle", Some(&hash)));

        // Second request for the same payload is served without a fetch.
        drop(asset);
        world.pipeline.update();
        let again = world
            .pipeline
            .request_asset("level1.bundle", "motd", Some(AssetKind::Text))
            .expect("request again");
        tick_until(&world.pipeline, || again.is_done()).await;
        assert!(!again.failed());
        assert_eq!(world.source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(world.errors.load(Ordering::SeqCst), 0);

        world.pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_download() {
        let root = testutil::temp_dir("pipe-dedup");
        let bundle = testutil::bundle_bytes(&[
            ("a", AssetKind::Binary, vec![1, 2, 3]),
            ("b", AssetKind::Binary, vec![4, 5, 6]),
        ]);
        let world = world(root, &[("pack.bundle", &bundle, &[])]);

        let first = world
            .pipeline
            .request_asset("pack.bundle", "a", None)
            .expect("request a");
        let second = world
            .pipeline
            .request_asset("pack.bundle", "b", None)
            .expect("request b");
        assert_eq!(world.pipeline.live_files(), 1);
        assert!(world.pipeline.live_downloads() <= 1);

        tick_until(&world.pipeline, || first.is_done() && second.is_done()).await;
        assert!(!first.failed() && !second.failed());
        assert_eq!(world.source.fetches.load(Ordering::SeqCst), 1);

        world.pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn dependencies_download_alongside_the_root_file() {
        let root = testutil::temp_dir("pipe-deps");
        let shared = testutil::bundle_bytes(&[("tex", AssetKind::Binary, vec![9])]);
        let level = testutil::bundle_bytes(&[("motd", AssetKind::Text, b"hi".to_vec())]);
        let world = world(
            root,
            &[
                ("level1.bundle", &level, &["shared.bundle"]),
                ("shared.bundle", &shared, &[]),
            ],
        );

        let file = world.pipeline.request_file("level1.bundle").expect("file");
        assert_eq!(world.pipeline.live_files(), 2);

        tick_until(&world.pipeline, || file.done()).await;
        assert!(!file.failed());
        assert_eq!(world.source.fetches.load(Ordering::SeqCst), 2);
        assert!(world.pipeline.cache().has(
            "shared.bundle",
            Some(&ContentHash::of_slice(&shared))
        ));

        world.pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_file_is_rejected_up_front() {
        let root = testutil::temp_dir("pipe-unknown");
        let world = world(root, &[]);
        let result = world.pipeline.request_file("ghost.bundle");
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
    }

    #[tokio::test]
    async fn dropping_the_last_guard_prunes_the_handles() {
        let root = testutil::temp_dir("pipe-prune");
        let bundle = testutil::bundle_bytes(&[("motd", AssetKind::Text, b"x".to_vec())]);
        let world = world(root, &[("level1.bundle", &bundle, &[])]);

        let asset = world
            .pipeline
            .request_asset("level1.bundle", "motd", None)
            .expect("request");
        tick_until(&world.pipeline, || asset.is_done()).await;
        assert_eq!(world.pipeline.live_assets(), 1);

        drop(asset);
        tick_until(&world.pipeline, || {
            world.pipeline.live_assets() == 0
                && world.pipeline.live_files() == 0
                && world.pipeline.live_downloads() == 0
        })
        .await;

        world.pipeline.shutdown().await;
    }
}
