use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::errors::{ErrorCallback, ErrorKind, PipelineError, ProgressCallback, Result};
use crate::hash::ContentHash;
use crate::refcount::{RefCount, RefCounted};
use crate::utils::file::remove_file_quiet;
use crate::writer::{FileWriter, WriteHandle};

pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Network seam: resolves a logical name to a byte stream. The production
/// implementation is [`HttpSource`]; tests substitute stubs.
pub trait RemoteSource: Send + Sync + 'static {
    fn fetch(&self, name: &str) -> BoxFuture<'static, Result<ByteStream>>;
}

/// Streams resources from `<base_url>/<name>` over HTTP.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }
}

impl RemoteSource for HttpSource {
    fn fetch(&self, name: &str) -> BoxFuture<'static, Result<ByteStream>> {
        let client = self.client.clone();
        let url = format!("{}/{}", self.base_url, name);
        Box::pin(async move {
            let response = client.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(PipelineError::Http(format!(
                    "{} -> HTTP {}",
                    url,
                    response.status()
                )));
            }
            let stream = response
                .bytes_stream()
                .map(|item| item.map(|bytes| bytes.to_vec()).map_err(PipelineError::Network));
            Ok(Box::pin(stream) as ByteStream)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadState {
    NotStarted,
    Downloading,
    CacheWriting,
    Done,
    Error,
}

struct TransferFailure {
    kind: ErrorKind,
    detail: String,
    retryable: bool,
}

type TransferOutcome = std::result::Result<(), TransferFailure>;

/// State one transfer attempt shares with the polling side. Every attempt
/// gets a fresh instance, so an aborted attempt that still manages to post
/// its outcome writes into state the poll no longer reads. Without that, a
/// stale outcome could consume an extra retry slot or flip the next
/// attempt's phase early.
struct TransferShared {
    outcome: Mutex<Option<TransferOutcome>>,
    write_handle: Mutex<Option<Arc<WriteHandle>>>,
    /// Set once the network stream ended and only the cache write remains.
    writing: AtomicBool,
    attempt_bytes: AtomicU64,
    last_receive: Mutex<Instant>,
}

impl TransferShared {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            write_handle: Mutex::new(None),
            writing: AtomicBool::new(false),
            attempt_bytes: AtomicU64::new(0),
            last_receive: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_receive.lock() {
            *guard = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_receive
            .lock()
            .map(|guard| guard.elapsed())
            .unwrap_or_default()
    }
}

pub struct DownloadRequest {
    pub name: String,
    pub final_path: PathBuf,
    pub hash: Option<ContentHash>,
    pub sha256: Option<String>,
}

/// One network fetch per logical resource. Streams bytes into the
/// [`FileWriter`], retries on transport error or receive timeout up to the
/// budget, and is reference-counted so concurrent requesters share one
/// fetch. The transfer itself runs in a spawned task; `update()` is a
/// non-blocking poll that harvests its outcome and advances the state
/// machine.
pub struct DownloadHandle {
    name: String,
    final_path: PathBuf,
    hash: Option<ContentHash>,
    sha256: Option<String>,
    timeout: Duration,
    retry_left: AtomicU32,
    attempts: AtomicU32,
    state: Mutex<DownloadState>,
    refs: RefCount,
    shared: Mutex<Arc<TransferShared>>,
    writer: Arc<FileWriter>,
    source: Arc<dyn RemoteSource>,
    on_error: ErrorCallback,
    on_progress: Option<ProgressCallback>,
    on_complete: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    runtime: tokio::runtime::Handle,
    disposed: AtomicBool,
}

impl RefCounted for DownloadHandle {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }
}

impl DownloadHandle {
    /// Must be constructed on a runtime thread; transfer attempts are
    /// spawned onto the ambient runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request: DownloadRequest,
        source: Arc<dyn RemoteSource>,
        writer: Arc<FileWriter>,
        retry_count: u32,
        timeout: Duration,
        on_error: ErrorCallback,
        on_progress: Option<ProgressCallback>,
        on_complete: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            name: request.name,
            final_path: request.final_path,
            hash: request.hash,
            sha256: request.sha256,
            timeout,
            retry_left: AtomicU32::new(retry_count),
            attempts: AtomicU32::new(0),
            state: Mutex::new(DownloadState::NotStarted),
            refs: RefCount::new(),
            shared: Mutex::new(Arc::new(TransferShared::new())),
            writer,
            source,
            on_error,
            on_progress,
            on_complete: Mutex::new(Some(on_complete.unwrap_or_else(|| Box::new(|| {})))),
            task: Mutex::new(None),
            runtime: tokio::runtime::Handle::current(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn state(&self) -> DownloadState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(DownloadState::Error)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state(), DownloadState::Done | DownloadState::Error)
    }

    pub fn failed(&self) -> bool {
        self.state() == DownloadState::Error
    }

    /// True only once the network transfer *and* the verified cache write
    /// both completed.
    pub fn file_available(&self) -> bool {
        self.state() == DownloadState::Done
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.shared_state().attempt_bytes.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        self.assert_live();
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if *state != DownloadState::NotStarted {
                return;
            }
            *state = DownloadState::Downloading;
        }
        self.spawn_attempt();
    }

    /// Non-blocking poll: harvests the transfer task's outcome, enforces
    /// the receive timeout, and drives retries.
    pub fn update(&self) {
        self.assert_live();
        let state = self.state();
        if !matches!(state, DownloadState::Downloading | DownloadState::CacheWriting) {
            return;
        }

        let shared = self.shared_state();
        if state == DownloadState::Downloading && shared.writing.load(Ordering::SeqCst) {
            self.set_state(DownloadState::CacheWriting);
        }

        let outcome = shared.outcome.lock().ok().and_then(|mut guard| guard.take());
        if let Some(outcome) = outcome {
            match outcome {
                Ok(()) => {
                    tracing::info!(
                        "download complete name={} bytes={}",
                        self.name,
                        self.downloaded_bytes()
                    );
                    self.set_state(DownloadState::Done);
                    let callback = self.on_complete.lock().ok().and_then(|mut cb| cb.take());
                    if let Some(callback) = callback {
                        callback();
                    }
                }
                Err(failure) if failure.retryable && self.take_retry() => {
                    tracing::warn!(
                        "download failed name={} ({}), retrying",
                        self.name,
                        failure.detail
                    );
                    self.begin_retry();
                }
                Err(failure) => {
                    self.set_state(DownloadState::Error);
                    (self.on_error)(failure.kind, &self.name, &failure.detail);
                }
            }
            return;
        }

        // The receive timeout bounds network receipt only, never the
        // cache write.
        if self.state() == DownloadState::Downloading && shared.idle_for() > self.timeout {
            self.abort_attempt();
            if self.take_retry() {
                tracing::warn!("download timed out name={}, retrying", self.name);
                self.begin_retry();
            } else {
                self.set_state(DownloadState::Error);
                (self.on_error)(ErrorKind::Network, &self.name, "receive timeout");
            }
        }
    }

    /// Valid only once done with no outstanding references; anything else
    /// is an invariant violation, not a data error.
    pub fn dispose(&self) {
        assert!(
            self.is_done() && self.refs.count() <= 0,
            "download handle for {} disposed while in use",
            self.name
        );
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn assert_live(&self) {
        assert!(
            !self.disposed.load(Ordering::SeqCst),
            "download handle for {} used after dispose",
            self.name
        );
    }

    fn set_state(&self, next: DownloadState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn take_retry(&self) -> bool {
        self.retry_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
    }

    fn shared_state(&self) -> Arc<TransferShared> {
        let guard = self.shared.lock().unwrap_or_else(|err| err.into_inner());
        Arc::clone(&guard)
    }

    fn begin_retry(&self) {
        self.abort_attempt();
        let rollback = self.shared_state().attempt_bytes.swap(0, Ordering::SeqCst);
        if rollback > 0 {
            if let Some(on_progress) = &self.on_progress {
                on_progress(-(rollback as i64));
            }
        }
        self.set_state(DownloadState::Downloading);
        self.spawn_attempt();
    }

    fn abort_attempt(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        let write_handle = self
            .shared_state()
            .write_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(write_handle) = write_handle {
            let writer = Arc::clone(&self.writer);
            self.runtime.spawn(async move {
                let _ = writer.abort(&write_handle).await;
            });
        }
    }

    fn spawn_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(TransferShared::new());
        *self.shared.lock().unwrap_or_else(|err| err.into_inner()) = Arc::clone(&shared);
        let ctx = TransferContext {
            name: self.name.clone(),
            final_path: self.final_path.clone(),
            hash: self.hash,
            sha256: self.sha256.clone(),
            writer: Arc::clone(&self.writer),
            source: Arc::clone(&self.source),
            shared,
            on_progress: self.on_progress.clone(),
        };
        let task = self.runtime.spawn(async move {
            let outcome = transfer_once(&ctx).await;
            if let Ok(mut guard) = ctx.shared.outcome.lock() {
                *guard = Some(outcome);
            }
        });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
    }
}

struct TransferContext {
    name: String,
    final_path: PathBuf,
    hash: Option<ContentHash>,
    sha256: Option<String>,
    writer: Arc<FileWriter>,
    source: Arc<dyn RemoteSource>,
    shared: Arc<TransferShared>,
    on_progress: Option<ProgressCallback>,
}

async fn transfer_once(ctx: &TransferContext) -> TransferOutcome {
    let write_handle = match ctx.writer.begin(&ctx.final_path).await {
        Ok(handle) => handle,
        Err(err) => {
            return Err(TransferFailure {
                kind: ErrorKind::CantWriteStorageCache,
                detail: err.to_string(),
                retryable: false,
            })
        }
    };
    if let Ok(mut guard) = ctx.shared.write_handle.lock() {
        *guard = Some(Arc::clone(&write_handle));
    }

    let mut stream = match ctx.source.fetch(&ctx.name).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ctx.writer.abort(&write_handle).await;
            return Err(TransferFailure {
                kind: ErrorKind::Network,
                detail: err.to_string(),
                retryable: true,
            });
        }
    };

    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = ctx.writer.abort(&write_handle).await;
                return Err(TransferFailure {
                    kind: ErrorKind::Network,
                    detail: err.to_string(),
                    retryable: true,
                });
            }
        };
        if chunk.is_empty() {
            continue;
        }
        ctx.shared.touch();
        ctx.shared
            .attempt_bytes
            .fetch_add(chunk.len() as u64, Ordering::SeqCst);
        if let Some(on_progress) = &ctx.on_progress {
            on_progress(chunk.len() as i64);
        }

        let mut offset = 0;
        while offset < chunk.len() && !write_handle.is_done() {
            match ctx.writer.write(&write_handle, &chunk[offset..]).await {
                Ok(written) => {
                    offset += written;
                    ctx.shared.touch();
                }
                Err(err) => {
                    return Err(TransferFailure {
                        kind: ErrorKind::CantWriteStorageCache,
                        detail: err.to_string(),
                        retryable: false,
                    })
                }
            }
        }
        if write_handle.is_done() {
            // The writer latched a failure mid-stream; stop feeding it.
            break;
        }
    }

    ctx.shared.writing.store(true, Ordering::SeqCst);
    if let Err(err) = ctx.writer.end(&write_handle).await {
        return Err(TransferFailure {
            kind: ErrorKind::CantWriteStorageCache,
            detail: err.to_string(),
            retryable: false,
        });
    }
    while !write_handle.is_done() {
        sleep(Duration::from_millis(2)).await;
    }
    if let Some(failure) = write_handle.failure() {
        return Err(TransferFailure {
            kind: ErrorKind::CantWriteStorageCache,
            detail: failure,
            retryable: false,
        });
    }

    verify_written_file(ctx).await
}

/// The downloaded file only becomes available after its content verifies
/// against the manifest fingerprints. A mismatch means the transfer was
/// corrupted, so it is retried like a network failure and the bad file is
/// deleted.
async fn verify_written_file(ctx: &TransferContext) -> TransferOutcome {
    let path = ctx.final_path.clone();
    let hash = ctx.hash;
    let sha256 = ctx.sha256.clone();
    let verified =
        tokio::task::spawn_blocking(move || verify_blocking(&path, hash, sha256.as_deref())).await;

    match verified {
        Ok(Ok(())) => Ok(()),
        Ok(Err(detail)) => {
            remove_file_quiet(&ctx.final_path);
            Err(TransferFailure {
                kind: ErrorKind::Network,
                detail,
                retryable: true,
            })
        }
        Err(err) => Err(TransferFailure {
            kind: ErrorKind::CantWriteStorageCache,
            detail: format!("verify task failed: {}", err),
            retryable: false,
        }),
    }
}

fn verify_blocking(
    path: &Path,
    hash: Option<ContentHash>,
    sha256: Option<&str>,
) -> std::result::Result<(), String> {
    if let Some(expected) = hash {
        let actual = ContentHash::of_file(path).map_err(|err| err.to_string())?;
        if actual != expected {
            return Err(format!(
                "content hash mismatch: expected {} actual {}",
                expected, actual
            ));
        }
    }
    if let Some(expected) = sha256 {
        let actual = sha256_file(path).map_err(|err| err.to_string())?;
        if actual != expected {
            return Err(format!(
                "sha256 mismatch: expected {} actual {}",
                expected, actual
            ));
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
