use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::mpsc;

use crate::config::PipelineConfig;
use crate::errors::{PipelineError, Result};
use crate::utils::file::{remove_file_quiet, TMP_SUFFIX};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// One open write. Created on the caller's thread, advanced exclusively by
/// the writer thread, polled by the caller for completion. Never reused.
pub struct WriteHandle {
    id: u64,
    final_path: PathBuf,
    temp_path: PathBuf,
    done: AtomicBool,
    failure: Mutex<Option<String>>,
    written_bytes: AtomicU64,
}

impl WriteHandle {
    fn new(final_path: &Path) -> Self {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        // The id keeps temp names unique, so an aborted earlier write to
        // the same target cannot delete a retry's temp file.
        let mut temp_name = final_path.as_os_str().to_os_string();
        temp_name.push(format!(".{}{}", id, TMP_SUFFIX));
        Self {
            id,
            final_path: final_path.to_path_buf(),
            temp_path: PathBuf::from(temp_name),
            done: AtomicBool::new(false),
            failure: Mutex::new(None),
            written_bytes: AtomicU64::new(0),
        }
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// True once the write reached a terminal state (renamed, aborted, or
    /// failed). Check [`WriteHandle::failure`] to distinguish.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::SeqCst)
    }

    fn latch_failure(&self, detail: String) {
        if let Ok(mut guard) = self.failure.lock() {
            guard.get_or_insert(detail);
        }
        self.done.store(true, Ordering::SeqCst);
    }
}

enum WriteRequest {
    Begin {
        handle: Arc<WriteHandle>,
    },
    Write {
        handle: Arc<WriteHandle>,
        data: Vec<u8>,
    },
    End {
        handle: Arc<WriteHandle>,
    },
    Abort {
        handle: Arc<WriteHandle>,
    },
    Shutdown,
}

/// Serializes every disk write onto one dedicated thread through a bounded
/// request queue, so writes and the terminal rename always happen in
/// submission order regardless of caller thread. A full queue makes
/// `send().await` suspend the producer, which is the back-pressure path
/// from disk to network.
pub struct FileWriter {
    tx: mpsc::Sender<WriteRequest>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    chunk_bytes: usize,
}

impl FileWriter {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.write_queue_capacity());
        let thread = thread::Builder::new()
            .name("assetflow-writer".to_string())
            .spawn(move || writer_loop(rx))?;
        Ok(Self {
            tx,
            thread: Mutex::new(Some(thread)),
            chunk_bytes: config.write_chunk_bytes,
        })
    }

    /// Opens a write to `final_path`'s temp twin. Bytes only appear under
    /// the final name after a successful [`FileWriter::end`].
    pub async fn begin(&self, final_path: &Path) -> Result<Arc<WriteHandle>> {
        let handle = Arc::new(WriteHandle::new(final_path));
        self.send(WriteRequest::Begin {
            handle: Arc::clone(&handle),
        })
        .await?;
        Ok(handle)
    }

    /// Accepts at most one chunk of `data` and returns how many bytes were
    /// taken; callers loop on the remainder. On a handle that already
    /// latched a failure this is a no-op that reports the input as
    /// consumed, so producers drain instead of spinning.
    pub async fn write(&self, handle: &Arc<WriteHandle>, data: &[u8]) -> Result<usize> {
        if data.is_empty() || handle.is_done() {
            return Ok(data.len());
        }
        let take = data.len().min(self.chunk_bytes);
        self.send(WriteRequest::Write {
            handle: Arc::clone(handle),
            data: data[..take].to_vec(),
        })
        .await?;
        Ok(take)
    }

    pub async fn end(&self, handle: &Arc<WriteHandle>) -> Result<()> {
        if handle.is_done() {
            return Ok(());
        }
        self.send(WriteRequest::End {
            handle: Arc::clone(handle),
        })
        .await
    }

    pub async fn abort(&self, handle: &Arc<WriteHandle>) -> Result<()> {
        if handle.is_done() {
            return Ok(());
        }
        self.send(WriteRequest::Abort {
            handle: Arc::clone(handle),
        })
        .await
    }

    /// Drains the queue and joins the writer thread. Must not be called
    /// from the writer thread itself.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
        let thread = self
            .thread
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(thread) = thread {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }

    async fn send(&self, request: WriteRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| PipelineError::Cache("file writer stopped".to_string()))
    }
}

fn writer_loop(mut rx: mpsc::Receiver<WriteRequest>) {
    let mut open: HashMap<u64, File> = HashMap::new();

    while let Some(request) = rx.blocking_recv() {
        match request {
            WriteRequest::Begin { handle } => {
                if handle.is_done() {
                    continue;
                }
                if let Some(parent) = handle.temp_path().parent() {
                    if let Err(err) = fs::create_dir_all(parent) {
                        fail(&handle, &mut open, err);
                        continue;
                    }
                }
                match File::create(handle.temp_path()) {
                    Ok(file) => {
                        open.insert(handle.id, file);
                    }
                    Err(err) => fail(&handle, &mut open, err),
                }
            }
            WriteRequest::Write { handle, data } => {
                if handle.is_done() {
                    continue;
                }
                let Some(file) = open.get_mut(&handle.id) else {
                    continue;
                };
                match file.write_all(&data) {
                    Ok(()) => {
                        handle
                            .written_bytes
                            .fetch_add(data.len() as u64, Ordering::SeqCst);
                    }
                    Err(err) => fail(&handle, &mut open, err),
                }
            }
            WriteRequest::End { handle } => {
                if handle.is_done() {
                    continue;
                }
                let Some(file) = open.remove(&handle.id) else {
                    handle.latch_failure("end without begin".to_string());
                    continue;
                };
                if let Err(err) = file.sync_all() {
                    drop(file);
                    fail(&handle, &mut open, err);
                    continue;
                }
                drop(file);
                match fs::rename(handle.temp_path(), handle.final_path()) {
                    Ok(()) => {
                        handle.done.store(true, Ordering::SeqCst);
                    }
                    Err(err) => fail(&handle, &mut open, err),
                }
            }
            WriteRequest::Abort { handle } => {
                open.remove(&handle.id);
                remove_file_quiet(handle.temp_path());
                handle.done.store(true, Ordering::SeqCst);
            }
            WriteRequest::Shutdown => break,
        }
    }

    // Anything still open never saw End: leave only temp files behind so
    // the next scan can reclaim them.
    if !open.is_empty() {
        tracing::warn!("file writer stopped with {} unfinished writes", open.len());
    }
}

fn fail(handle: &Arc<WriteHandle>, open: &mut HashMap<u64, File>, err: std::io::Error) {
    tracing::warn!(
        "write to {} failed: {}",
        handle.final_path().display(),
        err
    );
    open.remove(&handle.id);
    remove_file_quiet(handle.temp_path());
    handle.latch_failure(err.to_string());
}
