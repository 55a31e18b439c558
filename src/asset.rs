use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::errors::{ErrorCallback, ErrorKind};
use crate::file_handle::FileHandle;
use crate::loaded::{AssetKind, AssetObject, LoadedFile};
use crate::refcount::{Ref, RefCount, RefCounted};

/// Reported for assets whose real footprint is not known yet.
pub const DEFAULT_MEMORY_ESTIMATE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetState {
    WaitingFile,
    Extracting,
    Done,
    Error,
}

pub type AssetCallback = Box<dyn FnOnce(Option<AssetObject>) + Send>;

type ExtractOutcome = std::result::Result<AssetObject, (ErrorKind, String)>;

/// One extracted asset out of a loaded file. Pins its source file via a
/// [`Ref`] guard until extraction finishes. Completion callbacks fire
/// exactly once each, in registration order; a callback registered after
/// the terminal state fires immediately. On failure every callback still
/// fires, with `None`.
pub struct AssetHandle {
    name: String,
    expected: Option<AssetKind>,
    file: Mutex<Option<Ref<FileHandle>>>,
    state: Mutex<AssetState>,
    result: Mutex<Option<AssetObject>>,
    extract_slot: Arc<Mutex<Option<ExtractOutcome>>>,
    callbacks: Mutex<Vec<AssetCallback>>,
    error_kind: Mutex<Option<ErrorKind>>,
    on_error: ErrorCallback,
    refs: RefCount,
    task: Mutex<Option<JoinHandle<()>>>,
    runtime: tokio::runtime::Handle,
    disposed: AtomicBool,
}

impl RefCounted for AssetHandle {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }
}

impl AssetHandle {
    /// Must be constructed on a runtime thread.
    pub fn new(
        name: impl Into<String>,
        expected: Option<AssetKind>,
        file: Ref<FileHandle>,
        on_error: ErrorCallback,
    ) -> Self {
        Self {
            name: name.into(),
            expected,
            file: Mutex::new(Some(file)),
            state: Mutex::new(AssetState::WaitingFile),
            result: Mutex::new(None),
            extract_slot: Arc::new(Mutex::new(None)),
            callbacks: Mutex::new(Vec::new()),
            error_kind: Mutex::new(None),
            on_error,
            refs: RefCount::new(),
            task: Mutex::new(None),
            runtime: tokio::runtime::Handle::current(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AssetState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(AssetState::Error)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state(), AssetState::Done | AssetState::Error)
    }

    pub fn failed(&self) -> bool {
        self.state() == AssetState::Error
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind.lock().ok().and_then(|guard| *guard)
    }

    pub fn asset(&self) -> Option<AssetObject> {
        self.result.lock().ok().and_then(|guard| guard.clone())
    }

    /// Decoded footprint once extracted; a fixed guess before that.
    pub fn estimate_memory_size(&self) -> usize {
        self.result
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|asset| asset.estimate_memory_size()))
            .unwrap_or(DEFAULT_MEMORY_ESTIMATE)
    }

    /// Registers a completion callback. Fires immediately when the handle
    /// is already terminal.
    pub fn on_loaded(&self, callback: AssetCallback) {
        self.assert_live();
        match self.state() {
            AssetState::Done => callback(self.asset()),
            AssetState::Error => callback(None),
            _ => {
                if let Ok(mut callbacks) = self.callbacks.lock() {
                    callbacks.push(callback);
                }
            }
        }
    }

    /// Non-blocking poll; the owning pipeline drives the source file's own
    /// updates.
    pub fn update(&self) {
        self.assert_live();
        match self.state() {
            AssetState::WaitingFile => self.poll_file(),
            AssetState::Extracting => self.poll_extract(),
            AssetState::Done | AssetState::Error => {}
        }
    }

    fn poll_file(&self) {
        let loaded = {
            let Ok(guard) = self.file.lock() else {
                return;
            };
            let Some(file) = guard.as_ref() else {
                return;
            };
            if file.failed() {
                // The file already reported its own error; the asset only
                // settles its callbacks.
                drop(guard);
                self.fail_quiet();
                return;
            }
            if !file.done() {
                return;
            }
            file.loaded()
        };
        let Some(loaded) = loaded else {
            self.fail(
                ErrorKind::CantLoadAsset,
                "source file settled without content".to_string(),
            );
            return;
        };
        self.begin_extract(loaded);
    }

    fn begin_extract(&self, loaded: LoadedFile) {
        match loaded {
            LoadedFile::Bundle(bundle) => {
                self.set_state(AssetState::Extracting);
                let name = self.name.clone();
                let expected = self.expected;
                let slot = Arc::clone(&self.extract_slot);
                let task = self.runtime.spawn(async move {
                    let outcome =
                        tokio::task::spawn_blocking(move || bundle.extract(&name, expected)).await;
                    let outcome = outcome.unwrap_or_else(|err| {
                        Err((
                            ErrorKind::CantLoadAsset,
                            format!("extract task failed: {}", err),
                        ))
                    });
                    if let Ok(mut guard) = slot.lock() {
                        *guard = Some(outcome);
                    }
                });
                if let Ok(mut guard) = self.task.lock() {
                    *guard = Some(task);
                }
            }
            other => {
                // Non-container files are themselves the asset.
                match other.as_single_asset() {
                    Some(asset) => {
                        if let Some(expected) = self.expected {
                            if asset.kind() != expected {
                                self.fail(
                                    ErrorKind::AssetTypeMismatch,
                                    format!(
                                        "asset is {}, requested {}",
                                        asset.kind().as_str(),
                                        expected.as_str()
                                    ),
                                );
                                return;
                            }
                        }
                        self.complete(asset);
                    }
                    None => self.fail(
                        ErrorKind::CantLoadAsset,
                        "file carries no extractable asset".to_string(),
                    ),
                }
            }
        }
    }

    fn poll_extract(&self) {
        let outcome = self
            .extract_slot
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        match outcome {
            None => {}
            Some(Ok(asset)) => self.complete(asset),
            Some(Err((kind, detail))) => self.fail(kind, detail),
        }
    }

    fn complete(&self, asset: AssetObject) {
        tracing::debug!(
            "asset extracted name={} kind={} bytes~{}",
            self.name,
            asset.kind().as_str(),
            asset.estimate_memory_size()
        );
        if let Ok(mut result) = self.result.lock() {
            *result = Some(asset);
        }
        self.set_state(AssetState::Done);
        self.release_file();
        let payload = self.asset();
        for callback in self.take_callbacks() {
            callback(payload.clone());
        }
    }

    fn fail(&self, kind: ErrorKind, detail: String) {
        if let Ok(mut slot) = self.error_kind.lock() {
            *slot = Some(kind);
        }
        self.set_state(AssetState::Error);
        self.release_file();
        (self.on_error)(kind, &self.name, &detail);
        for callback in self.take_callbacks() {
            callback(None);
        }
    }

    fn fail_quiet(&self) {
        if let Ok(mut slot) = self.error_kind.lock() {
            *slot = Some(ErrorKind::CantLoadAsset);
        }
        self.set_state(AssetState::Error);
        self.release_file();
        for callback in self.take_callbacks() {
            callback(None);
        }
    }

    fn take_callbacks(&self) -> Vec<AssetCallback> {
        self.callbacks
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default()
    }

    fn release_file(&self) {
        if let Ok(mut guard) = self.file.lock() {
            guard.take();
        }
    }

    fn set_state(&self, next: AssetState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    pub fn disposable(&self) -> bool {
        self.is_done() && self.refs.count() <= 0
    }

    pub fn dispose(&self) {
        assert!(
            self.disposable(),
            "asset handle for {} disposed while in use",
            self.name
        );
        self.release_file();
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        if let Ok(mut result) = self.result.lock() {
            result.take();
        }
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn assert_live(&self) {
        assert!(
            !self.disposed.load(Ordering::SeqCst),
            "asset handle for {} used after dispose",
            self.name
        );
    }
}
