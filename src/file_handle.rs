use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::download::DownloadHandle;
use crate::errors::{ErrorCallback, ErrorKind, PipelineError};
use crate::loaded::{load_from_path, LoadedFile};
use crate::refcount::{Ref, RefCount, RefCounted};
use crate::utils::file::describe_io_error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileState {
    WaitingDownload,
    Loading,
    Done,
    Error,
}

type LoadOutcome = std::result::Result<LoadedFile, (ErrorKind, String)>;

/// One file the pipeline has been asked to load, together with the files
/// it depends on. While a download is in flight the handle waits on it;
/// once the bytes are cached on disk, decoding happens on a blocking task
/// and `update()` harvests the result. The handle pins its download and
/// every dependency via [`Ref`] guards so none of them can be disposed
/// underneath it.
pub struct FileHandle {
    name: String,
    path: PathBuf,
    download: Mutex<Option<Ref<DownloadHandle>>>,
    dependencies: Vec<Ref<FileHandle>>,
    state: Mutex<FileState>,
    result: Mutex<Option<LoadedFile>>,
    load_slot: Arc<Mutex<Option<LoadOutcome>>>,
    error_kind: Mutex<Option<ErrorKind>>,
    on_error: ErrorCallback,
    refs: RefCount,
    task: Mutex<Option<JoinHandle<()>>>,
    runtime: tokio::runtime::Handle,
    disposed: AtomicBool,
}

impl RefCounted for FileHandle {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }
}

impl FileHandle {
    /// Must be constructed on a runtime thread. `download` is `None` when
    /// the file is already cached.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        download: Option<Ref<DownloadHandle>>,
        dependencies: Vec<Ref<FileHandle>>,
        on_error: ErrorCallback,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            download: Mutex::new(download),
            dependencies,
            state: Mutex::new(FileState::WaitingDownload),
            result: Mutex::new(None),
            load_slot: Arc::new(Mutex::new(None)),
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

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> FileState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(FileState::Error)
    }

    pub fn dependencies(&self) -> &[Ref<FileHandle>] {
        &self.dependencies
    }

    /// Terminal for this file itself, ignoring dependencies.
    pub fn settled(&self) -> bool {
        matches!(self.state(), FileState::Done | FileState::Error)
    }

    /// Terminal including every transitive dependency.
    pub fn done(&self) -> bool {
        self.settled() && self.dependencies.iter().all(|dep| dep.done())
    }

    pub fn failed(&self) -> bool {
        self.state() == FileState::Error
            || self.dependencies.iter().any(|dep| dep.failed())
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind.lock().ok().and_then(|guard| *guard)
    }

    /// The decoded file, once `done()` without error.
    pub fn loaded(&self) -> Option<LoadedFile> {
        self.result.lock().ok().and_then(|guard| guard.clone())
    }

    /// Non-blocking poll. Dependencies are driven by their own updates;
    /// this only advances the handle's own state machine.
    pub fn update(&self) {
        self.assert_live();
        match self.state() {
            FileState::WaitingDownload => self.poll_download(),
            FileState::Loading => self.poll_load(),
            FileState::Done | FileState::Error => {}
        }
    }

    fn poll_download(&self) {
        let verdict = {
            let Ok(guard) = self.download.lock() else {
                return;
            };
            match guard.as_ref() {
                None => Some(true),
                Some(download) if download.file_available() => Some(true),
                Some(download) if download.failed() => Some(false),
                Some(_) => None,
            }
        };
        match verdict {
            Some(true) => {
                // The guard is released here: a finished download no
                // longer needs pinning and may be pruned by the pipeline.
                if let Ok(mut guard) = self.download.lock() {
                    guard.take();
                }
                self.begin_load();
            }
            Some(false) => {
                // The download already reported its own error; the file
                // just records the terminal state.
                if let Ok(mut guard) = self.download.lock() {
                    guard.take();
                }
                self.fail(ErrorKind::CantLoadStorageCache, None);
            }
            None => {}
        }
    }

    fn begin_load(&self) {
        self.set_state(FileState::Loading);
        let path = self.path.clone();
        let slot = Arc::clone(&self.load_slot);
        let task = self.runtime.spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || load_classified(&path)).await;
            let outcome = outcome.unwrap_or_else(|err| {
                Err((
                    ErrorKind::CantLoadStorageCache,
                    format!("load task failed: {}", err),
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

    fn poll_load(&self) {
        let outcome = self
            .load_slot
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        match outcome {
            None => {}
            Some(Ok(loaded)) => {
                tracing::debug!("file loaded name={} kind={}", self.name, loaded.kind_name());
                if let Ok(mut result) = self.result.lock() {
                    *result = Some(loaded);
                }
                self.set_state(FileState::Done);
            }
            Some(Err((kind, detail))) => {
                self.fail(kind, Some(detail));
            }
        }
    }

    fn fail(&self, kind: ErrorKind, detail: Option<String>) {
        if let Ok(mut slot) = self.error_kind.lock() {
            *slot = Some(kind);
        }
        self.set_state(FileState::Error);
        if let Some(detail) = detail {
            (self.on_error)(kind, &self.name, &detail);
        }
    }

    fn set_state(&self, next: FileState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    pub fn disposable(&self) -> bool {
        self.settled() && self.refs.count() <= 0
    }

    /// Releases the download and dependency pins. Valid only once settled
    /// with no outstanding references.
    pub fn dispose(&self) {
        assert!(
            self.disposable(),
            "file handle for {} disposed while in use",
            self.name
        );
        if let Ok(mut guard) = self.download.lock() {
            guard.take();
        }
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
            "file handle for {} used after dispose",
            self.name
        );
    }
}

/// Maps a load failure onto the caller-facing taxonomy: I/O problems are
/// cache read failures, anything past the read is a malformed container.
fn load_classified(path: &Path) -> LoadOutcome {
    match load_from_path(path) {
        Ok(loaded) => Ok(loaded),
        Err(PipelineError::Io(err)) => Err((
            ErrorKind::CantLoadStorageCache,
            format!("{}: {}", describe_io_error(&err), err),
        )),
        Err(err) => Err((ErrorKind::CantLoadBundle, err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loaded::AssetKind;
    use crate::testutil;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    fn noop_errors() -> (ErrorCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&count);
        let callback: ErrorCallback = Arc::new(move |_kind, _name, _detail| {
            cloned.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    async fn drive(handle: &FileHandle) {
        for _ in 0..2_000 {
            handle.update();
            if handle.settled() {
                return;
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("file never settled");
    }

    #[tokio::test]
    async fn cached_bundle_loads_without_a_download() {
        let dir = testutil::temp_dir("file-load");
        let path = dir.join("level1.bundle");
        let bytes = testutil::bundle_bytes(&[(
            "hello",
            AssetKind::Text,
            b"hello world".to_vec(),
        )]);
        std::fs::write(&path, bytes).expect("write bundle");

        let (on_error, errors) = noop_errors();
        let handle = FileHandle::new("level1.bundle", &path, None, Vec::new(), on_error);
        drive(&handle).await;

        assert_eq!(handle.state(), FileState::Done);
        assert!(handle.done());
        let loaded = handle.loaded().expect("loaded file");
        assert_eq!(loaded.kind_name(), "bundle");
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_file_reports_cache_read_failure() {
        let dir = testutil::temp_dir("file-missing");
        let (on_error, errors) = noop_errors();
        let handle = FileHandle::new(
            "ghost.bundle",
            dir.join("ghost.bundle"),
            None,
            Vec::new(),
            on_error,
        );
        drive(&handle).await;

        assert_eq!(handle.state(), FileState::Error);
        assert_eq!(handle.error_kind(), Some(ErrorKind::CantLoadStorageCache));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn truncated_bundle_reports_malformed_container() {
        let dir = testutil::temp_dir("file-truncated");
        let path = dir.join("broken.bundle");
        std::fs::write(&path, b"not a zip archive").expect("write junk");

        let (on_error, _errors) = noop_errors();
        let handle = FileHandle::new("broken.bundle", &path, None, Vec::new(), on_error);
        drive(&handle).await;

        assert_eq!(handle.error_kind(), Some(ErrorKind::CantLoadBundle));
    }

    #[tokio::test]
    async fn done_requires_every_dependency() {
        let dir = testutil::temp_dir("file-deps");
        let dep_path = dir.join("shared.bundle");
        let root_path = dir.join("level1.bundle");
        let bytes = testutil::bundle_bytes(&[("a", AssetKind::Binary, vec![1, 2, 3])]);
        std::fs::write(&dep_path, &bytes).expect("write dep");
        std::fs::write(&root_path, &bytes).expect("write root");

        let (on_error, _errors) = noop_errors();
        let dep = Arc::new(FileHandle::new(
            "shared.bundle",
            &dep_path,
            None,
            Vec::new(),
            Arc::clone(&on_error),
        ));
        let root = FileHandle::new(
            "level1.bundle",
            &root_path,
            None,
            vec![Ref::acquire(Arc::clone(&dep))],
            on_error,
        );

        drive(&root).await;
        assert!(root.settled());
        assert!(!root.done(), "dependency has not even started loading");

        drive(&dep).await;
        assert!(root.done());
        assert_eq!(dep.ref_count().count(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "disposed while in use")]
    async fn disposing_a_referenced_handle_panics() {
        let dir = testutil::temp_dir("file-dispose");
        let (on_error, _errors) = noop_errors();
        let handle = Arc::new(FileHandle::new(
            "level1.bundle",
            dir.join("level1.bundle"),
            None,
            Vec::new(),
            on_error,
        ));
        let _guard = Ref::acquire(Arc::clone(&handle));
        drive(&handle).await;
        handle.dispose();
    }
}
