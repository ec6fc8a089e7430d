//! The boundary between the consolidation core and the OS-native watch
//! primitives.
//!
//! A backend owns one kind of OS watch resource. It hands out signed integer
//! handles: non-negative on success, the negated OS error code on failure.
//! Raw observations come back through [`Listener::on_action`], invoked on a
//! thread the backend owns. Nothing backend-specific crosses this boundary.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use crate::event::Action;

/// Identifier of one OS-level watch, unique process-wide while it is running.
/// Negative values encode `-errno` from a failed `add_watch`.
pub(crate) type WatcherHandle = i32;

/// Receives raw observations from a backend thread.
pub(crate) trait Listener: Send + Sync {
    fn on_action(
        &self,
        handle: WatcherHandle,
        dir: &Path,
        filename: &OsStr,
        action: Action,
        old_filename: Option<&OsStr>,
    );
}

/// One OS watch primitive.
pub(crate) trait Backend: Send + Sync {
    /// Start watching `dir`, a canonical directory. Synchronous; returns a
    /// non-negative handle on success or a negated OS error code on failure.
    fn add_watch(&self, dir: &Path, listener: Arc<dyn Listener>) -> WatcherHandle;

    /// Stop the watch behind `handle`. Unknown handles are ignored.
    fn remove_watch(&self, handle: WatcherHandle);
}

/// Fallback for platforms without a native backend: every watch fails with
/// `ENOSYS`.
#[cfg(not(any(
    target_os = "macos",
    target_os = "linux",
    target_os = "android",
    windows
)))]
pub(crate) struct UnsupportedBackend;

#[cfg(not(any(
    target_os = "macos",
    target_os = "linux",
    target_os = "android",
    windows
)))]
impl Backend for UnsupportedBackend {
    fn add_watch(&self, _dir: &Path, _listener: Arc<dyn Listener>) -> WatcherHandle {
        const ENOSYS: i32 = 38;
        -ENOSYS
    }

    fn remove_watch(&self, _handle: WatcherHandle) {}
}

#[cfg(test)]
pub(crate) mod mock {
    //! A deterministic in-process backend for exercising the registry and
    //! subscription layers without touching the filesystem.

    use super::*;
    use std::collections::HashMap;
    use std::ffi::OsString;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        next_handle: WatcherHandle,
        watches: HashMap<WatcherHandle, (PathBuf, Arc<dyn Listener>)>,
        add_calls: Vec<PathBuf>,
        remove_calls: Vec<PathBuf>,
        fail_next: Option<i32>,
    }

    #[derive(Default)]
    pub(crate) struct MockBackend {
        state: Mutex<MockState>,
    }

    impl MockBackend {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make the next `add_watch` fail with the given OS error code.
        pub(crate) fn fail_next_add(&self, errno: i32) {
            self.state.lock().unwrap().fail_next = Some(errno);
        }

        /// Directories with a live watch, sorted.
        pub(crate) fn live_paths(&self) -> Vec<PathBuf> {
            let state = self.state.lock().unwrap();
            let mut paths: Vec<_> = state.watches.values().map(|(p, _)| p.clone()).collect();
            paths.sort();
            paths
        }

        pub(crate) fn add_calls(&self) -> Vec<PathBuf> {
            self.state.lock().unwrap().add_calls.clone()
        }

        pub(crate) fn remove_calls(&self) -> Vec<PathBuf> {
            self.state.lock().unwrap().remove_calls.clone()
        }

        fn lookup(&self, watched_dir: &Path) -> Option<(WatcherHandle, Arc<dyn Listener>)> {
            let state = self.state.lock().unwrap();
            state
                .watches
                .iter()
                .find(|(_, (path, _))| path == watched_dir)
                .map(|(handle, (_, listener))| (*handle, listener.clone()))
        }

        /// Inject a raw observation as if the OS reported it on the watch
        /// covering `watched_dir`. Panics if no such watch is live.
        pub(crate) fn emit(
            &self,
            watched_dir: &Path,
            action: Action,
            dir: &Path,
            filename: &str,
            old_filename: Option<&str>,
        ) {
            let (handle, listener) = self
                .lookup(watched_dir)
                .unwrap_or_else(|| panic!("no live watch on {watched_dir:?}"));
            let old = old_filename.map(OsString::from);
            listener.on_action(
                handle,
                dir,
                OsStr::new(filename),
                action,
                old.as_deref(),
            );
        }
    }

    impl Backend for MockBackend {
        fn add_watch(&self, dir: &Path, listener: Arc<dyn Listener>) -> WatcherHandle {
            let mut state = self.state.lock().unwrap();
            if let Some(errno) = state.fail_next.take() {
                return -errno;
            }
            let handle = state.next_handle;
            state.next_handle += 1;
            state.add_calls.push(dir.to_path_buf());
            state.watches.insert(handle, (dir.to_path_buf(), listener));
            handle
        }

        fn remove_watch(&self, handle: WatcherHandle) {
            let mut state = self.state.lock().unwrap();
            if let Some((path, _)) = state.watches.remove(&handle) {
                state.remove_calls.push(path);
            }
        }
    }
}
