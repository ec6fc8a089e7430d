//! Reference-counted wrapper around one OS-level watch.
//!
//! A `NativeWatcher` is created stopped, starts its backend watch when the
//! registry asks (lazily for a first subscriber, eagerly ahead of a
//! migration), and broadcasts raw events to every subscription currently
//! riding on it. The registry is the only writer of watcher placement; this
//! module only tracks subscribers and relays signals.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, Listener, WatcherHandle};
use crate::error::{Error, Result};
use crate::event::{Action, RawEvent};
use crate::subscription::PathWatcher;

struct NativeState {
    handle: Option<WatcherHandle>,
    subscribers: Vec<Arc<PathWatcher>>,
}

pub(crate) struct NativeWatcher {
    path: PathBuf,
    recursive: bool,
    backend: Arc<dyn Backend>,
    state: Mutex<NativeState>,
}

impl NativeWatcher {
    pub(crate) fn new(path: PathBuf, recursive: bool, backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            path,
            recursive,
            backend,
            state: Mutex::new(NativeState {
                handle: None,
                subscribers: Vec::new(),
            }),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().unwrap().handle.is_some()
    }

    pub(crate) fn handle(&self) -> Option<WatcherHandle> {
        self.state.lock().unwrap().handle
    }

    /// Install the OS watch. Idempotent; an already running watcher keeps its
    /// handle. A negative handle from the backend is decoded into the OS
    /// error it carries.
    pub(crate) fn start(&self, listener: Arc<dyn Listener>) -> Result<WatcherHandle> {
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }
        let handle = self.backend.add_watch(&self.path, listener);
        if handle < 0 {
            let err = io::Error::from_raw_os_error(-handle);
            log::debug!("native watch on {:?} failed to start: {}", self.path, err);
            return Err(Error::from(err).add_path(self.path.clone()));
        }
        log::trace!("native watch started on {:?} (handle {handle})", self.path);
        self.state.lock().unwrap().handle = Some(handle);
        Ok(handle)
    }

    /// Tear down the OS watch. Remaining subscribers are told first so they
    /// can drop their reference. Returns the handle that was released, if the
    /// watcher was running; stopping a stopped watcher is not an error.
    pub(crate) fn stop(self: &Arc<Self>) -> Option<WatcherHandle> {
        for sub in self.subscribers() {
            sub.native_will_stop(self);
        }
        let handle = self.state.lock().unwrap().handle.take();
        if let Some(handle) = handle {
            log::trace!("native watch stopped on {:?} (handle {handle})", self.path);
            self.backend.remove_watch(handle);
        }
        handle
    }

    pub(crate) fn add_subscriber(&self, sub: Arc<PathWatcher>) {
        let mut state = self.state.lock().unwrap();
        if !state.subscribers.iter().any(|s| Arc::ptr_eq(s, &sub)) {
            state.subscribers.push(sub);
        }
    }

    /// Drop `sub` from this watcher, returning how many subscribers remain.
    /// Removing a subscriber that is not attached is a no-op.
    pub(crate) fn remove_subscriber(&self, sub: &Arc<PathWatcher>) -> usize {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|s| !Arc::ptr_eq(s, sub));
        state.subscribers.len()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    /// Snapshot of the current subscribers. Fan-out works on the snapshot so
    /// no lock is held while user callbacks run.
    pub(crate) fn subscribers(&self) -> Vec<Arc<PathWatcher>> {
        self.state.lock().unwrap().subscribers.clone()
    }

    /// Relay one raw observation to every subscriber.
    pub(crate) fn dispatch(&self, raw: &RawEvent) {
        for sub in self.subscribers() {
            sub.handle_raw(raw);
        }
    }

    /// Ask every subscriber to hop onto `replacement`. Subscribers decide for
    /// themselves; one that is closing, already on the replacement, or not
    /// covered by the replacement's directory stays put. The caller must have
    /// started `replacement` already so no event falls between the two
    /// watches.
    pub(crate) fn migrate_subscribers_to(self: &Arc<Self>, replacement: &Arc<NativeWatcher>) {
        debug_assert!(replacement.is_running());
        for sub in self.subscribers() {
            sub.handle_should_detach(self, replacement);
        }
    }
}

impl std::fmt::Debug for NativeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("NativeWatcher")
            .field("path", &self.path)
            .field("recursive", &self.recursive)
            .field("handle", &state.handle)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

/// Process-wide index of running native watchers by backend handle, used to
/// route raw backend callbacks to the right wrapper.
#[derive(Default)]
pub(crate) struct NativeIndex {
    map: Mutex<std::collections::HashMap<WatcherHandle, Arc<NativeWatcher>>>,
}

impl NativeIndex {
    pub(crate) fn insert(&self, handle: WatcherHandle, native: Arc<NativeWatcher>) {
        self.map.lock().unwrap().insert(handle, native);
    }

    pub(crate) fn remove(&self, handle: WatcherHandle) -> Option<Arc<NativeWatcher>> {
        self.map.lock().unwrap().remove(&handle)
    }

    pub(crate) fn get(&self, handle: WatcherHandle) -> Option<Arc<NativeWatcher>> {
        self.map.lock().unwrap().get(&handle).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    /// The distinct directories watched at the OS level right now.
    pub(crate) fn watched_paths(&self) -> Vec<PathBuf> {
        let map = self.map.lock().unwrap();
        let mut paths: Vec<_> = map.values().map(|n| n.path().to_path_buf()).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub(crate) fn clear(&self) {
        self.map.lock().unwrap().clear();
    }
}

/// Routes raw backend callbacks, which arrive on backend threads, to the
/// wrapper registered under the event's handle. Events without an owner are
/// expected during migration and dropped.
pub(crate) struct Dispatcher {
    index: Arc<NativeIndex>,
}

impl Dispatcher {
    pub(crate) fn new(index: Arc<NativeIndex>) -> Arc<Self> {
        Arc::new(Self { index })
    }
}

impl Listener for Dispatcher {
    fn on_action(
        &self,
        handle: WatcherHandle,
        dir: &Path,
        filename: &OsStr,
        action: Action,
        old_filename: Option<&OsStr>,
    ) {
        let Some(native) = self.index.get(handle) else {
            log::trace!("dropping raw event for unknown handle {handle}: {dir:?}/{filename:?}");
            return;
        };
        let raw = RawEvent {
            handle,
            action,
            dir: dir.to_path_buf(),
            filename: filename.to_os_string(),
            old_filename: old_filename.map(OsStr::to_os_string),
        };
        native.dispatch(&raw);
    }
}
