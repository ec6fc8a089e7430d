//! Per-subscription state: the stable view a user holds onto while the
//! registry shuffles native watchers underneath it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::event::{Event, RawEvent};
use crate::native::NativeWatcher;
use crate::translate::{self, Outcome, SubscriberView};
use crate::{EventHandler, Hub};

struct PathsState {
    /// Canonical directory the subscription is anchored on. Follows the
    /// target when a watched file is renamed.
    normalized: PathBuf,
    /// The exact entry the user asked about.
    target: PathBuf,
    /// Whether the target is currently believed to exist on disk.
    target_exists: bool,
}

/// The internal subscription object. Shared between the user-facing
/// [`Subscription`] handle, the native watcher's subscriber list, and the
/// registry.
pub(crate) struct PathWatcher {
    /// The path as originally requested, before canonicalization.
    watched_path: PathBuf,
    /// Registry key: segments of the normalized directory at attach time.
    /// Deliberately not updated by rename-following; the registry's
    /// bookkeeping is keyed on where the subscription attached.
    dir_segments: Vec<OsString>,
    is_watching_parent: bool,
    paths: Mutex<PathsState>,
    native: Mutex<Weak<NativeWatcher>>,
    handlers: Mutex<Vec<Box<dyn EventHandler>>>,
    active: AtomicBool,
}

impl PathWatcher {
    pub(crate) fn new(
        watched_path: PathBuf,
        normalized: PathBuf,
        target: PathBuf,
        is_watching_parent: bool,
        dir_segments: Vec<OsString>,
        handler: Box<dyn EventHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            watched_path,
            dir_segments,
            is_watching_parent,
            paths: Mutex::new(PathsState {
                normalized,
                target,
                target_exists: true,
            }),
            native: Mutex::new(Weak::new()),
            handlers: Mutex::new(vec![handler]),
            active: AtomicBool::new(true),
        })
    }

    pub(crate) fn watched_path(&self) -> &Path {
        &self.watched_path
    }

    pub(crate) fn dir_segments(&self) -> &[OsString] {
        &self.dir_segments
    }

    pub(crate) fn normalized_path(&self) -> PathBuf {
        self.paths.lock().unwrap().normalized.clone()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Flip to inactive. Returns whether this call did the flip, so exactly
    /// one closer runs the registry detach.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn current_native(&self) -> Option<Arc<NativeWatcher>> {
        self.native.lock().unwrap().upgrade()
    }

    pub(crate) fn set_native(&self, native: &Arc<NativeWatcher>) {
        *self.native.lock().unwrap() = Arc::downgrade(native);
    }

    pub(crate) fn add_handler(&self, handler: Box<dyn EventHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Run one raw observation through the translator and deliver whatever
    /// survives. Invoked on the backend's delivery thread; no registry or
    /// native lock is held here.
    pub(crate) fn handle_raw(&self, raw: &RawEvent) {
        if !self.is_active() {
            return;
        }

        let emit = {
            let mut paths = self.paths.lock().unwrap();
            let view = SubscriberView {
                target: &paths.target,
                normalized: &paths.normalized,
                is_watching_parent: self.is_watching_parent,
                target_exists: paths.target_exists,
            };
            match translate::translate(raw, &view) {
                Outcome::Drop => None,
                Outcome::Emit(event) => {
                    Self::note_existence(&mut paths, &event);
                    Some(event)
                }
                Outcome::Retarget {
                    target,
                    normalized,
                    emit,
                } => {
                    log::debug!(
                        "subscription on {:?} follows its target to {:?}",
                        self.watched_path,
                        target
                    );
                    paths.target = target;
                    paths.normalized = normalized;
                    if let Some(event) = &emit {
                        Self::note_existence(&mut paths, event);
                    }
                    emit
                }
            }
        };

        if let Some(event) = emit {
            self.deliver(event);
        }
    }

    fn note_existence(paths: &mut PathsState, event: &Event) {
        match event {
            Event::Create => paths.target_exists = true,
            Event::Delete => paths.target_exists = false,
            _ => {}
        }
    }

    fn deliver(&self, event: Event) {
        let mut handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter_mut() {
            handler.handle_event(Ok(event.clone()));
        }
    }

    /// Report a backend failure through the subscription's handlers. The
    /// subscription stays active.
    pub(crate) fn deliver_error(&self, err: &Error) {
        if !self.is_active() {
            return;
        }
        let mut handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter_mut() {
            handler.handle_event(Err(err.duplicate()));
        }
    }

    /// Migration signal: the registry replaced `old` with `replacement`.
    /// Re-subscribe while the old native is still delivering, so the handover
    /// has no gap. Ignored when closing, when the replacement is already
    /// ours, or when the replacement does not cover our directory.
    pub(crate) fn handle_should_detach(
        self: &Arc<Self>,
        old: &Arc<NativeWatcher>,
        replacement: &Arc<NativeWatcher>,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(current) = self.current_native() {
            if Arc::ptr_eq(&current, replacement) {
                return;
            }
        }
        let normalized = self.normalized_path();
        if !normalized.starts_with(replacement.path()) {
            return;
        }

        replacement.add_subscriber(self.clone());
        old.remove_subscriber(self);
        self.set_native(replacement);
        log::trace!(
            "subscription on {:?} migrated from {:?} to {:?}",
            self.watched_path,
            old.path(),
            replacement.path()
        );
    }

    /// Stop signal: clear the native reference, but only if the stopping
    /// native is the one we hold.
    pub(crate) fn native_will_stop(&self, stopping: &Arc<NativeWatcher>) {
        let mut native = self.native.lock().unwrap();
        if let Some(current) = native.upgrade() {
            if Arc::ptr_eq(&current, stopping) {
                *native = Weak::new();
            }
        }
    }
}

impl std::fmt::Debug for PathWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathWatcher")
            .field("watched_path", &self.watched_path)
            .field("is_watching_parent", &self.is_watching_parent)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A live watch on one path, returned by [`watch`](crate::watch).
///
/// Events flow to the handler given at creation (and any added later with
/// [`Subscription::add_handler`]) until [`Subscription::close`] is called or
/// the subscription is dropped.
pub struct Subscription {
    watcher: Arc<PathWatcher>,
    hub: Arc<Hub>,
}

impl Subscription {
    pub(crate) fn new(watcher: Arc<PathWatcher>, hub: Arc<Hub>) -> Self {
        Self { watcher, hub }
    }

    /// The path this subscription was created on, as originally requested.
    pub fn path(&self) -> &Path {
        self.watcher.watched_path()
    }

    /// Register another handler on this subscription.
    pub fn add_handler<F: EventHandler>(&self, handler: F) {
        self.watcher.add_handler(Box::new(handler));
    }

    /// Stop the subscription. Idempotent; no handler is invoked after this
    /// returns. The backing native watcher is released, narrowed, or kept
    /// depending on what else it serves.
    pub fn close(&self) {
        if self.watcher.deactivate() {
            self.hub.detach(&self.watcher);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.watcher.watched_path())
            .field("active", &self.watcher.is_active())
            .finish()
    }
}
