//! Cross-platform file system watching with watcher consolidation
//!
//! # Installation
//!
//! ```toml
//! [dependencies]
//! pathwatch = "0.4.0"
//! ```
//!
//! Any number of paths can be watched through [`watch`]; behind the scenes a
//! registry packs the subscriptions onto as few OS-level watch resources as
//! the platform allows. On macOS every watched directory shares a single
//! FSEvents stream and nearby subscriptions are consolidated under common
//! ancestor directories; on Linux and Windows each distinct watched
//! directory gets one native watch.
//!
//! # Features
//!
//! - `serde` for serialization of [`Event`]
//! - `crossbeam-channel` and `flume` for the respective channel senders as
//!   event handlers
//!
//! # Examples
//!
//! ```no_run
//! use pathwatch::{watch, Event, Result};
//! use std::sync::mpsc;
//!
//! fn main() -> Result<()> {
//!     let (tx, rx) = mpsc::channel::<Result<Event>>();
//!
//!     // Watch a file; the subscription follows it through renames.
//!     let subscription = watch("/etc/hosts", tx)?;
//!
//!     for result in rx {
//!         match result {
//!             Ok(event) => println!("event: {event:?}"),
//!             Err(err) => println!("watch error: {err:?}"),
//!         }
//!     }
//!
//!     subscription.close();
//!     Ok(())
//! }
//! ```
//!
//! # Known problems
//!
//! ### Deleting a watched directory
//!
//! Deleting a directory you watch directly produces no event, on every
//! platform. Watch the parent directory to observe the deletion.
//!
//! ### Event granularity
//!
//! The OS may coalesce rapid changes; adjacent duplicate
//! [`Event::Change`] notifications are possible and handlers should be
//! idempotent for them.
//!
//! ### Linux: No space left on device
//!
//! Each watched directory consumes one inotify watch; running into the
//! per-user limit surfaces as an I/O error from [`watch`]. Raise
//! `fs.inotify.max_user_watches` if you hit this.

#![deny(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use event::Event;
pub use subscription::Subscription;

use backend::Backend;
use native::{Dispatcher, NativeIndex};
use registry::Registry;
use subscription::PathWatcher;

mod backend;
mod config;
mod error;
mod event;
mod native;
mod registry;
mod subscription;
mod translate;

#[cfg(target_os = "macos")]
mod fsevent;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;
#[cfg(windows)]
mod windows;

/// The set of requirements for subscription event handling functions.
///
/// # Example implementation
///
/// ```no_run
/// use pathwatch::{Event, EventHandler, Result};
///
/// /// Prints received events
/// struct EventPrinter;
///
/// impl EventHandler for EventPrinter {
///     fn handle_event(&mut self, event: Result<Event>) {
///         if let Ok(event) = event {
///             println!("Event: {event:?}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + 'static {
    /// Handles an event.
    fn handle_event(&mut self, event: Result<Event>);
}

impl<F> EventHandler for F
where
    F: FnMut(Result<Event>) + Send + 'static,
{
    fn handle_event(&mut self, event: Result<Event>) {
        (self)(event);
    }
}

impl EventHandler for std::sync::mpsc::Sender<Result<Event>> {
    fn handle_event(&mut self, event: Result<Event>) {
        let _ = self.send(event);
    }
}

#[cfg(feature = "crossbeam-channel")]
impl EventHandler for crossbeam_channel::Sender<Result<Event>> {
    fn handle_event(&mut self, event: Result<Event>) {
        let _ = self.send(event);
    }
}

#[cfg(feature = "flume")]
impl EventHandler for flume::Sender<Result<Event>> {
    fn handle_event(&mut self, event: Result<Event>) {
        let _ = self.send(event);
    }
}

/// Process-wide watcher state: the backend, the placement registry, and the
/// handle index raw callbacks are routed through.
pub(crate) struct Hub {
    registry: Mutex<Registry>,
    index: Arc<NativeIndex>,
    closing: AtomicBool,
}

impl Hub {
    pub(crate) fn new(backend: Arc<dyn Backend>, config: Config) -> Arc<Self> {
        let index = Arc::new(NativeIndex::default());
        let dispatcher = Dispatcher::new(index.clone());
        let registry = Registry::new(
            config,
            config::platform_recursive(),
            backend,
            dispatcher,
            index.clone(),
        );
        Arc::new(Self {
            registry: Mutex::new(registry),
            index,
            closing: AtomicBool::new(false),
        })
    }

    pub(crate) fn watch(
        self: &Arc<Self>,
        path: &Path,
        handler: Box<dyn EventHandler>,
    ) -> Result<Subscription> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::generic("watcher teardown in progress"));
        }
        if !path.is_absolute() {
            return Err(
                Error::generic("watch path must be absolute").add_path(path.to_path_buf())
            );
        }

        let canonical = path
            .canonicalize()
            .map_err(|err| Error::from(err).add_path(path.to_path_buf()))?;
        let metadata = std::fs::metadata(&canonical)
            .map_err(|err| Error::from(err).add_path(path.to_path_buf()))?;
        let is_file = !metadata.is_dir();
        let normalized = if is_file {
            canonical
                .parent()
                .ok_or_else(|| Error::path_not_found().add_path(path.to_path_buf()))?
                .to_path_buf()
        } else {
            canonical.clone()
        };

        let dir_segments = registry::path_segments(&normalized);
        let target_segments = registry::path_segments(&canonical);
        let watcher = PathWatcher::new(
            path.to_path_buf(),
            normalized,
            canonical,
            is_file,
            dir_segments.clone(),
            handler,
        );

        // Bind under the registry lock so a concurrent consolidation cannot
        // run between placement and subscription.
        {
            let mut registry = self.registry.lock().unwrap();
            let native = registry.attach(&target_segments, &dir_segments)?;
            native.add_subscriber(watcher.clone());
            watcher.set_native(&native);
        }

        Ok(Subscription::new(watcher, self.clone()))
    }

    pub(crate) fn detach(&self, watcher: &Arc<PathWatcher>) {
        self.registry.lock().unwrap().detach(watcher);
    }

    pub(crate) fn close_all(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let natives = self.registry.lock().unwrap().take_all_natives();
        for native in natives {
            for sub in native.subscribers() {
                sub.deactivate();
            }
            if let Some(handle) = native.stop() {
                self.index.remove(handle);
            }
        }
        self.index.clear();
        self.closing.store(false, Ordering::SeqCst);
    }

    pub(crate) fn watched_paths(&self) -> Vec<PathBuf> {
        self.index.watched_paths()
    }

    pub(crate) fn native_count(&self) -> usize {
        self.index.len()
    }
}

#[cfg(target_os = "macos")]
fn platform_backend() -> Arc<dyn Backend> {
    Arc::new(fsevent::FsEventsBackend::new())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn platform_backend() -> Arc<dyn Backend> {
    Arc::new(inotify::InotifyBackend::new())
}

#[cfg(windows)]
fn platform_backend() -> Arc<dyn Backend> {
    Arc::new(windows::ReadDirectoryChangesBackend::new())
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "linux",
    target_os = "android",
    windows
)))]
fn platform_backend() -> Arc<dyn Backend> {
    Arc::new(backend::UnsupportedBackend)
}

fn global_hub() -> &'static Arc<Hub> {
    static HUB: OnceLock<Arc<Hub>> = OnceLock::new();
    HUB.get_or_init(|| Hub::new(platform_backend(), Config::default()))
}

/// Watch `path` for changes, delivering events to `handler`.
///
/// `path` must be absolute and must exist; it is canonicalized before use. A
/// missing path is rejected with [`ErrorKind::PathNotFound`] carrying the OS
/// error. Watching a file watches its parent directory under the hood and
/// filters events down to the file, following it through renames.
///
/// The returned [`Subscription`] stops the watch when closed or dropped.
pub fn watch<P: AsRef<Path>, F: EventHandler>(path: P, handler: F) -> Result<Subscription> {
    global_hub().watch(path.as_ref(), Box::new(handler))
}

/// Stop every live subscription and native watcher and reset the registry.
///
/// In-flight events are dropped; no handler runs after this returns. The
/// library remains usable, [`watch`] simply starts from an empty registry.
pub fn close_all_watchers() {
    global_hub().close_all();
}

/// The set of directories currently watched at the OS level, one per native
/// watcher, deduplicated and sorted.
pub fn get_watched_paths() -> Vec<PathBuf> {
    global_hub().watched_paths()
}

/// Number of live native watchers.
pub fn get_native_watcher_count() -> usize {
    global_hub().native_count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::event::Action;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_hub(config: Config) -> (Arc<Hub>, Arc<MockBackend>) {
        let backend = MockBackend::new();
        let hub = Hub::new(backend.clone(), config);
        (hub, backend)
    }

    fn channel_watch(
        hub: &Arc<Hub>,
        path: &Path,
    ) -> (Subscription, mpsc::Receiver<Result<Event>>) {
        let (tx, rx) = mpsc::channel();
        let sub = hub.watch(path, Box::new(tx)).expect("watch");
        (sub, rx)
    }

    fn recv(rx: &mpsc::Receiver<Result<Event>>) -> Event {
        rx.recv_timeout(Duration::from_secs(1))
            .expect("expected an event")
            .expect("expected a non-error event")
    }

    #[test]
    fn watch_rejects_missing_path() {
        let (hub, _backend) = test_hub(Config::standalone());
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = hub
            .watch(&missing, Box::new(|_res: Result<Event>| {}))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::PathNotFound));
        assert_eq!(err.paths, vec![missing]);
    }

    #[test]
    fn watch_rejects_relative_path() {
        let (hub, _backend) = test_hub(Config::standalone());
        let err = hub
            .watch(Path::new("relative/path"), Box::new(|_res: Result<Event>| {}))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Generic(_)));
    }

    #[test]
    fn watching_a_file_watches_its_parent_directory() {
        let (hub, _backend) = test_hub(Config::standalone());
        let dir = tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "contents").unwrap();

        let (_sub, _rx) = channel_watch(&hub, &file);
        let canonical_dir = dir.path().canonicalize().unwrap();
        assert_eq!(hub.watched_paths(), vec![canonical_dir]);
    }

    #[test]
    fn file_events_are_filtered_to_the_target() {
        let (hub, backend) = test_hub(Config::standalone());
        let dir = tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "contents").unwrap();
        let canonical_dir = dir.path().canonicalize().unwrap();

        let (_sub, rx) = channel_watch(&hub, &file);

        backend.emit(&canonical_dir, Action::Modified, &canonical_dir, "file.txt", None);
        assert_eq!(recv(&rx), Event::Change);

        // A sibling's change is invisible.
        backend.emit(&canonical_dir, Action::Modified, &canonical_dir, "other.txt", None);
        backend.emit(&canonical_dir, Action::Add, &canonical_dir, "other.txt", None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn spurious_add_for_preexisting_target_is_suppressed() {
        let (hub, backend) = test_hub(Config::standalone());
        let dir = tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "contents").unwrap();
        let canonical_dir = dir.path().canonicalize().unwrap();

        let (_sub, rx) = channel_watch(&hub, &file);

        backend.emit(&canonical_dir, Action::Add, &canonical_dir, "file.txt", None);
        assert!(rx.try_recv().is_err());

        // After a real delete, a re-create is reported.
        backend.emit(&canonical_dir, Action::Delete, &canonical_dir, "file.txt", None);
        assert_eq!(recv(&rx), Event::Delete);
        backend.emit(&canonical_dir, Action::Add, &canonical_dir, "file.txt", None);
        assert_eq!(recv(&rx), Event::Create);
    }

    #[test]
    fn renamed_file_is_followed() {
        let (hub, backend) = test_hub(Config::standalone());
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "contents").unwrap();
        let canonical_dir = dir.path().canonicalize().unwrap();

        let (_sub, rx) = channel_watch(&hub, &file);

        backend.emit(&canonical_dir, Action::Moved, &canonical_dir, "g", Some("f"));
        assert_eq!(recv(&rx), Event::Rename(canonical_dir.join("g")));

        // Changes to the new name keep firing.
        backend.emit(&canonical_dir, Action::Modified, &canonical_dir, "g", None);
        assert_eq!(recv(&rx), Event::Change);

        // The old name no longer matters.
        backend.emit(&canonical_dir, Action::Modified, &canonical_dir, "f", None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn deleted_subdirectory_reported_by_parent_not_child() {
        let (hub, backend) = test_hub(Config::consolidating());
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let canonical_dir = dir.path().canonicalize().unwrap();

        let (_sub_parent, rx_parent) = channel_watch(&hub, dir.path());
        let (_sub_child, rx_child) = channel_watch(&hub, &sub);

        // One shared native watcher serves both.
        assert_eq!(hub.native_count(), 1);

        backend.emit(&canonical_dir, Action::Delete, &canonical_dir, "sub", None);
        assert_eq!(recv(&rx_parent), Event::Change);
        assert!(rx_child.try_recv().is_err());
    }

    #[test]
    fn directly_deleted_directory_is_silent() {
        let (hub, backend) = test_hub(Config::standalone());
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let canonical_sub = sub.canonicalize().unwrap();

        let (_sub, rx) = channel_watch(&hub, &sub);

        backend.emit(
            &canonical_sub,
            Action::Delete,
            canonical_sub.parent().unwrap(),
            "sub",
            None,
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn multiple_handlers_all_receive() {
        let (hub, backend) = test_hub(Config::standalone());
        let dir = tempdir().unwrap();
        let canonical_dir = dir.path().canonicalize().unwrap();

        let (sub, rx_one) = channel_watch(&hub, dir.path());
        let (tx_two, rx_two) = mpsc::channel();
        sub.add_handler(tx_two);

        backend.emit(&canonical_dir, Action::Add, &canonical_dir, "entry", None);
        assert_eq!(recv(&rx_one), Event::Change);
        assert_eq!(recv(&rx_two), Event::Change);
    }

    #[test]
    fn close_is_idempotent_and_drop_closes() {
        let (hub, backend) = test_hub(Config::standalone());
        let dir = tempdir().unwrap();
        let canonical_dir = dir.path().canonicalize().unwrap();

        let (sub, rx) = channel_watch(&hub, dir.path());
        sub.close();
        sub.close();
        assert_eq!(hub.native_count(), 0);

        // No delivery after close; the backend watch is gone.
        assert!(backend.live_paths().is_empty());
        drop(sub);
        assert!(rx.try_recv().is_err());

        {
            let (_sub2, _rx2) = channel_watch(&hub, dir.path());
            assert_eq!(hub.native_count(), 1);
            assert_eq!(hub.watched_paths(), vec![canonical_dir]);
        }
        // Dropped subscription released the watcher.
        assert_eq!(hub.native_count(), 0);
    }

    #[test]
    fn close_all_resets_everything() {
        let (hub, backend) = test_hub(Config::consolidating());
        let dir = tempdir().unwrap();
        let sub_dir = dir.path().join("sub");
        std::fs::create_dir(&sub_dir).unwrap();

        let (sub_a, rx) = channel_watch(&hub, dir.path());
        let (_sub_b, _rx_b) = channel_watch(&hub, &sub_dir);
        assert!(hub.native_count() > 0);

        hub.close_all();
        assert_eq!(hub.native_count(), 0);
        assert!(hub.watched_paths().is_empty());
        assert!(backend.live_paths().is_empty());
        assert!(rx.try_recv().is_err());

        // Closing an already torn-down subscription is harmless, and the hub
        // is reusable afterwards.
        sub_a.close();
        let (_sub_c, _rx_c) = channel_watch(&hub, dir.path());
        assert_eq!(hub.native_count(), 1);
    }

    #[test]
    fn watch_close_round_trip_restores_observable_state() {
        let (hub, backend) = test_hub(Config::consolidating());
        let dir = tempdir().unwrap();

        let before_paths = hub.watched_paths();
        let before_count = hub.native_count();
        {
            let (_sub, _rx) = channel_watch(&hub, dir.path());
        }
        assert_eq!(hub.watched_paths(), before_paths);
        assert_eq!(hub.native_count(), before_count);
        assert_eq!(backend.live_paths(), Vec::<PathBuf>::new());
    }
}
