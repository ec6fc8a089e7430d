//! Thin Linux backend over the inotify API: one non-recursive OS watch per
//! directory, translated to the listener contract.
//!
//! Consolidation is disabled on this platform, so the backend never needs to
//! observe more than one directory per handle. Renames within a directory
//! arrive as a `MOVED_FROM`/`MOVED_TO` pair sharing a cookie and are folded
//! into a single `Moved` action; an unpaired endpoint degrades to a `Delete`
//! or an `Add`, which is also how moves across the watch boundary surface.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};

use crate::backend::{Backend, Listener, WatcherHandle};
use crate::event::Action;

const INOTIFY: mio::Token = mio::Token(0);
const MESSAGE: mio::Token = mio::Token(1);

fn watch_mask() -> WatchMask {
    WatchMask::ATTRIB
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MODIFY
        | WatchMask::CLOSE_WRITE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

enum EventLoopMsg {
    AddWatch(PathBuf, Arc<dyn Listener>, Sender<WatcherHandle>),
    RemoveWatch(WatcherHandle),
}

struct Channel {
    tx: Sender<EventLoopMsg>,
    waker: Arc<mio::Waker>,
}

enum LoopState {
    NotStarted,
    Failed(i32),
    Running(Channel),
}

/// inotify-based `Backend` implementation. The event loop starts lazily on
/// the first watch and runs for the life of the process.
pub(crate) struct InotifyBackend {
    state: Mutex<LoopState>,
}

impl InotifyBackend {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LoopState::NotStarted),
        }
    }

    fn start_event_loop() -> io::Result<Channel> {
        let inotify = Inotify::init()?;
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), MESSAGE)?);
        let (tx, rx) = mpsc::channel();

        let event_loop = EventLoop {
            poll,
            rx,
            inotify,
            next_handle: 0,
            watches: HashMap::new(),
            by_wd: HashMap::new(),
        };
        thread::Builder::new()
            .name("pathwatch inotify loop".to_string())
            .spawn(move || event_loop.run())?;

        Ok(Channel { tx, waker })
    }
}

impl Backend for InotifyBackend {
    fn add_watch(&self, dir: &std::path::Path, listener: Arc<dyn Listener>) -> WatcherHandle {
        let mut state = self.state.lock().unwrap();
        if let LoopState::NotStarted = *state {
            *state = match Self::start_event_loop() {
                Ok(channel) => LoopState::Running(channel),
                Err(err) => LoopState::Failed(err.raw_os_error().unwrap_or(libc_einval())),
            };
        }
        let channel = match &*state {
            LoopState::Running(channel) => channel,
            LoopState::Failed(errno) => return -*errno,
            LoopState::NotStarted => unreachable!(),
        };

        let (reply_tx, reply_rx) = mpsc::channel();
        if channel
            .tx
            .send(EventLoopMsg::AddWatch(
                dir.to_path_buf(),
                listener,
                reply_tx,
            ))
            .is_err()
        {
            return -libc_eio();
        }
        let _ = channel.waker.wake();
        reply_rx.recv().unwrap_or(-libc_eio())
    }

    fn remove_watch(&self, handle: WatcherHandle) {
        let state = self.state.lock().unwrap();
        if let LoopState::Running(channel) = &*state {
            let _ = channel.tx.send(EventLoopMsg::RemoveWatch(handle));
            let _ = channel.waker.wake();
        }
    }
}

fn libc_eio() -> i32 {
    5
}

fn libc_einval() -> i32 {
    22
}

struct WatchState {
    wd: WatchDescriptor,
    path: PathBuf,
    listener: Arc<dyn Listener>,
}

struct EventLoop {
    poll: mio::Poll,
    rx: Receiver<EventLoopMsg>,
    inotify: Inotify,
    next_handle: WatcherHandle,
    watches: HashMap<WatcherHandle, WatchState>,
    by_wd: HashMap<WatchDescriptor, WatcherHandle>,
}

impl EventLoop {
    fn run(mut self) {
        let inotify_fd = self.inotify.as_raw_fd();
        let mut evented_inotify = mio::unix::SourceFd(&inotify_fd);
        if self
            .poll
            .registry()
            .register(&mut evented_inotify, INOTIFY, mio::Interest::READABLE)
            .is_err()
        {
            return;
        }

        let mut events = mio::Events::with_capacity(16);
        loop {
            match self.poll.poll(&mut events, None) {
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("inotify poll failed: {err}");
                    return;
                }
                Ok(()) => {}
            }
            for event in &events {
                match event.token() {
                    MESSAGE => self.handle_messages(),
                    INOTIFY => self.handle_inotify(),
                    _ => unreachable!(),
                }
            }
        }
    }

    fn handle_messages(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                EventLoopMsg::AddWatch(path, listener, reply) => {
                    let handle = self.add_watch(path, listener);
                    let _ = reply.send(handle);
                }
                EventLoopMsg::RemoveWatch(handle) => self.remove_watch(handle),
            }
        }
    }

    fn add_watch(&mut self, path: PathBuf, listener: Arc<dyn Listener>) -> WatcherHandle {
        match self.inotify.watches().add(&path, watch_mask()) {
            Ok(wd) => {
                let handle = self.next_handle;
                self.next_handle += 1;
                self.by_wd.insert(wd.clone(), handle);
                self.watches.insert(
                    handle,
                    WatchState {
                        wd,
                        path,
                        listener,
                    },
                );
                handle
            }
            Err(err) => -err.raw_os_error().unwrap_or_else(libc_einval),
        }
    }

    fn remove_watch(&mut self, handle: WatcherHandle) {
        if let Some(watch) = self.watches.remove(&handle) {
            self.by_wd.remove(&watch.wd);
            // The kernel drops the watch itself when the directory vanishes;
            // a failure here means exactly that and is not an error.
            let _ = self.inotify.watches().remove(watch.wd);
        }
    }

    fn handle_inotify(&mut self) {
        let mut buffer = [0u8; 4096];
        loop {
            // One raw rename produces a MOVED_FROM/MOVED_TO pair sharing a
            // cookie; an endpoint left unpaired at the end of the batch was a
            // move across the watch boundary.
            let mut pending_from: Option<(u32, WatcherHandle, OsString)> = None;

            let events = match self.inotify.read_events(&mut buffer) {
                Ok(events) => events,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::error!("inotify read failed: {err}");
                    break;
                }
            };

            for event in events {
                if event.mask.contains(EventMask::IGNORED) {
                    if let Some(handle) = self.by_wd.remove(&event.wd) {
                        self.watches.remove(&handle);
                    }
                    continue;
                }

                let Some(&handle) = self.by_wd.get(&event.wd) else {
                    continue;
                };
                let Some(name) = event.name else {
                    // Events about the watched directory itself are not
                    // reported; watch the parent to observe them.
                    continue;
                };
                let name = name.to_os_string();

                if event.mask.contains(EventMask::MOVED_TO) {
                    match pending_from.take() {
                        Some((cookie, from_handle, old_name))
                            if cookie == event.cookie && from_handle == handle =>
                        {
                            self.send(handle, Action::Moved, &name, Some(&old_name));
                        }
                        other => {
                            if let Some((_, from_handle, old_name)) = other {
                                self.send(from_handle, Action::Delete, &old_name, None);
                            }
                            self.send(handle, Action::Add, &name, None);
                        }
                    }
                    continue;
                }

                if let Some((_, from_handle, old_name)) = pending_from.take() {
                    self.send(from_handle, Action::Delete, &old_name, None);
                }

                if event.mask.contains(EventMask::MOVED_FROM) {
                    pending_from = Some((event.cookie, handle, name));
                } else if event.mask.contains(EventMask::CREATE) {
                    self.send(handle, Action::Add, &name, None);
                } else if event.mask.contains(EventMask::DELETE) {
                    self.send(handle, Action::Delete, &name, None);
                } else if event.mask.intersects(
                    EventMask::MODIFY | EventMask::CLOSE_WRITE | EventMask::ATTRIB,
                ) {
                    self.send(handle, Action::Modified, &name, None);
                }
            }

            if let Some((_, from_handle, old_name)) = pending_from {
                self.send(from_handle, Action::Delete, &old_name, None);
            }
        }
    }

    fn send(
        &self,
        handle: WatcherHandle,
        action: Action,
        filename: &std::ffi::OsStr,
        old_filename: Option<&OsString>,
    ) {
        let Some(watch) = self.watches.get(&handle) else {
            return;
        };
        log::trace!(
            "inotify: {:?} {:?} in {:?} (old: {:?})",
            action,
            filename,
            watch.path,
            old_filename
        );
        watch.listener.on_action(
            handle,
            &watch.path,
            filename,
            action,
            old_filename.map(|o| o.as_os_str()),
        );
    }
}
