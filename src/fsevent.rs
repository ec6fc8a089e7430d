//! macOS backend: every watched directory multiplexed onto a single shared
//! FSEvents stream.
//!
//! FSEvents charges per stream, not per path, so instead of one stream per
//! watched directory this backend maintains one stream over all of them. Each
//! `add_watch`/`remove_watch` builds a replacement stream over the current
//! path set, promotes it once it has started, and only then releases the old
//! one, so no event falls into a gap. Raw stream events are correlated back
//! to the owning handle, rename pairs are reconstructed from inode equality,
//! and create/delete claims are confirmed against the disk because FSEvents
//! flags are a bit-union with unreliable ordering.

#![allow(non_upper_case_globals)]

use std::collections::{BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use objc2_core_foundation as cf;
use objc2_core_services as fs;

use crate::backend::{Backend, Listener, WatcherHandle};
use crate::event::Action;

bitflags::bitflags! {
  #[repr(C)]
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  struct StreamFlags: u32 {
    const NONE = fs::kFSEventStreamEventFlagNone;
    const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
    const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
    const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
    const IDS_WRAPPED = fs::kFSEventStreamEventFlagEventIdsWrapped;
    const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
    const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
    const MOUNT = fs::kFSEventStreamEventFlagMount;
    const UNMOUNT = fs::kFSEventStreamEventFlagUnmount;
    const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
    const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
    const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
    const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
    const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
    const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
    const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
    const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
    const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
    const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
    const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
    const OWN_EVENT = fs::kFSEventStreamEventFlagOwnEvent;
    const IS_HARDLINK = fs::kFSEventStreamEventFlagItemIsHardlink;
    const IS_LAST_HARDLINK = fs::kFSEventStreamEventFlagItemIsLastHardlink;
    const ITEM_CLONED = fs::kFSEventStreamEventFlagItemCloned;
  }
}

impl StreamFlags {
    /// Stream administration, mount activity, and drop hints carry no usable
    /// path change and are skipped wholesale.
    fn administrative(self) -> bool {
        self.intersects(
            StreamFlags::MUST_SCAN_SUBDIRS
                | StreamFlags::USER_DROPPED
                | StreamFlags::KERNEL_DROPPED
                | StreamFlags::IDS_WRAPPED
                | StreamFlags::HISTORY_DONE
                | StreamFlags::MOUNT
                | StreamFlags::UNMOUNT
                | StreamFlags::ROOT_CHANGED,
        )
    }

    /// The union of flags that mean "contents or metadata changed".
    fn modified(self) -> bool {
        self.intersects(
            StreamFlags::ITEM_MODIFIED
                | StreamFlags::FINDER_INFO_MOD
                | StreamFlags::INODE_META_MOD,
        )
    }

    fn structural(self) -> bool {
        self.intersects(
            StreamFlags::ITEM_CREATED | StreamFlags::ITEM_REMOVED | StreamFlags::ITEM_RENAMED,
        )
    }
}

/// One decoded stream event.
struct FsEvent {
    path: PathBuf,
    flags: StreamFlags,
    inode: i64,
}

#[derive(Default)]
struct Maps {
    next_handle: WatcherHandle,
    paths_by_handle: HashMap<WatcherHandle, PathBuf>,
    handles_by_path: HashMap<PathBuf, WatcherHandle>,
    listeners: HashMap<WatcherHandle, Arc<dyn Listener>>,
}

struct RunningStream {
    runloop: cf::CFRetained<cf::CFRunLoop>,
    thread: thread::JoinHandle<()>,
}

#[derive(Default)]
struct ProcessingState {
    destroyed: bool,
    in_progress: bool,
}

struct StreamHost {
    maps: Mutex<Maps>,
    stream: Mutex<Option<RunningStream>>,
    processing: Mutex<ProcessingState>,
    processing_done: Condvar,
}

// StreamHost is not Send/Sync automatically because of the retained
// CFRunLoop. It's safe: the runloop reference is only used to stop the loop,
// and Apple documents CFRunLoops as safe to use across threads.
unsafe impl Send for StreamHost {}
unsafe impl Sync for StreamHost {}

/// FSEvents-based `Backend` implementation.
pub(crate) struct FsEventsBackend {
    host: Arc<StreamHost>,
}

impl FsEventsBackend {
    pub(crate) fn new() -> Self {
        Self {
            host: Arc::new(StreamHost {
                maps: Mutex::new(Maps::default()),
                stream: Mutex::new(None),
                processing: Mutex::new(ProcessingState::default()),
                processing_done: Condvar::new(),
            }),
        }
    }
}

impl Backend for FsEventsBackend {
    fn add_watch(&self, dir: &Path, listener: Arc<dyn Listener>) -> WatcherHandle {
        let handle = {
            let mut maps = self.host.maps.lock().unwrap();
            let handle = maps.next_handle;
            maps.next_handle += 1;
            maps.paths_by_handle.insert(handle, dir.to_path_buf());
            maps.handles_by_path.insert(dir.to_path_buf(), handle);
            maps.listeners.insert(handle, listener);
            handle
        };

        if !self.host.start_new_stream() {
            self.host.remove_handle(handle);
            return -libc::EIO;
        }
        handle
    }

    fn remove_watch(&self, handle: WatcherHandle) {
        let remaining = self.host.remove_handle(handle);
        if remaining == 0 {
            if let Some(stream) = self.host.stream.lock().unwrap().take() {
                stop_stream(stream);
            }
            return;
        }
        // A replacement failing to start is tolerable here: the old stream
        // keeps running, and events for the removed handle no longer resolve
        // in the maps, so they are silently ignored.
        self.host.start_new_stream();
    }
}

impl Drop for FsEventsBackend {
    fn drop(&mut self) {
        // Wait for an in-flight callback before releasing the stream.
        {
            let mut processing = self.host.processing.lock().unwrap();
            processing.destroyed = true;
            while processing.in_progress {
                processing = self.host.processing_done.wait(processing).unwrap();
            }
        }
        if let Some(stream) = self.host.stream.lock().unwrap().take() {
            stop_stream(stream);
        }
    }
}

/// Clears the in-progress flag however the processing scope exits.
struct ProcessingGuard<'a> {
    host: &'a StreamHost,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        let mut processing = self.host.processing.lock().unwrap();
        processing.in_progress = false;
        self.host.processing_done.notify_all();
    }
}

impl StreamHost {
    /// Remove a handle from all maps, returning how many watches remain.
    fn remove_handle(&self, handle: WatcherHandle) -> usize {
        let mut maps = self.maps.lock().unwrap();
        if let Some(path) = maps.paths_by_handle.remove(&handle) {
            maps.handles_by_path.remove(&path);
        }
        maps.listeners.remove(&handle);
        maps.paths_by_handle.len()
    }

    /// The handle owning an event at `path`: the nearest watched ancestor of
    /// the entry, or, failing that, the path itself. The latter only matches
    /// a directly watched directory being deleted; routing it keeps the
    /// behavior consistent with the other platforms, and the subscription
    /// layer keeps it silent.
    fn owner_of(&self, path: &Path) -> Option<(WatcherHandle, PathBuf)> {
        let maps = self.maps.lock().unwrap();
        let mut cursor = path.parent();
        while let Some(dir) = cursor {
            if let Some(&handle) = maps.handles_by_path.get(dir) {
                return Some((handle, dir.to_path_buf()));
            }
            cursor = dir.parent();
        }
        maps.handles_by_path
            .get(path)
            .map(|&handle| (handle, path.to_path_buf()))
    }

    fn listener_for(&self, handle: WatcherHandle) -> Option<Arc<dyn Listener>> {
        self.maps.lock().unwrap().listeners.get(&handle).cloned()
    }

    fn send_file_action(
        &self,
        handle: WatcherHandle,
        dir: &Path,
        filename: &OsStr,
        action: Action,
        old_filename: Option<&OsStr>,
    ) {
        let Some(listener) = self.listener_for(handle) else {
            return;
        };
        let dir = precompose_path(dir);
        let filename = precompose_name(filename);
        let old = old_filename.map(|old| precompose_name(old));
        log::trace!(
            "fsevents: {:?} {:?} in {:?} (old: {:?})",
            action,
            filename,
            dir,
            old
        );
        listener.on_action(handle, &dir, &filename, action, old.as_deref());
    }

    /// Build a stream over the current path set and promote it to active
    /// once it has started. Returns whether the new stream started.
    fn start_new_stream(self: &Arc<Self>) -> bool {
        let paths: Vec<PathBuf> = {
            let maps = self.maps.lock().unwrap();
            maps.paths_by_handle.values().cloned().collect()
        };
        if paths.is_empty() {
            return true;
        }

        // Promotion is serialized on the stream slot so two concurrent
        // rebuilds cannot interleave their swaps.
        let mut slot = self.stream.lock().unwrap();
        match spawn_stream(self, &paths) {
            Some(stream) => {
                if let Some(old) = slot.replace(stream) {
                    stop_stream(old);
                }
                true
            }
            None => false,
        }
    }

    /// Decode, correlate, and forward one callback batch.
    fn handle_events(&self, events: Vec<FsEvent>) {
        let mut dirs_changed: BTreeSet<PathBuf> = BTreeSet::new();

        let count = events.len();
        let mut i = 0;
        while i < count {
            let event = &events[i];

            if event.flags.administrative() {
                i += 1;
                continue;
            }

            let Some((handle, watched_path)) = self.owner_of(&event.path) else {
                log::trace!("fsevents: no watcher for {:?}", event.path);
                i += 1;
                continue;
            };

            let dir_path = parent_of(&event.path);
            let file_name = name_of(&event.path);

            if event.flags.structural() && dir_path != watched_path {
                dirs_changed.insert(dir_path.clone());
            }

            if event.flags.contains(StreamFlags::ITEM_RENAMED) {
                // FSEvents reports each endpoint of a rename separately and
                // does not promise their order. Two consecutive rename
                // events sharing an inode are the two ends of one rename.
                let pair = events.get(i + 1).filter(|next| {
                    next.flags.contains(StreamFlags::ITEM_RENAMED) && next.inode == event.inode
                });
                if let Some(next) = pair {
                    let next_dir = parent_of(&next.path);
                    let next_name = name_of(&next.path);

                    if event.path != next.path {
                        if dir_path == next_dir {
                            // A move within one directory. Whichever endpoint
                            // still exists on disk is the destination.
                            if !path_exists(&event.path) || paths_equal_fold(&event.path, &next.path)
                            {
                                self.send_file_action(
                                    handle,
                                    &dir_path,
                                    &next_name,
                                    Action::Moved,
                                    Some(&file_name),
                                );
                            } else {
                                self.send_file_action(
                                    handle,
                                    &dir_path,
                                    &file_name,
                                    Action::Moved,
                                    Some(&next_name),
                                );
                            }
                        } else {
                            // Across directories: one deletion, one creation.
                            self.send_file_action(
                                handle,
                                &dir_path,
                                &file_name,
                                Action::Delete,
                                None,
                            );
                            self.send_file_action(handle, &next_dir, &next_name, Action::Add, None);
                            if next.flags.modified() {
                                self.send_file_action(
                                    handle,
                                    &dir_path,
                                    &file_name,
                                    Action::Modified,
                                    None,
                                );
                            }
                        }
                    } else {
                        // Same path on both ends; fall back to flag triage.
                        self.add_mod_del(handle, next.flags, &next.path, &dir_path, &file_name);
                    }

                    if next.flags.structural() && next_dir != watched_path {
                        dirs_changed.insert(next_dir);
                    }

                    // The paired event is consumed.
                    i += 2;
                    continue;
                } else if path_exists(&event.path) {
                    // A lone rename endpoint that still exists came into
                    // being; one that does not went away.
                    self.send_file_action(handle, &dir_path, &file_name, Action::Add, None);
                    if event.flags.modified() {
                        self.send_file_action(handle, &dir_path, &file_name, Action::Modified, None);
                    }
                } else {
                    self.send_file_action(handle, &dir_path, &file_name, Action::Delete, None);
                }
            } else {
                self.add_mod_del(handle, event.flags, &event.path, &dir_path, &file_name);
            }

            i += 1;
        }

        // Roll structural changes inside subdirectories up to the watcher
        // covering them: one Modified naming the changed subdirectory.
        for dir in dirs_changed {
            let Some((handle, watched_path)) = self.owner_of(&dir) else {
                continue;
            };
            if dir == watched_path {
                continue;
            }
            self.send_file_action(handle, &parent_of(&dir), &name_of(&dir), Action::Modified, None);
        }
    }

    /// Plain create/modify/delete triage. Creation and deletion claims are
    /// confirmed against the disk; the flags accumulate across a batch and
    /// cannot be trusted alone.
    fn add_mod_del(
        &self,
        handle: WatcherHandle,
        flags: StreamFlags,
        path: &Path,
        dir_path: &Path,
        file_name: &OsStr,
    ) {
        if flags.contains(StreamFlags::ITEM_CREATED) && path_exists(path) {
            self.send_file_action(handle, dir_path, file_name, Action::Add, None);
        }
        if flags.modified() {
            self.send_file_action(handle, dir_path, file_name, Action::Modified, None);
        }
        if flags.contains(StreamFlags::ITEM_REMOVED) && !path_exists(path) {
            self.send_file_action(handle, dir_path, file_name, Action::Delete, None);
        }
    }
}

fn path_exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

fn paths_equal_fold(a: &Path, b: &Path) -> bool {
    a.to_string_lossy()
        .eq_ignore_ascii_case(&b.to_string_lossy())
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().unwrap_or(path).to_path_buf()
}

fn name_of(path: &Path) -> OsString {
    path.file_name().unwrap_or(path.as_os_str()).to_os_string()
}

/// HFS+ hands out decomposed (NFD) names; precompose to NFC so callers can
/// compare against the strings they typed.
fn precompose_name(name: &OsStr) -> OsString {
    let Some(utf8) = name.to_str() else {
        return name.to_os_string();
    };
    let source = cf::CFString::from_str(utf8);
    let Some(mutable) = cf::CFMutableString::new_copy(None, 0, Some(&source)) else {
        return name.to_os_string();
    };
    mutable.normalize(cf::CFStringNormalizationForm::C);
    OsString::from(mutable.to_string())
}

fn precompose_path(path: &Path) -> PathBuf {
    PathBuf::from(precompose_name(path.as_os_str()))
}

struct StreamContextInfo {
    host: Weak<StreamHost>,
}

// Free the context when the stream created by `FSEventStreamCreate` is released.
unsafe extern "C-unwind" fn release_context(info: *const libc::c_void) {
    unsafe {
        drop(Box::from_raw(
            info as *const StreamContextInfo as *mut StreamContextInfo,
        ));
    }
}

fn spawn_stream(host: &Arc<StreamHost>, paths: &[PathBuf]) -> Option<RunningStream> {
    let cf_paths = cf::CFMutableArray::<cf::CFString>::empty();
    for path in paths {
        let Some(utf8) = path.to_str() else {
            log::error!("skipping non-UTF-8 watch path {path:?}");
            continue;
        };
        cf_paths.append(&cf::CFString::from_str(utf8));
    }

    // Owned by the stream; freed by `release_context` when the stream is
    // released.
    let context = Box::into_raw(Box::new(StreamContextInfo {
        host: Arc::downgrade(host),
    }));

    let stream_context = fs::FSEventStreamContext {
        version: 0,
        info: context as *mut libc::c_void,
        retain: None,
        release: Some(release_context),
        copyDescription: None,
    };

    let flags = fs::kFSEventStreamCreateFlagFileEvents
        | fs::kFSEventStreamCreateFlagNoDefer
        | fs::kFSEventStreamCreateFlagUseExtendedData
        | fs::kFSEventStreamCreateFlagUseCFTypes;

    let stream = unsafe {
        fs::FSEventStreamCreate(
            cf::kCFAllocatorDefault,
            Some(callback),
            &stream_context as *const _ as *mut _,
            cf_paths.as_opaque(),
            fs::kFSEventStreamEventIdSinceNow,
            0.0,
            flags,
        )
    };

    // Wrapper to help send CFRunLoop types across threads.
    struct CFRunLoopSendWrapper(cf::CFRetained<cf::CFRunLoop>);

    // Safety:
    // - According to the Apple documentation, it's safe to move `CFRunLoop`s
    //   across threads.
    unsafe impl Send for CFRunLoopSendWrapper {}

    // Wrapper to help send FSEventStreamRef types across threads. The stream
    // is only touched from the loop thread after this send.
    struct FSEventStreamSendWrapper(fs::FSEventStreamRef);
    unsafe impl Send for FSEventStreamSendWrapper {}

    let stream = FSEventStreamSendWrapper(stream);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let thread = thread::Builder::new()
        .name("pathwatch fsevents loop".to_string())
        .spawn(move || {
            let stream = stream.0;
            unsafe {
                let runloop = cf::CFRunLoop::current().expect("current runloop");

                #[allow(deprecated)]
                fs::FSEventStreamScheduleWithRunLoop(
                    stream,
                    &runloop,
                    cf::kCFRunLoopDefaultMode.expect("default runloop mode"),
                );
                if !fs::FSEventStreamStart(stream) {
                    fs::FSEventStreamInvalidate(stream);
                    fs::FSEventStreamRelease(stream);
                    let _ = ready_tx.send(None);
                    return;
                }

                let _ = ready_tx.send(Some(CFRunLoopSendWrapper(runloop)));

                // Runs until the promotion of a successor (or teardown)
                // stops this runloop.
                cf::CFRunLoop::run();

                fs::FSEventStreamStop(stream);
                // Events can still be pending for a stopped stream; purge
                // them so the callback is not invoked on a dead stream.
                let event_id = fs::FSEventsGetCurrentEventId();
                let device = fs::FSEventStreamGetDeviceBeingWatched(stream);
                fs::FSEventsPurgeEventsForDeviceUpToEventId(device, event_id);
                fs::FSEventStreamInvalidate(stream);
                fs::FSEventStreamRelease(stream);
            }
        })
        .ok()?;

    match ready_rx.recv() {
        Ok(Some(runloop)) => Some(RunningStream {
            runloop: runloop.0,
            thread,
        }),
        Ok(None) => {
            let _ = thread.join();
            log::debug!("unable to start FSEvents stream");
            None
        }
        Err(_) => None,
    }
}

fn stop_stream(stream: RunningStream) {
    while !stream.runloop.is_waiting() {
        thread::yield_now();
    }
    stream.runloop.stop();
    let _ = stream.thread.join();
}

unsafe extern "C-unwind" fn callback(
    stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: NonNull<libc::c_void>,
    event_flags: NonNull<fs::FSEventStreamEventFlags>,
    event_ids: NonNull<fs::FSEventStreamEventId>,
) {
    unsafe {
        callback_impl(
            stream_ref,
            info,
            num_events,
            event_paths,
            event_flags,
            event_ids,
        )
    }
}

unsafe fn callback_impl(
    _stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: NonNull<libc::c_void>,
    event_flags: NonNull<fs::FSEventStreamEventFlags>,
    _event_ids: NonNull<fs::FSEventStreamEventId>,
) {
    let info = &*(info as *const StreamContextInfo);
    let Some(host) = info.host.upgrade() else {
        return;
    };

    {
        let mut processing = host.processing.lock().unwrap();
        if processing.destroyed || processing.in_progress {
            return;
        }
        processing.in_progress = true;
    }
    let _guard = ProcessingGuard { host: &host };

    // With UseCFTypes and UseExtendedData the paths argument is a CFArray of
    // dictionaries carrying the path and the file inode.
    let array = &*(event_paths.as_ptr() as *const cf::CFArray);
    let path_key = fs::kFSEventStreamEventExtendedDataPathKey.expect("extended data path key");
    let inode_key = fs::kFSEventStreamEventExtendedFileIDKey.expect("extended file id key");

    let mut events = Vec::with_capacity(num_events);
    for i in 0..num_events {
        let entry = array.value_at_index(i as cf::CFIndex);
        if entry.is_null() {
            continue;
        }
        let dict = &*(entry as *const cf::CFDictionary);

        let path_value = dict.value(path_key as *const cf::CFString as *const libc::c_void);
        if path_value.is_null() {
            continue;
        }
        let path = (*(path_value as *const cf::CFString)).to_string();

        let inode_value = dict.value(inode_key as *const cf::CFString as *const libc::c_void);
        let Some(inode) = (!inode_value.is_null())
            .then(|| (*(inode_value as *const cf::CFNumber)).as_i64())
            .flatten()
        else {
            // Without an inode the event cannot participate in rename
            // pairing; this matches dropping it outright.
            continue;
        };

        let raw_flags = *event_flags.as_ptr().add(i);
        let flags = StreamFlags::from_bits_retain(raw_flags);
        events.push(FsEvent {
            path: PathBuf::from(path),
            flags,
            inode,
        });
    }

    host.handle_events(events);
}
