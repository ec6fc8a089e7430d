//! Thin Windows backend over `ReadDirectoryChangesW`: one non-recursive OS
//! watch per directory, translated to the listener contract.
//!
//! Each watch owns a directory handle and a delivery thread blocked in
//! `ReadDirectoryChangesW`. Rename pairs arrive as `RENAMED_OLD_NAME`
//! followed by `RENAMED_NEW_NAME` in the same buffer and are folded into a
//! single `Moved` action; an endpoint left unpaired degrades to a `Delete`
//! or an `Add`, which is also how moves across the watch boundary surface.

use std::collections::HashMap;
use std::ffi::{c_void, OsString};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex};
use std::thread;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES,
    FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::CancelIoEx;

use crate::backend::{Backend, Listener, WatcherHandle};
use crate::event::Action;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_CREATION;

/// A directory handle that can cross into the delivery thread.
#[derive(Clone, Copy)]
struct DirHandle(HANDLE);
unsafe impl Send for DirHandle {}

struct WatchControl {
    dir_handle: DirHandle,
    thread: thread::JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    next_handle: WatcherHandle,
    watches: HashMap<WatcherHandle, WatchControl>,
}

/// `ReadDirectoryChangesW`-based `Backend` implementation.
#[derive(Default)]
pub(crate) struct ReadDirectoryChangesBackend {
    inner: Mutex<Inner>,
}

impl ReadDirectoryChangesBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

fn to_wide(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

impl Backend for ReadDirectoryChangesBackend {
    fn add_watch(&self, dir: &Path, listener: Arc<dyn Listener>) -> WatcherHandle {
        let wide = to_wide(dir);
        let raw = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS,
                ptr::null_mut(),
            )
        };
        if raw == INVALID_HANDLE_VALUE {
            return -(unsafe { GetLastError() } as WatcherHandle);
        }

        let mut inner = self.inner.lock().unwrap();
        let handle = inner.next_handle;
        inner.next_handle += 1;

        let dir_handle = DirHandle(raw);
        let dir_path = dir.to_path_buf();
        let thread = match thread::Builder::new()
            .name("pathwatch rdcw loop".to_string())
            .spawn(move || delivery_loop(handle, dir_handle, dir_path, listener))
        {
            Ok(thread) => thread,
            Err(err) => {
                unsafe { CloseHandle(raw) };
                return -err.raw_os_error().unwrap_or(1);
            }
        };

        inner.watches.insert(handle, WatchControl { dir_handle, thread });
        handle
    }

    fn remove_watch(&self, handle: WatcherHandle) {
        let control = self.inner.lock().unwrap().watches.remove(&handle);
        if let Some(control) = control {
            unsafe {
                CancelIoEx(control.dir_handle.0, ptr::null());
                CloseHandle(control.dir_handle.0);
            }
            let _ = control.thread.join();
        }
    }
}

impl Drop for ReadDirectoryChangesBackend {
    fn drop(&mut self) {
        let watches = std::mem::take(&mut self.inner.lock().unwrap().watches);
        for control in watches.into_values() {
            unsafe {
                CancelIoEx(control.dir_handle.0, ptr::null());
                CloseHandle(control.dir_handle.0);
            }
            let _ = control.thread.join();
        }
    }
}

fn delivery_loop(
    handle: WatcherHandle,
    dir_handle: DirHandle,
    dir_path: PathBuf,
    listener: Arc<dyn Listener>,
) {
    // Change records need DWORD alignment.
    let mut buffer = vec![0u32; 16 * 1024];

    loop {
        let mut bytes_returned: u32 = 0;
        let ok = unsafe {
            ReadDirectoryChangesW(
                dir_handle.0,
                buffer.as_mut_ptr() as *mut c_void,
                (buffer.len() * 4) as u32,
                0, // non-recursive
                NOTIFY_FILTER,
                &mut bytes_returned,
                ptr::null_mut(),
                None,
            )
        };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            if code != ERROR_OPERATION_ABORTED {
                log::debug!("ReadDirectoryChangesW on {dir_path:?} ended: error {code}");
            }
            return;
        }
        if bytes_returned == 0 {
            // Overflow: the OS dropped changes. There is nothing to replay.
            log::warn!("change buffer overflow on {dir_path:?}; events were lost");
            continue;
        }

        process_buffer(
            handle,
            &dir_path,
            listener.as_ref(),
            buffer.as_ptr() as *const u8,
            bytes_returned as usize,
        );
    }
}

fn process_buffer(
    handle: WatcherHandle,
    dir_path: &Path,
    listener: &dyn Listener,
    base: *const u8,
    len: usize,
) {
    let mut pending_old: Option<OsString> = None;
    let mut offset = 0usize;

    loop {
        if offset + std::mem::size_of::<FILE_NOTIFY_INFORMATION>() > len {
            break;
        }
        // Safety: the kernel fills the buffer with a chain of properly
        // aligned FILE_NOTIFY_INFORMATION records.
        let info = unsafe { &*(base.add(offset) as *const FILE_NOTIFY_INFORMATION) };
        let name_len = info.FileNameLength as usize / 2;
        let name_ptr = unsafe {
            (base.add(offset) as *const u8)
                .add(std::mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName))
                as *const u16
        };
        let name_wide = unsafe { std::slice::from_raw_parts(name_ptr, name_len) };
        let full_name = OsString::from_wide(name_wide);

        // Only direct children: deeper paths cannot occur with a
        // non-recursive watch, but keep the final component if they do.
        let name = Path::new(&full_name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or(full_name);

        match info.Action {
            FILE_ACTION_RENAMED_OLD_NAME => {
                if let Some(old) = pending_old.take() {
                    listener.on_action(handle, dir_path, &old, Action::Delete, None);
                }
                pending_old = Some(name);
            }
            FILE_ACTION_RENAMED_NEW_NAME => match pending_old.take() {
                Some(old) => {
                    listener.on_action(handle, dir_path, &name, Action::Moved, Some(&old));
                }
                None => listener.on_action(handle, dir_path, &name, Action::Add, None),
            },
            action => {
                if let Some(old) = pending_old.take() {
                    listener.on_action(handle, dir_path, &old, Action::Delete, None);
                }
                match action {
                    FILE_ACTION_ADDED => {
                        listener.on_action(handle, dir_path, &name, Action::Add, None)
                    }
                    FILE_ACTION_REMOVED => {
                        listener.on_action(handle, dir_path, &name, Action::Delete, None)
                    }
                    FILE_ACTION_MODIFIED => {
                        listener.on_action(handle, dir_path, &name, Action::Modified, None)
                    }
                    other => log::trace!("unknown change action {other} on {dir_path:?}"),
                }
            }
        }

        if info.NextEntryOffset == 0 {
            break;
        }
        offset += info.NextEntryOffset as usize;
    }

    // A rename whose destination left the watched directory.
    if let Some(old) = pending_old {
        listener.on_action(handle, dir_path, &old, Action::Delete, None);
    }
}
