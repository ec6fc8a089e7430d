//! Event types crossing the public boundary and the raw backend boundary.

use std::ffi::OsString;
use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A change notification delivered to a subscription's handlers.
///
/// The variants are the full vocabulary a subscription can observe. What a
/// given filesystem operation maps to depends on whether the subscription
/// targets a file or a directory:
///
/// - A subscription on a **file** sees [`Event::Change`] when the file's
///   contents change, [`Event::Rename`] when it moves within the watched
///   directory (the subscription follows it to the new name), and
///   [`Event::Delete`] when it is removed or moved away. [`Event::Create`]
///   appears when the file comes back after a delete.
/// - A subscription on a **directory** sees [`Event::Change`] whenever an
///   entry inside it is created, modified, removed, or renamed. Deleting the
///   watched directory itself is deliberately not reported; watch the parent
///   directory to observe that.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Event {
    /// The watched target came into existence.
    Create,

    /// The watched file's contents changed, or an entry inside the watched
    /// directory changed.
    Change,

    /// The watched target moved; carries its new location.
    Rename(PathBuf),

    /// The watched target is gone.
    Delete,
}

impl Event {
    /// Returns true for the variants that concern the exact watched target
    /// rather than the contents of the watched directory.
    pub fn concerns_target(&self) -> bool {
        !matches!(self, Event::Change)
    }
}

/// What a native backend observed happening to a single path.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum Action {
    /// A file or directory appeared.
    Add,
    /// A file's contents or metadata changed.
    Modified,
    /// A file or directory disappeared.
    Delete,
    /// A file or directory was renamed within one directory.
    Moved,
}

/// One raw observation from a native backend, addressed to a backend handle.
///
/// `dir` is the directory the change happened in, `filename` the entry that
/// changed. `old_filename` is set only for [`Action::Moved`] and names the
/// entry's previous name in the same directory. Cross-directory moves arrive
/// as a `Delete` plus an `Add`.
#[derive(Clone, Debug)]
pub(crate) struct RawEvent {
    pub handle: i32,
    pub action: Action,
    pub dir: PathBuf,
    pub filename: OsString,
    pub old_filename: Option<OsString>,
}

impl RawEvent {
    /// Full path of the entry after the change.
    pub fn new_path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    /// Full path of the entry before a rename, if this is one.
    pub fn old_path(&self) -> Option<PathBuf> {
        self.old_filename.as_ref().map(|old| self.dir.join(old))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_paths_join_dir_and_names() {
        let ev = RawEvent {
            handle: 1,
            action: Action::Moved,
            dir: PathBuf::from("/watched"),
            filename: OsString::from("new.txt"),
            old_filename: Some(OsString::from("old.txt")),
        };
        assert_eq!(ev.new_path(), PathBuf::from("/watched/new.txt"));
        assert_eq!(ev.old_path(), Some(PathBuf::from("/watched/old.txt")));
    }

    #[test]
    fn change_does_not_concern_target() {
        assert!(!Event::Change.concerns_target());
        assert!(Event::Delete.concerns_target());
        assert!(Event::Rename(PathBuf::from("/p")).concerns_target());
    }
}
