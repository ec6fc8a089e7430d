//! Translation of raw backend observations into per-subscription events.
//!
//! A native watcher is frequently broader than the subscriptions it serves:
//! it may sit on an ancestor directory and deliver raw events about siblings,
//! cousins, or the watched entry itself. This module decides, for one
//! subscription, whether a raw event is visible at all and what it means.

use std::path::{Path, PathBuf};

use crate::event::{Action, Event, RawEvent};

/// The subscription-side context a translation runs against.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SubscriberView<'a> {
    /// The exact entry the user asked about. A file for file subscriptions,
    /// equal to `normalized` for directory subscriptions.
    pub target: &'a Path,
    /// The canonical directory the subscription is anchored on.
    pub normalized: &'a Path,
    /// True iff `target` is a file inside `normalized`.
    pub is_watching_parent: bool,
    /// Whether the target is currently believed to exist. Used to suppress
    /// the spurious `Add` some backends report for entries that predate the
    /// watch.
    pub target_exists: bool,
}

/// What a subscription should do with one raw event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Not visible to this subscription.
    Drop,
    /// Deliver the event as-is.
    Emit(Event),
    /// The target moved within the watched subtree: adopt the new paths,
    /// then deliver `emit` if present.
    Retarget {
        target: PathBuf,
        normalized: PathBuf,
        emit: Option<Event>,
    },
}

/// Strict-descendant check: `path` is inside `root` but not equal to it.
fn inside(path: &Path, root: &Path) -> bool {
    path != root && path.starts_with(root)
}

pub(crate) fn translate(raw: &RawEvent, view: &SubscriberView<'_>) -> Outcome {
    let new_path = raw.new_path();
    let old_path = raw.old_path();

    let new_inside = inside(&new_path, view.normalized);
    let old_inside = old_path
        .as_deref()
        .is_some_and(|old| inside(old, view.normalized));

    // Events entirely outside the subscription's subtree are invisible. This
    // also swallows events naming the watched directory itself, which keeps
    // self-deletion of a directly watched directory silent on every platform.
    if !new_inside && !old_inside {
        return Outcome::Drop;
    }

    let new_is_target = new_path == view.target;

    match raw.action {
        Action::Add => {
            if new_is_target {
                if view.target_exists {
                    // The entry predates the watch; the backend is replaying
                    // its existence, not reporting a creation.
                    Outcome::Drop
                } else {
                    Outcome::Emit(Event::Create)
                }
            } else if view.is_watching_parent {
                Outcome::Drop
            } else {
                Outcome::Emit(Event::Change)
            }
        }
        Action::Modified => {
            if view.is_watching_parent {
                if new_is_target {
                    Outcome::Emit(Event::Change)
                } else {
                    Outcome::Drop
                }
            } else if new_is_target {
                // A directory has no contents of its own to modify.
                Outcome::Drop
            } else {
                Outcome::Emit(Event::Change)
            }
        }
        Action::Delete => {
            if view.is_watching_parent {
                if new_is_target {
                    Outcome::Emit(Event::Delete)
                } else {
                    Outcome::Drop
                }
            } else {
                Outcome::Emit(Event::Change)
            }
        }
        Action::Moved => {
            let old_is_target = old_path.as_deref() == Some(view.target);
            if !new_is_target && !old_is_target {
                if view.is_watching_parent {
                    return Outcome::Drop;
                }
                // A rename among our direct children is a contents change;
                // renames deeper down are reported through their own
                // directory-change events.
                let direct = new_path.parent() == Some(view.normalized)
                    || old_path
                        .as_deref()
                        .and_then(Path::parent)
                        .is_some_and(|parent| parent == view.normalized);
                return if direct {
                    Outcome::Emit(Event::Change)
                } else {
                    Outcome::Drop
                };
            }

            let emit = if new_inside && old_inside {
                Some(Event::Rename(new_path.clone()))
            } else if old_inside {
                Some(Event::Delete)
            } else if new_inside {
                Some(Event::Create)
            } else {
                None
            };

            if new_inside && new_path != view.target {
                // The target moved within the watched subtree; follow it.
                let normalized = if view.is_watching_parent {
                    new_path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| view.normalized.to_path_buf())
                } else {
                    view.normalized.to_path_buf()
                };
                Outcome::Retarget {
                    target: new_path,
                    normalized,
                    emit,
                }
            } else {
                match emit {
                    Some(event) => Outcome::Emit(event),
                    None => Outcome::Drop,
                }
            }
        }
    }
}
