//! Configuration types

/// Watcher-consolidation configuration.
///
/// These options control how aggressively subscriptions are packed onto
/// shared OS-level watch resources. The registry consults them on every
/// attach and detach.
///
/// ```rust
/// # use pathwatch::Config;
/// let config = Config::default()
///     .with_merge_watchers_with_common_ancestors(true)
///     .with_max_common_ancestor_level(2);
/// ```
///
/// [`Config::default`] returns the platform policy: consolidation is enabled
/// on macOS, where one shared event stream serves any number of directories,
/// and disabled on Linux and Windows, where the native primitive is
/// per-directory and a watcher above the requested path would observe
/// unrelated siblings.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Config {
    /// See [Config::with_reuse_ancestor_watchers]
    reuse_ancestor_watchers: bool,

    /// See [Config::with_relocate_descendant_watchers]
    relocate_descendant_watchers: bool,

    /// See [Config::with_relocate_ancestor_watchers]
    relocate_ancestor_watchers: bool,

    /// See [Config::with_merge_watchers_with_common_ancestors]
    merge_watchers_with_common_ancestors: bool,

    /// See [Config::with_max_common_ancestor_level]
    max_common_ancestor_level: i32,
}

impl Config {
    /// If a watcher already covers an ancestor of a new subscription's path,
    /// attach the subscription to it instead of creating a new watcher.
    pub fn with_reuse_ancestor_watchers(mut self, enabled: bool) -> Self {
        self.reuse_ancestor_watchers = enabled;
        self
    }

    /// Returns current setting
    pub fn reuse_ancestor_watchers(&self) -> bool {
        self.reuse_ancestor_watchers
    }

    /// When a subscription arrives above existing watchers, replace them with
    /// a single watcher on the new, higher directory.
    pub fn with_relocate_descendant_watchers(mut self, enabled: bool) -> Self {
        self.relocate_descendant_watchers = enabled;
        self
    }

    /// Returns current setting
    pub fn relocate_descendant_watchers(&self) -> bool {
        self.relocate_descendant_watchers
    }

    /// When an ancestor subscription goes away and a single descendant
    /// remains, narrow the watcher down to the descendant's directory.
    pub fn with_relocate_ancestor_watchers(mut self, enabled: bool) -> Self {
        self.relocate_ancestor_watchers = enabled;
        self
    }

    /// Returns current setting
    pub fn relocate_ancestor_watchers(&self) -> bool {
        self.relocate_ancestor_watchers
    }

    /// Consolidate sibling and cousin subscriptions under their nearest
    /// common directory, subject to [`Config::with_max_common_ancestor_level`].
    pub fn with_merge_watchers_with_common_ancestors(mut self, enabled: bool) -> Self {
        self.merge_watchers_with_common_ancestors = enabled;
        self
    }

    /// Returns current setting
    pub fn merge_watchers_with_common_ancestors(&self) -> bool {
        self.merge_watchers_with_common_ancestors
    }

    /// Maximum segment distance between a subscription's path and the common
    /// ancestor a merge may place the watcher on. Zero or negative removes
    /// the cap.
    pub fn with_max_common_ancestor_level(mut self, level: i32) -> Self {
        self.max_common_ancestor_level = level;
        self
    }

    /// Returns current setting
    pub fn max_common_ancestor_level(&self) -> i32 {
        self.max_common_ancestor_level
    }

    /// True when `distance` segments between subscription and ancestor are
    /// within the configured cap.
    pub(crate) fn within_ancestor_cap(&self, distance: usize) -> bool {
        self.max_common_ancestor_level <= 0 || distance <= self.max_common_ancestor_level as usize
    }

    /// Configuration with every consolidation strategy disabled: one native
    /// watcher per distinct watched directory.
    pub fn standalone() -> Self {
        Self {
            reuse_ancestor_watchers: false,
            relocate_descendant_watchers: false,
            relocate_ancestor_watchers: false,
            merge_watchers_with_common_ancestors: false,
            max_common_ancestor_level: 0,
        }
    }

    /// The macOS policy: pack subscriptions onto as few watchers as the
    /// shared event stream allows.
    pub fn consolidating() -> Self {
        Self {
            reuse_ancestor_watchers: true,
            relocate_descendant_watchers: false,
            relocate_ancestor_watchers: true,
            merge_watchers_with_common_ancestors: true,
            max_common_ancestor_level: 2,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::consolidating()
        } else {
            Self::standalone()
        }
    }
}

/// Whether native watchers on this platform observe the whole subtree under
/// their directory. An FSEvents stream always does; inotify and
/// `ReadDirectoryChangesW` as used here never do.
pub(crate) fn platform_recursive() -> bool {
    cfg!(target_os = "macos")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_disabled_by_nonpositive_level() {
        let config = Config::standalone().with_max_common_ancestor_level(0);
        assert!(config.within_ancestor_cap(100));
        let config = config.with_max_common_ancestor_level(-1);
        assert!(config.within_ancestor_cap(100));
    }

    #[test]
    fn cap_bounds_distance() {
        let config = Config::standalone().with_max_common_ancestor_level(2);
        assert!(config.within_ancestor_cap(2));
        assert!(!config.within_ancestor_cap(3));
    }

    #[test]
    fn consolidating_policy_enables_merging() {
        let config = Config::consolidating();
        assert!(config.reuse_ancestor_watchers());
        assert!(config.merge_watchers_with_common_ancestors());
        assert!(config.relocate_ancestor_watchers());
        assert!(!config.relocate_descendant_watchers());
        assert_eq!(config.max_common_ancestor_level(), 2);
    }
}
