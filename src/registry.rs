//! Placement of native watchers: a path-keyed trie that serves every
//! subscription with as few OS watches as the configured policy allows.
//!
//! Nodes form a trie over canonical path segments. A node may anchor a
//! *leaf*: a native watcher plus the list of descendant directories it serves
//! on behalf of subscriptions below it. With consolidation enabled a leaf
//! absorbs everything beneath it, so no two leaves share a root-to-leaf
//! path; with everything disabled (the Linux and Windows policy) anchors
//! simply stack, one per distinct watched directory.
//!
//! All mutation runs under the owning hub's registry lock. Replacement
//! watchers are always started before the watchers they supersede are
//! stopped, so a migrating subscription never has a coverage gap.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::backend::{Backend, Listener};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::native::{NativeIndex, NativeWatcher};
use crate::subscription::PathWatcher;

/// Split a canonical absolute path into trie segments. The root (and drive
/// prefix, on Windows) folds into the first segment so joining the segments
/// back yields the original absolute path.
pub(crate) fn path_segments(path: &Path) -> Vec<OsString> {
    let mut root = OsString::new();
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => root.push(prefix.as_os_str()),
            Component::RootDir => root.push(std::path::MAIN_SEPARATOR_STR),
            // Canonical paths contain neither of these.
            Component::CurDir | Component::ParentDir => {}
            Component::Normal(segment) => segments.push(segment.to_os_string()),
        }
    }
    let mut all = Vec::with_capacity(segments.len() + 1);
    all.push(root);
    all.extend(segments);
    all
}

pub(crate) fn segments_to_path(segments: &[OsString]) -> PathBuf {
    let mut path = PathBuf::new();
    for segment in segments {
        path.push(segment);
    }
    path
}

type NodeId = usize;

const ROOT: NodeId = 0;

struct Leaf {
    native: Arc<NativeWatcher>,
    /// Directories below this node whose subscriptions this watcher serves,
    /// one entry per subscription.
    child_paths: Vec<Vec<OsString>>,
}

struct Node {
    parent: Option<NodeId>,
    /// Segment under which the parent holds this node. Empty for the root.
    key: OsString,
    children: HashMap<OsString, NodeId>,
    leaf: Option<Leaf>,
}

impl Node {
    fn interior(parent: Option<NodeId>, key: OsString) -> Self {
        Self {
            parent,
            key,
            children: HashMap::new(),
            leaf: None,
        }
    }
}

struct Walk {
    /// Deepest existing node along the requested segments.
    node: NodeId,
    /// How many segments were matched to reach it.
    depth: usize,
    /// Deepest anchored node strictly above the requested path, if any.
    ancestor_anchor: Option<NodeId>,
}

/// How one rehomed directory was placed, with enough context to undo it.
enum Placement {
    /// An equally tight leaf already existed.
    Shared(Arc<NativeWatcher>),
    /// Registered as a child path of an existing ancestor leaf.
    ChildOf(NodeId, Arc<NativeWatcher>),
    /// A fresh leaf was anchored.
    NewAnchor(NodeId, Arc<NativeWatcher>),
}

impl Placement {
    fn native(&self) -> &Arc<NativeWatcher> {
        match self {
            Placement::Shared(native)
            | Placement::ChildOf(_, native)
            | Placement::NewAnchor(_, native) => native,
        }
    }
}

pub(crate) struct Registry {
    config: Config,
    recursive: bool,
    backend: Arc<dyn Backend>,
    listener: Arc<dyn Listener>,
    index: Arc<NativeIndex>,
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
}

impl Registry {
    pub(crate) fn new(
        config: Config,
        recursive: bool,
        backend: Arc<dyn Backend>,
        listener: Arc<dyn Listener>,
        index: Arc<NativeIndex>,
    ) -> Self {
        Self {
            config,
            recursive,
            backend,
            listener,
            index,
            nodes: vec![Some(Node::interior(None, OsString::new()))],
            free: Vec::new(),
        }
    }

    /// Number of native watchers currently anchored in the tree.
    pub(crate) fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .flatten()
            .filter(|node| node.leaf.is_some())
            .count()
    }

    // -- arena plumbing ----------------------------------------------------

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("node was freed")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("node was freed")
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn free_node(&mut self, id: NodeId) {
        self.nodes[id] = None;
        self.free.push(id);
    }

    fn child(&self, id: NodeId, segment: &OsString) -> Option<NodeId> {
        self.node(id).children.get(segment).copied()
    }

    fn node_path(&self, id: NodeId) -> Vec<OsString> {
        let mut segments = Vec::new();
        let mut cursor = id;
        while cursor != ROOT {
            let node = self.node(cursor);
            segments.push(node.key.clone());
            cursor = node.parent.expect("non-root node has a parent");
        }
        segments.reverse();
        segments
    }

    fn descend(&self, segments: &[OsString]) -> Walk {
        let mut node = ROOT;
        let mut depth = 0;
        let mut ancestor_anchor = None;
        for segment in segments {
            if self.node(node).leaf.is_some() {
                ancestor_anchor = Some(node);
            }
            match self.child(node, segment) {
                Some(next) => {
                    node = next;
                    depth += 1;
                }
                None => break,
            }
        }
        Walk {
            node,
            depth,
            ancestor_anchor,
        }
    }

    fn ensure_chain(&mut self, segments: &[OsString]) -> NodeId {
        let mut node = ROOT;
        for segment in segments {
            node = match self.child(node, segment) {
                Some(next) => next,
                None => {
                    let child = self.alloc(Node::interior(Some(node), segment.clone()));
                    self.node_mut(node).children.insert(segment.clone(), child);
                    child
                }
            };
        }
        node
    }

    /// Anchored nodes strictly below `id`, in no particular order.
    fn anchored_descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id).children.values().copied().collect();
        while let Some(cursor) = stack.pop() {
            if self.node(cursor).leaf.is_some() {
                found.push(cursor);
            }
            stack.extend(self.node(cursor).children.values().copied());
        }
        found
    }

    /// Drop empty interior nodes from `id` upward, stopping at `stop` or the
    /// first node still carrying children or a leaf.
    fn prune_up(&mut self, mut id: NodeId, stop: NodeId) {
        while id != stop && id != ROOT {
            if self.nodes[id].is_none() {
                return;
            }
            let node = self.node(id);
            if node.leaf.is_some() || !node.children.is_empty() {
                return;
            }
            let parent = node.parent.expect("non-root node has a parent");
            let key = node.key.clone();
            self.node_mut(parent).children.remove(&key);
            self.free_node(id);
            id = parent;
        }
    }

    // -- native lifecycle --------------------------------------------------

    fn start_native(&self, native: &Arc<NativeWatcher>) -> Result<()> {
        let handle = native.start(self.listener.clone())?;
        self.index.insert(handle, native.clone());
        Ok(())
    }

    fn stop_native(&self, native: &Arc<NativeWatcher>) {
        if let Some(handle) = native.stop() {
            self.index.remove(handle);
        }
    }

    fn new_native(&self, dir: &[OsString]) -> Arc<NativeWatcher> {
        NativeWatcher::new(segments_to_path(dir), self.recursive, self.backend.clone())
    }

    // -- attach ------------------------------------------------------------

    /// Decide native-watcher placement for a new subscription on `dir`
    /// (targeting `target`; for file subscriptions the extra trailing
    /// segment is the file name). Returns the running native watcher the
    /// subscription must bind to. On error nothing is changed.
    pub(crate) fn attach(
        &mut self,
        target: &[OsString],
        dir: &[OsString],
    ) -> Result<Arc<NativeWatcher>> {
        let walk = self.descend(dir);
        let exact = (walk.depth == dir.len()).then_some(walk.node);

        // A watcher already sits exactly on this directory: share it. This
        // holds under every policy, keeping natives unique per directory.
        if let Some(node_id) = exact {
            if let Some(leaf) = self.node(node_id).leaf.as_ref() {
                log::debug!("sharing native watcher at {:?}", segments_to_path(dir));
                return Ok(leaf.native.clone());
            }
        }

        // An ancestor watcher covers us: ride on it.
        if self.config.reuse_ancestor_watchers() {
            if let Some(ancestor_id) = walk.ancestor_anchor {
                let native = self
                    .node(ancestor_id)
                    .leaf
                    .as_ref()
                    .expect("anchored node has a leaf")
                    .native
                    .clone();
                self.node_mut(ancestor_id)
                    .leaf
                    .as_mut()
                    .expect("anchored node has a leaf")
                    .child_paths
                    .push(dir.to_vec());
                log::debug!(
                    "attaching {:?} to ancestor watcher at {:?}",
                    segments_to_path(dir),
                    native.path()
                );
                return Ok(native);
            }
        }

        // We arrived above existing watchers: replace them with one here.
        if let Some(node_id) = exact {
            let below = self.anchored_descendants(node_id);
            if !below.is_empty() && self.config.relocate_descendant_watchers() {
                return self.consolidate(node_id, dir.to_vec(), below, dir);
            }
        }

        // Nothing on our path, but cousins nearby: merge under the common
        // ancestor when it is close enough. A last parent that is itself a
        // leaf was already rejected for reuse above and must stay intact.
        if walk.depth < dir.len()
            && walk.node != ROOT
            && self.node(walk.node).leaf.is_none()
            && self.config.merge_watchers_with_common_ancestors()
        {
            let below = self.anchored_descendants(walk.node);
            if !below.is_empty() {
                let distance = target.len() - walk.depth;
                if self.config.within_ancestor_cap(distance) {
                    let ancestor_path = dir[..walk.depth].to_vec();
                    return self.consolidate(walk.node, ancestor_path, below, dir);
                }
            }
        }

        // No useful overlap: a watcher of our own.
        self.anchor_standalone(dir)
    }

    /// Create and start a native at `dir` and anchor a fresh leaf there.
    fn anchor_standalone(&mut self, dir: &[OsString]) -> Result<Arc<NativeWatcher>> {
        let native = self.new_native(dir);
        self.start_native(&native)?;
        let node_id = self.ensure_chain(dir);
        self.node_mut(node_id).leaf = Some(Leaf {
            native: native.clone(),
            child_paths: Vec::new(),
        });
        log::debug!("new native watcher at {:?}", native.path());
        Ok(native)
    }

    /// Replace the leaves in `absorbed` with a single watcher at
    /// `anchor_path` (the path of `anchor_node`). `subscriber_dir` is the
    /// incoming subscription's directory; it is recorded as a child path
    /// unless the new watcher sits exactly on it. The replacement is started
    /// before any absorbed watcher stops.
    fn consolidate(
        &mut self,
        anchor_node: NodeId,
        anchor_path: Vec<OsString>,
        absorbed: Vec<NodeId>,
        subscriber_dir: &[OsString],
    ) -> Result<Arc<NativeWatcher>> {
        let native = self.new_native(&anchor_path);
        self.start_native(&native)?;

        let mut child_paths = Vec::new();
        let mut replaced = Vec::new();
        for id in &absorbed {
            let leaf = self
                .node_mut(*id)
                .leaf
                .take()
                .expect("absorbed node has a leaf");
            child_paths.push(self.node_path(*id));
            child_paths.extend(leaf.child_paths);
            replaced.push(leaf.native);
        }
        if subscriber_dir != anchor_path.as_slice() {
            child_paths.push(subscriber_dir.to_vec());
        }

        log::debug!(
            "consolidating {} watcher(s) under {:?}",
            replaced.len(),
            native.path()
        );

        self.node_mut(anchor_node).leaf = Some(Leaf {
            native: native.clone(),
            child_paths,
        });

        for old in &replaced {
            old.migrate_subscribers_to(&native);
            self.stop_native(old);
        }
        for id in absorbed {
            self.prune_up(id, anchor_node);
        }

        Ok(native)
    }

    // -- detach ------------------------------------------------------------

    fn find_anchor_for(&self, native: &Arc<NativeWatcher>) -> Option<NodeId> {
        self.nodes.iter().position(|slot| {
            slot.as_ref()
                .and_then(|node| node.leaf.as_ref())
                .is_some_and(|leaf| Arc::ptr_eq(&leaf.native, native))
        })
    }

    fn anchor_covering(&self, dir: &[OsString]) -> Option<NodeId> {
        let walk = self.descend(dir);
        if walk.depth == dir.len() && self.node(walk.node).leaf.is_some() {
            return Some(walk.node);
        }
        walk.ancestor_anchor
    }

    /// Remove a closed subscription from the tree, splitting or narrowing
    /// the serving watcher as the policy allows.
    pub(crate) fn detach(&mut self, sub: &Arc<PathWatcher>) {
        let dir = sub.dir_segments().to_vec();
        let native = sub.current_native();
        let node_id = native
            .as_ref()
            .and_then(|n| self.find_anchor_for(n))
            .or_else(|| self.anchor_covering(&dir));

        let Some(node_id) = node_id else {
            // No record of this subscription (the tree was reset under it).
            if let Some(native) = native {
                if native.remove_subscriber(sub) == 0 {
                    self.stop_native(&native);
                }
            }
            return;
        };

        let leaf_native = self
            .node(node_id)
            .leaf
            .as_ref()
            .expect("anchored node has a leaf")
            .native
            .clone();
        let remaining = leaf_native.remove_subscriber(sub);
        let leaf_path = self.node_path(node_id);

        if leaf_path == dir {
            // The subscription sat on the leaf's own directory.
            let another_owner = leaf_native
                .subscribers()
                .iter()
                .any(|other| other.dir_segments() == dir.as_slice());
            if another_owner {
                return;
            }
            let has_child_paths = !self
                .node(node_id)
                .leaf
                .as_ref()
                .expect("anchored node has a leaf")
                .child_paths
                .is_empty();
            if has_child_paths {
                self.rehome(node_id);
            } else {
                let leaf = self
                    .node_mut(node_id)
                    .leaf
                    .take()
                    .expect("anchored node has a leaf");
                self.stop_native(&leaf.native);
                self.prune_up(node_id, ROOT);
            }
            return;
        }

        // The subscription was served as a child path of an ancestor leaf.
        {
            let leaf = self
                .node_mut(node_id)
                .leaf
                .as_mut()
                .expect("anchored node has a leaf");
            if let Some(pos) = leaf.child_paths.iter().position(|p| *p == dir) {
                leaf.child_paths.remove(pos);
            }
        }

        if remaining == 0 {
            let leaf = self
                .node_mut(node_id)
                .leaf
                .take()
                .expect("anchored node has a leaf");
            self.stop_native(&leaf.native);
            self.prune_up(node_id, ROOT);
            return;
        }

        if self.config.relocate_ancestor_watchers() {
            let leaf = self
                .node(node_id)
                .leaf
                .as_ref()
                .expect("anchored node has a leaf");
            let mut distinct = leaf.child_paths.clone();
            distinct.sort();
            distinct.dedup();
            let owner_on_leaf_dir = leaf_native
                .subscribers()
                .iter()
                .any(|other| other.dir_segments() == leaf_path.as_slice());
            if distinct.len() == 1 && !owner_on_leaf_dir {
                self.rehome(node_id);
            }
        }
    }

    /// Re-anchor everything a leaf served below itself onto new, tighter
    /// watchers, then stop the old one. Used when a leaf's own subscription
    /// goes away (split) and when a lone descendant remains (narrow).
    fn rehome(&mut self, node_id: NodeId) {
        let leaf = self
            .node_mut(node_id)
            .leaf
            .take()
            .expect("anchored node has a leaf");
        let old_native = leaf.native.clone();

        // Shallow-first so a nested child path can reuse a leaf created for
        // its ancestor in the same pass.
        let mut dirs = leaf.child_paths.clone();
        dirs.sort();
        dirs.dedup();

        let mut placements: Vec<Placement> = Vec::new();
        let mut failed: Option<(Vec<OsString>, Error)> = None;

        for dir in &dirs {
            match self.place_tight(dir) {
                Ok(placement) => placements.push(placement),
                Err(err) => {
                    failed = Some((dir.clone(), err));
                    break;
                }
            }
        }

        if let Some((failed_dir, err)) = failed {
            // Undo in reverse and keep everything on the old watcher.
            for placement in placements.into_iter().rev() {
                match placement {
                    Placement::Shared(_) => {}
                    Placement::ChildOf(id, _) => {
                        self.node_mut(id)
                            .leaf
                            .as_mut()
                            .expect("anchored node has a leaf")
                            .child_paths
                            .pop();
                    }
                    Placement::NewAnchor(id, native) => {
                        self.node_mut(id).leaf = None;
                        self.stop_native(&native);
                        // Stop at the rehomed node: its leaf is restored
                        // right below.
                        self.prune_up(id, node_id);
                    }
                }
            }
            self.node_mut(node_id).leaf = Some(Leaf {
                native: old_native.clone(),
                child_paths: leaf.child_paths,
            });
            log::error!(
                "could not narrow watcher at {:?}: replacement on {:?} failed: {}",
                old_native.path(),
                segments_to_path(&failed_dir),
                err
            );
            for sub in old_native.subscribers() {
                if sub.dir_segments() == failed_dir.as_slice() {
                    sub.deliver_error(&err);
                }
            }
            return;
        }

        // Every replacement is running; move each subscriber to the deepest
        // one covering it, then retire the old watcher.
        for sub in old_native.subscribers() {
            let normalized = sub.normalized_path();
            let best = placements
                .iter()
                .map(Placement::native)
                .filter(|native| normalized.starts_with(native.path()))
                .max_by_key(|native| native.path().components().count());
            if let Some(replacement) = best {
                sub.handle_should_detach(&old_native, replacement);
            }
        }
        self.stop_native(&old_native);
        self.prune_up(node_id, ROOT);
    }

    /// Reuse-or-standalone placement for one rehomed directory. Unlike
    /// [`Registry::attach`] this never merges; rehoming must produce tighter
    /// watchers, not re-create the one being dismantled.
    fn place_tight(&mut self, dir: &[OsString]) -> Result<Placement> {
        let walk = self.descend(dir);
        if walk.depth == dir.len() {
            if let Some(leaf) = self.node(walk.node).leaf.as_ref() {
                return Ok(Placement::Shared(leaf.native.clone()));
            }
        }
        if self.config.reuse_ancestor_watchers() {
            if let Some(ancestor_id) = walk.ancestor_anchor {
                let native = self
                    .node(ancestor_id)
                    .leaf
                    .as_ref()
                    .expect("anchored node has a leaf")
                    .native
                    .clone();
                self.node_mut(ancestor_id)
                    .leaf
                    .as_mut()
                    .expect("anchored node has a leaf")
                    .child_paths
                    .push(dir.to_vec());
                return Ok(Placement::ChildOf(ancestor_id, native));
            }
        }
        let native = self.new_native(dir);
        self.start_native(&native)?;
        let node_id = self.ensure_chain(dir);
        self.node_mut(node_id).leaf = Some(Leaf {
            native: native.clone(),
            child_paths: Vec::new(),
        });
        Ok(Placement::NewAnchor(node_id, native))
    }

    // -- teardown ----------------------------------------------------------

    /// Empty the tree, returning every anchored native watcher so the caller
    /// can stop them. Used by global teardown.
    pub(crate) fn take_all_natives(&mut self) -> Vec<Arc<NativeWatcher>> {
        let natives = self
            .nodes
            .iter_mut()
            .flatten()
            .filter_map(|node| node.leaf.take())
            .map(|leaf| leaf.native)
            .collect();
        self.nodes = vec![Some(Node::interior(None, OsString::new()))];
        self.free.clear();
        natives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::event::{Action, Event};
    use crate::native::Dispatcher;
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct Fixture {
        backend: Arc<MockBackend>,
        index: Arc<NativeIndex>,
        registry: Mutex<Registry>,
    }

    impl Fixture {
        fn new(config: Config) -> Self {
            let backend = MockBackend::new();
            let index = Arc::new(NativeIndex::default());
            let dispatcher = Dispatcher::new(index.clone());
            let registry = Registry::new(config, true, backend.clone(), dispatcher, index.clone());
            Self {
                backend,
                index,
                registry: Mutex::new(registry),
            }
        }

        /// Attach a directory subscription, binding it the way the hub does.
        fn watch_dir(
            &self,
            dir: &str,
        ) -> Result<(Arc<PathWatcher>, mpsc::Receiver<crate::Result<Event>>)> {
            self.watch(dir, dir, false)
        }

        fn watch_file(
            &self,
            target: &str,
        ) -> Result<(Arc<PathWatcher>, mpsc::Receiver<crate::Result<Event>>)> {
            let dir = Path::new(target)
                .parent()
                .expect("file target has a parent")
                .to_str()
                .unwrap()
                .to_owned();
            self.watch(target, &dir, true)
        }

        fn watch(
            &self,
            target: &str,
            dir: &str,
            is_file: bool,
        ) -> Result<(Arc<PathWatcher>, mpsc::Receiver<crate::Result<Event>>)> {
            let (tx, rx) = mpsc::channel();
            let dir_path = PathBuf::from(dir);
            let dir_segments = path_segments(&dir_path);
            let target_segments = path_segments(Path::new(target));
            let sub = PathWatcher::new(
                PathBuf::from(target),
                dir_path,
                PathBuf::from(target),
                is_file,
                dir_segments.clone(),
                Box::new(tx),
            );
            let native = self
                .registry
                .lock()
                .unwrap()
                .attach(&target_segments, &dir_segments)?;
            native.add_subscriber(sub.clone());
            sub.set_native(&native);
            Ok((sub, rx))
        }

        fn close(&self, sub: &Arc<PathWatcher>) {
            if sub.deactivate() {
                self.registry.lock().unwrap().detach(sub);
            }
        }

        fn leaf_count(&self) -> usize {
            self.registry.lock().unwrap().leaf_count()
        }

        fn watched(&self) -> Vec<PathBuf> {
            self.index.watched_paths()
        }
    }

    fn merge_config(cap: i32) -> Config {
        Config::standalone()
            .with_merge_watchers_with_common_ancestors(true)
            .with_max_common_ancestor_level(cap)
    }

    #[test]
    fn sibling_subscriptions_merge_under_parent() {
        let fx = Fixture::new(merge_config(1));
        let (sub_a, rx_a) = fx.watch_dir("/x/a").unwrap();
        let (_sub_b, rx_b) = fx.watch_dir("/x/b").unwrap();

        assert_eq!(fx.watched(), vec![PathBuf::from("/x")]);
        assert_eq!(fx.leaf_count(), 1);
        assert!(sub_a.current_native().unwrap().path() == Path::new("/x"));

        // A write inside /x/a reaches only the /x/a subscription.
        fx.backend
            .emit(Path::new("/x"), Action::Modified, Path::new("/x/a"), "f", None);
        assert_eq!(rx_a.try_recv().unwrap().unwrap(), Event::Change);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn watchers_count_matches_leaves_for_any_policy() {
        for config in [Config::standalone(), Config::consolidating(), merge_config(5)] {
            let fx = Fixture::new(config);
            let (_s1, _r1) = fx.watch_dir("/x/a").unwrap();
            let (_s2, _r2) = fx.watch_dir("/x/b").unwrap();
            let (_s3, _r3) = fx.watch_dir("/y").unwrap();
            assert_eq!(fx.leaf_count(), fx.watched().len());
            assert_eq!(fx.leaf_count(), fx.index.len());
        }
    }

    #[test]
    fn ancestor_watcher_is_reused() {
        let fx = Fixture::new(Config::consolidating());
        let (sub_parent, _rx_p) = fx.watch_dir("/x").unwrap();
        let (sub_child, _rx_c) = fx.watch_dir("/x/sub").unwrap();

        assert_eq!(fx.watched(), vec![PathBuf::from("/x")]);
        assert_eq!(fx.leaf_count(), 1);
        assert_eq!(sub_child.current_native().unwrap().path(), Path::new("/x"));

        // Closing the parent splits the leaf down to /x/sub.
        fx.close(&sub_parent);
        assert_eq!(fx.watched(), vec![PathBuf::from("/x/sub")]);
        assert_eq!(fx.leaf_count(), 1);
        assert_eq!(
            sub_child.current_native().unwrap().path(),
            Path::new("/x/sub")
        );
    }

    #[test]
    fn exact_directory_is_shared_under_every_policy() {
        let fx = Fixture::new(Config::standalone());
        let (sub_one, _rx1) = fx.watch_dir("/x").unwrap();
        let (sub_two, _rx2) = fx.watch_dir("/x").unwrap();

        assert_eq!(fx.leaf_count(), 1);
        assert!(Arc::ptr_eq(
            &sub_one.current_native().unwrap(),
            &sub_two.current_native().unwrap()
        ));

        // First close keeps the leaf for the remaining owner.
        fx.close(&sub_one);
        assert_eq!(fx.leaf_count(), 1);
        fx.close(&sub_two);
        assert_eq!(fx.leaf_count(), 0);
        assert!(fx.watched().is_empty());
    }

    #[test]
    fn standalone_policy_stacks_watchers() {
        let fx = Fixture::new(Config::standalone());
        let (_parent, _rx_p) = fx.watch_dir("/x").unwrap();
        let (_child, _rx_c) = fx.watch_dir("/x/sub").unwrap();

        assert_eq!(
            fx.watched(),
            vec![PathBuf::from("/x"), PathBuf::from("/x/sub")]
        );
        assert_eq!(fx.leaf_count(), 2);
    }

    #[test]
    fn descendant_watchers_relocate_under_new_ancestor() {
        let config = Config::standalone().with_relocate_descendant_watchers(true);
        let fx = Fixture::new(config);
        let (sub_a, _rx_a) = fx.watch_dir("/x/a").unwrap();
        let (sub_b, _rx_b) = fx.watch_dir("/x/b").unwrap();
        assert_eq!(fx.leaf_count(), 2);

        let (sub_top, _rx_t) = fx.watch_dir("/x").unwrap();
        assert_eq!(fx.watched(), vec![PathBuf::from("/x")]);
        assert_eq!(fx.leaf_count(), 1);

        // All three ride the same native now.
        let top = sub_top.current_native().unwrap();
        assert!(Arc::ptr_eq(&top, &sub_a.current_native().unwrap()));
        assert!(Arc::ptr_eq(&top, &sub_b.current_native().unwrap()));
        assert_eq!(top.subscriber_count(), 3);
    }

    #[test]
    fn cousins_merge_only_within_the_ancestor_cap() {
        // Distance from /x is three segments (directory plus file name), one
        // past the cap: the watchers stay apart.
        let fx = Fixture::new(merge_config(2));
        let (_s1, _r1) = fx.watch_file("/x/a/aa/file").unwrap();
        let (_s2, _r2) = fx.watch_file("/x/b/bb/file").unwrap();
        assert_eq!(
            fx.watched(),
            vec![PathBuf::from("/x/a/aa"), PathBuf::from("/x/b/bb")]
        );

        // With a cap of three they collapse onto /x.
        let fx = Fixture::new(merge_config(3));
        let (_s1, _r1) = fx.watch_file("/x/a/aa/file").unwrap();
        let (sub, _r2) = fx.watch_file("/x/b/bb/file").unwrap();
        assert_eq!(fx.watched(), vec![PathBuf::from("/x")]);
        assert_eq!(sub.current_native().unwrap().path(), Path::new("/x"));
    }

    #[test]
    fn merge_is_transparent_to_existing_subscribers() {
        let fx = Fixture::new(merge_config(1));
        let (sub_a, rx_a) = fx.watch_dir("/x/a").unwrap();
        let before = sub_a.current_native().unwrap();
        assert_eq!(before.path(), Path::new("/x/a"));

        let (_sub_b, _rx_b) = fx.watch_dir("/x/b").unwrap();
        let after = sub_a.current_native().unwrap();
        assert_eq!(after.path(), Path::new("/x"));
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(!before.is_running());

        // Events keep flowing through the consolidated watcher.
        fx.backend.emit(
            Path::new("/x"),
            Action::Add,
            Path::new("/x/a"),
            "new-entry",
            None,
        );
        assert_eq!(rx_a.try_recv().unwrap().unwrap(), Event::Change);
    }

    #[test]
    fn narrowing_after_sibling_detach() {
        let fx = Fixture::new(
            merge_config(1).with_relocate_ancestor_watchers(true),
        );
        let (sub_a, _rx_a) = fx.watch_dir("/x/a").unwrap();
        let (sub_b, _rx_b) = fx.watch_dir("/x/b").unwrap();
        assert_eq!(fx.watched(), vec![PathBuf::from("/x")]);

        fx.close(&sub_b);
        assert_eq!(fx.watched(), vec![PathBuf::from("/x/a")]);
        assert_eq!(
            sub_a.current_native().unwrap().path(),
            Path::new("/x/a")
        );
    }

    #[test]
    fn no_narrowing_without_the_option() {
        let fx = Fixture::new(merge_config(1));
        let (_sub_a, _rx_a) = fx.watch_dir("/x/a").unwrap();
        let (sub_b, _rx_b) = fx.watch_dir("/x/b").unwrap();
        fx.close(&sub_b);
        assert_eq!(fx.watched(), vec![PathBuf::from("/x")]);
    }

    #[test]
    fn failed_start_leaves_no_trace() {
        let fx = Fixture::new(Config::standalone());
        fx.backend.fail_next_add(28); // ENOSPC, the classic inotify limit
        let err = fx.watch_dir("/x").unwrap_err();
        assert!(matches!(err.kind, crate::ErrorKind::Io(_)));
        assert_eq!(fx.leaf_count(), 0);
        assert_eq!(fx.index.len(), 0);
        assert!(fx.watched().is_empty());
    }

    #[test]
    fn failed_merge_keeps_existing_watchers() {
        let fx = Fixture::new(merge_config(1));
        let (sub_a, _rx_a) = fx.watch_dir("/x/a").unwrap();
        fx.backend.fail_next_add(28);
        let err = fx.watch_dir("/x/b").unwrap_err();
        assert!(matches!(err.kind, crate::ErrorKind::Io(_)));

        // The original watcher is untouched and still serves its subscriber.
        assert_eq!(fx.watched(), vec![PathBuf::from("/x/a")]);
        assert_eq!(sub_a.current_native().unwrap().path(), Path::new("/x/a"));
        assert!(sub_a.current_native().unwrap().is_running());
    }

    #[test]
    fn migration_keeps_replacement_running_before_old_stops() {
        let fx = Fixture::new(merge_config(1));
        let (_sub_a, _rx_a) = fx.watch_dir("/x/a").unwrap();
        let (_sub_b, _rx_b) = fx.watch_dir("/x/b").unwrap();

        // The consolidated parent watch began before the child watch was
        // removed, so no event falls between the two.
        let adds = fx.backend.add_calls();
        let removes = fx.backend.remove_calls();
        assert_eq!(adds, vec![PathBuf::from("/x/a"), PathBuf::from("/x")]);
        assert_eq!(removes, vec![PathBuf::from("/x/a")]);
    }

    #[test]
    fn closing_subscriptions_in_any_order_empties_the_tree() {
        let orders: [[usize; 3]; 3] = [[0, 1, 2], [2, 0, 1], [1, 2, 0]];
        for order in orders {
            let fx = Fixture::new(Config::consolidating());
            let subs = [
                fx.watch_dir("/x").unwrap().0,
                fx.watch_dir("/x/sub").unwrap().0,
                fx.watch_file("/y/file").unwrap().0,
            ];
            for i in order {
                fx.close(&subs[i]);
            }
            assert_eq!(fx.leaf_count(), 0, "order {order:?}");
            assert!(fx.watched().is_empty(), "order {order:?}");
            assert_eq!(fx.index.len(), 0, "order {order:?}");
        }
    }

    #[test]
    fn double_close_is_ignored() {
        let fx = Fixture::new(Config::standalone());
        let (sub, _rx) = fx.watch_dir("/x").unwrap();
        fx.close(&sub);
        fx.close(&sub);
        assert_eq!(fx.leaf_count(), 0);
    }

    #[test]
    fn take_all_natives_resets_the_tree() {
        let fx = Fixture::new(Config::consolidating());
        let (_s1, _r1) = fx.watch_dir("/x").unwrap();
        let (_s2, _r2) = fx.watch_dir("/y").unwrap();
        let natives = fx.registry.lock().unwrap().take_all_natives();
        assert_eq!(natives.len(), 2);
        assert_eq!(fx.leaf_count(), 0);
    }

    #[test]
    fn segments_round_trip() {
        let path = Path::new("/x/a/file.txt");
        let segments = path_segments(path);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments_to_path(&segments), path);
    }
}
