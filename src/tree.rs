//! The tree driver.
//!
//! [`BlinkTree`] ties the pieces together: optimistic descent through the
//! inner nodes, B-link crabbing at the leaf level, upward propagation of
//! splits and merges through a path stack, root growth and shrink, and
//! the ordered scan.
//!
//! Descent records only the inner nodes entered through a *child* edge.
//! A sibling jump means the node above no longer bounds the key, so the
//! stack entry would be useless for upward propagation; the per-level
//! leftmost-node array steps in when the stack runs dry, and rightward
//! crabbing under the latch does the rest.
//!
//! Root changes happen while both the old top and its replacement are
//! latched, so concurrent descents always observe a coherent depth. The
//! tree owns its epoch domain; every public operation demands a [`Guard`]
//! from [`BlinkTree::guard`] and borrowed records live as long as that
//! guard.

mod iter;

pub use iter::Range;

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use crate::config::MAX_HEIGHT;
use crate::control::Control;
use crate::epoch::{Epoch, Guard};
use crate::inner::{Descent, InnerNode, SlotOrSibling};
use crate::key::{KVPair, Key};
use crate::leaf::{LeafNode, LeafRemove, LeafUpsert};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::trace::debug_log;

/// Concurrent ordered index from `K` to `V`.
///
/// # Example
///
/// ```
/// use blinktree::BlinkTree;
///
/// let tree: BlinkTree<u64, u64> = BlinkTree::new();
/// let guard = tree.guard();
/// tree.insert(7, 70, &guard);
/// assert_eq!(tree.lookup(&7, &guard).map(|kv| kv.value), Some(70));
/// ```
pub struct BlinkTree<K: Key, V> {
    /// Type-erased root node; the control word's leaf bit is the tag.
    root: AtomicPtr<u8>,
    /// Tree height; 1 while the root is a leaf.
    depth: AtomicUsize,
    /// Leftmost node of each level, level 0 being the leaves. Leftmost
    /// nodes are never unlinked, so these stay valid for every level
    /// below the current depth.
    root_track: [AtomicPtr<u8>; MAX_HEIGHT],
    epoch: Epoch,
    _marker: PhantomData<(K, V)>,
}

/// Structure counters from a full walk, primarily for tests and
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeStats {
    pub depth: usize,
    pub inner_nodes: usize,
    pub leaf_nodes: usize,
    pub pairs: usize,
    /// Live pairs over leaf capacity.
    pub load_factor: f64,
}

#[inline]
unsafe fn ctrl<'a>(node: *mut u8) -> &'a Control {
    // SAFETY: both node types lead with their control word; the caller
    // passes a live node pointer.
    unsafe { &*node.cast::<Control>() }
}

impl<K: Key, V: Send + Sync + 'static> BlinkTree<K, V> {
    /// An empty tree: a single leaf root.
    #[must_use]
    pub fn new() -> Self {
        let root: *mut u8 = Box::into_raw(LeafNode::<K, V>::alloc()).cast();
        let root_track = std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut()));
        root_track[0].store(root, RELAXED);
        Self {
            root: AtomicPtr::new(root),
            depth: AtomicUsize::new(1),
            root_track,
            epoch: Epoch::new(),
            _marker: PhantomData,
        }
    }

    /// Pin the calling thread for a batch of operations.
    #[must_use]
    pub fn guard(&self) -> Guard<'_> {
        self.epoch.guard()
    }

    /// Current height.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(READ_ORD)
    }

    // ========================================================================
    //  Node handle helpers
    // ========================================================================

    #[inline]
    unsafe fn as_leaf<'a>(node: *mut u8) -> &'a LeafNode<K, V> {
        debug_assert!(unsafe { ctrl(node) }.is_leaf());
        // SAFETY: tagged by the control word's leaf bit.
        unsafe { &*node.cast::<LeafNode<K, V>>() }
    }

    #[inline]
    unsafe fn as_inner<'a>(node: *mut u8) -> &'a InnerNode<K> {
        debug_assert!(!unsafe { ctrl(node) }.is_leaf());
        // SAFETY: tagged by the control word's leaf bit.
        unsafe { &*node.cast::<InnerNode<K>>() }
    }

    /// Descend to the leaf level, recording child-edge inner nodes.
    fn descend_tracked(&self, route: &K::Route) -> (*mut u8, Vec<*mut u8>) {
        let mut path = Vec::with_capacity(self.depth());
        let mut current = self.root.load(READ_ORD);
        // SAFETY: every pointer followed here is a live node under our
        // caller's guard.
        while !unsafe { ctrl(current) }.is_leaf() {
            let inner = unsafe { Self::as_inner(current) };
            match inner.to_next(route) {
                Descent::Child(next) => {
                    path.push(current);
                    current = next;
                }
                Descent::Sibling(next) => current = next,
            }
        }
        (current, path)
    }

    /// Descend without path tracking (read-only operations).
    fn descend(&self, route: &K::Route) -> *mut u8 {
        let mut current = self.root.load(READ_ORD);
        // SAFETY: as in `descend_tracked`.
        while !unsafe { ctrl(current) }.is_leaf() {
            let inner = unsafe { Self::as_inner(current) };
            current = match inner.to_next(route) {
                Descent::Child(next) | Descent::Sibling(next) => next,
            };
        }
        current
    }

    /// Latch the leaf responsible for `key`, crabbing rightward across
    /// in-flight splits.
    fn latch_leaf_for(&self, start: *mut u8, key: &K) -> *mut u8 {
        let mut current = start;
        // SAFETY: node pointers stay live under the guard.
        unsafe { ctrl(current) }.latch_exclusive();
        loop {
            let leaf = unsafe { Self::as_leaf(current) };
            match leaf.to_sibling(key) {
                Some(next) => {
                    let next: *mut u8 = next.cast();
                    unsafe { ctrl(next) }.latch_exclusive();
                    unsafe { ctrl(current) }.unlatch_exclusive();
                    current = next;
                }
                None => return current,
            }
        }
    }

    // ========================================================================
    //  Public operations
    // ========================================================================

    /// Insert `key`, or replace its value if present. Returns the
    /// displaced record, valid for the guard's lifetime.
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard<'_>) -> Option<&'g KVPair<K, V>> {
        self.insert_pair(KVPair::boxed(key, value), guard)
    }

    /// [`BlinkTree::insert`] with a caller-built record.
    pub fn insert_pair<'g>(
        &'g self,
        kv: Box<KVPair<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Option<&'g KVPair<K, V>> {
        let kv = Box::into_raw(kv);
        // SAFETY: we own `kv` until the leaf publishes it.
        let key = unsafe { &(*kv).key };
        let route = key.route();

        let (start, mut path) = self.descend_tracked(&route);
        let mut current = self.latch_leaf_for(start, key);

        let leaf = unsafe { Self::as_leaf(current) };
        let (mut rnode, mut mid) = match leaf.upsert(kv, guard) {
            LeafUpsert::Replaced(old) => {
                unsafe { ctrl(current) }.unlatch_exclusive();
                // SAFETY: `old` was just unlinked from its slot.
                unsafe { guard.retire_pair(old) };
                return Some(unsafe { &*old });
            }
            LeafUpsert::Inserted => {
                unsafe { ctrl(current) }.unlatch_exclusive();
                return None;
            }
            LeafUpsert::Split { rnode, mid } => (rnode.cast::<u8>(), mid),
        };

        // Thread the split upward until some ancestor absorbs it.
        let mut rootid = 0usize;
        loop {
            rootid += 1;
            let root_now = self.root.load(READ_ORD);
            let growing = current == root_now;
            let work: *mut u8 = if growing {
                Box::into_raw(InnerNode::<K>::alloc()).cast()
            } else if let Some(p) = path.pop() {
                p
            } else {
                let p = self.root_track[rootid].load(READ_ORD);
                assert!(!p.is_null(), "leftmost track lost a level");
                p
            };

            unsafe { ctrl(work) }.latch_exclusive();
            if growing {
                // Publish the new top while the old one is still latched:
                // descents either see the old root (and recover through
                // sibling pointers) or the complete new one.
                debug_log!(depth = rootid + 1, "root grows");
                self.root_track[rootid].store(work, WRITE_ORD);
                self.root.store(work, WRITE_ORD);
                self.depth.fetch_add(1, WRITE_ORD);
            }

            let mut work = work;
            let index = loop {
                let inner = unsafe { Self::as_inner(work) };
                match inner.slot_or_sibling(&mid) {
                    SlotOrSibling::At(index) => break index,
                    SlotOrSibling::Sibling(next) => {
                        unsafe { ctrl(next) }.latch_exclusive();
                        unsafe { ctrl(work) }.unlatch_exclusive();
                        work = next;
                    }
                }
            };

            // Straddle: readers of `work` treat the in-flight child split
            // as inconsistent until the separator lands.
            unsafe { ctrl(work) }.begin_splitting();
            unsafe { ctrl(current) }.unlatch_exclusive();
            let inner = unsafe { Self::as_inner(work) };
            let split = inner.insert(current, rnode, &mut mid, index, guard);
            unsafe { ctrl(work) }.end_splitting();

            current = work;
            match split {
                Some(next_rnode) => rnode = next_rnode.cast(),
                None => break,
            }
        }
        unsafe { ctrl(current) }.unlatch_exclusive();
        None
    }

    /// Replace the value of `key` if present; the record swap is atomic.
    /// Returns the displaced record, or `None` (and drops the new value)
    /// if the key is absent.
    pub fn update<'g>(&'g self, key: K, value: V, guard: &'g Guard<'_>) -> Option<&'g KVPair<K, V>> {
        self.update_pair(KVPair::boxed(key, value), guard)
    }

    /// [`BlinkTree::update`] with a caller-built record.
    pub fn update_pair<'g>(
        &'g self,
        kv: Box<KVPair<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Option<&'g KVPair<K, V>> {
        let kv = Box::into_raw(kv);
        // SAFETY: we own `kv` until a slot CAS publishes it.
        let key = unsafe { &(*kv).key };
        let route = key.route();
        let mut node = self.descend(&route);

        loop {
            let leaf = unsafe { Self::as_leaf(node) };
            let mut version = leaf.control().begin_read();
            let leaf = loop {
                let leaf = unsafe { Self::as_leaf(node) };
                match leaf.to_sibling(key) {
                    Some(next) => {
                        node = next.cast();
                        version = unsafe { Self::as_leaf(node) }.control().begin_read();
                    }
                    None => break leaf,
                }
            };
            let old = leaf.update(kv);
            if !old.is_null() {
                // SAFETY: the CAS unlinked `old` from its slot.
                unsafe { guard.retire_pair(old) };
                return Some(unsafe { &*old });
            }
            if leaf.control().end_read(version) {
                break;
            }
            // A writer moved things around; the key may have relocated.
        }

        // Absent: the unpublished record goes straight back.
        // SAFETY: `kv` was never published.
        unsafe { drop(Box::from_raw(kv)) };
        None
    }

    /// Find `key`. The borrow is valid until the guard drops.
    pub fn lookup<'g>(&'g self, key: &K, _guard: &'g Guard<'_>) -> Option<&'g KVPair<K, V>> {
        let route = key.route();
        let mut node = self.descend(&route);

        loop {
            let leaf = unsafe { Self::as_leaf(node) };
            let mut version = leaf.control().begin_read();
            let leaf = loop {
                let leaf = unsafe { Self::as_leaf(node) };
                match leaf.to_sibling(key) {
                    Some(next) => {
                        node = next.cast();
                        version = unsafe { Self::as_leaf(node) }.control().begin_read();
                    }
                    None => break leaf,
                }
            };
            let kv = leaf.lookup(key);
            if !kv.is_null() {
                // SAFETY: records outlive the guard that observed them.
                return Some(unsafe { &*kv });
            }
            if leaf.control().end_read(version) {
                return None;
            }
        }
    }

    /// Remove `key`. Returns the removed record, valid for the guard's
    /// lifetime; the tree retires it.
    pub fn remove<'g>(&'g self, key: &K, guard: &'g Guard<'_>) -> Option<&'g KVPair<K, V>> {
        let route = key.route();
        let (start, mut path) = self.descend_tracked(&route);
        let mut current = self.latch_leaf_for(start, key);

        let leaf = unsafe { Self::as_leaf(current) };
        let LeafRemove { old, merged } = leaf.remove(key, guard);

        let (mut merged_node, mut mid) = match merged {
            Some((node, mid)) => (Some(node.cast::<u8>()), mid),
            None => (None, route),
        };
        let mut merged_is_leaf = true;
        let mut up = false;
        let mut rootid = 0usize;

        while merged_node.is_some() || up {
            rootid += 1;
            let mut work = path.pop().unwrap_or_else(|| {
                let p = self.root_track[rootid].load(READ_ORD);
                assert!(!p.is_null(), "leftmost track lost a level");
                p
            });

            unsafe { ctrl(work) }.latch_exclusive();
            let index = loop {
                let inner = unsafe { Self::as_inner(work) };
                match inner.slot_or_sibling(&mid) {
                    SlotOrSibling::At(index) => break index,
                    SlotOrSibling::Sibling(next) => {
                        unsafe { ctrl(next) }.latch_exclusive();
                        unsafe { ctrl(work) }.unlatch_exclusive();
                        work = next;
                    }
                }
            };

            let root_now = self.root.load(READ_ORD);
            if work != root_now {
                unsafe { ctrl(current) }.unlatch_exclusive();
            }

            let inner = unsafe { Self::as_inner(work) };
            match merged_node.take() {
                Some(dead) => {
                    let next_merged = inner.remove(&mut mid, &mut up, index, guard);
                    // The parent no longer routes to the absorbed node;
                    // stragglers already inside hold older guards.
                    // SAFETY: `dead` was unlinked by the level below.
                    unsafe {
                        if merged_is_leaf {
                            guard.retire_leaf(dead.cast::<LeafNode<K, V>>());
                        } else {
                            guard.retire_inner(dead.cast::<InnerNode<K>>());
                        }
                    }
                    merged_is_leaf = false;
                    merged_node = next_merged.map(|p| p.cast::<u8>());
                }
                None => {
                    up = inner.border_update(&mid, index, guard);
                }
            }

            if work == root_now {
                merged_node = None;
                up = false;
                if let Some(new_root) = inner.root_remove() {
                    debug_log!(depth = rootid, "root shrinks");
                    debug_assert!(new_root == current);
                    self.root.store(new_root, WRITE_ORD);
                    self.depth.fetch_sub(1, WRITE_ORD);
                    // SAFETY: the old root is unlinked; new descents start
                    // below it, and stragglers inside it recover through
                    // its trailing pointer.
                    unsafe { guard.retire_inner(work.cast::<InnerNode<K>>()) };
                }
                unsafe { ctrl(current) }.unlatch_exclusive();
            }
            current = work;
        }
        unsafe { ctrl(current) }.unlatch_exclusive();

        if old.is_null() {
            None
        } else {
            // SAFETY: the record was unlinked under the leaf latch.
            unsafe { guard.retire_pair(old) };
            Some(unsafe { &*old })
        }
    }

    // ========================================================================
    //  Maintenance
    // ========================================================================

    /// Walk every level and count nodes and records.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let depth = self.depth();
        let mut stats = TreeStats {
            depth,
            inner_nodes: 0,
            leaf_nodes: 0,
            pairs: 0,
            load_factor: 0.0,
        };
        for level in 0..depth {
            let mut node = self.root_track[level].load(READ_ORD);
            while !node.is_null() {
                // SAFETY: live chain nodes under no contention; `stats` is
                // not meant to run against concurrent writers.
                if unsafe { ctrl(node) }.is_leaf() {
                    let leaf = unsafe { Self::as_leaf(node) };
                    stats.leaf_nodes += 1;
                    stats.pairs += leaf.key_count();
                    node = leaf.sibling_forward().cast();
                } else {
                    let inner = unsafe { Self::as_inner(node) };
                    stats.inner_nodes += 1;
                    node = inner.sibling_ptr();
                }
            }
        }
        if stats.leaf_nodes > 0 {
            stats.load_factor =
                stats.pairs as f64 / (stats.leaf_nodes * crate::config::FANOUT) as f64;
        }
        stats
    }

    /// Check every structural invariant reachable from the root. Panics
    /// on violation. Quiescent use only (tests).
    #[doc(hidden)]
    pub fn validate(&self) {
        let root = self.root.load(READ_ORD);
        self.validate_node(root, None, None);
    }

    fn validate_node(&self, node: *mut u8, lo: Option<&K::Route>, hi: Option<&K::Route>) {
        // SAFETY: quiescent tree, live nodes.
        if unsafe { ctrl(node) }.is_leaf() {
            let leaf = unsafe { Self::as_leaf(node) };
            assert!(!leaf.control().deleted(), "reachable leaf is deleted");
            for route in leaf.live_routes() {
                if let Some(lo) = lo {
                    assert!(&route > lo, "leaf key at or below its lower bound");
                }
                if let Some(hi) = hi {
                    assert!(&route <= hi, "leaf key above its separator");
                }
            }
            if let Some(high) = leaf.high_key_route() {
                for route in leaf.live_routes() {
                    assert!(route <= high, "leaf key above its high key");
                }
            }
        } else {
            let inner = unsafe { Self::as_inner(node) };
            assert!(!inner.control().deleted(), "reachable inner node is deleted");
            assert!(inner.check_sorted(), "separators out of order");
            let knum = inner.key_count();
            let mut prev = lo.cloned();
            for i in 0..knum {
                let sep = inner.separator_route(i);
                if let Some(hi) = hi {
                    assert!(&sep <= hi, "separator above the parent bound");
                }
                self.validate_node(inner.child(i), prev.as_ref(), Some(&sep));
                prev = Some(sep);
            }
            if !inner.control().has_sibling() {
                self.validate_node(inner.next_raw(), prev.as_ref(), hi);
            }
        }
    }
}

impl<K: Key, V: Send + Sync + 'static> Default for BlinkTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V> Drop for BlinkTree<K, V> {
    fn drop(&mut self) {
        // Free the live structure level by level; nodes retired during the
        // tree's lifetime are flushed when the epoch domain drops after
        // this.
        let depth = self.depth.load(RELAXED);
        for level in 0..depth {
            let mut node = self.root_track[level].load(RELAXED);
            while !node.is_null() {
                // SAFETY: exclusive access at drop; each live node is
                // reachable exactly once through its level chain.
                unsafe {
                    if ctrl(node).is_leaf() {
                        let leaf = node.cast::<LeafNode<K, V>>();
                        let next = (*leaf).sibling_forward();
                        drop(Box::from_raw(leaf));
                        node = next.cast();
                    } else {
                        let inner = node.cast::<InnerNode<K>>();
                        let next = (*inner).sibling_ptr();
                        drop(Box::from_raw(inner));
                        node = next;
                    }
                }
            }
        }
    }
}

impl<K: Key, V> std::fmt::Debug for BlinkTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlinkTree")
            .field("depth", &self.depth.load(RELAXED))
            .finish_non_exhaustive()
    }
}
