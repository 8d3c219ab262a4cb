//! Inner (branching) node.
//!
//! An inner node holds up to [`FANOUT`] separators in a *feature table*: a
//! columnar array with one byte per separator per feature row. The bytes
//! every separator agrees on are factored out into a common prefix, so row
//! `r` holds byte `plen + r` of each separator. Routing compares the query
//! key against whole rows at a time with the batched kernel and narrows a
//! candidate mask row by row.
//!
//! A separator is the largest routing key of its left subtree: keys equal
//! to a separator belong to the child at the separator's slot, keys above
//! it to the next one. The trailing `next` pointer is either the right
//! sibling (sibling flag set) or the last child — the rightmost node of a
//! level covers everything above its last separator. When a node is
//! unlinked, `next` is repurposed to point back at its surviving left
//! neighbor so straggling readers can recover.
//!
//! For byte-string keys the feature table only covers a separator's first
//! [`Key::FEATURE_LEN`] bytes; the full separators live in the node's
//! [`AnchorExtent`] and break ties past the feature bytes.
//!
//! Concurrency: every mutation runs under the control word's exclusive
//! latch and bumps the version first. [`InnerNode::to_next`] is wrapped in
//! an optimistic read frame and retries on version change; field loads
//! inside a frame may observe a torn state, which validation discards.

mod anchor;

pub(crate) use anchor::AnchorExtent;

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize};

use crate::config::{FANOUT, MAX_FEATURE_LEN, MERGE_LIMIT, NODE_ALIGN};
use crate::control::Control;
use crate::epoch::Guard;
use crate::key::{Key, Route};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::simd::{cmpeq_u8x64, cmplt_u8x64, vcmpeq_u8x64, vcmplt_u8x64};

/// Where a routing step leads.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Descent {
    /// Descend into a child (stable parent: goes on the path stack).
    Child(*mut u8),
    /// Jump rightward (or backward, from a deleted node) at the same
    /// level.
    Sibling(*mut u8),
}

/// Slot resolution under the latch, during upward propagation.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SlotOrSibling {
    /// The routing key resolves to this separator slot.
    At(usize),
    /// The routing key lives further right; hand over to the sibling.
    Sibling(*mut u8),
}

/// Branching node. The control word is the first field so a type-erased
/// node pointer can be inspected before its type is known.
#[repr(C, align(64))]
pub(crate) struct InnerNode<K: Key> {
    control: Control,
    knum: AtomicUsize,
    plen: AtomicUsize,
    prefix: [AtomicU8; MAX_FEATURE_LEN],
    /// Right sibling, or last child, or (deleted) left neighbor.
    next: AtomicPtr<u8>,
    /// Feature table, `features[row][slot]`. Rows beyond
    /// `K::FEATURE_LEN - plen` are dead.
    features: [[AtomicU8; FANOUT]; MAX_FEATURE_LEN],
    children: [AtomicPtr<u8>; FANOUT],
    /// Full separators for anchored key types; null otherwise.
    anchors: AtomicPtr<AnchorExtent>,
    _marker: PhantomData<fn() -> K>,
}

const _: () = assert!(NODE_ALIGN == 64);

impl<K: Key> InnerNode<K> {
    pub(crate) fn alloc() -> Box<Self> {
        let anchors = if K::ANCHORED {
            Box::into_raw(AnchorExtent::with_capacity(0))
        } else {
            ptr::null_mut()
        };
        Box::new(Self {
            control: Control::new(false),
            knum: AtomicUsize::new(0),
            plen: AtomicUsize::new(0),
            prefix: std::array::from_fn(|_| AtomicU8::new(0)),
            next: AtomicPtr::new(ptr::null_mut()),
            features: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU8::new(0))),
            children: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            anchors: AtomicPtr::new(anchors),
            _marker: PhantomData,
        })
    }

    // ========================================================================
    //  Field access
    // ========================================================================

    #[inline]
    pub(crate) fn control(&self) -> &Control {
        &self.control
    }

    #[inline]
    pub(crate) fn key_count(&self) -> usize {
        self.knum.load(RELAXED)
    }

    #[inline]
    fn prefix_len(&self) -> usize {
        self.plen.load(RELAXED)
    }

    #[inline]
    pub(crate) fn next_raw(&self) -> *mut u8 {
        self.next.load(READ_ORD)
    }

    /// Right sibling, or null for the rightmost node of a level.
    pub(crate) fn sibling_ptr(&self) -> *mut u8 {
        if self.control.has_sibling() {
            self.next.load(READ_ORD)
        } else {
            ptr::null_mut()
        }
    }

    #[inline]
    pub(crate) fn child(&self, idx: usize) -> *mut u8 {
        self.children[idx].load(READ_ORD)
    }

    #[inline]
    fn set_child(&self, idx: usize, p: *mut u8) {
        self.children[idx].store(p, WRITE_ORD);
    }

    #[inline]
    fn feat(&self, row: usize, col: usize) -> u8 {
        self.features[row][col].load(RELAXED)
    }

    #[inline]
    fn set_feat(&self, row: usize, col: usize, b: u8) {
        self.features[row][col].store(b, RELAXED);
    }

    #[inline]
    fn prefix_byte(&self, idx: usize) -> u8 {
        self.prefix[idx].load(RELAXED)
    }

    #[inline]
    fn row_ptr(&self, row: usize) -> *const u8 {
        // AtomicU8 has the same in-memory representation as u8.
        self.features[row].as_ptr().cast::<u8>()
    }

    #[inline]
    fn anchors(&self) -> &AnchorExtent {
        debug_assert!(K::ANCHORED);
        // SAFETY: anchored nodes allocate their extent at construction and
        // the pointer is only ever swapped for a fresh extent.
        unsafe { &*self.anchors.load(READ_ORD) }
    }

    #[inline]
    fn live_mask(knum: usize) -> u64 {
        assert!(knum <= FANOUT, "key count out of range");
        if knum == FANOUT {
            u64::MAX
        } else {
            (1u64 << knum) - 1
        }
    }

    // ========================================================================
    //  Routing
    // ========================================================================

    /// Compare the query against the prefix. Returns the step to take when
    /// the prefix alone decides, or `None` when the feature rows must.
    fn prefix_compare(&self, route: &K::Route, plen: usize) -> Option<Descent> {
        let mut pid = 0;
        while pid < plen {
            if route.byte(pid) != self.prefix_byte(pid) {
                break;
            }
            pid += 1;
        }
        if pid == plen {
            return None;
        }
        if route.byte(pid) < self.prefix_byte(pid) {
            return Some(Descent::Child(self.child(0)));
        }
        // Above the prefix: rightmost child, or hand over to the sibling.
        let next = self.next_raw();
        if self.control.has_sibling() {
            Some(Descent::Sibling(next))
        } else {
            Some(Descent::Child(next))
        }
    }

    /// Resolve the slot whose subtree covers `route`, given a consistent
    /// snapshot of `knum`/`plen`. Returns `FANOUT + 1`-free slot index in
    /// `0..=knum`.
    fn resolve_slot(&self, route: &K::Route, plen: usize, knum: usize) -> usize {
        let mut eqmask = Self::live_mask(knum);
        let mut rid = 0;
        while rid + plen < K::FEATURE_LEN {
            // SAFETY: rows are FANOUT bytes and rid is in range.
            let mask = unsafe { cmpeq_u8x64(self.row_ptr(rid), route.byte(rid + plen)) } & eqmask;
            if mask == 0 {
                break;
            }
            eqmask = mask;
            rid += 1;
        }

        if rid + plen < K::FEATURE_LEN {
            // The deciding row: separators whose byte is below the query
            // byte are below the query key.
            // SAFETY: rows are FANOUT bytes and rid is in range.
            let lt = unsafe { cmplt_u8x64(self.row_ptr(rid), route.byte(rid + plen)) } & eqmask;
            if lt != 0 {
                64 - lt.leading_zeros() as usize
            } else if eqmask == 0 {
                // Rightmost underfull node whose separators were all
                // removed, or a brand-new root.
                0
            } else {
                eqmask.trailing_zeros() as usize
            }
        } else if K::ANCHORED {
            // Survivors agree on every feature byte; break the tie on the
            // full separators. They are contiguous in slot order.
            if eqmask == 0 {
                return 0;
            }
            let lo = eqmask.trailing_zeros() as usize;
            let hi = 63 - eqmask.leading_zeros() as usize;
            self.anchor_lower_bound(route, lo, hi)
        } else {
            // Fixed-width keys are fully covered by prefix + features, so
            // a lone survivor equals the query and routes left.
            debug_assert!(eqmask.count_ones() == 1, "ambiguous separator match");
            eqmask.trailing_zeros() as usize
        }
    }

    /// First slot in `[lo, hi]` whose anchor is >= the query, else
    /// `hi + 1`.
    fn anchor_lower_bound(&self, route: &K::Route, lo: usize, hi: usize) -> usize {
        let extent = self.anchors();
        let key = route.as_bytes();
        let (mut lo, mut hi) = (lo, hi + 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if extent.anchor(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Route one step down. Retries internally until it observes a
    /// consistent frame; the caller only learns where to go next.
    pub(crate) fn to_next(&self, route: &K::Route) -> Descent {
        loop {
            let version = self.control.begin_read();

            if self.control.deleted() {
                // Unlinked: `next` leads back to the surviving left
                // neighbor, which now covers this node's key range.
                let next = self.next_raw();
                assert!(!next.is_null(), "deleted node lost its back-pointer");
                return Descent::Sibling(next);
            }

            let knum = self.key_count();
            let plen = self.prefix_len();
            let step = match self.prefix_compare(route, plen) {
                Some(step) => step,
                None => {
                    let slot = self.resolve_slot(route, plen, knum);
                    if slot == knum {
                        let next = self.next_raw();
                        if self.control.has_sibling() {
                            Descent::Sibling(next)
                        } else {
                            Descent::Child(next)
                        }
                    } else {
                        Descent::Child(self.child(slot))
                    }
                }
            };

            let target = match step {
                Descent::Child(p) | Descent::Sibling(p) => p,
            };
            if target.is_null() {
                // A torn frame can surface a null; a consistent one never
                // may.
                assert!(!self.control.end_read(version), "null routing target");
                continue;
            }
            if self.control.end_read(version) {
                return step;
            }
        }
    }

    /// Latched slot resolution during upward propagation of a split or
    /// merge. The caller holds this node exclusively.
    pub(crate) fn slot_or_sibling(&self, route: &K::Route) -> SlotOrSibling {
        if self.control.deleted() {
            let next = self.next_raw();
            assert!(!next.is_null(), "deleted node lost its back-pointer");
            return SlotOrSibling::Sibling(next);
        }

        let knum = self.key_count();
        let plen = self.prefix_len();

        let mut pid = 0;
        while pid < plen {
            if route.byte(pid) != self.prefix_byte(pid) {
                break;
            }
            pid += 1;
        }
        if pid < plen {
            if route.byte(pid) < self.prefix_byte(pid) {
                return SlotOrSibling::At(0);
            }
            if self.control.has_sibling() {
                return SlotOrSibling::Sibling(self.next_raw());
            }
            return SlotOrSibling::At(knum);
        }

        let slot = self.resolve_slot(route, plen, knum);
        if slot == knum && self.control.has_sibling() {
            return SlotOrSibling::Sibling(self.next_raw());
        }
        SlotOrSibling::At(slot)
    }

    // ========================================================================
    //  Feature-table maintenance (latch required throughout)
    // ========================================================================

    /// Shift row bytes `[index, index + count)` one slot right and write
    /// `b` at `index`.
    fn row_open(&self, row: usize, index: usize, count: usize, b: u8) {
        for col in (index..index + count).rev() {
            self.set_feat(row, col + 1, self.feat(row, col));
        }
        self.set_feat(row, index, b);
    }

    /// Shift row bytes `[index + 1, index + 1 + count)` one slot left.
    fn row_close(&self, row: usize, index: usize, count: usize) {
        for col in index..index + count {
            self.set_feat(row, col, self.feat(row, col + 1));
        }
    }

    /// Move `rows` full-width rows down by `by` (toward higher row
    /// indices), highest first.
    fn rows_shift_down(&self, by: usize, rows: usize) {
        for row in (0..rows).rev() {
            for col in 0..FANOUT {
                self.set_feat(row + by, col, self.feat(row, col));
            }
        }
    }

    /// Move `rows` full-width rows starting at `from` up to row 0.
    fn rows_shift_up(&self, from: usize, rows: usize) {
        for row in 0..rows {
            for col in 0..FANOUT {
                self.set_feat(row, col, self.feat(from + row, col));
            }
        }
    }

    /// Push the prefix back into the feature rows, leaving every
    /// `K::FEATURE_LEN` row populated from byte 0 of each separator.
    fn memory_expand(&self) {
        let plen = self.prefix_len();
        if plen == 0 {
            return;
        }
        self.rows_shift_down(plen, K::FEATURE_LEN - plen);
        for row in 0..plen {
            let b = self.prefix_byte(row);
            for col in 0..FANOUT {
                self.set_feat(row, col, b);
            }
        }
        self.plen.store(0, RELAXED);
    }

    /// Re-derive the longest common prefix from fully expanded rows.
    fn memory_shrink(&self) {
        let knum = self.key_count();
        if knum == 0 {
            self.plen.store(0, RELAXED);
            return;
        }
        let mut pid = 0;
        while pid < K::FEATURE_LEN {
            let b = self.feat(pid, 0);
            self.prefix[pid].store(b, RELAXED);
            if b != self.feat(pid, knum - 1) {
                break;
            }
            pid += 1;
        }
        let pid = pid.min(K::FEATURE_LEN);
        self.plen.store(pid, RELAXED);
        if pid > 0 {
            self.rows_shift_up(pid, K::FEATURE_LEN - pid);
        }
    }

    /// Insert separator `mid` at `index` into the feature table. `knum` is
    /// not bumped here; the caller owns the count.
    fn key_insert(&self, mid: &K::Route, index: usize) {
        let knum = self.key_count();
        if knum == 0 {
            for pid in 0..K::FEATURE_LEN {
                self.prefix[pid].store(mid.byte(pid), RELAXED);
            }
            self.plen.store(K::FEATURE_LEN, RELAXED);
            return;
        }

        let plen = self.prefix_len();
        assert!(index <= knum, "separator insert out of range");
        for rid in 0..K::FEATURE_LEN - plen {
            self.row_open(rid, index, knum - index, mid.byte(rid + plen));
        }

        // A separator inserted at either border can disagree with the
        // prefix; interior inserts are bounded by conforming neighbors.
        if index == 0 || index == knum {
            let mut pid = 0;
            while pid < plen {
                if self.prefix_byte(pid) != mid.byte(pid) {
                    break;
                }
                pid += 1;
            }
            if pid < plen {
                // Prefix reduction: the lost bytes become feature rows.
                let drop = plen - pid;
                self.rows_shift_down(drop, K::FEATURE_LEN - plen);
                assert!(knum + 1 <= FANOUT, "key count out of range");
                for rid in 0..drop {
                    let b = self.prefix_byte(pid + rid);
                    for col in 0..knum + 1 {
                        self.set_feat(rid, col, b);
                    }
                    self.set_feat(rid, index, mid.byte(rid + pid));
                }
                self.plen.store(pid, RELAXED);
            }
        }
    }

    /// Remove the separator at `index` (not the last one) from the
    /// feature table. `knum` is not touched here.
    fn key_remove(&self, index: usize) {
        let knum = self.key_count();
        let plen = self.prefix_len();
        assert!(knum >= 2 && index < knum - 1, "separator remove out of range");
        for rid in 0..K::FEATURE_LEN - plen {
            self.row_close(rid, index, knum - index - 1);
        }

        if index == 0 {
            // The old least separator bounded the prefix; it may extend
            // now.
            let live = knum - 1;
            let mut pid = 0;
            while pid < K::FEATURE_LEN - plen {
                if self.feat(pid, 0) != self.feat(pid, live - 1) {
                    break;
                }
                self.prefix[plen + pid].store(self.feat(pid, 0), RELAXED);
                pid += 1;
            }
            if pid > 0 {
                self.rows_shift_up(pid, K::FEATURE_LEN - plen - pid);
                self.plen.store(plen + pid, RELAXED);
            }
        }
    }

    /// Fold newly-common leading feature rows into the prefix after a
    /// border removal. `knum` must already hold the new count.
    fn border_extension(&self) {
        let knum = self.key_count();
        assert!(knum >= 1, "border extension on an empty node");
        let plen = self.prefix_len();
        let mut pid = 0;
        while pid < K::FEATURE_LEN - plen {
            if self.feat(pid, 0) != self.feat(pid, knum - 1) {
                break;
            }
            self.prefix[plen + pid].store(self.feat(pid, 0), RELAXED);
            pid += 1;
        }
        if pid > 0 {
            self.rows_shift_up(pid, K::FEATURE_LEN - plen - pid);
            self.plen.store(plen + pid, RELAXED);
        }
    }

    /// Materialize the full separator stored at `col`.
    pub(crate) fn separator_route(&self, col: usize) -> K::Route {
        if K::ANCHORED {
            return K::Route::from_bytes(self.anchors().anchor(col));
        }
        let plen = self.prefix_len();
        let mut buf = [0u8; MAX_FEATURE_LEN];
        for (rid, slot) in buf.iter_mut().enumerate().take(K::FEATURE_LEN) {
            *slot = if rid < plen {
                self.prefix_byte(rid)
            } else {
                self.feat(rid - plen, col)
            };
        }
        K::Route::from_bytes(&buf[..K::FEATURE_LEN])
    }

    // ========================================================================
    //  Anchor maintenance (latch required, anchored keys only)
    // ========================================================================

    /// Guarantee `extra` free bytes, rebuilding (and epoch-retiring) the
    /// extent if it is full or fragmented. `live` slots survive a rebuild.
    fn anchor_ensure_room(&self, live: usize, extra: usize, guard: &Guard<'_>) {
        let extent = self.anchors();
        if extent.room() >= extra && !extent.wants_compaction() {
            return;
        }
        let fresh = Box::into_raw(extent.rebuild(live, extra));
        let old = self.anchors.swap(fresh, WRITE_ORD);
        // SAFETY: the old extent is unreachable from this node; straggling
        // frame readers hold guards opened before this call.
        unsafe { guard.retire_extent(old) };
    }

    /// Total anchor bytes held by `other`'s slots `[0, n)`.
    fn anchor_bytes_of(other: &Self, n: usize) -> usize {
        (0..n).map(|slot| other.anchors().anchor(slot).len()).sum()
    }

    // ========================================================================
    //  Structural modification (latch required)
    // ========================================================================

    /// Thread a freshly split child into this node.
    ///
    /// `rchild` is the new right node produced by splitting `lchild`;
    /// `mid`, the promoted separator, resolves to slot `index` here. If
    /// this node is full it splits in turn: the returned node is the new
    /// right sibling and `mid` is rewritten to the separator to promote
    /// next.
    pub(crate) fn insert(
        &self,
        lchild: *mut u8,
        rchild: *mut u8,
        mid: &mut K::Route,
        index: usize,
        guard: &Guard<'_>,
    ) -> Option<*mut Self> {
        self.control.update_version();
        let knum = self.key_count();
        assert!(!lchild.is_null() && !rchild.is_null(), "null child");
        assert!(index <= knum, "separator insert out of range");

        if knum < FANOUT {
            if K::ANCHORED {
                self.anchor_ensure_room(knum, mid.as_bytes().len(), guard);
                self.anchors().slot_insert(index, knum);
                self.anchors().store(index, mid.as_bytes());
            }
            self.key_insert(mid, index);
            if index != knum {
                for i in (index + 1..knum).rev() {
                    self.set_child(i + 1, self.child(i));
                }
                self.set_child(index + 1, rchild);
            } else {
                // Rightmost node (or brand-new root): the split child was
                // the trailing child.
                self.set_child(index, lchild);
                self.next.store(rchild, WRITE_ORD);
            }
            self.knum.store(knum + 1, RELAXED);
            None
        } else {
            Some(self.split(lchild, rchild, mid, index, guard))
        }
    }

    /// Split a full node around an insertion at `index`. Returns the new
    /// right node; `mid` is rewritten to the separator to promote.
    fn split(
        &self,
        lchild: *mut u8,
        rchild: *mut u8,
        mid: &mut K::Route,
        index: usize,
        guard: &Guard<'_>,
    ) -> *mut Self {
        const HALF: usize = FANOUT / 2;

        let rnode_box = Self::alloc();
        let rnode: &Self = &rnode_box;

        // Link before filling: this node stays latched, so no frame can
        // cross the link until the split is complete.
        rnode.next.store(self.next_raw(), WRITE_ORD);
        if !self.control.has_sibling() {
            self.control.set_sibling();
        } else {
            rnode.control.set_sibling();
        }

        let midx;
        if index == FANOUT {
            // Rightmost full node, key above every separator: the new
            // right node starts with just the promoted pair.
            for pid in 0..K::FEATURE_LEN {
                rnode.prefix[pid].store(mid.byte(pid), RELAXED);
            }
            rnode.plen.store(K::FEATURE_LEN, RELAXED);
            rnode.set_child(0, lchild);
            rnode.next.store(rchild, WRITE_ORD);
            rnode.knum.store(1, RELAXED);
            if K::ANCHORED {
                rnode.anchor_ensure_room(0, mid.as_bytes().len(), guard);
                rnode.anchors().store(0, mid.as_bytes());
            }
            midx = FANOUT - 1;
        } else if index < HALF {
            self.memory_expand();
            // Upper half moves out, then the new separator squeezes into
            // the lower half.
            for rid in 0..K::FEATURE_LEN {
                for col in 0..HALF {
                    rnode.set_feat(rid, col, self.feat(rid, HALF + col));
                }
            }
            for col in 0..HALF {
                rnode.set_child(col, self.child(HALF + col));
            }
            if K::ANCHORED {
                let moved = Self::anchor_bytes_of(self, FANOUT) - Self::anchor_bytes_of(self, HALF);
                rnode.anchor_ensure_room(0, moved, guard);
                for col in 0..HALF {
                    rnode.anchors().store(col, self.anchors().anchor(HALF + col));
                }
                for col in HALF..FANOUT {
                    self.anchors().release(col);
                }
            }

            for rid in 0..K::FEATURE_LEN {
                self.row_open(rid, index, HALF - index, mid.byte(rid));
            }
            for i in (index..HALF).rev() {
                self.set_child(i + 1, self.child(i));
            }
            self.set_child(index + 1, rchild);
            if K::ANCHORED {
                self.anchor_ensure_room(HALF, mid.as_bytes().len(), guard);
                self.anchors().slot_insert(index, HALF);
                self.anchors().store(index, mid.as_bytes());
            }

            self.knum.store(HALF + 1, RELAXED);
            rnode.knum.store(HALF, RELAXED);
            self.memory_shrink();
            rnode.memory_shrink();
            midx = HALF;
        } else {
            self.memory_expand();
            // The new separator lands in the right node.
            let at = index - HALF;
            for rid in 0..K::FEATURE_LEN {
                for col in 0..at {
                    rnode.set_feat(rid, col, self.feat(rid, HALF + col));
                }
                rnode.set_feat(rid, at, mid.byte(rid));
                for col in index..FANOUT {
                    rnode.set_feat(rid, at + 1 + col - index, self.feat(rid, col));
                }
            }
            for col in 0..=at {
                rnode.set_child(col, self.child(HALF + col));
            }
            rnode.set_child(at + 1, rchild);
            for col in index + 1..FANOUT {
                rnode.set_child(at + 2 + col - index - 1, self.child(col));
            }
            if K::ANCHORED {
                let moved = Self::anchor_bytes_of(self, FANOUT) - Self::anchor_bytes_of(self, HALF)
                    + mid.as_bytes().len();
                rnode.anchor_ensure_room(0, moved, guard);
                for col in 0..at {
                    rnode.anchors().store(col, self.anchors().anchor(HALF + col));
                }
                rnode.anchors().store(at, mid.as_bytes());
                for col in index..FANOUT {
                    rnode
                        .anchors()
                        .store(at + 1 + col - index, self.anchors().anchor(col));
                }
                for col in HALF..FANOUT {
                    self.anchors().release(col);
                }
            }

            self.knum.store(HALF, RELAXED);
            rnode.knum.store(HALF + 1, RELAXED);
            self.memory_shrink();
            rnode.memory_shrink();
            midx = HALF - 1;
        }

        let rnode = Box::into_raw(rnode_box);
        // Publish the link; readers blocked on the latch will cross it
        // once we unlatch.
        self.next.store(rnode.cast(), WRITE_ORD);

        *mid = self.separator_route(midx);
        rnode
    }

    /// Remove the separator at `index` after the child beyond it was
    /// merged away. May merge this node into its right sibling in turn
    /// (returned for retirement) or request a separator repair in the
    /// parent (`up`).
    pub(crate) fn remove(
        &self,
        mid: &mut K::Route,
        up: &mut bool,
        index: usize,
        guard: &Guard<'_>,
    ) -> Option<*mut Self> {
        self.control.update_version();
        *up = false;
        let knum = self.key_count();
        assert!(index < knum, "separator remove out of range");

        if index < knum - 1 {
            self.key_remove(index);
            if K::ANCHORED {
                self.anchors().slot_remove(index, knum);
            }
            for i in index + 1..knum - 1 {
                self.set_child(i, self.child(i + 1));
            }
            self.knum.store(knum - 1, RELAXED);
            return self.merge(mid, guard);
        }
        self.border_remove(mid, up, index, guard)
    }

    /// Try to absorb the right sibling after an interior removal. Returns
    /// the absorbed node, already unlinked and back-pointed, for
    /// retirement by the caller.
    fn merge(&self, mid: &mut K::Route, guard: &Guard<'_>) -> Option<*mut Self> {
        if !self.control.has_sibling() {
            return None;
        }
        let rnode_ptr = self.next_raw().cast::<Self>();
        // SAFETY: a sibling pointer stays dereferenceable while our guard
        // is held; unlinking rewires it to a back-pointer, never frees it
        // early.
        let rnode = unsafe { &*rnode_ptr };
        let knum = self.key_count();
        assert!(knum >= 1, "merge from an empty node");

        // Unlatched peek; re-checked below.
        if knum + rnode.key_count() > MERGE_LIMIT {
            return None;
        }

        rnode.control.latch_exclusive();
        let rnkey = rnode.key_count();
        let mut merged = None;
        if knum + rnkey <= MERGE_LIMIT || rnkey == 0 {
            // The separator between the two nodes is our own high
            // separator; the parent removes it next.
            *mid = self.separator_route(knum - 1);

            self.memory_expand();
            rnode.memory_expand();
            for rid in 0..K::FEATURE_LEN {
                for col in 0..rnkey {
                    self.set_feat(rid, knum + col, rnode.feat(rid, col));
                }
            }
            for col in 0..rnkey {
                self.set_child(knum + col, rnode.child(col));
            }
            if K::ANCHORED {
                let incoming = Self::anchor_bytes_of(rnode, rnkey);
                self.anchor_ensure_room(knum, incoming, guard);
                for col in 0..rnkey {
                    self.anchors().store(knum + col, rnode.anchors().anchor(col));
                }
            }
            self.knum.store(knum + rnkey, RELAXED);
            rnode.knum.store(0, RELAXED);
            self.memory_shrink();

            self.next.store(rnode.next_raw(), WRITE_ORD);
            rnode.next.store((self as *const Self as *mut Self).cast(), WRITE_ORD);
            if !rnode.control.has_sibling() {
                self.control.clear_sibling();
            }
            rnode.control.set_delete();
            rnode.control.update_version();
            merged = Some(rnode_ptr);
        }
        rnode.control.unlatch_exclusive();
        merged
    }

    /// Remove the last separator. Either shrink in place (rightmost
    /// node), merge into the right sibling, or relocate the trailing
    /// child into the sibling and ask the parent to repair our separator.
    fn border_remove(
        &self,
        mid: &mut K::Route,
        up: &mut bool,
        index: usize,
        guard: &Guard<'_>,
    ) -> Option<*mut Self> {
        if !self.control.has_sibling() {
            // Rightmost node of its level: the merged child becomes the
            // trailing child.
            self.next.store(self.child(index), WRITE_ORD);
            if K::ANCHORED {
                self.anchors().release(index);
            }
            self.knum.store(index, RELAXED);
            if index == 0 {
                self.plen.store(0, RELAXED);
            } else {
                self.border_extension();
            }
            return None;
        }

        let rnode_ptr = self.next_raw().cast::<Self>();
        // SAFETY: as in `merge`, sibling pointers outlive our guard.
        let rnode = unsafe { &*rnode_ptr };
        rnode.control.latch_exclusive();
        rnode.control.update_version();
        let rnkey = rnode.key_count();

        let merged = if index + rnkey <= MERGE_LIMIT || index == 0 || rnkey <= 1 {
            // Border remove already names the separator to delete above;
            // `mid` stays as passed in.
            self.memory_expand();
            rnode.memory_expand();
            if K::ANCHORED {
                self.anchors().release(index);
                let incoming = Self::anchor_bytes_of(rnode, rnkey);
                self.anchor_ensure_room(index, incoming, guard);
            }
            for rid in 0..K::FEATURE_LEN {
                for col in 0..rnkey {
                    self.set_feat(rid, index + col, rnode.feat(rid, col));
                }
            }
            if K::ANCHORED {
                for col in 0..rnkey {
                    self.anchors().store(index + col, rnode.anchors().anchor(col));
                }
            }
            // The sibling's first child was absorbed below; skip it.
            for col in 1..rnkey {
                self.set_child(index + col, rnode.child(col));
            }
            self.knum.store(index + rnkey, RELAXED);
            self.memory_shrink();

            if rnkey != 0 {
                self.next.store(rnode.next_raw(), WRITE_ORD);
            } else {
                // Empty rightmost sibling: its trailing child was the one
                // merged away; ours takes over.
                self.next.store(self.child(index), WRITE_ORD);
            }
            rnode
                .next
                .store((self as *const Self as *mut Self).cast(), WRITE_ORD);
            if !rnode.control.has_sibling() {
                self.control.clear_sibling();
            }
            rnode.control.set_delete();
            Some(rnode_ptr)
        } else {
            // No merge: relocate the trailing child into the sibling and
            // have the parent overwrite our separator with the new last
            // one.
            *up = true;
            *mid = self.separator_route(index - 1);
            rnode.set_child(0, self.child(index));
            if K::ANCHORED {
                self.anchors().release(index);
            }
            self.knum.store(index, RELAXED);
            self.border_extension();
            None
        };

        rnode.control.unlatch_exclusive();
        merged
    }

    /// Overwrite the separator at `index` with `mid` (a child's high key
    /// moved left). Returns whether the parent's separator for this node
    /// must change too.
    pub(crate) fn border_update(&self, mid: &K::Route, index: usize, guard: &Guard<'_>) -> bool {
        let knum = self.key_count();
        assert!(index < knum, "separator update out of range");
        self.control.update_version();
        self.memory_expand();
        for rid in 0..K::FEATURE_LEN {
            self.set_feat(rid, index, mid.byte(rid));
        }
        if K::ANCHORED {
            self.anchor_ensure_room(knum, mid.as_bytes().len(), guard);
            self.anchors().release(index);
            self.anchors().store(index, mid.as_bytes());
        }
        self.memory_shrink();

        self.control.has_sibling() && knum - 1 == index
    }

    /// Root shrink: a root with no separators hands its trailing child
    /// back as the new root.
    pub(crate) fn root_remove(&self) -> Option<*mut u8> {
        if self.key_count() == 0 {
            self.control.set_delete();
            Some(self.next_raw())
        } else {
            None
        }
    }

    /// Whether the separators are in strictly ascending order, decided
    /// with whole-row comparisons: lane `i` compares slot `i` against
    /// slot `i + 1`, and a pair is ordered once some leading-byte row
    /// proves it. Quiescent use only (tests, structure validation).
    pub(crate) fn check_sorted(&self) -> bool {
        let knum = self.key_count();
        if knum < 2 {
            return true;
        }
        if K::ANCHORED {
            let extent = self.anchors();
            return (1..knum).all(|i| extent.anchor(i - 1) < extent.anchor(i));
        }

        let plen = self.prefix_len();
        let pairs = Self::live_mask(knum - 1);
        let mut undecided = pairs;
        let mut proven = 0u64;
        for rid in 0..K::FEATURE_LEN - plen {
            let mut shifted = [0u8; FANOUT];
            for (col, slot) in shifted.iter_mut().enumerate().take(FANOUT - 1) {
                *slot = self.feat(rid, col + 1);
            }
            // SAFETY: both operands are FANOUT bytes; lanes at or above
            // `knum - 1` are masked off.
            let (lt, eq) = unsafe {
                (
                    vcmplt_u8x64(self.row_ptr(rid), shifted.as_ptr()),
                    vcmpeq_u8x64(self.row_ptr(rid), shifted.as_ptr()),
                )
            };
            proven |= lt & undecided;
            undecided &= eq;
            if undecided == 0 {
                break;
            }
        }
        // Pairs equal on every feature byte are duplicates: out of order.
        proven == pairs
    }
}

impl<K: Key> Drop for InnerNode<K> {
    fn drop(&mut self) {
        let extent = self.anchors.load(RELAXED);
        if !extent.is_null() {
            // SAFETY: the extent is exclusively owned by this node and no
            // reader can hold it once the node itself is reclaimed.
            unsafe { drop(Box::from_raw(extent)) };
        }
    }
}

impl<K: Key> std::fmt::Debug for InnerNode<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerNode")
            .field("control", &self.control)
            .field("knum", &self.key_count())
            .field("plen", &self.prefix_len())
            .finish_non_exhaustive()
    }
}
