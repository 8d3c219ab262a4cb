//! Leaf node.
//!
//! A leaf stores up to [`FANOUT`] key-value records in *unsorted* slots: a
//! presence bitmap says which slots are live, a 1-byte fingerprint per
//! slot filters candidates before any full key compare, and each slot is
//! an atomic pointer to its record. Point reads and updates never sort or
//! shift anything; scans sort the slots in place under the latch and set
//! the `ordered` control bit until the next upsert or remove disturbs it.
//!
//! The high key is the largest live key the leaf is responsible for; a
//! key above it belongs to the right sibling, and
//! [`LeafNode::to_sibling`] walks readers rightward across in-flight
//! splits (or backward out of a deleted leaf).
//!
//! Slot discipline against concurrent updaters: mutation paths that move
//! a record out of a slot do so with `swap`, so a racing update that CAS'd
//! a fresh record in is either observed (the swap returns it) or fails
//! its CAS and retries through the outer optimistic frame.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8};

use crate::config::{FANOUT, MERGE_LIMIT, NODE_ALIGN};
use crate::control::Control;
use crate::epoch::Guard;
use crate::key::{KVPair, Key};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::simd::cmpeq_u8x64;

/// Outcome of a latched upsert.
pub(crate) enum LeafUpsert<K: Key, V> {
    /// The key existed; the displaced record is returned.
    Replaced(*mut KVPair<K, V>),
    /// Fresh key, absorbed without splitting.
    Inserted,
    /// Fresh key forced a split; `rnode` is the new right sibling and
    /// `mid` the separator to promote (the left leaf's new high key).
    Split {
        rnode: *mut LeafNode<K, V>,
        mid: K::Route,
    },
}

/// Outcome of a latched remove.
pub(crate) struct LeafRemove<K: Key, V> {
    /// The removed record, or null if the key was absent.
    pub old: *mut KVPair<K, V>,
    /// Right sibling absorbed during the removal: the unlinked node plus
    /// the separator the parent must drop.
    pub merged: Option<(*mut LeafNode<K, V>, K::Route)>,
}

/// Result of a bound probe for scans.
pub(crate) enum LeafBound<K: Key, V> {
    /// Bounding record and its ordinal position.
    At(*mut KVPair<K, V>, usize),
    /// Every live key is below the probe.
    End,
    /// A concurrent writer got in the way; restart from the frame.
    Inconsistent,
}

/// Result of a framed bound probe, with the sibling hand-over folded in.
pub(crate) enum LeafSeek<K: Key, V> {
    /// Bounding record, its ordinal, and the frame version it was read
    /// under.
    Found(*mut KVPair<K, V>, usize, u64),
    /// Every live key here is below the probe; the successor, if any,
    /// lives along the sibling chain.
    End(u64),
    /// The probe belongs further along the chain.
    Jump(*mut LeafNode<K, V>),
}

/// Leaf node. The control word is the first field so a type-erased node
/// pointer can be inspected before its type is known.
#[repr(C, align(64))]
pub(crate) struct LeafNode<K: Key, V> {
    control: Control,
    /// Presence bitmap, one bit per slot.
    bitmap: AtomicU64,
    /// Largest live key (boxed, swapped wholesale). Meaningful only while
    /// the sibling flag is set.
    high_key: AtomicPtr<K>,
    /// Right sibling, or (deleted) the surviving left neighbor.
    sibling: AtomicPtr<LeafNode<K, V>>,
    /// Per-slot fingerprints.
    tags: [AtomicU8; FANOUT],
    /// Per-slot record pointers.
    kvs: [AtomicPtr<KVPair<K, V>>; FANOUT],
}

const _: () = assert!(NODE_ALIGN == 64);

impl<K: Key, V> LeafNode<K, V> {
    pub(crate) fn alloc() -> Box<Self> {
        Box::new(Self {
            control: Control::new(true),
            bitmap: AtomicU64::new(0),
            high_key: AtomicPtr::new(ptr::null_mut()),
            sibling: AtomicPtr::new(ptr::null_mut()),
            tags: std::array::from_fn(|_| AtomicU8::new(0)),
            kvs: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
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
        self.bitmap.load(RELAXED).count_ones() as usize
    }

    /// Next stop along the chain: the right sibling, or — for a deleted
    /// leaf — the surviving left neighbor its keys moved into.
    pub(crate) fn sibling_ptr(&self) -> *mut Self {
        if self.control.has_sibling() || self.control.deleted() {
            self.sibling.load(READ_ORD)
        } else {
            ptr::null_mut()
        }
    }

    /// Right sibling only; null for the rightmost (or a deleted) leaf.
    /// This is the edge the level walks follow.
    pub(crate) fn sibling_forward(&self) -> *mut Self {
        if self.control.has_sibling() && !self.control.deleted() {
            self.sibling.load(READ_ORD)
        } else {
            ptr::null_mut()
        }
    }

    #[inline]
    fn slot(&self, idx: usize) -> *mut KVPair<K, V> {
        self.kvs[idx].load(READ_ORD)
    }

    #[inline]
    fn tag(&self, idx: usize) -> u8 {
        self.tags[idx].load(RELAXED)
    }

    #[inline]
    fn set_tag(&self, idx: usize, t: u8) {
        self.tags[idx].store(t, RELAXED);
    }

    /// Live slots whose fingerprint matches `tag`.
    #[inline]
    fn candidates(&self, tag: u8) -> u64 {
        // AtomicU8 has the same in-memory representation as u8; a torn
        // view only produces false candidates, which the key compare
        // rejects.
        let tags_ptr = self.tags.as_ptr().cast::<u8>();
        // SAFETY: the tag array is FANOUT bytes long.
        self.bitmap.load(READ_ORD) & unsafe { cmpeq_u8x64(tags_ptr, tag) }
    }

    /// Routing keys of every live record. Quiescent use only (tests,
    /// structure validation).
    pub(crate) fn live_routes(&self) -> Vec<K::Route> {
        let mut routes = Vec::with_capacity(self.key_count());
        let mut mask = self.bitmap.load(READ_ORD);
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            let kv = self.slot(idx);
            if !kv.is_null() {
                // SAFETY: quiescent tree; slot records are live.
                routes.push(unsafe { (*kv).key.route() });
            }
            mask &= !(1 << idx);
        }
        routes
    }

    /// The high key's routing form, if the leaf has one.
    pub(crate) fn high_key_route(&self) -> Option<K::Route> {
        if !self.control.has_sibling() {
            return None;
        }
        self.high_key_ref().map(Key::route)
    }

    #[inline]
    fn high_key_ref(&self) -> Option<&K> {
        let p = self.high_key.load(READ_ORD);
        // SAFETY: high-key boxes are swapped, never mutated, and retired
        // through the epoch; any loaded pointer outlives the caller's
        // guard.
        unsafe { p.as_ref() }
    }

    // ========================================================================
    //  B-link hand-over
    // ========================================================================

    /// Whether `key` belongs further along the sibling chain, and where.
    ///
    /// A deleted leaf always hands over to its back-pointer so stragglers
    /// rejoin the tree at the surviving left neighbor.
    pub(crate) fn to_sibling(&self, key: &K) -> Option<*mut Self> {
        if self.control.deleted() {
            let next = self.sibling.load(READ_ORD);
            assert!(!next.is_null(), "deleted leaf lost its back-pointer");
            return Some(next);
        }
        if self.control.has_sibling() {
            if let Some(high) = self.high_key_ref() {
                if high < key {
                    let next = self.sibling.load(READ_ORD);
                    assert!(!next.is_null(), "sibling flag without a sibling");
                    return Some(next);
                }
            }
        }
        None
    }

    // ========================================================================
    //  Point operations
    // ========================================================================

    /// Find `key`. Runs inside an optimistic frame at the tree level and
    /// may race with every other operation; a null slot just means some
    /// writer is mid-flight and this candidate is gone.
    pub(crate) fn lookup(&self, key: &K) -> *mut KVPair<K, V> {
        let mut mask = self.candidates(key.fingerprint());
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            let kv = self.slot(idx);
            if !kv.is_null() {
                // SAFETY: slot pointers are valid records until
                // epoch-reclaimed, which the caller's guard forbids.
                if unsafe { &(*kv).key } == key {
                    return kv;
                }
            }
            mask &= !(1 << idx);
        }
        ptr::null_mut()
    }

    /// Swap `new_kv` into the slot currently holding its key. Returns the
    /// displaced record, or null if the key is not here (the caller
    /// revalidates its frame and retries or gives up).
    pub(crate) fn update(&self, new_kv: *mut KVPair<K, V>) -> *mut KVPair<K, V> {
        // SAFETY: the caller owns `new_kv` until it is published.
        let new_key = unsafe { &(*new_kv).key };
        let mut mask = self.candidates(new_key.fingerprint());
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            let mut old = self.slot(idx);
            while !old.is_null() {
                // SAFETY: as in `lookup`.
                if unsafe { &(*old).key } != new_key {
                    break;
                }
                match self.kvs[idx].compare_exchange(old, new_kv, CAS_SUCCESS, CAS_FAILURE) {
                    Ok(_) => return old,
                    // Another update raced; chase the fresh record.
                    Err(cur) => old = cur,
                }
            }
            mask &= !(1 << idx);
        }
        ptr::null_mut()
    }

    /// Insert-or-replace under the latch. On overflow the leaf splits and
    /// the caller promotes the returned separator.
    pub(crate) fn upsert(&self, kv: *mut KVPair<K, V>, _guard: &Guard<'_>) -> LeafUpsert<K, V> {
        // SAFETY: the caller owns `kv` until it is published.
        let key = unsafe { &(*kv).key };
        let tag = key.fingerprint();

        let mut mask = self.candidates(tag);
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            let old = self.slot(idx);
            assert!(!old.is_null(), "live slot holds no record");
            // SAFETY: as in `lookup`.
            if unsafe { &(*old).key } == key {
                // Exchange, not store: a racing update may swap the slot
                // between our load and here, and its record must not leak.
                let latest = self.kvs[idx].swap(kv, CAS_SUCCESS);
                return LeafUpsert::Replaced(latest);
            }
            mask &= !(1 << idx);
        }

        // The key goes into this leaf (or its brand-new sibling) for
        // sure: publish the intent before touching slots.
        self.control.update_version();
        if self.control.ordered() {
            self.control.clear_ordered();
        }

        let bitmap = self.bitmap.load(RELAXED);
        let free = (!bitmap).trailing_zeros() as usize;
        if free < FANOUT {
            self.kvs[free].store(kv, WRITE_ORD);
            self.set_tag(free, tag);
            self.bitmap.fetch_or(1 << free, WRITE_ORD);
            return LeafUpsert::Inserted;
        }

        // Full: split. Collect and sort the live records; the collected
        // pointers may be superseded by racing updates, but a replacement
        // carries the same key, so the order stands.
        let mut order: Vec<(*mut KVPair<K, V>, usize)> = (0..FANOUT)
            .map(|idx| {
                let p = self.slot(idx);
                assert!(!p.is_null(), "live slot holds no record");
                (p, idx)
            })
            .collect();
        // SAFETY: records stay readable while our guard is held.
        order.sort_unstable_by(|a, b| unsafe { (*a.0).key.cmp(&(*b.0).key) });

        let rnode_box = Self::alloc();
        let rnode_ptr = Box::into_raw(rnode_box);
        // SAFETY: freshly allocated, unshared until linked below.
        let rnode = unsafe { &*rnode_ptr };

        // SAFETY: sorted record pointers, readable under the guard.
        let max_key = unsafe { &(*order[FANOUT - 1].0).key };

        let (target, slot_idx, mid);
        if !self.control.has_sibling() && key > max_key {
            // Rightmost leaf, ascending insert: ship only the new key to
            // the fresh sibling. Sequential loads stay packed.
            self.sibling.store(rnode_ptr, WRITE_ORD);
            let high = Box::into_raw(Box::new(max_key.clone()));
            let stale = self.high_key.swap(high, CAS_SUCCESS);
            debug_assert!(stale.is_null());
            self.control.set_sibling();

            target = rnode;
            slot_idx = 0;
            mid = max_key.route();
        } else {
            // Move the upper half of the sort order out.
            let mut moved_mask = 0u64;
            let mut last_freed = 0usize;
            for (rid, &(_, lid)) in order[FANOUT / 2..].iter().enumerate() {
                moved_mask |= 1 << lid;
                rnode.set_tag(rid, self.tag(lid));
                // Exchange interacts correctly with racing updates: the
                // freshest record moves, and a CAS loser retries via its
                // frame and finds the slot null.
                let moving = self.kvs[lid].swap(ptr::null_mut(), CAS_SUCCESS);
                rnode.kvs[rid].store(moving, WRITE_ORD);
                last_freed = lid;
            }
            rnode
                .bitmap
                .store((1u64 << (FANOUT / 2)) - 1, WRITE_ORD);
            rnode.sibling.store(self.sibling.load(READ_ORD), WRITE_ORD);
            rnode
                .high_key
                .store(self.high_key.swap(ptr::null_mut(), CAS_SUCCESS), WRITE_ORD);

            assert!(moved_mask.count_ones() as usize == FANOUT / 2, "split lost slots");
            self.bitmap.fetch_and(!moved_mask, WRITE_ORD);
            self.sibling.store(rnode_ptr, WRITE_ORD);
            // SAFETY: as above; the median record is still readable.
            let median = unsafe { &(*order[FANOUT / 2 - 1].0).key };
            self.high_key
                .store(Box::into_raw(Box::new(median.clone())), WRITE_ORD);

            if !self.control.has_sibling() {
                self.control.set_sibling();
            } else {
                rnode.control.set_sibling();
            }

            if key > median {
                target = rnode;
                slot_idx = FANOUT / 2;
            } else {
                target = self;
                slot_idx = last_freed;
            }
            mid = median.route();
        }

        assert!(
            target.bitmap.load(RELAXED) & (1 << slot_idx) == 0,
            "split insert into a live slot"
        );
        target.kvs[slot_idx].store(kv, WRITE_ORD);
        target.set_tag(slot_idx, tag);
        target.bitmap.fetch_or(1 << slot_idx, WRITE_ORD);

        LeafUpsert::Split {
            rnode: rnode_ptr,
            mid,
        }
    }

    /// Remove `key` under the latch, merging with the right sibling when
    /// both fit the merge threshold.
    pub(crate) fn remove(&self, key: &K, guard: &Guard<'_>) -> LeafRemove<K, V> {
        let mut mask = self.candidates(key.fingerprint());
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            let kv = self.slot(idx);
            assert!(!kv.is_null(), "live slot holds no record");
            // SAFETY: as in `lookup`.
            if unsafe { &(*kv).key } == key {
                self.control.update_version();
                self.bitmap.fetch_and(!(1 << idx), WRITE_ORD);
                // Exchange: fetch whatever a racing update left last.
                let latest = self.kvs[idx].swap(ptr::null_mut(), CAS_SUCCESS);
                let merged = self.merge(guard);
                if self.control.ordered() {
                    self.control.clear_ordered();
                }
                return LeafRemove {
                    old: latest,
                    merged,
                };
            }
            mask &= !(1 << idx);
        }
        LeafRemove {
            old: ptr::null_mut(),
            merged: None,
        }
    }

    /// Absorb the right sibling if the combined population fits. Returns
    /// the unlinked node and the separator the parent must drop.
    fn merge(&self, guard: &Guard<'_>) -> Option<(*mut Self, K::Route)> {
        if !self.control.has_sibling() {
            return None;
        }
        let rnode_ptr = self.sibling.load(READ_ORD);
        assert!(!rnode_ptr.is_null(), "sibling flag without a sibling");
        // SAFETY: sibling pointers stay dereferenceable while our guard is
        // held; unlinking rewires, never frees early.
        let rnode = unsafe { &*rnode_ptr };

        let lnkey = self.key_count();
        // Unlatched peek; re-checked below. An emptied leaf always merges,
        // whatever the sibling holds.
        if lnkey + rnode.key_count() > MERGE_LIMIT && lnkey != 0 {
            return None;
        }

        rnode.control.latch_exclusive();
        let rnkey = rnode.key_count();
        let mut merged = None;
        if lnkey + rnkey <= MERGE_LIMIT || lnkey == 0 {
            // The separator between the two leaves is our high key; grab
            // it before it is replaced.
            let mid = self
                .high_key_ref()
                .expect("leaf with a sibling has a high key")
                .route();

            let mut mask = rnode.bitmap.load(RELAXED);
            while mask != 0 {
                let ridx = mask.trailing_zeros() as usize;
                let lidx = (!self.bitmap.load(RELAXED)).trailing_zeros() as usize;
                assert!(lidx < FANOUT, "merge into a full leaf");
                self.set_tag(lidx, rnode.tag(ridx));
                let moving = rnode.kvs[ridx].swap(ptr::null_mut(), CAS_SUCCESS);
                self.kvs[lidx].store(moving, WRITE_ORD);
                self.bitmap.fetch_or(1 << lidx, WRITE_ORD);
                mask &= !(1 << ridx);
            }
            rnode.bitmap.store(0, WRITE_ORD);

            // Inherit the sibling's upper bound and unlink it, leaving a
            // back-pointer for stragglers.
            let theirs = rnode.high_key.swap(ptr::null_mut(), CAS_SUCCESS);
            let ours = self.high_key.swap(theirs, CAS_SUCCESS);
            if !ours.is_null() {
                // SAFETY: just unlinked from this leaf; frame readers
                // still holding it opened their guards earlier.
                unsafe { guard.retire_key(ours) };
            }
            self.sibling.store(rnode.sibling.load(READ_ORD), WRITE_ORD);
            rnode
                .sibling
                .store((self as *const Self).cast_mut(), WRITE_ORD);
            if !rnode.control.has_sibling() {
                self.control.clear_sibling();
            }
            rnode.control.set_delete();
            rnode.control.update_version();
            merged = Some((rnode_ptr, mid));
        }
        rnode.control.unlatch_exclusive();
        merged
    }

    // ========================================================================
    //  Scan support
    // ========================================================================

    /// Pack and sort the live records into the low slots. Latch required.
    pub(crate) fn kv_sort(&self) {
        if self.control.ordered() {
            return;
        }

        let mut entries: Vec<(*mut KVPair<K, V>, usize)> = Vec::with_capacity(FANOUT);
        let mut mask = self.bitmap.load(RELAXED);
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            // Exchange tells racing updates to retry through their frame.
            let kv = self.kvs[idx].swap(ptr::null_mut(), CAS_SUCCESS);
            assert!(!kv.is_null(), "live slot holds no record");
            entries.push((kv, idx));
            mask &= !(1 << idx);
        }
        // SAFETY: records stay readable under the caller's guard.
        entries.sort_unstable_by(|a, b| unsafe { (*a.0).key.cmp(&(*b.0).key) });

        let tags: Vec<u8> = entries.iter().map(|&(_, old)| self.tag(old)).collect();
        for (pos, (&(kv, _), &tag)) in entries.iter().zip(tags.iter()).enumerate() {
            self.set_tag(pos, tag);
            self.kvs[pos].store(kv, WRITE_ORD);
        }
        let n = entries.len();
        let packed = if n == FANOUT { u64::MAX } else { (1u64 << n) - 1 };
        self.bitmap.store(packed, WRITE_ORD);

        self.control.set_ordered();
        self.control.update_version();
    }

    /// Locate the first record at-or-above (`upper == false`) or strictly
    /// above (`upper == true`) `key`. Meaningful inside an optimistic
    /// frame on an ordered leaf, or under the latch right after
    /// [`LeafNode::kv_sort`].
    pub(crate) fn bound(&self, key: &K, upper: bool) -> LeafBound<K, V> {
        let nkey = self.key_count();
        if nkey == 0 {
            return LeafBound::End;
        }

        if self.control.ordered() {
            // Packed and sorted: binary search the ordinals.
            let (mut lo, mut hi) = (0usize, nkey);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let kv = self.slot(mid);
                if kv.is_null() {
                    return LeafBound::Inconsistent;
                }
                // SAFETY: as in `lookup`.
                let below = match unsafe { (*kv).key.cmp(key) } {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => upper,
                    std::cmp::Ordering::Greater => false,
                };
                if below {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            if lo >= nkey {
                return LeafBound::End;
            }
            let kv = self.slot(lo);
            if kv.is_null() {
                return LeafBound::Inconsistent;
            }
            return LeafBound::At(kv, lo);
        }

        // Unordered: collect the low slots and verify they are usable; a
        // gap or an out-of-order pair means a writer is (or was) in
        // flight and the caller must sort under the latch instead.
        let mut prev: Option<&K> = None;
        let mut hit: Option<(usize, *mut KVPair<K, V>)> = None;
        for pos in 0..nkey {
            let kv = self.slot(pos);
            if kv.is_null() {
                return LeafBound::Inconsistent;
            }
            // SAFETY: as in `lookup`.
            let k = unsafe { &(*kv).key };
            if prev.is_some_and(|p| p >= k) {
                return LeafBound::Inconsistent;
            }
            prev = Some(k);
            let above = if upper { k > key } else { k >= key };
            if above && hit.is_none() {
                hit = Some((pos, kv));
            }
        }
        match hit {
            Some((pos, kv)) => LeafBound::At(kv, pos),
            None => LeafBound::End,
        }
    }

    /// Record at ordinal `pos`, for ordered leaves.
    pub(crate) fn access_at(&self, pos: usize) -> *mut KVPair<K, V> {
        if pos >= FANOUT {
            return ptr::null_mut();
        }
        if self.bitmap.load(READ_ORD) & (1 << pos) == 0 {
            return ptr::null_mut();
        }
        self.slot(pos)
    }

    /// Framed bound probe for scans: hands over to the sibling when the
    /// probe lies beyond this leaf, retries torn frames, and falls back
    /// to an exclusive sort when the slot order is unusable.
    pub(crate) fn seek_bound(&self, key: &K, upper: bool) -> LeafSeek<K, V> {
        loop {
            let version = self.control.begin_read();
            if let Some(next) = self.to_sibling(key) {
                return LeafSeek::Jump(next);
            }
            match self.bound(key, upper) {
                LeafBound::At(kv, pos) => {
                    if self.control.end_read(version) {
                        return LeafSeek::Found(kv, pos, version);
                    }
                }
                LeafBound::End => {
                    if self.control.end_read(version) {
                        return LeafSeek::End(version);
                    }
                }
                LeafBound::Inconsistent => {
                    self.control.latch_exclusive();
                    self.kv_sort();
                    let found = self.bound(key, upper);
                    let version = self.control.load_version();
                    self.control.unlatch_exclusive();
                    return match found {
                        LeafBound::At(kv, pos) => LeafSeek::Found(kv, pos, version),
                        LeafBound::End => LeafSeek::End(version),
                        LeafBound::Inconsistent => unreachable!("latched bound cannot race"),
                    };
                }
            }
        }
    }

    /// Advance a scan to ordinal `pos` under `version`, sorting the leaf
    /// first if its order is unknown.
    ///
    /// `last` is the record the scan just yielded (null when starting at
    /// the leaf's first ordinal); after a sort invalidates the ordinals,
    /// the successor of `last`'s key is located instead, so nothing is
    /// skipped or repeated.
    pub(crate) fn advance_access(
        &self,
        last: *mut KVPair<K, V>,
        pos: usize,
        version: u64,
    ) -> (*mut KVPair<K, V>, usize, u64) {
        if self.control.ordered() {
            let next = self.access_at(pos);
            if self.control.end_read(version) {
                return (next, pos, version);
            }
        }

        // Unordered or changed underneath the scan: sort and re-locate.
        self.control.latch_exclusive();
        self.kv_sort();
        let (next, pos) = if last.is_null() {
            (self.access_at(pos), pos)
        } else {
            // SAFETY: `last` stays readable under the caller's guard even
            // if it was removed meanwhile.
            match self.bound(unsafe { &(*last).key }, true) {
                LeafBound::At(kv, p) => (kv, p),
                LeafBound::End => (ptr::null_mut(), self.key_count()),
                LeafBound::Inconsistent => unreachable!("latched bound cannot race"),
            }
        };
        let version = self.control.load_version();
        self.control.unlatch_exclusive();
        (next, pos, version)
    }
}

impl<K: Key, V> Drop for LeafNode<K, V> {
    fn drop(&mut self) {
        let mut mask = *self.bitmap.get_mut();
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            let kv = *self.kvs[idx].get_mut();
            if !kv.is_null() {
                // SAFETY: live records are exclusively owned by their leaf
                // once no guard can reach them.
                unsafe { drop(Box::from_raw(kv)) };
            }
            mask &= !(1 << idx);
        }
        let high = *self.high_key.get_mut();
        if !high.is_null() {
            // SAFETY: the high-key box is exclusively owned, as above.
            unsafe { drop(Box::from_raw(high)) };
        }
    }
}

impl<K: Key, V> std::fmt::Debug for LeafNode<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafNode")
            .field("control", &self.control)
            .field("keys", &self.key_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;

    fn pair(k: u64, v: u64) -> *mut KVPair<u64, u64> {
        Box::into_raw(KVPair::boxed(k, v))
    }

    fn value_at(leaf: &LeafNode<u64, u64>, k: u64) -> Option<u64> {
        let kv = leaf.lookup(&k);
        if kv.is_null() {
            None
        } else {
            Some(unsafe { (*kv).value })
        }
    }

    #[test]
    fn upsert_then_lookup() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();

        for k in [5u64, 1, 9, 3] {
            assert!(matches!(leaf.upsert(pair(k, k * 10), &guard), LeafUpsert::Inserted));
        }
        assert_eq!(leaf.key_count(), 4);
        assert_eq!(value_at(&leaf, 3), Some(30));
        assert_eq!(value_at(&leaf, 9), Some(90));
        assert_eq!(value_at(&leaf, 7), None);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();

        leaf.upsert(pair(8, 80), &guard);
        match leaf.upsert(pair(8, 88), &guard) {
            LeafUpsert::Replaced(old) => {
                assert_eq!(unsafe { (*old).value }, 80);
                unsafe { guard.retire_pair(old) };
            }
            _ => panic!("expected replacement"),
        }
        assert_eq!(leaf.key_count(), 1);
        assert_eq!(value_at(&leaf, 8), Some(88));
    }

    #[test]
    fn update_misses_absent_key() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();
        leaf.upsert(pair(1, 10), &guard);

        let kv = pair(2, 20);
        assert!(leaf.update(kv).is_null());
        unsafe { drop(Box::from_raw(kv)) };
    }

    #[test]
    fn update_swaps_present_key() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();
        leaf.upsert(pair(4, 40), &guard);

        let old = leaf.update(pair(4, 44));
        assert!(!old.is_null());
        assert_eq!(unsafe { (*old).value }, 40);
        unsafe { guard.retire_pair(old) };
        assert_eq!(value_at(&leaf, 4), Some(44));
    }

    #[test]
    fn full_leaf_splits_in_the_middle() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();

        // Descending insertion defeats the rightmost-append fast path.
        for k in (1..=FANOUT as u64).rev() {
            leaf.upsert(pair(k * 2, k), &guard);
        }
        match leaf.upsert(pair(63, 0), &guard) {
            LeafUpsert::Split { rnode, mid } => {
                let right = unsafe { &*rnode };
                assert_eq!(leaf.key_count() + right.key_count(), FANOUT + 1);
                assert!(leaf.control().has_sibling());
                assert_eq!(leaf.sibling_forward(), rnode);
                // The promoted separator equals the left node's high key.
                let high = leaf.high_key_route().expect("split leaf has a high key");
                assert_eq!(mid, high);
                // Every left key is at or below the separator, every
                // right key above it.
                assert!(leaf.live_routes().iter().all(|r| *r <= mid));
                assert!(right.live_routes().iter().all(|r| *r > mid));
                unsafe { drop(Box::from_raw(rnode)) };
            }
            _ => panic!("expected a split"),
        }
    }

    #[test]
    fn rightmost_append_ships_only_the_new_key() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();

        for k in 1..=FANOUT as u64 {
            leaf.upsert(pair(k, k), &guard);
        }
        match leaf.upsert(pair(1000, 1), &guard) {
            LeafUpsert::Split { rnode, .. } => {
                let right = unsafe { &*rnode };
                assert_eq!(leaf.key_count(), FANOUT);
                assert_eq!(right.key_count(), 1);
                assert_eq!(value_at(right, 1000), Some(1));
                unsafe { drop(Box::from_raw(rnode)) };
            }
            _ => panic!("expected a split"),
        }
    }

    #[test]
    fn remove_returns_the_record() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();
        leaf.upsert(pair(6, 60), &guard);
        leaf.upsert(pair(7, 70), &guard);

        let out = leaf.remove(&6, &guard);
        assert!(!out.old.is_null());
        assert_eq!(unsafe { (*out.old).value }, 60);
        assert!(out.merged.is_none());
        unsafe { guard.retire_pair(out.old) };
        assert_eq!(value_at(&leaf, 6), None);
        assert_eq!(leaf.key_count(), 1);

        let miss = leaf.remove(&6, &guard);
        assert!(miss.old.is_null());
    }

    #[test]
    fn underfull_leaf_absorbs_its_sibling() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();

        for k in (1..=FANOUT as u64).rev() {
            leaf.upsert(pair(k, k), &guard);
        }
        let rnode = match leaf.upsert(pair(0, 0), &guard) {
            LeafUpsert::Split { rnode, .. } => rnode,
            _ => panic!("expected a split"),
        };

        // Drain the left side below the merge threshold, then remove once
        // more to trigger the merge.
        for k in 0..=(FANOUT as u64 / 2) {
            let out = leaf.remove(&k, &guard);
            if !out.old.is_null() {
                unsafe { guard.retire_pair(out.old) };
            }
            if let Some((merged, _)) = out.merged {
                assert_eq!(merged, rnode);
                let dead = unsafe { &*merged };
                assert!(dead.control().deleted());
                assert_eq!(dead.key_count(), 0);
                // The back-pointer leads to the surviving left node.
                assert_eq!(dead.sibling_ptr(), &*leaf as *const _ as *mut _);
                assert!(!leaf.control().has_sibling());
                unsafe { guard.retire_leaf(merged) };
                return;
            }
        }
        panic!("merge never happened");
    }

    #[test]
    fn sort_packs_and_orders() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();
        for k in [9u64, 2, 7, 4, 1] {
            leaf.upsert(pair(k, k), &guard);
        }
        let out = leaf.remove(&7, &guard);
        unsafe { guard.retire_pair(out.old) };

        assert!(!leaf.control().ordered());
        leaf.kv_sort();
        assert!(leaf.control().ordered());

        let keys: Vec<u64> = (0..leaf.key_count())
            .map(|pos| unsafe { (*leaf.access_at(pos)).key })
            .collect();
        assert_eq!(keys, vec![1, 2, 4, 9]);
    }

    #[test]
    fn bound_on_ordered_leaf() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<u64, u64>> = LeafNode::alloc();
        for k in [10u64, 20, 30] {
            leaf.upsert(pair(k, k), &guard);
        }
        leaf.kv_sort();

        match leaf.bound(&15, false) {
            LeafBound::At(kv, pos) => {
                assert_eq!(unsafe { (*kv).key }, 20);
                assert_eq!(pos, 1);
            }
            _ => panic!("expected a bound"),
        }
        match leaf.bound(&20, false) {
            LeafBound::At(kv, _) => assert_eq!(unsafe { (*kv).key }, 20),
            _ => panic!("expected a bound"),
        }
        match leaf.bound(&20, true) {
            LeafBound::At(kv, _) => assert_eq!(unsafe { (*kv).key }, 30),
            _ => panic!("expected a bound"),
        }
        assert!(matches!(leaf.bound(&30, true), LeafBound::End));
    }

    #[test]
    fn string_keys_round_trip() {
        let epoch = Epoch::new();
        let guard = epoch.guard();
        let leaf: Box<LeafNode<Box<[u8]>, u64>> = LeafNode::alloc();

        let key = |s: &str| -> Box<[u8]> { s.as_bytes().into() };
        for (i, s) in ["pear", "apple", "quince"].iter().enumerate() {
            let kv = Box::into_raw(KVPair::boxed(key(s), i as u64));
            assert!(matches!(leaf.upsert(kv, &guard), LeafUpsert::Inserted));
        }
        let hit = leaf.lookup(&key("apple"));
        assert!(!hit.is_null());
        assert_eq!(unsafe { (*hit).value }, 1);
        assert!(leaf.lookup(&key("plum")).is_null());
    }
}
