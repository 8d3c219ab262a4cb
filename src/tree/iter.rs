//! Ordered range scan.
//!
//! A [`Range`] remembers `(leaf, version, record, ordinal)` and advances
//! by ordinal as long as the leaf stays put. When the version moves — a
//! sort, a split, a merge — it re-locates the successor of the last key
//! it yielded, so concurrent mutation can neither repeat a key nor skip
//! one that was present for the whole scan. Crossing to a sibling (or
//! backward out of a merged-away leaf) reuses the same bound machinery.

use std::marker::PhantomData;
use std::ptr;

use crate::epoch::Guard;
use crate::key::{KVPair, Key};
use crate::leaf::{LeafNode, LeafSeek};
use crate::ordering::READ_ORD;

use super::BlinkTree;

/// A live forward scan. Holds its creating guard's borrow, so records it
/// yields stay valid while it exists.
pub struct Range<'g, K: Key, V> {
    leaf: *mut LeafNode<K, V>,
    kv: *mut KVPair<K, V>,
    pos: usize,
    version: u64,
    _guard: PhantomData<&'g Guard<'g>>,
}

impl<'g, K: Key, V> Range<'g, K, V> {
    fn empty() -> Self {
        Self {
            leaf: ptr::null_mut(),
            kv: ptr::null_mut(),
            pos: 0,
            version: 0,
            _guard: PhantomData,
        }
    }

    fn at(leaf: *mut LeafNode<K, V>, kv: *mut KVPair<K, V>, pos: usize, version: u64) -> Self {
        Self {
            leaf,
            kv,
            pos,
            version,
            _guard: PhantomData,
        }
    }

    /// The record the scan currently rests on.
    #[must_use]
    pub fn pair(&self) -> Option<&'g KVPair<K, V>> {
        // SAFETY: yielded records outlive the guard borrow `'g`.
        unsafe { self.kv.as_ref() }
    }

    /// Whether the scan ran off the right edge.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.kv.is_null()
    }

    /// Step to the next key in order.
    pub fn advance(&mut self) {
        if self.leaf.is_null() {
            self.kv = ptr::null_mut();
            return;
        }
        let last = self.kv;

        // SAFETY: leaves reached by the scan stay readable under `'g`.
        let leaf = unsafe { &*self.leaf };
        let (mut next, mut pos, mut version) = leaf.advance_access(last, self.pos + 1, self.version);

        while next.is_null() {
            // This leaf is exhausted (or dissolved): follow the chain.
            // A deleted leaf's chain pointer leads back to the neighbor
            // that absorbed its records; the key-bounded re-seek below
            // keeps the scan exactly-once across such detours.
            let chain = unsafe { &*self.leaf }.sibling_ptr();
            if chain.is_null() {
                self.leaf = ptr::null_mut();
                self.kv = ptr::null_mut();
                return;
            }
            let mut target = chain;
            loop {
                let tleaf = unsafe { &*target };
                if last.is_null() {
                    // Nothing yielded yet: the first record will do.
                    let v = tleaf.control().begin_read();
                    let r = tleaf.advance_access(ptr::null_mut(), 0, v);
                    self.leaf = target;
                    (next, pos, version) = r;
                    break;
                }
                // SAFETY: `last` stays readable under `'g` even if
                // removed meanwhile.
                match tleaf.seek_bound(unsafe { &(*last).key }, true) {
                    LeafSeek::Found(kv, p, v) => {
                        self.leaf = target;
                        (next, pos, version) = (kv, p, v);
                        break;
                    }
                    LeafSeek::End(v) => {
                        self.leaf = target;
                        (next, pos, version) = (ptr::null_mut(), 0, v);
                        break;
                    }
                    LeafSeek::Jump(j) => target = j,
                }
            }
        }

        self.kv = next;
        self.pos = pos;
        self.version = version;
    }
}

impl<'g, K: Key, V: 'g> Iterator for Range<'g, K, V> {
    type Item = &'g KVPair<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: as in `pair`.
        let current: Option<&'g KVPair<K, V>> = unsafe { self.kv.as_ref() };
        if current.is_some() {
            self.advance();
        }
        current
    }
}

impl<K: Key, V> std::fmt::Debug for Range<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Range")
            .field("at_end", &self.kv.is_null())
            .finish_non_exhaustive()
    }
}

impl<K: Key, V: Send + Sync + 'static> BlinkTree<K, V> {
    /// Scan from the first key at or above `key`.
    pub fn lower_bound<'g>(&'g self, key: &K, guard: &'g Guard<'_>) -> Range<'g, K, V> {
        self.seek(key, false, guard)
    }

    /// Scan from the first key strictly above `key`.
    pub fn upper_bound<'g>(&'g self, key: &K, guard: &'g Guard<'_>) -> Range<'g, K, V> {
        self.seek(key, true, guard)
    }

    /// Scan from the least key in the tree.
    pub fn begin<'g>(&'g self, _guard: &'g Guard<'_>) -> Range<'g, K, V> {
        // The level-0 leftmost leaf is never unlinked.
        let mut target = self.root_track[0].load(READ_ORD).cast::<LeafNode<K, V>>();
        loop {
            // SAFETY: chain leaves stay readable under the guard.
            let leaf = unsafe { &*target };
            let v = leaf.control().begin_read();
            let (kv, pos, version) = leaf.advance_access(ptr::null_mut(), 0, v);
            if !kv.is_null() {
                return Range::at(target, kv, pos, version);
            }
            let chain = leaf.sibling_forward();
            if chain.is_null() {
                return Range::empty();
            }
            target = chain;
        }
    }

    fn seek<'g>(&'g self, key: &K, upper: bool, _guard: &'g Guard<'_>) -> Range<'g, K, V> {
        let route = key.route();
        let mut target = self.descend(&route).cast::<LeafNode<K, V>>();
        loop {
            // SAFETY: as in `begin`.
            let leaf = unsafe { &*target };
            match leaf.seek_bound(key, upper) {
                LeafSeek::Found(kv, pos, version) => {
                    return Range::at(target, kv, pos, version);
                }
                LeafSeek::End(_) => {
                    // Everything here is below the bound; the successor,
                    // if any, is the sibling's least key. Re-seeking with
                    // the bound also absorbs a concurrent merge.
                    let chain = leaf.sibling_ptr();
                    if chain.is_null() {
                        return Range::empty();
                    }
                    target = chain;
                }
                LeafSeek::Jump(next) => target = next,
            }
        }
    }
}
