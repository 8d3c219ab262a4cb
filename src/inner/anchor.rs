//! Anchor storage for byte-string separators.
//!
//! An inner node's feature table only captures the first few bytes of each
//! separator. For byte-string keys the full separator (the *anchor*) is
//! needed whenever two candidates agree on every feature byte. Anchors for
//! one node are packed into a single slab, the [`AnchorExtent`]: a
//! bump-allocated byte region plus one packed `(offset, len)` entry per
//! key slot.
//!
//! Anchors are immutable once written. Removing or overwriting a separator
//! only marks its bytes dead (`freed`); when the dead share grows past the
//! compaction threshold, or the slab runs out of room, the owning node
//! builds a replacement extent, swaps the pointer and retires the old slab
//! through the epoch — straggling optimistic readers may still be walking
//! it.
//!
//! All mutation happens under the owning node's exclusive latch. Readers
//! go pointer -> slot entry -> bytes with acquire loads and validate the
//! node version afterwards, so a torn byte read is discarded, never acted
//! on.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize};

use crate::config::{EXTENT_MIN_BYTES, FANOUT};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// Packed per-slot anchor slab for one inner node.
pub struct AnchorExtent {
    /// Byte capacity of `bytes`.
    cap: usize,

    /// Bump offset: bytes `[0, used)` are allocated.
    used: AtomicUsize,

    /// Bytes belonging to removed or overwritten anchors.
    freed: AtomicUsize,

    /// Packed `offset << 32 | len` per key slot. Only slots below the
    /// owning node's key count are meaningful.
    slots: [AtomicU64; FANOUT],

    /// The slab. Append-only between pointer swaps.
    bytes: Box<[UnsafeCell<u8>]>,
}

// SAFETY: the UnsafeCell bytes are written only while the owning node's
// exclusive latch is held, and published via the release store of the slot
// entry; optimistic readers validate the node version before trusting
// anything they read.
unsafe impl Send for AnchorExtent {}
unsafe impl Sync for AnchorExtent {}

#[inline]
fn pack(offset: usize, len: usize) -> u64 {
    ((offset as u64) << 32) | len as u64
}

#[inline]
fn unpack(entry: u64) -> (usize, usize) {
    ((entry >> 32) as usize, (entry & 0xFFFF_FFFF) as usize)
}

impl AnchorExtent {
    /// Allocate an extent with at least `cap` bytes of anchor storage.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Box<Self> {
        let cap = cap.max(EXTENT_MIN_BYTES);
        let bytes = (0..cap)
            .map(|_| UnsafeCell::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self {
            cap,
            used: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes,
        })
    }

    /// Bytes still unallocated.
    #[inline]
    #[must_use]
    pub fn room(&self) -> usize {
        self.cap - self.used.load(RELAXED)
    }

    /// Bytes reachable through live slots.
    #[inline]
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.used.load(RELAXED) - self.freed.load(RELAXED)
    }

    /// Whether the dead share has grown past the compaction threshold.
    #[inline]
    #[must_use]
    pub fn wants_compaction(&self) -> bool {
        let used = self.used.load(RELAXED);
        used > 0 && self.freed.load(RELAXED) * 2 > used
    }

    /// The anchor bytes of `slot`.
    ///
    /// Under the latch this is exact. In an optimistic frame the slice may
    /// be torn; the caller must validate the node version before acting on
    /// a comparison result.
    #[inline]
    #[must_use]
    pub fn anchor(&self, slot: usize) -> &[u8] {
        let (offset, len) = unpack(self.slots[slot].load(READ_ORD));
        debug_assert!(offset + len <= self.cap);
        // SAFETY: offset/len were published only after the bytes were
        // written; the region never moves within this slab.
        unsafe { std::slice::from_raw_parts(self.bytes.as_ptr().cast::<u8>().add(offset), len) }
    }

    /// Bump-allocate `anchor` and point `slot` at it. Latch required.
    ///
    /// # Panics
    /// If the slab lacks room; callers grow the extent first.
    pub fn store(&self, slot: usize, anchor: &[u8]) {
        let offset = self.used.load(RELAXED);
        assert!(offset + anchor.len() <= self.cap, "anchor extent overflow");
        for (i, &b) in anchor.iter().enumerate() {
            // SAFETY: [offset, offset+len) is unallocated and invisible to
            // readers until the slot entry below is published.
            unsafe { *self.bytes[offset + i].get() = b };
        }
        self.used.store(offset + anchor.len(), RELAXED);
        self.slots[slot].store(pack(offset, anchor.len()), WRITE_ORD);
    }

    /// Mark the anchor of `slot` dead. Latch required.
    pub fn release(&self, slot: usize) {
        let (_, len) = unpack(self.slots[slot].load(RELAXED));
        self.freed.store(self.freed.load(RELAXED) + len, RELAXED);
    }

    /// Copy the slot entry (not the bytes) from `src` to `dst`. Latch
    /// required.
    pub fn move_slot(&self, src: usize, dst: usize) {
        let entry = self.slots[src].load(RELAXED);
        self.slots[dst].store(entry, WRITE_ORD);
    }

    /// Open a hole at `index` among `live` occupied slots. Latch required.
    pub fn slot_insert(&self, index: usize, live: usize) {
        debug_assert!(index <= live && live < FANOUT);
        for i in (index..live).rev() {
            self.move_slot(i, i + 1);
        }
    }

    /// Close the hole at `index` among `live` occupied slots, releasing
    /// the removed anchor. Latch required.
    pub fn slot_remove(&self, index: usize, live: usize) {
        debug_assert!(index < live && live <= FANOUT);
        self.release(index);
        for i in index + 1..live {
            self.move_slot(i, i - 1);
        }
    }

    /// Build a replacement extent containing the anchors of slots
    /// `[0, live)` plus headroom for `extra` more bytes.
    #[must_use]
    pub fn rebuild(&self, live: usize, extra: usize) -> Box<Self> {
        let need = self.live_bytes() + extra;
        let fresh = Self::with_capacity((need * 2).max(EXTENT_MIN_BYTES));
        for slot in 0..live {
            fresh.store(slot, self.anchor(slot));
        }
        fresh
    }
}

impl std::fmt::Debug for AnchorExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorExtent")
            .field("cap", &self.cap)
            .field("used", &self.used.load(RELAXED))
            .field("freed", &self.freed.load(RELAXED))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_read_back() {
        let ext = AnchorExtent::with_capacity(0);
        ext.store(0, b"alpha");
        ext.store(1, b"beta");
        assert_eq!(ext.anchor(0), b"alpha");
        assert_eq!(ext.anchor(1), b"beta");
        assert_eq!(ext.live_bytes(), 9);
    }

    #[test]
    fn empty_anchor_is_representable() {
        let ext = AnchorExtent::with_capacity(0);
        ext.store(0, b"");
        assert_eq!(ext.anchor(0), b"");
    }

    #[test]
    fn slot_insert_shifts_entries() {
        let ext = AnchorExtent::with_capacity(0);
        ext.store(0, b"a");
        ext.store(1, b"c");
        ext.slot_insert(1, 2);
        ext.store(1, b"b");
        assert_eq!(ext.anchor(0), b"a");
        assert_eq!(ext.anchor(1), b"b");
        assert_eq!(ext.anchor(2), b"c");
    }

    #[test]
    fn slot_remove_releases_bytes() {
        let ext = AnchorExtent::with_capacity(0);
        ext.store(0, b"aa");
        ext.store(1, b"bbbb");
        ext.store(2, b"cc");
        ext.slot_remove(1, 3);
        assert_eq!(ext.anchor(0), b"aa");
        assert_eq!(ext.anchor(1), b"cc");
        assert_eq!(ext.live_bytes(), 4);
    }

    #[test]
    fn compaction_threshold() {
        let ext = AnchorExtent::with_capacity(0);
        ext.store(0, b"xxxxxxxxxx");
        ext.store(1, b"y");
        assert!(!ext.wants_compaction());
        ext.slot_remove(0, 2);
        assert!(ext.wants_compaction());
    }

    #[test]
    fn rebuild_drops_dead_bytes() {
        let ext = AnchorExtent::with_capacity(0);
        ext.store(0, b"keep-me");
        ext.store(1, b"drop-me-drop-me");
        ext.store(2, b"also-keep");
        ext.slot_remove(1, 3);

        let fresh = ext.rebuild(2, 0);
        assert_eq!(fresh.anchor(0), b"keep-me");
        assert_eq!(fresh.anchor(1), b"also-keep");
        assert_eq!(fresh.live_bytes(), 16);
        assert!(!fresh.wants_compaction());
    }

    #[test]
    #[should_panic(expected = "anchor extent overflow")]
    fn overflow_is_fatal() {
        let ext = AnchorExtent::with_capacity(0);
        ext.store(0, &vec![7u8; EXTENT_MIN_BYTES + 1]);
    }
}
