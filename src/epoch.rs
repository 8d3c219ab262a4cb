//! Epoch-based safe memory reclamation.
//!
//! Every public tree operation executes under a [`Guard`]. A guard pins
//! the thread into the current reclamation epoch; memory retired while any
//! earlier guard is still live will not be freed until that guard drops.
//! A thread may keep one guard open across many operations — entry cost is
//! amortized and any borrowed records stay valid for the guard's lifetime.
//!
//! Retirement carries a typed destructor: leaves, inner nodes, key-value
//! records, boxed keys and anchor extents each have their own reclaim
//! callback, invoked once no straggling reader can hold the pointer.
//!
//! The one hard rule: a retired object must already be unreachable for
//! threads that start *after* the retire call. Structural unlinking (under
//! the latch) therefore always precedes retirement; in-flight readers that
//! still hold the pointer are exactly the ones the epoch protects.

use seize::{Collector, Guard as _, LocalGuard};

use crate::inner::{AnchorExtent, InnerNode};
use crate::key::{KVPair, Key};
use crate::leaf::LeafNode;

// ============================================================================
//  Epoch
// ============================================================================

/// The reclamation domain owned by a tree.
pub struct Epoch {
    collector: Collector,
}

impl Epoch {
    /// Create a fresh reclamation domain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            collector: Collector::new(),
        }
    }

    /// Pin the calling thread and return a guard.
    ///
    /// Cheap enough to call per operation; cheaper still when one guard is
    /// held across a batch.
    #[must_use]
    pub fn guard(&self) -> Guard<'_> {
        Guard {
            inner: self.collector.enter(),
        }
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoch").finish_non_exhaustive()
    }
}

// ============================================================================
//  Guard
// ============================================================================

/// A scoped epoch acquisition.
///
/// Dropping the guard releases the thread's epoch slot and lets deferred
/// reclamation proceed. Guards are not `Send`; they pin the *calling*
/// thread.
pub struct Guard<'a> {
    inner: LocalGuard<'a>,
}

impl Guard<'_> {
    /// Retire an unlinked leaf.
    ///
    /// # Safety
    /// `ptr` must come from `Box::into_raw`, must be unreachable for
    /// threads entering after this call, and must not be retired twice.
    pub(crate) unsafe fn retire_leaf<K: Key, V>(&self, ptr: *mut LeafNode<K, V>) {
        // SAFETY: forwarded caller guarantees.
        unsafe { self.inner.defer_retire(ptr, reclaim_leaf_boxed::<K, V>) };
    }

    /// Retire an unlinked inner node.
    ///
    /// # Safety
    /// Same contract as [`Guard::retire_leaf`].
    pub(crate) unsafe fn retire_inner<K: Key>(&self, ptr: *mut InnerNode<K>) {
        // SAFETY: forwarded caller guarantees.
        unsafe { self.inner.defer_retire(ptr, reclaim_inner_boxed::<K>) };
    }

    /// Retire a displaced key-value record.
    ///
    /// # Safety
    /// Same contract as [`Guard::retire_leaf`]; the record must already be
    /// swapped out of its slot.
    pub(crate) unsafe fn retire_pair<K: Key, V>(&self, ptr: *mut KVPair<K, V>) {
        // SAFETY: forwarded caller guarantees.
        unsafe { self.inner.defer_retire(ptr, reclaim_pair_boxed::<K, V>) };
    }

    /// Retire a replaced high-key box.
    ///
    /// # Safety
    /// Same contract as [`Guard::retire_leaf`].
    pub(crate) unsafe fn retire_key<K: Key>(&self, ptr: *mut K) {
        // SAFETY: forwarded caller guarantees.
        unsafe { self.inner.defer_retire(ptr, reclaim_boxed::<K>) };
    }

    /// Retire a swapped-out anchor extent.
    ///
    /// # Safety
    /// Same contract as [`Guard::retire_leaf`].
    pub(crate) unsafe fn retire_extent(&self, ptr: *mut AnchorExtent) {
        // SAFETY: forwarded caller guarantees.
        unsafe { self.inner.defer_retire(ptr, reclaim_boxed::<AnchorExtent>) };
    }
}

impl std::fmt::Debug for Guard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard").finish_non_exhaustive()
    }
}

// ============================================================================
//  Reclaim callbacks
// ============================================================================

/// Reclaim a boxed leaf. The leaf's `Drop` frees any records it still
/// owns; merged-away leaves own none.
///
/// # Safety
/// `ptr` must be a valid `Box::into_raw` leaf with no remaining readers.
unsafe fn reclaim_leaf_boxed<K: Key, V>(ptr: *mut LeafNode<K, V>, _collector: &Collector) {
    // SAFETY: reclamation runs once, after the last possible reader.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Reclaim a boxed inner node, including its anchor extent if any.
///
/// # Safety
/// `ptr` must be a valid `Box::into_raw` inner node with no remaining
/// readers.
unsafe fn reclaim_inner_boxed<K: Key>(ptr: *mut InnerNode<K>, _collector: &Collector) {
    // SAFETY: reclamation runs once, after the last possible reader.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Reclaim a boxed key-value record.
///
/// # Safety
/// `ptr` must be a valid `Box::into_raw` record with no remaining readers.
unsafe fn reclaim_pair_boxed<K: Key, V>(ptr: *mut KVPair<K, V>, _collector: &Collector) {
    // SAFETY: reclamation runs once, after the last possible reader.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Reclaim any other boxed allocation.
///
/// # Safety
/// `ptr` must be a valid `Box::into_raw` allocation of `T` with no
/// remaining readers.
unsafe fn reclaim_boxed<T>(ptr: *mut T, _collector: &Collector) {
    // SAFETY: reclamation runs once, after the last possible reader.
    unsafe { drop(Box::from_raw(ptr)) };
}

// ============================================================================
//  Tests
// ============================================================================
