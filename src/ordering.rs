//! Standard memory orderings for concurrent node access.
//!
//! These constants keep ordering usage consistent across the codebase and
//! make the intent clear at each access point. The control word is the
//! synchronization edge for every other field of a node: writers publish
//! with Release stores, optimistic readers observe with Acquire loads and
//! validate against the version afterwards.

use std::sync::atomic::Ordering;

/// Ordering for reading node fields during optimistic traversal.
/// Pairs with writers' Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing node fields that readers may observe.
/// Pairs with readers' Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (latch acquisition, value-slot swaps).
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure. Only the current value is needed.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for loads and stores inside a latched region. The latch
/// acquisition already provides the synchronization edge.
pub const RELAXED: Ordering = Ordering::Relaxed;
