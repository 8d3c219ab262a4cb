//! Compile-time node parameters.
//!
//! All sizes are fixed at compile time; there is no runtime configuration.
//! The fanout is tied to the 64-lane compare kernel and the `u64` presence
//! bitmap, so changing it means changing both.

/// Number of key slots per node (inner separators, leaf pairs).
///
/// Must match a compare-kernel width (16, 32 or 64) and fit a `u64` bitmap.
pub const FANOUT: usize = 64;

/// Merge threshold: a node absorbs its right sibling when the combined key
/// count is at or below this.
pub const MERGE_LIMIT: usize = FANOUT / 2;

/// Maximum number of feature rows an inner node can carry.
///
/// Integer keys use all `size_of::<K>()` rows; byte-string keys use
/// [`STRING_FEATURE_LEN`] rows and fall back to anchors past them.
pub const MAX_FEATURE_LEN: usize = 8;

/// Feature rows stored for byte-string keys.
pub const STRING_FEATURE_LEN: usize = 4;

/// Node alignment in bytes.
pub const NODE_ALIGN: usize = 64;

/// Maximum tree height. 64^13 keys is far beyond addressable memory, so
/// the per-level leftmost-node array can be a fixed array.
pub const MAX_HEIGHT: usize = 13;

/// Initial byte capacity of an anchor extent.
pub const EXTENT_MIN_BYTES: usize = 256;

const _: () = assert!(FANOUT == 16 || FANOUT == 32 || FANOUT == 64);
const _: () = assert!(MERGE_LIMIT > 0 && MERGE_LIMIT < FANOUT);
const _: () = assert!(STRING_FEATURE_LEN > 0 && STRING_FEATURE_LEN <= MAX_FEATURE_LEN);
const _: () = assert!(NODE_ALIGN == 32 || NODE_ALIGN == 64);
