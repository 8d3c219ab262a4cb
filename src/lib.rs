//! # blinktree
//!
//! A concurrent, in-memory ordered index: a B-link tree whose inner
//! nodes route through columnar *feature* bytes compared 64 lanes at a
//! time, and whose leaves filter candidates through 1-byte fingerprints
//! before any full key compare.
//!
//! ## Design
//!
//! - **One word of concurrency state per node.** An 8-byte control word
//!   carries the lock, the flags, a split counter and a monotonic
//!   version. Readers are optimistic: read, validate, retry.
//! - **B-link siblings.** Every node knows its right neighbor and leaves
//!   know their inclusive upper bound, so a reader that raced a split
//!   walks right instead of restarting; a reader that raced an unlink
//!   walks *back* through the deleted node's repurposed pointer.
//! - **Epoch reclamation.** Unlinked nodes and displaced records are
//!   retired, not freed; a [`Guard`] pins the epoch, and borrows handed
//!   out by the tree stay valid until the guard drops.
//!
//! ## Example
//!
//! ```
//! use blinktree::BlinkTree;
//!
//! let tree: BlinkTree<u64, String> = BlinkTree::new();
//! let guard = tree.guard();
//!
//! tree.insert(3, "three".into(), &guard);
//! tree.insert(1, "one".into(), &guard);
//! tree.insert(2, "two".into(), &guard);
//!
//! assert_eq!(tree.lookup(&2, &guard).map(|kv| kv.value.as_str()), Some("two"));
//!
//! let keys: Vec<u64> = tree.begin(&guard).map(|kv| kv.key).collect();
//! assert_eq!(keys, vec![1, 2, 3]);
//! ```
//!
//! Keys are `u32`/`u64`/`i32`/`i64` or byte strings (`Box<[u8]>`); see
//! [`Key`] to wire up further types.

pub mod config;
pub mod control;
pub mod epoch;
pub mod key;
pub mod simd;

pub(crate) mod inner;
pub(crate) mod leaf;
pub(crate) mod ordering;
pub(crate) mod trace;

mod tree;

pub use epoch::{Epoch, Guard};
pub use key::{BytesRoute, FixedRoute, KVPair, Key, Route};
pub use tree::{BlinkTree, Range, TreeStats};
