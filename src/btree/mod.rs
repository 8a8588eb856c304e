//! # B-Tree Engine
//!
//! The ordered index over node pages: search, upsert with preemptive top-down
//! splits, delete with borrow/merge rebalancing, range scans over the leaf
//! sibling chain, bottom-up bulk loading and structural verification.
//!
//! ## Shape
//!
//! Values live in leaf nodes only. Internal nodes hold separator keys and
//! child offsets; every separator is a copy of the largest key in the subtree
//! to its left, so routing ties go left and a key found in an internal node is
//! resolved by continuing the descent.
//!
//! ```text
//!                 [ internal: k3 │ k7 ]
//!                 /        │         \
//!       [k1 k2 k3]   [k4 k5 k7]    [k8 k9]
//!           │<───────────>│<──────────>│      (doubly-linked leaves)
//! ```
//!
//! [`tree::BTree`] borrows the device, header, pool and codec from the store
//! for the duration of one operation; it owns nothing.

pub mod node;
pub mod tree;

use std::cmp::Ordering;
use std::sync::Arc;

pub use node::{Node, NodeCodec, NodeKind};
pub use tree::{BTree, RangeQuery};

/// Total order over keys. Defaults to the codec type's `Ord`; callers may
/// supply their own.
pub type KeyComparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

/// The natural `Ord`-based comparator.
pub fn natural_order<K: Ord>() -> KeyComparator<K> {
    Arc::new(|a: &K, b: &K| a.cmp(b))
}
