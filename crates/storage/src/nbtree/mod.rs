//! Per-series necklace B+tree: node formats, the per-level extents list
//! and the tier-1 operators that iterate committed subtrees.
//!
//! The tree has no single root. Nodes at every level form a backward
//! linked list through their `addr` field; a superblock at level `k`
//! references up to [`FANOUT`] level-`k-1` siblings. Only the rightmost
//! node of each level is mutable, everything else is immutable once
//! committed to the block store.
//!
//! [`FANOUT`]: nacre_common::FANOUT

mod def;
mod extents;
pub mod iter;
mod leaf;
mod superblock;

pub use def::{NodeType, SubtreeRef, SUBTREE_REF_SIZE};
pub use extents::{AppendOutcome, ExtentsList, RepairStatus};
pub use leaf::{Leaf, LeafView};
pub use superblock::Superblock;
