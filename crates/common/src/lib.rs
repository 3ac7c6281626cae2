//! Core types shared by every nacre crate: identifiers, logical block
//! addresses and the sample representation that flows through the write
//! path and back out of query materializers.

mod addr;
mod sample;

pub use addr::LogicAddr;
pub use sample::{PayloadValue, Sample};

/// Monotonic, unsigned nanosecond-scale timestamp.
pub type Timestamp = u64;

/// Dense (but not contiguous) series identifier assigned by the series
/// matcher.
pub type ParamId = u64;

/// Size of one block-store page in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Maximum number of siblings addressable from one superblock.
pub const FANOUT: u16 = 32;

/// On-disk format version tag carried by every node header.
pub const NACRE_VERSION: u16 = 1;
