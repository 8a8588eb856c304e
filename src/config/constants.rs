//! # Configuration Constants
//!
//! This module centralizes the layout constants and defaults. Constants that
//! depend on each other are co-located so a change to one is checked against
//! the others at compile time.
//!
//! ## Dependency Graph
//!
//! ```text
//! FILE_HEADER_SIZE (512 bytes)
//!       │
//!       └─> first node page starts at offset 512
//!
//! NODE_HEADER_SIZE (64 bytes)
//!       │
//!       └─> page payload capacity = page_size - NODE_HEADER_SIZE
//!
//! DEFAULT_ORDER (128)
//!       │
//!       ├─> max keys per node = order - 1
//!       └─> min keys per non-root node = order / 2 - 1
//!
//! DEFAULT_PAGE_SIZE (4096 bytes)
//!       │
//!       └─> widened at create time when fixed-size codecs would
//!           overflow a worst-case node of order - 1 entries
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `MIN_ORDER >= 4` — below that the minimum-degree arithmetic of the
//!    delete rebalance degenerates.
//! 2. `DEFAULT_PAGE_SIZE > NODE_HEADER_SIZE` — a page must hold at least its
//!    own header.

/// Size of the file header in bytes. Node pages start at this offset.
pub const FILE_HEADER_SIZE: usize = 512;

/// Size of the per-node header in bytes.
pub const NODE_HEADER_SIZE: usize = 64;

/// File magic: "BTRE" read as a little-endian u32.
pub const FILE_MAGIC: u32 = 0x4254_5245;

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Byte range of the file header covered by the header checksum.
pub const HEADER_CHECKSUM_START: usize = 12;

/// Default branching factor (max children per internal node).
pub const DEFAULT_ORDER: u32 = 128;

/// Smallest branching factor the engine accepts.
pub const MIN_ORDER: u32 = 4;

/// Default buffer-pool capacity in cached nodes.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default node page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Length-prefix framing for variable-size codec fields, in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of a child offset inside an internal node payload, in bytes.
pub const CHILD_OFFSET_SIZE: usize = 8;

/// Codec tags stored in the file header are NUL-padded to this length.
pub const CODEC_TAG_LEN: usize = 16;

/// Default fill factor for bottom-up bulk loading.
pub const BULK_LOAD_FILL_FACTOR: f64 = 0.75;

/// Default batch size between bulk-load progress callbacks.
pub const DEFAULT_BULK_BATCH_SIZE: usize = 1000;

/// Header flag bit reserved for the (unimplemented) transaction log.
pub const FLAG_TRANSACTION_LOG: u32 = 1;

const _: () = assert!(MIN_ORDER >= 4, "delete rebalance needs order >= 4");
const _: () = assert!(
    DEFAULT_PAGE_SIZE as usize > NODE_HEADER_SIZE,
    "a page must hold at least its node header"
);
