//! # Storage Layer
//!
//! The foundation under the tree engine: a byte-addressed block device, the
//! 512-byte file header, CRC-32 integrity checksums, a free-list page
//! allocator, and an LRU buffer pool of decoded nodes.
//!
//! ## Data Flow
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        B-Tree Engine         │
//! ├──────────────────────────────┤
//! │  BufferPool (decoded nodes)  │   load / put / flush
//! ├──────────────────────────────┤
//! │  NodeCodec + crc32           │   encode / decode / verify
//! ├──────────────────────────────┤
//! │  BlockDevice (FileDevice)    │   read / write / truncate / flush
//! └──────────────────────────────┘
//! ```
//!
//! The file header is read once at open and held in memory; counters mutate
//! in place and the sealed header is rewritten at every flush boundary. The
//! allocator manipulates header counters and free-list links directly through
//! the device, below the buffer pool.
//!
//! ## Ownership
//!
//! The device exclusively owns the file handle; the buffer pool exclusively
//! owns cached node instances; the engine borrows nodes from the pool for the
//! duration of one operation and submits mutated copies back.

pub mod alloc;
pub mod checksum;
pub mod device;
pub mod header;
pub mod pool;

pub use alloc::Allocator;
pub use checksum::{crc32, Crc32Digest};
pub use device::{exists, remove, BlockDevice, FileDevice};
pub use header::FileHeader;
pub use pool::{BufferPool, PoolStats, WriteMode};
