//! # BirchDB - Embeddable Ordered Key-Value Store
//!
//! BirchDB is a persistent, ordered key-value store implemented as a B-tree
//! over a single page-addressed file. It supports point lookup, upsert,
//! deletion, ordered range scans, full in-order enumeration, bulk loading and
//! structural verification. Keys and values are user-defined types whose
//! binary encoding and ordering are supplied through codecs.
//!
//! ## Quick Start
//!
//! ```ignore
//! use birchdb::codec::{I32Codec, StringCodec};
//! use birchdb::{Store, StoreConfig};
//!
//! let config = StoreConfig::new(Box::new(I32Codec), Box::new(StringCodec))
//!     .with_order(32)
//!     .with_cache_capacity(100);
//!
//! let mut store = Store::create("users.bt", config)?;
//! store.insert(1, "alice".to_string())?;
//! assert_eq!(store.search(&1)?, Some("alice".to_string()));
//! store.close()?;
//! ```
//!
//! Callers that need the engine isolated on its own execution context use the
//! gateway instead: [`gateway::StoreHandle::spawn`] starts a worker thread
//! that owns the store, and every operation becomes a message exchange.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   Gateway (worker thread + channel)  │
//! ├──────────────────────────────────────┤
//! │   Store (lifecycle, op surface)      │
//! ├──────────────────────────────────────┤
//! │   B-Tree Engine (search/insert/      │
//! │   delete/range/verify/bulk-load)     │
//! ├───────────────────┬──────────────────┤
//! │   Node Codec      │  Key/Value       │
//! │   (64 B header +  │  Codecs          │
//! │    CRC payload)   │                  │
//! ├───────────────────┴──────────────────┤
//! │   Buffer Pool (LRU, write policies)  │
//! ├──────────────────────────────────────┤
//! │   Block Device (single file)         │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! store.bt
//! ├── [0, 512)      file header: magic, version, CRC-32, counters,
//! │                 codec tags
//! └── [512, ...)    node pages, one node per page, uniform page size,
//!                   freed pages threaded onto a free list
//! ```
//!
//! All multi-byte integers on disk are little-endian. Every node payload and
//! the header carry CRC-32 checksums; a mismatch surfaces as a corruption
//! error and is never silently repaired.
//!
//! ## Concurrency Model
//!
//! The engine is single-writer and single-execution-context. The [`Store`]
//! itself is plain `&mut self` Rust; the [`gateway`] wraps it in a dedicated
//! worker thread with a FIFO request channel, which makes operations
//! linearizable in submission order without any locking in the engine.
//!
//! ## Module Overview
//!
//! - [`codec`]: key/value codecs and the framing rules
//! - [`storage`]: block device, file header, checksums, allocator, buffer pool
//! - [`btree`]: node model and the tree algorithms
//! - [`store`]: lifecycle and the operation surface
//! - [`gateway`]: request/reply worker for callers on other threads

pub mod btree;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod storage;
pub mod store;

pub use btree::RangeQuery;
pub use error::{Result, StoreError};
pub use gateway::StoreHandle;
pub use storage::WriteMode;
pub use store::{BulkLoadOptions, Store, StoreConfig, StoreStats};
