//! # Store
//!
//! [`Store`] ties the storage components together and exposes the operation
//! surface: initialize, insert, search, delete, range, entries, clear, stats,
//! bulk_load, verify, flush, close, plus the static `exists`/`destroy`.
//!
//! ## Lifecycle
//!
//! ```text
//! create ──> Open ──(close)──> Closed
//!               │
//!               └──(io / corruption)──> Poisoned
//! ```
//!
//! A fatal error (`Io`, `Corruption`) poisons the session: the tree is
//! unusable until the file is re-opened, and every subsequent operation
//! answers `Closed`. Non-fatal errors (`Codec`, `Capacity`, `NotFound`,
//! `InvalidArgument`) leave the tree untouched.
//!
//! ## Durability
//!
//! In write-through mode every mutating operation writes its node pages and
//! rewrites the sealed header before returning, so terminating the process
//! after an `insert` returns loses nothing. In write-back mode dirty nodes
//! and the header reach the device on eviction, [`Store::flush`] or
//! [`Store::close`]; a crash before that loses the un-flushed tail.
//!
//! ## Re-open validation
//!
//! Opening verifies magic, version and header checksum, then compares the
//! stored codec tags against the supplied codecs: a store written as
//! `i32/utf8` refuses to open under different codecs. The stored `order` and
//! `node_size` always win over the caller's config.

mod config;

use std::path::Path;

use tracing::{debug, info};
use zerocopy::IntoBytes;

pub use config::{BulkLoadOptions, StoreConfig};

use crate::btree::{BTree, NodeCodec, RangeQuery};
use crate::codec::{padded_tag, unpadded_tag};
use crate::config::{FILE_HEADER_SIZE, FLAG_TRANSACTION_LOG, NODE_HEADER_SIZE};
use crate::error::{Result, StoreError};
use crate::storage::{
    Allocator, BlockDevice, BufferPool, FileDevice, FileHeader, WriteMode,
};

/// Counters reported by [`Store::stats`].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct StoreStats {
    pub node_count: u64,
    pub height: u32,
    pub key_count: u64,
    pub file_size: u64,
    pub cache_hit_rate: f64,
    pub cached_nodes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Closed,
    Poisoned,
}

pub struct Store<K, V> {
    name: String,
    device: Box<dyn BlockDevice>,
    header: FileHeader,
    codec: NodeCodec<K, V>,
    pool: BufferPool<K, V>,
    alloc: Allocator,
    cmp: crate::btree::KeyComparator<K>,
    state: SessionState,
}

impl<K, V> std::fmt::Debug for Store<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<K: Clone + 'static, V: Clone + 'static> Store<K, V> {
    /// Creates a new store file. Fails with `AlreadyExists` when the file is
    /// present.
    pub fn create(name: &str, config: StoreConfig<K, V>) -> Result<Self> {
        let page_size = effective_page_size(&config);
        let key_tag = padded_tag(config.key_codec.tag())?;
        let value_tag = padded_tag(config.value_codec.tag())?;
        let flags = if config.enable_transaction_log {
            FLAG_TRANSACTION_LOG
        } else {
            0
        };

        let header = FileHeader::new(
            config.order,
            config.key_codec.fixed_size().unwrap_or(0) as u32,
            config.value_codec.fixed_size().unwrap_or(0) as u32,
            page_size,
            flags,
            key_tag,
            value_tag,
        )?;

        let device = FileDevice::create(name)?;
        let codec = NodeCodec::new(config.key_codec, config.value_codec, page_size, config.order);

        let mut store = Self {
            name: name.to_string(),
            device: Box::new(device),
            header,
            codec,
            pool: BufferPool::new(config.cache_capacity, config.write_mode),
            alloc: Allocator::new(page_size),
            cmp: config.compare_keys,
            state: SessionState::Open,
        };

        // Physically reserve the header range before the first node lands.
        store.device.write(0, &[0u8; FILE_HEADER_SIZE])?;
        store.tree().create_root()?;
        // The root page must be on the device before the header that points
        // at it, in either write mode.
        store.flush_inner()?;
        store.device.flush()?;

        info!(name, order = store.header.order(), page_size, "store created");
        Ok(store)
    }

    /// Opens an existing store file and validates it against the supplied
    /// codecs.
    pub fn open(name: &str, config: StoreConfig<K, V>) -> Result<Self> {
        let mut device = FileDevice::open(name)?;
        let raw = device.read(0, FILE_HEADER_SIZE)?;
        let header = FileHeader::from_bytes(&raw)?;

        let stored_key_tag = unpadded_tag(header.key_codec_tag());
        if stored_key_tag != config.key_codec.tag() {
            return Err(StoreError::invalid(format!(
                "store was written with key codec '{}', caller supplied '{}'",
                stored_key_tag,
                config.key_codec.tag()
            )));
        }
        let stored_value_tag = unpadded_tag(header.value_codec_tag());
        if stored_value_tag != config.value_codec.tag() {
            return Err(StoreError::invalid(format!(
                "store was written with value codec '{}', caller supplied '{}'",
                stored_value_tag,
                config.value_codec.tag()
            )));
        }

        // Stored layout parameters win over the caller's config.
        if config.order != header.order() {
            debug!(
                supplied = config.order,
                stored = header.order(),
                "order mismatch on open, stored value wins"
            );
        }
        let order = header.order();
        let page_size = header.node_size();

        let codec = NodeCodec::new(config.key_codec, config.value_codec, page_size, order);
        let store = Self {
            name: name.to_string(),
            device: Box::new(device),
            header,
            codec,
            pool: BufferPool::new(config.cache_capacity, config.write_mode),
            alloc: Allocator::new(page_size),
            cmp: config.compare_keys,
            state: SessionState::Open,
        };

        info!(name, order, page_size, keys = store.header.key_count(), "store opened");
        Ok(store)
    }

    /// The `initialize` request: create when `open_existing` is false, open
    /// when it is true.
    pub fn initialize(name: &str, config: StoreConfig<K, V>, open_existing: bool) -> Result<Self> {
        if open_existing {
            Self::open(name, config)
        } else {
            Self::create(name, config)
        }
    }

    /// Whether a store file exists at `name`.
    pub fn exists(name: &str) -> bool {
        crate::storage::exists(Path::new(name))
    }

    /// Removes the store file at `name`.
    pub fn destroy(name: &str) -> Result<()> {
        crate::storage::remove(Path::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // operations
    // ------------------------------------------------------------------

    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.ensure_open()?;
        let result = self.tree().insert(key, value).map(|_| ());
        self.finish_mutation(result)
    }

    pub fn search(&mut self, key: &K) -> Result<Option<V>> {
        self.ensure_open()?;
        let result = self.tree().search(key);
        self.guard(result)
    }

    pub fn delete(&mut self, key: &K) -> Result<bool> {
        self.ensure_open()?;
        let result = self.tree().delete(key);
        self.finish_mutation(result)
    }

    pub fn range(&mut self, query: RangeQuery<K>) -> Result<Vec<(K, V)>> {
        self.ensure_open()?;
        let result = self.tree().range(query);
        self.guard(result)
    }

    pub fn entries(&mut self) -> Result<Vec<(K, V)>> {
        self.ensure_open()?;
        let result = self.tree().entries();
        self.guard(result)
    }

    /// Drops every entry but keeps the file and its configuration:
    /// equivalent to destroy + re-create.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.clear_inner();
        self.finish_mutation(result)
    }

    fn clear_inner(&mut self) -> Result<()> {
        self.pool.clear();
        self.device.truncate(FILE_HEADER_SIZE as u64)?;
        self.header.set_root_offset(0);
        self.header.set_height(0);
        self.header.set_node_count(0);
        self.header.set_key_count(0);
        self.header.set_free_list_head(0);
        self.header.set_total_file_size(FILE_HEADER_SIZE as u64);
        self.tree().create_root()?;
        // A cleared store is durable immediately: the truncation already hit
        // the device, so the header and fresh root must follow it.
        self.flush_inner()?;
        debug!(name = %self.name, "store cleared");
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        if self.state == SessionState::Closed || self.state == SessionState::Poisoned {
            return Err(StoreError::Closed);
        }
        let pool_stats = self.pool.stats();
        Ok(StoreStats {
            node_count: self.header.node_count(),
            height: self.header.height(),
            key_count: self.header.key_count(),
            file_size: self.header.total_file_size(),
            cache_hit_rate: pool_stats.hit_rate(),
            cached_nodes: self.pool.len(),
        })
    }

    /// Clears existing data, then builds the tree from `entries`.
    pub fn bulk_load(
        &mut self,
        entries: Vec<(K, V)>,
        options: BulkLoadOptions,
        progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<()> {
        self.ensure_open()?;
        let result = self.clear_inner().and_then(|()| {
            self.tree()
                .bulk_build(entries, options.sorted, options.batch_size, progress)
        });
        self.finish_mutation(result)
    }

    /// Structural audit of the flushed on-disk image; see the tree-level
    /// documentation for the checks performed.
    pub fn verify(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let result = self
            .flush_inner()
            .and_then(|()| self.tree().verify());
        self.guard(result)
    }

    /// Writes every dirty node and the sealed header, then syncs the device.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self
            .flush_inner()
            .and_then(|()| self.device.flush());
        self.guard(result)
    }

    fn flush_inner(&mut self) -> Result<()> {
        self.pool
            .flush(&mut *self.device, &self.codec)?;
        self.write_header()
    }

    /// Flushes and releases. Subsequent operations answer `Closed`.
    pub fn close(&mut self) -> Result<()> {
        if self.state != SessionState::Open {
            self.state = SessionState::Closed;
            return Ok(());
        }
        let result = self
            .flush_inner()
            .and_then(|()| self.device.flush());
        self.state = SessionState::Closed;
        self.pool.clear();
        info!(name = %self.name, "store closed");
        result
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn tree(&mut self) -> BTree<'_, K, V> {
        BTree {
            device: &mut *self.device,
            header: &mut self.header,
            pool: &mut self.pool,
            codec: &self.codec,
            alloc: self.alloc,
            cmp: self.cmp.clone(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Closed | SessionState::Poisoned => Err(StoreError::Closed),
        }
    }

    /// Poisons the session on fatal errors so later operations answer
    /// `Closed` until re-open.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.state = SessionState::Poisoned;
                debug!(name = %self.name, error = %e, "session poisoned");
            }
        }
        result
    }

    /// Mutation epilogue: in write-through mode the sealed header follows the
    /// node writes out immediately; write-back defers it to the next flush
    /// boundary.
    fn finish_mutation<T>(&mut self, result: Result<T>) -> Result<T> {
        let result = self.guard(result);
        if result.is_ok() && self.pool.mode() == WriteMode::WriteThrough {
            let write = self.write_header();
            self.guard(write)?;
        }
        result
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.seal();
        self.device.write(0, self.header.as_bytes())?;
        Ok(())
    }
}

/// For fixed-size codecs the page is widened so a worst-case node of
/// `order - 1` entries always fits; variable codecs keep the configured page
/// and rely on byte-aware splitting.
fn effective_page_size<K, V>(config: &StoreConfig<K, V>) -> u32 {
    let (Some(key_size), Some(value_size)) = (
        config.key_codec.fixed_size(),
        config.value_codec.fixed_size(),
    ) else {
        return config.page_size;
    };

    let max_keys = config.order.saturating_sub(1) as usize;
    let worst_leaf = NODE_HEADER_SIZE + max_keys * (key_size + value_size);
    let worst_internal =
        NODE_HEADER_SIZE + max_keys * key_size + config.order as usize * 8;
    let needed = worst_leaf.max(worst_internal) as u32;

    config.page_size.max(needed.next_multiple_of(256))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{I32Codec, StringCodec};
    use tempfile::{tempdir, TempDir};

    fn config() -> StoreConfig<i32, String> {
        StoreConfig::new(Box::new(I32Codec), Box::new(StringCodec))
            .with_order(4)
            .with_cache_capacity(16)
            .with_page_size(512)
    }

    fn temp_store(name: &str) -> (TempDir, String) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name).display().to_string();
        (dir, path)
    }

    #[test]
    fn create_insert_reopen_roundtrip() {
        let (_dir, path) = temp_store("t.bt");
        {
            let mut store = Store::create(&path, config()).unwrap();
            for i in 0..20 {
                store.insert(i, format!("v{}", i)).unwrap();
            }
            store.close().unwrap();
        }

        let mut store = Store::open(&path, config()).unwrap();
        assert_eq!(store.stats().unwrap().key_count, 20);
        for i in 0..20 {
            assert_eq!(store.search(&i).unwrap(), Some(format!("v{}", i)));
        }
        assert!(store.verify().unwrap());
    }

    #[test]
    fn initialize_dispatches_on_open_existing() {
        let (_dir, path) = temp_store("t.bt");

        assert!(matches!(
            Store::<i32, String>::initialize(&path, config(), true),
            Err(StoreError::NotFound(_))
        ));

        Store::initialize(&path, config(), false).unwrap().close().unwrap();

        assert!(matches!(
            Store::<i32, String>::initialize(&path, config(), false),
            Err(StoreError::AlreadyExists(_))
        ));
        Store::<i32, String>::initialize(&path, config(), true).unwrap();
    }

    #[test]
    fn open_rejects_codec_mismatch() {
        let (_dir, path) = temp_store("t.bt");
        Store::create(&path, config()).unwrap().close().unwrap();

        let wrong: StoreConfig<String, String> =
            StoreConfig::new(Box::new(StringCodec), Box::new(StringCodec));
        let err = Store::open(&path, wrong).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert!(err.to_string().contains("i32"));
    }

    #[test]
    fn stored_order_wins_on_reopen() {
        let (_dir, path) = temp_store("t.bt");
        Store::create(&path, config().with_order(8))
            .unwrap()
            .close()
            .unwrap();

        let store = Store::open(&path, config().with_order(32)).unwrap();
        assert_eq!(store.header.order(), 8);
    }

    #[test]
    fn write_back_defers_until_flush() {
        let (_dir, path) = temp_store("t.bt");
        let mut store = Store::create(
            &path,
            config().with_write_mode(WriteMode::WriteBack),
        )
        .unwrap();

        for i in 0..10 {
            store.insert(i, format!("v{}", i)).unwrap();
        }
        store.flush().unwrap();
        store.insert(99, "late".into()).unwrap();
        store.close().unwrap();

        let mut reopened = Store::open(&path, config()).unwrap();
        assert_eq!(reopened.search(&99).unwrap(), Some("late".into()));
        assert_eq!(reopened.stats().unwrap().key_count, 11);
    }

    #[test]
    fn clear_preserves_configuration() {
        let (_dir, path) = temp_store("t.bt");
        let mut store = Store::create(&path, config()).unwrap();
        for i in 0..30 {
            store.insert(i, format!("v{}", i)).unwrap();
        }

        store.clear().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.key_count, 0);
        assert_eq!(stats.node_count, 1);
        assert_eq!(stats.height, 1);
        assert!(store.entries().unwrap().is_empty());
        assert!(store.verify().unwrap());

        // Still usable with the same layout.
        store.insert(1, "one".into()).unwrap();
        assert_eq!(store.search(&1).unwrap(), Some("one".into()));
    }

    #[test]
    fn stats_report_tree_and_cache_shape() {
        let (_dir, path) = temp_store("t.bt");
        let mut store = Store::create(&path, config()).unwrap();
        for i in 0..17 {
            store.insert(i, format!("v{}", i)).unwrap();
        }
        for i in 0..17 {
            store.search(&i).unwrap();
        }

        let stats = store.stats().unwrap();
        assert_eq!(stats.key_count, 17);
        assert!(stats.height >= 2);
        assert!(stats.node_count >= 5);
        assert_eq!(stats.file_size, 512 + stats.node_count * 512);
        assert!(stats.cache_hit_rate > 0.0);
        assert!(stats.cached_nodes > 0);
    }

    #[test]
    fn operations_after_close_fail() {
        let (_dir, path) = temp_store("t.bt");
        let mut store = Store::create(&path, config()).unwrap();
        store.insert(1, "one".into()).unwrap();
        store.close().unwrap();

        assert!(matches!(store.insert(2, "two".into()), Err(StoreError::Closed)));
        assert!(matches!(store.search(&1), Err(StoreError::Closed)));
        assert!(matches!(store.stats(), Err(StoreError::Closed)));
    }

    #[test]
    fn exists_and_destroy() {
        let (_dir, path) = temp_store("t.bt");
        assert!(!Store::<i32, String>::exists(&path));

        Store::create(&path, config()).unwrap().close().unwrap();
        assert!(Store::<i32, String>::exists(&path));

        Store::<i32, String>::destroy(&path).unwrap();
        assert!(!Store::<i32, String>::exists(&path));
        assert!(matches!(
            Store::<i32, String>::destroy(&path),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn bulk_load_replaces_existing_data() {
        let (_dir, path) = temp_store("t.bt");
        let mut store = Store::create(&path, config()).unwrap();
        store.insert(999, "old".into()).unwrap();

        let entries: Vec<(i32, String)> = (0..50).map(|i| (i, format!("v{}", i))).collect();
        store
            .bulk_load(entries, BulkLoadOptions { sorted: true, batch_size: 10 }, None)
            .unwrap();

        assert_eq!(store.search(&999).unwrap(), None);
        assert_eq!(store.stats().unwrap().key_count, 50);
        assert!(store.verify().unwrap());
    }

    #[test]
    fn fixed_size_codecs_widen_small_pages() {
        let cfg: StoreConfig<i32, i32> =
            StoreConfig::new(Box::new(I32Codec), Box::new(I32Codec))
                .with_order(128)
                .with_page_size(512);
        // 127 entries of 8 bytes plus the header cannot fit 512 bytes.
        let widened = effective_page_size(&cfg);
        assert!(widened > 512);
        assert_eq!(widened % 256, 0);
    }

    #[test]
    fn corruption_poisons_the_session() {
        let (_dir, path) = temp_store("t.bt");
        let mut store = Store::create(&path, config()).unwrap();
        for i in 0..17 {
            store.insert(i, format!("v{}", i)).unwrap();
        }
        store.flush().unwrap();

        // Flip a payload byte in some non-root page, then drop the cache so
        // the next read sees the disk.
        let root = store.header.root_offset();
        let victim = (512..store.header.total_file_size())
            .step_by(512)
            .find(|&off| off != root)
            .unwrap();
        let mut page = store.device.read(victim, 512).unwrap();
        page[NODE_HEADER_SIZE] ^= 0x01;
        store.device.write(victim, &page).unwrap();
        store.pool.clear();

        let mut saw_corruption = false;
        for i in 0..17 {
            match store.search(&i) {
                Err(StoreError::Corruption(_)) => {
                    saw_corruption = true;
                    break;
                }
                Err(StoreError::Closed) => break,
                _ => {}
            }
        }
        assert!(saw_corruption);
        assert!(matches!(store.search(&0), Err(StoreError::Closed)));
    }
}
