//! Store configuration.
//!
//! A config bundles the codecs, the comparator and the tuning knobs. Layout
//! parameters (`order`, `page_size`) are fixed into the file header at
//! creation time; on re-open the stored values win over whatever the caller
//! passes, and only the codecs and runtime knobs (cache capacity, write mode)
//! are taken from the config.

use crate::btree::{natural_order, KeyComparator};
use crate::codec::Codec;
use crate::config::{DEFAULT_CACHE_CAPACITY, DEFAULT_ORDER, DEFAULT_PAGE_SIZE};
use crate::storage::WriteMode;

pub struct StoreConfig<K, V> {
    /// Branching factor: max children per internal node.
    pub order: u32,
    /// Buffer-pool capacity in cached nodes.
    pub cache_capacity: usize,
    pub write_mode: WriteMode,
    /// Node page size in bytes. Widened automatically when fixed-size codecs
    /// would overflow a worst-case node.
    pub page_size: u32,
    /// Reserved: persisted as a header flag, no recovery protocol yet.
    pub enable_transaction_log: bool,
    pub key_codec: Box<dyn Codec<Item = K>>,
    pub value_codec: Box<dyn Codec<Item = V>>,
    pub compare_keys: KeyComparator<K>,
}

impl<K: Ord + 'static, V> StoreConfig<K, V> {
    /// A config with the default knobs and the key type's natural order.
    pub fn new(
        key_codec: Box<dyn Codec<Item = K>>,
        value_codec: Box<dyn Codec<Item = V>>,
    ) -> Self {
        Self {
            order: DEFAULT_ORDER,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            write_mode: WriteMode::default(),
            page_size: DEFAULT_PAGE_SIZE,
            enable_transaction_log: false,
            key_codec,
            value_codec,
            compare_keys: natural_order::<K>(),
        }
    }
}

impl<K, V> StoreConfig<K, V> {
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_comparator(mut self, compare_keys: KeyComparator<K>) -> Self {
        self.compare_keys = compare_keys;
        self
    }
}

/// Options for [`crate::store::Store::bulk_load`].
#[derive(Debug, Clone, Copy)]
pub struct BulkLoadOptions {
    /// Skip the sort when the input is already in ascending key order.
    pub sorted: bool,
    /// Entries between progress callbacks.
    pub batch_size: usize,
}

impl Default for BulkLoadOptions {
    fn default() -> Self {
        Self {
            sorted: false,
            batch_size: crate::config::DEFAULT_BULK_BATCH_SIZE,
        }
    }
}
