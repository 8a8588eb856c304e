//! # Buffer Pool
//!
//! An LRU cache of decoded nodes keyed by file offset. The pool is the only
//! path between the tree engine and node pages on the block device: reads go
//! through [`BufferPool::load`], writes through [`BufferPool::put`].
//!
//! ## Recency Structure
//!
//! ```text
//! index: HashMap<offset, slot>        O(1) lookup
//! slots: Vec<Option<Slot>>            stable arena, freed slots recycled
//! recency: intrusive doubly-linked list through the slots
//!
//!   head (least recent) <-> ... <-> tail (most recent)
//! ```
//!
//! Touching an entry unlinks it and relinks at the tail in O(1); eviction
//! always takes the head.
//!
//! ## Write Policies
//!
//! - **Write-through**: `put` encodes and writes the page before caching the
//!   node clean. Every committed mutation is on the device when the operation
//!   returns.
//! - **Write-back**: `put` caches the node dirty. Dirty entries reach the
//!   device on eviction, on [`BufferPool::flush`], or at close. An eviction
//!   write failure propagates and poisons the session at the store level.
//!
//! ## Guarantees
//!
//! - a `load` after a `put` of the same offset returns the cached node
//!   without touching the device;
//! - a dirty entry is never dropped from the cache without being written;
//! - `flush` writes every dirty entry and marks it clean;
//! - capacity is enforced after every insertion.

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::btree::node::{Node, NodeCodec};
use crate::error::Result;
use crate::storage::device::BlockDevice;

const NIL: usize = usize::MAX;

/// Cache policy for propagating dirty nodes to the block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    WriteThrough,
    WriteBack,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot<K, V> {
    node: Node<K, V>,
    dirty: bool,
    prev: usize,
    next: usize,
}

pub struct BufferPool<K, V> {
    slots: Vec<Option<Slot<K, V>>>,
    free_slots: Vec<usize>,
    index: HashMap<u64, usize>,
    head: usize,
    tail: usize,
    capacity: usize,
    mode: WriteMode,
    stats: PoolStats,
}

impl<K: Clone, V: Clone> BufferPool<K, V> {
    pub fn new(capacity: usize, mode: WriteMode) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            free_slots: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
            mode,
            stats: PoolStats::default(),
        }
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Returns the node at `offset`, reading and decoding it on a miss.
    ///
    /// The returned reference is valid until the next pool mutation; callers
    /// that mutate clone the node and submit it back through [`put`].
    ///
    /// [`put`]: BufferPool::put
    pub fn load(
        &mut self,
        offset: u64,
        device: &mut dyn BlockDevice,
        codec: &NodeCodec<K, V>,
    ) -> Result<&Node<K, V>> {
        if let Some(&slot) = self.index.get(&offset) {
            self.stats.hits += 1;
            self.touch(slot);
            return Ok(&self.slots[slot].as_ref().expect("indexed slot").node);
        }

        self.stats.misses += 1;
        let page = device.read(offset, codec.page_size() as usize)?;
        let node = codec.decode(offset, &page)?;
        trace!(offset, "buffer pool miss, node loaded");

        let slot = self.insert(offset, node, false, device, codec)?;
        Ok(&self.slots[slot].as_ref().expect("inserted slot").node)
    }

    /// Submits a (possibly mutated) node to the pool.
    ///
    /// Write-through encodes and writes before caching clean; write-back
    /// caches dirty. Either way the cached copy is what the next `load`
    /// returns.
    pub fn put(
        &mut self,
        node: Node<K, V>,
        device: &mut dyn BlockDevice,
        codec: &NodeCodec<K, V>,
    ) -> Result<()> {
        let offset = node.offset();
        let dirty = match self.mode {
            WriteMode::WriteThrough => {
                let page = codec.encode(&node)?;
                device.write(offset, &page)?;
                false
            }
            WriteMode::WriteBack => true,
        };

        if let Some(&slot) = self.index.get(&offset) {
            let entry = self.slots[slot].as_mut().expect("indexed slot");
            entry.node = node;
            entry.dirty = entry.dirty || dirty;
            self.touch(slot);
            return Ok(());
        }

        self.insert(offset, node, dirty, device, codec)?;
        Ok(())
    }

    /// Drops the entry for a freed page without writing it.
    ///
    /// Only the allocator calls this, after the page has been unlinked from
    /// the tree; a dirty copy of a freed node must not survive in the cache.
    pub fn discard(&mut self, offset: u64) {
        if let Some(slot) = self.index.remove(&offset) {
            self.unlink(slot);
            self.slots[slot] = None;
            self.free_slots.push(slot);
        }
    }

    /// Writes every dirty entry and marks it clean. Returns how many were
    /// written.
    pub fn flush(
        &mut self,
        device: &mut dyn BlockDevice,
        codec: &NodeCodec<K, V>,
    ) -> Result<usize> {
        let mut flushed = 0usize;
        let dirty_slots: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&s| self.slots[s].as_ref().is_some_and(|e| e.dirty))
            .collect();

        for slot in dirty_slots {
            let entry = self.slots[slot].as_mut().expect("indexed slot");
            let page = codec.encode(&entry.node)?;
            device.write(entry.node.offset(), &page)?;
            entry.dirty = false;
            flushed += 1;
        }

        if flushed > 0 {
            debug!(flushed, "buffer pool flushed");
        }
        Ok(flushed)
    }

    /// Flushes, then empties the pool. Statistics survive for reporting.
    pub fn close(
        &mut self,
        device: &mut dyn BlockDevice,
        codec: &NodeCodec<K, V>,
    ) -> Result<()> {
        self.flush(device, codec)?;
        self.clear();
        Ok(())
    }

    /// Empties the pool without writing anything.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_slots.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn insert(
        &mut self,
        offset: u64,
        node: Node<K, V>,
        dirty: bool,
        device: &mut dyn BlockDevice,
        codec: &NodeCodec<K, V>,
    ) -> Result<usize> {
        while self.index.len() >= self.capacity {
            self.evict_lru(device, codec)?;
        }

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(Slot {
                    node,
                    dirty,
                    prev: NIL,
                    next: NIL,
                });
                slot
            }
            None => {
                self.slots.push(Some(Slot {
                    node,
                    dirty,
                    prev: NIL,
                    next: NIL,
                }));
                self.slots.len() - 1
            }
        };

        self.index.insert(offset, slot);
        self.link_tail(slot);
        Ok(slot)
    }

    fn evict_lru(
        &mut self,
        device: &mut dyn BlockDevice,
        codec: &NodeCodec<K, V>,
    ) -> Result<()> {
        let victim = self.head;
        debug_assert_ne!(victim, NIL, "evict on empty pool");

        let entry = self.slots[victim].as_ref().expect("linked slot");
        let offset = entry.node.offset();
        if entry.dirty {
            let page = codec.encode(&entry.node)?;
            device.write(offset, &page)?;
            trace!(offset, "dirty node written back on eviction");
        }

        self.unlink(victim);
        self.index.remove(&offset);
        self.slots[victim] = None;
        self.free_slots.push(victim);
        self.stats.evictions += 1;
        Ok(())
    }

    fn touch(&mut self, slot: usize) {
        if self.tail == slot {
            return;
        }
        self.unlink(slot);
        self.link_tail(slot);
    }

    fn link_tail(&mut self, slot: usize) {
        let entry = self.slots[slot].as_mut().expect("slot present");
        entry.prev = self.tail;
        entry.next = NIL;

        if self.tail != NIL {
            self.slots[self.tail].as_mut().expect("tail slot").next = slot;
        }
        self.tail = slot;
        if self.head == NIL {
            self.head = slot;
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = self.slots[slot].as_ref().expect("slot present");
            (entry.prev, entry.next)
        };

        if prev != NIL {
            self.slots[prev].as_mut().expect("prev slot").next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].as_mut().expect("next slot").prev = prev;
        } else {
            self.tail = prev;
        }

        let entry = self.slots[slot].as_mut().expect("slot present");
        entry.prev = NIL;
        entry.next = NIL;
    }
}
