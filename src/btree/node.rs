//! # Node Model and Codec
//!
//! A node occupies one page at a byte offset that never changes for its
//! lifetime. The decoded form lives in the buffer pool; the encoded form is a
//! 64-byte header followed by a checksummed payload, zero-padded to the page
//! size.
//!
//! ## Node Header Layout (64 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------
//! 0       1     node_type         1 = leaf, 2 = internal
//! 1       1     deleted           set when the page sits on the free list
//! 2       2     key_count
//! 4       4     checksum          CRC-32 over the payload bytes only
//! 8       8     node_id           equals the node's byte offset
//! 16      8     parent_offset
//! 24      8     left_sibling_offset
//! 32      8     right_sibling_offset
//! 40      8     created_at        unix millis
//! 48      8     modified_at       unix millis
//! 56      8     reserved
//! ```
//!
//! ## Payload Layout
//!
//! Leaves concatenate entries; internals interleave child offsets and
//! separator keys. Variable-size codecs frame themselves with a 4-byte length
//! prefix, so the payload is self-delimiting and its exact length is recovered
//! during the decode walk.
//!
//! ```text
//! leaf:      [key0][value0][key1][value1]...
//! internal:  [child0 u64][key0][child1 u64][key1]...[keyN-1][childN u64]
//! ```
//!
//! ## Integrity
//!
//! Encoding computes the payload CRC-32 and stores it in the header. Decoding
//! re-walks the payload, recomputes the checksum over the consumed bytes and
//! fails with a corruption error on mismatch, an impossible key count, a bad
//! node type, or a tombstoned page reached through a live pointer. Any codec
//! failure while parsing a payload is reported as corruption too: the bytes
//! were checksummed when written, so a parse failure means the page no longer
//! holds what the engine wrote.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::codec::Codec;
use crate::config::{CHILD_OFFSET_SIZE, NODE_HEADER_SIZE};
use crate::error::{Result, StoreError};
use crate::storage::checksum::crc32;
use crate::storage::header::now_millis;

const NODE_TYPE_LEAF: u8 = 1;
const NODE_TYPE_INTERNAL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Internal,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    node_type: u8,
    deleted: u8,
    key_count: U16,
    checksum: U32,
    node_id: U64,
    parent_offset: U64,
    left_sibling: U64,
    right_sibling: U64,
    created_at: U64,
    modified_at: U64,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

/// A decoded node. Leaves hold `keys` and `values` of equal length; internals
/// hold `keys` and `children` with `children.len() == keys.len() + 1` and no
/// values.
#[derive(Debug, Clone)]
pub struct Node<K, V> {
    pub(crate) offset: u64,
    pub(crate) kind: NodeKind,
    pub(crate) keys: Vec<K>,
    pub(crate) values: Vec<V>,
    pub(crate) children: Vec<u64>,
    pub(crate) parent_offset: u64,
    pub(crate) left_sibling: u64,
    pub(crate) right_sibling: u64,
    pub(crate) created_at: u64,
    pub(crate) modified_at: u64,
}

impl<K, V> Node<K, V> {
    pub fn new_leaf(offset: u64) -> Self {
        let now = now_millis();
        Self {
            offset,
            kind: NodeKind::Leaf,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            parent_offset: 0,
            left_sibling: 0,
            right_sibling: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn new_internal(offset: u64) -> Self {
        let now = now_millis();
        Self {
            offset,
            kind: NodeKind::Internal,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            parent_offset: 0,
            left_sibling: 0,
            right_sibling: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn touch(&mut self) {
        self.modified_at = now_millis();
    }

    /// Index of the first key `>= key` under `cmp`, and whether it is equal.
    ///
    /// The index doubles as the child slot to descend into: ties go left, so a
    /// separator equal to the probe routes into the child at the same index.
    pub fn lower_bound(&self, key: &K, cmp: &dyn Fn(&K, &K) -> std::cmp::Ordering) -> (usize, bool) {
        let mut lo = 0usize;
        let mut hi = self.keys.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp(&self.keys[mid], key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let found = lo < self.keys.len() && cmp(&self.keys[lo], key).is_eq();
        (lo, found)
    }
}

/// Everything needed to move nodes between their decoded and on-disk forms:
/// the key and value codecs, the uniform page size and the branching factor.
pub struct NodeCodec<K, V> {
    key: Box<dyn Codec<Item = K>>,
    value: Box<dyn Codec<Item = V>>,
    page_size: u32,
    order: u32,
}

impl<K, V> NodeCodec<K, V> {
    pub fn new(
        key: Box<dyn Codec<Item = K>>,
        value: Box<dyn Codec<Item = V>>,
        page_size: u32,
        order: u32,
    ) -> Self {
        Self {
            key,
            value,
            page_size,
            order,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Max keys per node (`order - 1`).
    pub fn max_keys(&self) -> usize {
        self.order as usize - 1
    }

    pub fn key_codec(&self) -> &dyn Codec<Item = K> {
        self.key.as_ref()
    }

    pub fn value_codec(&self) -> &dyn Codec<Item = V> {
        self.value.as_ref()
    }

    pub fn payload_capacity(&self) -> usize {
        self.page_size as usize - NODE_HEADER_SIZE
    }

    /// Payload bytes the node encodes to.
    pub fn payload_size(&self, node: &Node<K, V>) -> usize {
        match node.kind {
            NodeKind::Leaf => node
                .keys
                .iter()
                .zip(&node.values)
                .map(|(k, v)| self.key.encoded_size(k) + self.value.encoded_size(v))
                .sum(),
            NodeKind::Internal => {
                let keys: usize = node.keys.iter().map(|k| self.key.encoded_size(k)).sum();
                keys + node.children.len() * CHILD_OFFSET_SIZE
            }
        }
    }

    /// Whether the node as it stands fits its page.
    pub fn node_fits(&self, node: &Node<K, V>) -> bool {
        self.payload_size(node) <= self.payload_capacity()
    }

    /// Encodes to a full zero-padded page.
    pub fn encode(&self, node: &Node<K, V>) -> Result<Vec<u8>> {
        let mut page = vec![0u8; self.page_size as usize];
        let mut payload = Vec::with_capacity(self.payload_size(node));

        match node.kind {
            NodeKind::Leaf => {
                debug_assert_eq!(node.keys.len(), node.values.len());
                for (k, v) in node.keys.iter().zip(&node.values) {
                    self.key.encode(k, &mut payload)?;
                    self.value.encode(v, &mut payload)?;
                }
            }
            NodeKind::Internal => {
                debug_assert_eq!(node.children.len(), node.keys.len() + 1);
                payload.extend_from_slice(&node.children[0].to_le_bytes());
                for (i, k) in node.keys.iter().enumerate() {
                    self.key.encode(k, &mut payload)?;
                    payload.extend_from_slice(&node.children[i + 1].to_le_bytes());
                }
            }
        }

        if NODE_HEADER_SIZE + payload.len() > self.page_size as usize {
            return Err(StoreError::Capacity(format!(
                "node at {} encodes to {} bytes, page is {}",
                node.offset,
                NODE_HEADER_SIZE + payload.len(),
                self.page_size
            )));
        }

        let header = NodeHeader {
            node_type: match node.kind {
                NodeKind::Leaf => NODE_TYPE_LEAF,
                NodeKind::Internal => NODE_TYPE_INTERNAL,
            },
            deleted: 0,
            key_count: U16::new(node.keys.len() as u16),
            checksum: U32::new(crc32(&payload)),
            node_id: U64::new(node.offset),
            parent_offset: U64::new(node.parent_offset),
            left_sibling: U64::new(node.left_sibling),
            right_sibling: U64::new(node.right_sibling),
            created_at: U64::new(node.created_at),
            modified_at: U64::new(node.modified_at),
            reserved: [0u8; 8],
        };

        page[..NODE_HEADER_SIZE].copy_from_slice(header.as_bytes());
        page[NODE_HEADER_SIZE..NODE_HEADER_SIZE + payload.len()].copy_from_slice(&payload);
        Ok(page)
    }

    /// Decodes a page read from `offset`, verifying the payload checksum.
    pub fn decode(&self, offset: u64, page: &[u8]) -> Result<Node<K, V>> {
        if page.len() < NODE_HEADER_SIZE {
            return Err(StoreError::corruption(format!(
                "page at {} too small for node header: {} bytes",
                offset,
                page.len()
            )));
        }

        let header = NodeHeader::read_from_bytes(&page[..NODE_HEADER_SIZE])
            .map_err(|e| StoreError::corruption(format!("unreadable node header at {}: {:?}", offset, e)))?;

        let kind = match header.node_type {
            NODE_TYPE_LEAF => NodeKind::Leaf,
            NODE_TYPE_INTERNAL => NodeKind::Internal,
            b => {
                return Err(StoreError::corruption(format!(
                    "invalid node type {:#04x} at offset {}",
                    b, offset
                )))
            }
        };

        if header.deleted != 0 {
            return Err(StoreError::corruption(format!(
                "dangling pointer: node at {} is on the free list",
                offset
            )));
        }

        let key_count = header.key_count.get() as usize;
        if key_count > self.max_keys() {
            return Err(StoreError::corruption(format!(
                "impossible key count {} at offset {} (max {})",
                key_count,
                offset,
                self.max_keys()
            )));
        }

        let payload = &page[NODE_HEADER_SIZE..];
        let mut pos = 0usize;
        let mut keys = Vec::with_capacity(key_count);
        let mut values = Vec::new();
        let mut children = Vec::new();

        let parse = || -> String { format!("corrupt payload at offset {}", offset) };

        match kind {
            NodeKind::Leaf => {
                values.reserve(key_count);
                for _ in 0..key_count {
                    let (k, used) = self
                        .key
                        .decode(&payload[pos..])
                        .map_err(|e| StoreError::corruption(format!("{}: {}", parse(), e)))?;
                    pos += used;
                    let (v, used) = self
                        .value
                        .decode(&payload[pos..])
                        .map_err(|e| StoreError::corruption(format!("{}: {}", parse(), e)))?;
                    pos += used;
                    keys.push(k);
                    values.push(v);
                }
            }
            NodeKind::Internal => {
                children.reserve(key_count + 1);
                children.push(read_child(payload, pos, offset)?);
                pos += CHILD_OFFSET_SIZE;
                for _ in 0..key_count {
                    let (k, used) = self
                        .key
                        .decode(&payload[pos..])
                        .map_err(|e| StoreError::corruption(format!("{}: {}", parse(), e)))?;
                    pos += used;
                    keys.push(k);
                    children.push(read_child(payload, pos, offset)?);
                    pos += CHILD_OFFSET_SIZE;
                }
            }
        }

        let stored = header.checksum.get();
        let computed = crc32(&payload[..pos]);
        if stored != computed {
            return Err(StoreError::corruption(format!(
                "node checksum mismatch at offset {}: stored {:#010x}, computed {:#010x}",
                offset, stored, computed
            )));
        }

        Ok(Node {
            offset,
            kind,
            keys,
            values,
            children,
            parent_offset: header.parent_offset.get(),
            left_sibling: header.left_sibling.get(),
            right_sibling: header.right_sibling.get(),
            created_at: header.created_at.get(),
            modified_at: header.modified_at.get(),
        })
    }
}

fn read_child(payload: &[u8], pos: usize, offset: u64) -> Result<u64> {
    let raw: [u8; CHILD_OFFSET_SIZE] = payload
        .get(pos..pos + CHILD_OFFSET_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            StoreError::corruption(format!("truncated child offset at node offset {}", offset))
        })?;
    Ok(u64::from_le_bytes(raw))
}
