//! # File Header
//!
//! Every store file begins with a fixed 512-byte header. The header is the
//! single source of truth for the tree-wide counters (`root_offset`, `height`,
//! `node_count`, `key_count`, `free_list_head`, `total_file_size`) and for the
//! layout parameters that were fixed at creation time (`order`, `node_size`,
//! codec sizes and tags).
//!
//! ## Layout (little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------
//! 0       4     magic ("BTRE")
//! 4       4     version
//! 8       4     header_checksum     CRC-32 over bytes [12, 512)
//! 12      4     order
//! 16      4     key_fixed_size      0 if variable
//! 20      4     value_fixed_size    0 if variable
//! 24      4     node_size           page size for every node
//! 28      4     flags               bit 0: transaction log (reserved)
//! 32      8     root_offset         0 = not yet created
//! 40      8     node_count
//! 48      4     height
//! 52      8     free_list_head      0 = empty
//! 60      8     total_file_size
//! 68      8     created_at          unix millis
//! 76      8     modified_at         unix millis
//! 84      8     transaction_id      reserved
//! 92      8     key_count
//! 100     16    key_codec_tag       NUL-padded ASCII
//! 116     16    value_codec_tag     NUL-padded ASCII
//! 132     380   reserved
//! ```
//!
//! ## Checksum Discipline
//!
//! `seal()` recomputes the checksum immediately before the header is written;
//! `from_bytes()` verifies magic, version and checksum and fails with a
//! corruption error on any mismatch. Mutators that change a counter also bump
//! `modified_at`; the store rewrites the sealed header at the next flush
//! boundary.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    CODEC_TAG_LEN, FILE_HEADER_SIZE, FILE_MAGIC, FORMAT_VERSION, HEADER_CHECKSUM_START, MIN_ORDER,
    NODE_HEADER_SIZE,
};
use crate::error::{Result, StoreError};
use crate::storage::checksum::crc32;

/// Milliseconds since the unix epoch; the clock for all on-disk timestamps.
pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: U32,
    version: U32,
    header_checksum: U32,
    order: U32,
    key_fixed_size: U32,
    value_fixed_size: U32,
    node_size: U32,
    flags: U32,
    root_offset: U64,
    node_count: U64,
    height: U32,
    free_list_head: U64,
    total_file_size: U64,
    created_at: U64,
    modified_at: U64,
    transaction_id: U64,
    key_count: U64,
    key_codec_tag: [u8; CODEC_TAG_LEN],
    value_codec_tag: [u8; CODEC_TAG_LEN],
    reserved: [u8; 380],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order: u32,
        key_fixed_size: u32,
        value_fixed_size: u32,
        node_size: u32,
        flags: u32,
        key_codec_tag: [u8; CODEC_TAG_LEN],
        value_codec_tag: [u8; CODEC_TAG_LEN],
    ) -> Result<Self> {
        if order < MIN_ORDER {
            return Err(StoreError::invalid(format!(
                "order {} below minimum {}",
                order, MIN_ORDER
            )));
        }
        if node_size as usize <= NODE_HEADER_SIZE {
            return Err(StoreError::invalid(format!(
                "node size {} cannot hold a {}-byte node header",
                node_size, NODE_HEADER_SIZE
            )));
        }

        let now = now_millis();
        Ok(Self {
            magic: U32::new(FILE_MAGIC),
            version: U32::new(FORMAT_VERSION),
            header_checksum: U32::new(0),
            order: U32::new(order),
            key_fixed_size: U32::new(key_fixed_size),
            value_fixed_size: U32::new(value_fixed_size),
            node_size: U32::new(node_size),
            flags: U32::new(flags),
            root_offset: U64::new(0),
            node_count: U64::new(0),
            height: U32::new(0),
            free_list_head: U64::new(0),
            total_file_size: U64::new(FILE_HEADER_SIZE as u64),
            created_at: U64::new(now),
            modified_at: U64::new(now),
            transaction_id: U64::new(0),
            key_count: U64::new(0),
            key_codec_tag,
            value_codec_tag,
            reserved: [0u8; 380],
        })
    }

    /// Parses and verifies a header read from offset 0.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(StoreError::corruption(format!(
                "file too small for header: {} < {}",
                bytes.len(),
                FILE_HEADER_SIZE
            )));
        }

        let header = Self::read_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| StoreError::corruption(format!("unreadable file header: {:?}", e)))?;

        if header.magic.get() != FILE_MAGIC {
            return Err(StoreError::corruption(format!(
                "bad magic {:#010x}, expected {:#010x}",
                header.magic.get(),
                FILE_MAGIC
            )));
        }
        if header.version.get() != FORMAT_VERSION {
            return Err(StoreError::corruption(format!(
                "unsupported format version {} (expected {})",
                header.version.get(),
                FORMAT_VERSION
            )));
        }

        let stored = header.header_checksum.get();
        let computed = header.compute_checksum();
        if stored != computed {
            return Err(StoreError::corruption(format!(
                "header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        if header.order.get() < MIN_ORDER {
            return Err(StoreError::corruption(format!(
                "impossible order {} in header",
                header.order.get()
            )));
        }

        Ok(header)
    }

    fn compute_checksum(&self) -> u32 {
        crc32(&self.as_bytes()[HEADER_CHECKSUM_START..])
    }

    /// Recomputes the checksum; call immediately before writing to disk.
    pub fn seal(&mut self) {
        self.header_checksum = U32::new(self.compute_checksum());
    }

    pub fn order(&self) -> u32 {
        self.order.get()
    }

    pub fn key_fixed_size(&self) -> u32 {
        self.key_fixed_size.get()
    }

    pub fn value_fixed_size(&self) -> u32 {
        self.value_fixed_size.get()
    }

    pub fn node_size(&self) -> u32 {
        self.node_size.get()
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn root_offset(&self) -> u64 {
        self.root_offset.get()
    }

    pub fn set_root_offset(&mut self, offset: u64) {
        self.root_offset = U64::new(offset);
        self.touch();
    }

    pub fn node_count(&self) -> u64 {
        self.node_count.get()
    }

    pub fn set_node_count(&mut self, count: u64) {
        self.node_count = U64::new(count);
        self.touch();
    }

    pub fn height(&self) -> u32 {
        self.height.get()
    }

    pub fn set_height(&mut self, height: u32) {
        self.height = U32::new(height);
        self.touch();
    }

    pub fn free_list_head(&self) -> u64 {
        self.free_list_head.get()
    }

    pub fn set_free_list_head(&mut self, offset: u64) {
        self.free_list_head = U64::new(offset);
        self.touch();
    }

    pub fn total_file_size(&self) -> u64 {
        self.total_file_size.get()
    }

    pub fn set_total_file_size(&mut self, size: u64) {
        self.total_file_size = U64::new(size);
        self.touch();
    }

    pub fn created_at(&self) -> u64 {
        self.created_at.get()
    }

    pub fn modified_at(&self) -> u64 {
        self.modified_at.get()
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id.get()
    }

    pub fn key_count(&self) -> u64 {
        self.key_count.get()
    }

    pub fn set_key_count(&mut self, count: u64) {
        self.key_count = U64::new(count);
        self.touch();
    }

    pub fn key_codec_tag(&self) -> &[u8; CODEC_TAG_LEN] {
        &self.key_codec_tag
    }

    pub fn value_codec_tag(&self) -> &[u8; CODEC_TAG_LEN] {
        &self.value_codec_tag
    }

    fn touch(&mut self) {
        self.modified_at = U64::new(now_millis());
    }
}
