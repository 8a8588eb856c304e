//! # Page Allocator
//!
//! Node pages are recycled through a singly-linked free list threaded through
//! the freed pages themselves: the list head lives in the file header, and
//! each freed page stores the offset of the next free page in its first eight
//! payload bytes.
//!
//! ```text
//! header.free_list_head ──> page A ──> page B ──> 0
//!                            │          │
//!                            └ next in  └ next in
//!                              payload    payload
//! ```
//!
//! Freeing tombstones the page by setting the `deleted` flag in its node
//! header, so a stale pointer that still reaches the page decodes as a
//! dangling-offset corruption instead of stale data. Allocation pops the head
//! if the list is non-empty and otherwise appends at `total_file_size`.
//!
//! The caller is responsible for dropping the freed offset from the buffer
//! pool before calling [`Allocator::free`]; a cached dirty copy of a freed
//! node must not be written back over the free-list link.

use tracing::trace;

use crate::config::NODE_HEADER_SIZE;
use crate::error::{Result, StoreError};
use crate::storage::device::BlockDevice;
use crate::storage::header::FileHeader;

/// Byte offset of the deleted flag within a node header.
const DELETED_FLAG_OFFSET: u64 = 1;

#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    page_size: u32,
}

impl Allocator {
    pub fn new(page_size: u32) -> Self {
        Self { page_size }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Returns the offset of a page for a new node, reusing a freed page when
    /// one is available. Adjusts `node_count` and, on append,
    /// `total_file_size`.
    pub fn allocate(
        &self,
        header: &mut FileHeader,
        device: &mut dyn BlockDevice,
    ) -> Result<u64> {
        let offset = if header.free_list_head() != 0 {
            let offset = header.free_list_head();
            let next = self.read_next_free(device, offset)?;
            header.set_free_list_head(next);
            trace!(offset, next, "page reused from free list");
            offset
        } else {
            let offset = header.total_file_size();
            header.set_total_file_size(offset + self.page_size as u64);
            trace!(offset, "page appended");
            offset
        };

        header.set_node_count(header.node_count() + 1);
        Ok(offset)
    }

    /// Returns a page to the free list: tombstones the node header, threads
    /// the old list head through the page, and makes the page the new head.
    pub fn free(
        &self,
        header: &mut FileHeader,
        device: &mut dyn BlockDevice,
        offset: u64,
    ) -> Result<()> {
        if offset == 0 || offset + self.page_size as u64 > header.total_file_size() {
            return Err(StoreError::corruption(format!(
                "free of offset {} outside file of {} bytes",
                offset,
                header.total_file_size()
            )));
        }

        device.write(offset + DELETED_FLAG_OFFSET, &[1u8])?;
        device.write(
            offset + NODE_HEADER_SIZE as u64,
            &header.free_list_head().to_le_bytes(),
        )?;

        header.set_free_list_head(offset);
        let count = header.node_count();
        debug_assert!(count > 0, "free with node_count 0");
        header.set_node_count(count.saturating_sub(1));
        trace!(offset, "page freed");
        Ok(())
    }

    fn read_next_free(&self, device: &mut dyn BlockDevice, offset: u64) -> Result<u64> {
        let raw = device.read(offset + NODE_HEADER_SIZE as u64, 8)?;
        let next = u64::from_le_bytes(raw.try_into().expect("8-byte read"));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::padded_tag;
    use crate::storage::device::FileDevice;
    use tempfile::tempdir;

    const PAGE: u32 = 256;

    fn fixture() -> (tempfile::TempDir, FileDevice, FileHeader) {
        let dir = tempdir().unwrap();
        let mut device = FileDevice::create(dir.path().join("alloc.bt")).unwrap();
        let header = FileHeader::new(
            8,
            4,
            0,
            PAGE,
            0,
            padded_tag("i32").unwrap(),
            padded_tag("utf8").unwrap(),
        )
        .unwrap();
        // Make the header range physically present.
        device.write(0, &[0u8; 512]).unwrap();
        (dir, device, header)
    }

    #[test]
    fn allocate_appends_past_the_header() {
        let (_dir, mut dev, mut header) = fixture();
        let alloc = Allocator::new(PAGE);

        let a = alloc.allocate(&mut header, &mut dev).unwrap();
        let b = alloc.allocate(&mut header, &mut dev).unwrap();

        assert_eq!(a, 512);
        assert_eq!(b, 512 + PAGE as u64);
        assert_eq!(header.node_count(), 2);
        assert_eq!(header.total_file_size(), 512 + 2 * PAGE as u64);
    }

    #[test]
    fn free_then_allocate_reuses_lifo() {
        let (_dir, mut dev, mut header) = fixture();
        let alloc = Allocator::new(PAGE);

        let a = alloc.allocate(&mut header, &mut dev).unwrap();
        let b = alloc.allocate(&mut header, &mut dev).unwrap();
        // Pages must exist on disk before they can be freed and re-read.
        dev.write(a, &vec![0u8; PAGE as usize]).unwrap();
        dev.write(b, &vec![0u8; PAGE as usize]).unwrap();

        alloc.free(&mut header, &mut dev, a).unwrap();
        alloc.free(&mut header, &mut dev, b).unwrap();
        assert_eq!(header.node_count(), 0);
        assert_eq!(header.free_list_head(), b);

        assert_eq!(alloc.allocate(&mut header, &mut dev).unwrap(), b);
        assert_eq!(alloc.allocate(&mut header, &mut dev).unwrap(), a);
        assert_eq!(header.free_list_head(), 0);
        assert_eq!(header.node_count(), 2);
        // No growth: both came from the free list.
        assert_eq!(header.total_file_size(), 512 + 2 * PAGE as u64);
    }

    #[test]
    fn free_tombstones_the_page() {
        let (_dir, mut dev, mut header) = fixture();
        let alloc = Allocator::new(PAGE);

        let a = alloc.allocate(&mut header, &mut dev).unwrap();
        dev.write(a, &vec![0u8; PAGE as usize]).unwrap();
        alloc.free(&mut header, &mut dev, a).unwrap();

        let page = dev.read(a, PAGE as usize).unwrap();
        assert_eq!(page[1], 1, "deleted flag set");
    }

    #[test]
    fn free_rejects_out_of_range_offset() {
        let (_dir, mut dev, mut header) = fixture();
        let alloc = Allocator::new(PAGE);

        assert!(alloc.free(&mut header, &mut dev, 0).is_err());
        let out_of_range = header.total_file_size();
        assert!(alloc.free(&mut header, &mut dev, out_of_range).is_err());
    }
}
