//! # CRC-32 Integrity Checksums
//!
//! Both the file header (bytes `[12, 512)`) and every node payload carry a
//! CRC-32 in the reflected IEEE form: polynomial 0xEDB88320, initial value
//! 0xFFFFFFFF, final XOR 0xFFFFFFFF. The `crc` crate's `CRC_32_ISO_HDLC`
//! parameter set is exactly that algorithm, table-driven.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One-shot CRC-32 over a byte range.
pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Streaming CRC-32 for callers that assemble the covered range in pieces.
pub struct Crc32Digest {
    digest: Digest<'static, u32>,
}

impl Crc32Digest {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Crc32Digest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        // Standard check value for CRC-32/ISO-HDLC.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_empty_input() {
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";

        let mut digest = Crc32Digest::new();
        digest.update(&data[..10]);
        digest.update(&data[10..]);

        assert_eq!(digest.finalize(), crc32(data));
    }

    #[test]
    fn single_bit_flip_changes_checksum() {
        let mut data = vec![0xA5u8; 256];
        let before = crc32(&data);
        data[100] ^= 0x01;

        assert_ne!(crc32(&data), before);
    }
}
