//! # Key and Value Codecs
//!
//! The engine is generic over the binary encoding of keys and values. A codec
//! turns a user type into a byte sequence inside a node payload and back.
//!
//! ## Framing
//!
//! Fixed-size codecs write their bytes raw; `fixed_size()` tells the node
//! codec how many bytes to consume on decode. Variable-size codecs always
//! frame themselves with a 4-byte little-endian unsigned length prefix, so a
//! payload can be parsed entry by entry without an external index.
//!
//! ```text
//! fixed:     [ raw bytes (fixed_size) ]
//! variable:  [ len u32 LE ][ len bytes ]
//! ```
//!
//! ## Tags
//!
//! Every codec carries a short ASCII tag (at most 16 bytes). The tags of the
//! key and value codecs are persisted NUL-padded in the file header and are
//! checked on re-open: a store written with one encoding refuses to open under
//! an incompatible one.
//!
//! ## Provided Codecs
//!
//! - [`I32Codec`] — 32-bit signed little-endian integers
//! - [`F64Codec`] — IEEE-754 64-bit little-endian floats
//! - [`StringCodec`] — length-prefixed UTF-8
//! - [`BoolCodec`] — a single byte
//! - [`BigIntCodec`] — sign byte + length-prefixed magnitude
//! - [`JsonCodec`] — length-prefixed UTF-8 JSON for arbitrary serde types
//! - [`PairCodec`] — two codecs concatenated in a fixed order

mod bigint;
mod composite;
mod primitive;

pub use bigint::{BigInt, BigIntCodec};
pub use composite::{JsonCodec, PairCodec};
pub use primitive::{BoolCodec, F64Codec, I32Codec, StringCodec};

use crate::config::{CODEC_TAG_LEN, LENGTH_PREFIX_SIZE};
use crate::error::{Result, StoreError};

/// Binary encoding for one user-visible type.
///
/// `decode` returns the decoded item together with the number of payload bytes
/// it consumed, so entries can be parsed sequentially.
pub trait Codec: Send {
    type Item;

    fn encode(&self, item: &Self::Item, buf: &mut Vec<u8>) -> Result<()>;

    fn decode(&self, bytes: &[u8]) -> Result<(Self::Item, usize)>;

    /// Encoded size in bytes, including framing.
    fn encoded_size(&self, item: &Self::Item) -> usize;

    /// `Some(n)` when every item encodes to exactly `n` bytes (no framing).
    fn fixed_size(&self) -> Option<usize> {
        None
    }

    /// Identifier persisted in the file header; ASCII, at most 16 bytes.
    fn tag(&self) -> &'static str;
}

/// Writes a 4-byte little-endian length prefix.
pub(crate) fn write_len_prefix(len: usize, buf: &mut Vec<u8>) -> Result<()> {
    let len32 = u32::try_from(len)
        .map_err(|_| StoreError::codec(format!("field of {} bytes exceeds u32 framing", len)))?;
    buf.extend_from_slice(&len32.to_le_bytes());
    Ok(())
}

/// Reads a 4-byte little-endian length prefix and bounds-checks the framed
/// field against the remaining payload.
pub(crate) fn read_len_prefix(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(StoreError::codec(format!(
            "truncated length prefix: {} < {}",
            bytes.len(),
            LENGTH_PREFIX_SIZE
        )));
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if bytes.len() < LENGTH_PREFIX_SIZE + len {
        return Err(StoreError::codec(format!(
            "framed field of {} bytes overruns payload of {}",
            len,
            bytes.len() - LENGTH_PREFIX_SIZE
        )));
    }
    Ok(len)
}

/// Pads a codec tag to its NUL-padded on-disk form.
pub fn padded_tag(tag: &str) -> Result<[u8; CODEC_TAG_LEN]> {
    if !tag.is_ascii() || tag.len() > CODEC_TAG_LEN {
        return Err(StoreError::invalid(format!(
            "codec tag '{}' must be ASCII and at most {} bytes",
            tag, CODEC_TAG_LEN
        )));
    }
    let mut out = [0u8; CODEC_TAG_LEN];
    out[..tag.len()].copy_from_slice(tag.as_bytes());
    Ok(out)
}

/// Recovers the tag string from its NUL-padded on-disk form.
pub fn unpadded_tag(raw: &[u8; CODEC_TAG_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(CODEC_TAG_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_prefix_roundtrip() {
        let mut buf = Vec::new();
        write_len_prefix(300, &mut buf).unwrap();
        buf.extend_from_slice(&[0u8; 300]);

        assert_eq!(read_len_prefix(&buf).unwrap(), 300);
    }

    #[test]
    fn len_prefix_rejects_truncated_field() {
        let mut buf = Vec::new();
        write_len_prefix(8, &mut buf).unwrap();
        buf.extend_from_slice(&[1, 2, 3]);

        let err = read_len_prefix(&buf).unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)));
    }

    #[test]
    fn len_prefix_rejects_short_buffer() {
        assert!(read_len_prefix(&[1, 2]).is_err());
    }

    #[test]
    fn tag_padding_roundtrip() {
        let padded = padded_tag("utf8").unwrap();
        assert_eq!(&padded[..4], b"utf8");
        assert_eq!(padded[4], 0);
        assert_eq!(unpadded_tag(&padded), "utf8");
    }

    #[test]
    fn tag_rejects_oversized() {
        assert!(padded_tag("a-tag-that-is-way-too-long").is_err());
    }
}
