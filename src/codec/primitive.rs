//! Primitive codecs: integers, floats, strings, booleans.
//!
//! All multi-byte encodings are little-endian. Strings are length-prefixed
//! UTF-8; decoding validates the bytes and fails with a codec error on
//! malformed input rather than replacing characters.

use super::{read_len_prefix, write_len_prefix, Codec};
use crate::config::LENGTH_PREFIX_SIZE;
use crate::error::{Result, StoreError};

/// 32-bit signed little-endian integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct I32Codec;

impl Codec for I32Codec {
    type Item = i32;

    fn encode(&self, item: &i32, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&item.to_le_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<(i32, usize)> {
        let raw: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| StoreError::codec(format!("truncated i32: {} bytes", bytes.len())))?;
        Ok((i32::from_le_bytes(raw), 4))
    }

    fn encoded_size(&self, _item: &i32) -> usize {
        4
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(4)
    }

    fn tag(&self) -> &'static str {
        "i32"
    }
}

/// IEEE-754 64-bit little-endian floats.
#[derive(Debug, Clone, Copy, Default)]
pub struct F64Codec;

impl Codec for F64Codec {
    type Item = f64;

    fn encode(&self, item: &f64, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&item.to_le_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<(f64, usize)> {
        let raw: [u8; 8] = bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| StoreError::codec(format!("truncated f64: {} bytes", bytes.len())))?;
        Ok((f64::from_le_bytes(raw), 8))
    }

    fn encoded_size(&self, _item: &f64) -> usize {
        8
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(8)
    }

    fn tag(&self) -> &'static str {
        "f64"
    }
}

/// Length-prefixed UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Item = String;

    fn encode(&self, item: &String, buf: &mut Vec<u8>) -> Result<()> {
        write_len_prefix(item.len(), buf)?;
        buf.extend_from_slice(item.as_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<(String, usize)> {
        let len = read_len_prefix(bytes)?;
        let raw = &bytes[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len];
        let s = std::str::from_utf8(raw)
            .map_err(|e| StoreError::codec(format!("invalid utf-8 in string field: {}", e)))?;
        Ok((s.to_owned(), LENGTH_PREFIX_SIZE + len))
    }

    fn encoded_size(&self, item: &String) -> usize {
        LENGTH_PREFIX_SIZE + item.len()
    }

    fn tag(&self) -> &'static str {
        "utf8"
    }
}

/// Single-byte booleans: 0 = false, 1 = true, anything else is corruption of
/// the payload and decodes as a codec error.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolCodec;

impl Codec for BoolCodec {
    type Item = bool;

    fn encode(&self, item: &bool, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(u8::from(*item));
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<(bool, usize)> {
        match bytes.first() {
            Some(0) => Ok((false, 1)),
            Some(1) => Ok((true, 1)),
            Some(b) => Err(StoreError::codec(format!("invalid bool byte: {:#04x}", b))),
            None => Err(StoreError::codec("truncated bool: empty payload")),
        }
    }

    fn encoded_size(&self, _item: &bool) -> usize {
        1
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(1)
    }

    fn tag(&self) -> &'static str {
        "bool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32_roundtrip_and_endianness() {
        let codec = I32Codec;
        let mut buf = Vec::new();
        codec.encode(&-2, &mut buf).unwrap();

        assert_eq!(buf, [0xFE, 0xFF, 0xFF, 0xFF]);
        assert_eq!(codec.decode(&buf).unwrap(), (-2, 4));
    }

    #[test]
    fn i32_rejects_truncation() {
        assert!(I32Codec.decode(&[1, 2]).is_err());
    }

    #[test]
    fn f64_roundtrip() {
        let codec = F64Codec;
        let mut buf = Vec::new();
        codec.encode(&-1234.5678, &mut buf).unwrap();

        let (back, used) = codec.decode(&buf).unwrap();
        assert_eq!(back, -1234.5678);
        assert_eq!(used, 8);
    }

    #[test]
    fn string_frames_with_length_prefix() {
        let codec = StringCodec;
        let mut buf = Vec::new();
        codec.encode(&"héllo".to_string(), &mut buf).unwrap();

        assert_eq!(&buf[..4], &6u32.to_le_bytes());
        let (back, used) = codec.decode(&buf).unwrap();
        assert_eq!(back, "héllo");
        assert_eq!(used, buf.len());
        assert_eq!(codec.encoded_size(&"héllo".to_string()), buf.len());
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut buf = Vec::new();
        write_len_prefix(2, &mut buf).unwrap();
        buf.extend_from_slice(&[0xFF, 0xFE]);

        assert!(StringCodec.decode(&buf).is_err());
    }

    #[test]
    fn empty_string_is_just_a_prefix() {
        let codec = StringCodec;
        let mut buf = Vec::new();
        codec.encode(&String::new(), &mut buf).unwrap();

        assert_eq!(buf.len(), 4);
        assert_eq!(codec.decode(&buf).unwrap(), (String::new(), 4));
    }

    #[test]
    fn bool_roundtrip_and_junk_byte() {
        let codec = BoolCodec;
        let mut buf = Vec::new();
        codec.encode(&true, &mut buf).unwrap();
        codec.encode(&false, &mut buf).unwrap();

        assert_eq!(buf, [1, 0]);
        assert_eq!(codec.decode(&buf).unwrap(), (true, 1));
        assert_eq!(codec.decode(&buf[1..]).unwrap(), (false, 1));
        assert!(codec.decode(&[7]).is_err());
    }
}
