//! Composite codecs: JSON values and field pairs.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{read_len_prefix, write_len_prefix, Codec};
use crate::config::LENGTH_PREFIX_SIZE;
use crate::error::{Result, StoreError};

/// Length-prefixed UTF-8 JSON for any serde-compatible type.
///
/// `serde_json::Value` gives schemaless structured values; a concrete
/// `Deserialize` type gives typed rows. Either way the payload bytes are the
/// canonical compact JSON encoding.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec for JsonCodec<T> {
    type Item = T;

    fn encode(&self, item: &T, buf: &mut Vec<u8>) -> Result<()> {
        let json = serde_json::to_vec(item)
            .map_err(|e| StoreError::codec(format!("json encode failed: {}", e)))?;
        write_len_prefix(json.len(), buf)?;
        buf.extend_from_slice(&json);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<(T, usize)> {
        let len = read_len_prefix(bytes)?;
        let raw = &bytes[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len];
        let item = serde_json::from_slice(raw)
            .map_err(|e| StoreError::codec(format!("json decode failed: {}", e)))?;
        Ok((item, LENGTH_PREFIX_SIZE + len))
    }

    fn encoded_size(&self, item: &T) -> usize {
        // A JSON encode of an already-serializable item only fails on
        // pathological map keys, which encode() reports; size falls back to
        // the prefix alone in that case.
        let body = serde_json::to_vec(item).map(|v| v.len()).unwrap_or(0);
        LENGTH_PREFIX_SIZE + body
    }

    fn tag(&self) -> &'static str {
        "json"
    }
}

/// Two codecs concatenated in a fixed order.
///
/// Each field keeps its own framing, so a pair of variable-size fields is
/// `[len a][a bytes][len b][b bytes]`. The pair is fixed-size only when both
/// halves are.
pub struct PairCodec<CA, CB> {
    first: CA,
    second: CB,
}

impl<CA, CB> PairCodec<CA, CB> {
    pub fn new(first: CA, second: CB) -> Self {
        Self { first, second }
    }
}

impl<CA: Codec, CB: Codec> Codec for PairCodec<CA, CB> {
    type Item = (CA::Item, CB::Item);

    fn encode(&self, item: &Self::Item, buf: &mut Vec<u8>) -> Result<()> {
        self.first.encode(&item.0, buf)?;
        self.second.encode(&item.1, buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<(Self::Item, usize)> {
        let (a, used_a) = self.first.decode(bytes)?;
        let (b, used_b) = self.second.decode(&bytes[used_a..])?;
        Ok(((a, b), used_a + used_b))
    }

    fn encoded_size(&self, item: &Self::Item) -> usize {
        self.first.encoded_size(&item.0) + self.second.encoded_size(&item.1)
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(self.first.fixed_size()? + self.second.fixed_size()?)
    }

    fn tag(&self) -> &'static str {
        "pair"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{F64Codec, I32Codec, StringCodec};

    #[test]
    fn json_value_roundtrip() {
        let codec: JsonCodec<serde_json::Value> = JsonCodec::new();
        let value = serde_json::json!({"name": "ada", "scores": [1, 2, 3]});

        let mut buf = Vec::new();
        codec.encode(&value, &mut buf).unwrap();

        let (back, used) = codec.decode(&buf).unwrap();
        assert_eq!(back, value);
        assert_eq!(used, buf.len());
        assert_eq!(codec.encoded_size(&value), buf.len());
    }

    #[test]
    fn json_typed_roundtrip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Row {
            id: u32,
            label: String,
        }

        let codec: JsonCodec<Row> = JsonCodec::new();
        let row = Row {
            id: 7,
            label: "seven".into(),
        };

        let mut buf = Vec::new();
        codec.encode(&row, &mut buf).unwrap();
        assert_eq!(codec.decode(&buf).unwrap().0, row);
    }

    #[test]
    fn json_rejects_malformed_payload() {
        let codec: JsonCodec<serde_json::Value> = JsonCodec::new();
        let mut buf = Vec::new();
        write_len_prefix(3, &mut buf).unwrap();
        buf.extend_from_slice(b"{\"x");

        assert!(codec.decode(&buf).is_err());
    }

    #[test]
    fn pair_concatenates_fields_in_order() {
        let codec = PairCodec::new(I32Codec, StringCodec);
        let item = (42, "forty-two".to_string());

        let mut buf = Vec::new();
        codec.encode(&item, &mut buf).unwrap();

        assert_eq!(&buf[..4], &42i32.to_le_bytes());
        let (back, used) = codec.decode(&buf).unwrap();
        assert_eq!(back, item);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn pair_fixed_size_only_when_both_fixed() {
        assert_eq!(PairCodec::new(I32Codec, F64Codec).fixed_size(), Some(12));
        assert_eq!(PairCodec::new(I32Codec, StringCodec).fixed_size(), None);
    }
}
