//! Arbitrary-precision signed integers and their codec.
//!
//! The on-disk form is a sign byte (0 positive, 1 negative) followed by the
//! length-prefixed big-endian magnitude. The in-memory form keeps the same
//! shape: a normalized magnitude with no leading zero bytes, where zero is the
//! empty magnitude with a positive sign, so equality and ordering are well
//! defined without re-normalizing on every comparison.

use std::cmp::Ordering;

use super::{read_len_prefix, write_len_prefix, Codec};
use crate::config::LENGTH_PREFIX_SIZE;
use crate::error::{Result, StoreError};

const SIGN_POSITIVE: u8 = 0;
const SIGN_NEGATIVE: u8 = 1;

/// A signed integer of arbitrary magnitude.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigInt {
    negative: bool,
    /// Big-endian, no leading zero bytes. Empty means zero.
    magnitude: Vec<u8>,
}

impl BigInt {
    pub fn zero() -> Self {
        Self {
            negative: false,
            magnitude: Vec::new(),
        }
    }

    /// Builds from a sign and raw big-endian magnitude, stripping leading
    /// zeros. A zero magnitude always normalizes to the positive sign.
    pub fn from_sign_magnitude(negative: bool, magnitude: &[u8]) -> Self {
        let first_nonzero = magnitude.iter().position(|&b| b != 0);
        match first_nonzero {
            Some(i) => Self {
                negative,
                magnitude: magnitude[i..].to_vec(),
            },
            None => Self::zero(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude.is_empty()
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn magnitude(&self) -> &[u8] {
        &self.magnitude
    }
}

impl From<i64> for BigInt {
    fn from(v: i64) -> Self {
        let negative = v < 0;
        let mag = v.unsigned_abs().to_be_bytes();
        Self::from_sign_magnitude(negative, &mag)
    }
}

impl Ord for BigInt {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => cmp_magnitude(&self.magnitude, &other.magnitude),
            (true, true) => cmp_magnitude(&other.magnitude, &self.magnitude),
        }
    }
}

impl PartialOrd for BigInt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Big-endian magnitude comparison: longer is larger, then lexicographic.
fn cmp_magnitude(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Sign byte + length-prefixed big-endian magnitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct BigIntCodec;

impl Codec for BigIntCodec {
    type Item = BigInt;

    fn encode(&self, item: &BigInt, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(if item.negative {
            SIGN_NEGATIVE
        } else {
            SIGN_POSITIVE
        });
        write_len_prefix(item.magnitude.len(), buf)?;
        buf.extend_from_slice(&item.magnitude);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<(BigInt, usize)> {
        let sign = *bytes
            .first()
            .ok_or_else(|| StoreError::codec("truncated bigint: empty payload"))?;
        let negative = match sign {
            SIGN_POSITIVE => false,
            SIGN_NEGATIVE => true,
            b => return Err(StoreError::codec(format!("invalid bigint sign: {:#04x}", b))),
        };
        let len = read_len_prefix(&bytes[1..])?;
        let start = 1 + LENGTH_PREFIX_SIZE;
        let value = BigInt::from_sign_magnitude(negative, &bytes[start..start + len]);
        Ok((value, start + len))
    }

    fn encoded_size(&self, item: &BigInt) -> usize {
        1 + LENGTH_PREFIX_SIZE + item.magnitude.len()
    }

    fn tag(&self) -> &'static str {
        "bigint"
    }
}
