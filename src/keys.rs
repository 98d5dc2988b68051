//! Binary keys and the fixed-width codecs used to build them.
//!
//! Every key handed to the page store is an opaque byte string. Integers and
//! timestamps are encoded big-endian so that the unsigned lexicographic order
//! of the encoded form matches the numeric order of non-negative values.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid encoded length: expected {expected} bytes, found {found}")]
    Length { expected: usize, found: usize },
    #[error("invalid UTF-8 in encoded string")]
    Utf8(#[from] std::str::Utf8Error),
}

/// An immutable byte string used as a key or value.
///
/// Equality and hashing cover the full byte sequence. Ordering is unsigned
/// lexicographic, with a shorter prefix sorting before any longer extension
/// of it.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bytes(Vec<u8>);

impl Bytes {
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    /// Encode a UTF-8 string.
    pub fn from_string(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }

    /// Encode a 32-bit integer as 4 big-endian bytes.
    pub fn from_i32(value: i32) -> Self {
        let mut buf = [0u8; 4];
        BigEndian::write_i32(&mut buf, value);
        Self(buf.to_vec())
    }

    /// Encode a 64-bit integer as 8 big-endian bytes.
    pub fn from_i64(value: i64) -> Self {
        let mut buf = [0u8; 8];
        BigEndian::write_i64(&mut buf, value);
        Self(buf.to_vec())
    }

    /// Encode an unsigned 64-bit integer as 8 big-endian bytes.
    pub fn from_u64(value: u64) -> Self {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        Self(buf.to_vec())
    }

    /// Encode a timestamp expressed as milliseconds since the epoch.
    pub fn from_timestamp(millis: i64) -> Self {
        Self::from_i64(millis)
    }

    pub fn to_i32(&self) -> Result<i32, CodecError> {
        self.expect_len(4)?;
        Ok(BigEndian::read_i32(&self.0))
    }

    pub fn to_i64(&self) -> Result<i64, CodecError> {
        self.expect_len(8)?;
        Ok(BigEndian::read_i64(&self.0))
    }

    pub fn to_u64(&self) -> Result<u64, CodecError> {
        self.expect_len(8)?;
        Ok(BigEndian::read_u64(&self.0))
    }

    /// Decode a UTF-8 string.
    pub fn to_utf8(&self) -> Result<&str, CodecError> {
        Ok(std::str::from_utf8(&self.0)?)
    }

    /// Decode a timestamp. A negative encoded value denotes a null timestamp.
    pub fn to_timestamp(&self) -> Result<Option<i64>, CodecError> {
        let millis = self.to_i64()?;
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(millis))
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn expect_len(&self, expected: usize) -> Result<(), CodecError> {
        if self.0.len() != expected {
            return Err(CodecError::Length {
                expected,
                found: self.0.len(),
            });
        }
        Ok(())
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

impl From<&str> for Bytes {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes({})", String::from_utf8_lossy(&self.0).escape_debug())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        for value in [0i32, 1, -1, 42, i32::MIN, i32::MAX] {
            assert_eq!(Bytes::from_i32(value).to_i32().expect("decode"), value);
        }
        assert_eq!(Bytes::from_i32(7).len(), 4);
    }

    #[test]
    fn long_round_trip() {
        for value in [0i64, 1, -1, i64::MIN, i64::MAX] {
            assert_eq!(Bytes::from_i64(value).to_i64().expect("decode"), value);
        }
        assert_eq!(Bytes::from_u64(u64::MAX).to_u64().expect("decode"), u64::MAX);
    }

    #[test]
    fn string_round_trip() {
        let encoded = Bytes::from_string("città");
        assert_eq!(encoded.to_utf8().expect("decode"), "città");
    }

    #[test]
    fn timestamp_round_trip() {
        let encoded = Bytes::from_timestamp(1_700_000_000_000);
        assert_eq!(
            encoded.to_timestamp().expect("decode"),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn negative_timestamp_decodes_to_null() {
        let encoded = Bytes::from_timestamp(-1);
        assert_eq!(encoded.to_timestamp().expect("decode"), None);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = Bytes::from_slice(&[1, 2, 3]).to_i32().unwrap_err();
        assert!(matches!(err, CodecError::Length { expected: 4, found: 3 }));
    }

    #[test]
    fn ordering_is_unsigned_lexicographic() {
        assert!(Bytes::from_slice(&[0x01]) < Bytes::from_slice(&[0xff]));
        assert!(Bytes::from_slice(&[0x7f]) < Bytes::from_slice(&[0x80]));
    }

    #[test]
    fn shorter_prefix_orders_first() {
        assert!(Bytes::from_slice(&[1, 2]) < Bytes::from_slice(&[1, 2, 0]));
    }

    #[test]
    fn big_endian_order_matches_numeric_order_for_unsigned() {
        assert!(Bytes::from_u64(1) < Bytes::from_u64(2));
        assert!(Bytes::from_u64(255) < Bytes::from_u64(256));
    }
}
