//! # Self-Delimiting Numeric Values
//!
//! ```text
//!   value 300 = 0b1_0010_1100
//!
//!   +-+-------------+ +-+-------------+
//!   |1|   0000010   | |0|   0101100   |
//!   +-+-------------+ +-+-------------+
//!    more   high       last   low
//! ```
//!
//! Seven payload bits per byte, most significant group first. The high bit of
//! every byte except the last is set. Decoding rejects leading zero groups and
//! values that do not fit the requested width.

use bytes::{Buf, BufMut};
use std::fmt;
use std::io::{self, Read};

use crate::error::{Result, WireError};

/// Longest encoding of a 64-bit value: ceil(64 / 7).
pub const MAX_SDNV_LEN: usize = 10;

/// An unsigned integer carried as an SDNV.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sdnv(u64);

impl Sdnv {
    #[inline]
    pub fn new(value: u64) -> Self {
        Sdnv(value)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of bytes this value encodes to (never zero).
    #[inline]
    pub fn encoded_len(self) -> usize {
        encoded_len(self.0)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        encode(self.0, buf);
    }

    /// Decode a value of up to 64 bits.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        decode_bits(buf, 64).map(Sdnv)
    }
}

impl fmt::Debug for Sdnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sdnv({})", self.0)
    }
}

impl fmt::Display for Sdnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for Sdnv {
    fn from(v: u32) -> Self {
        Sdnv(v as u64)
    }
}

impl From<u64> for Sdnv {
    fn from(v: u64) -> Self {
        Sdnv(v)
    }
}

impl From<usize> for Sdnv {
    fn from(v: usize) -> Self {
        Sdnv(v as u64)
    }
}

// ─── Free functions ──────────────────────────────────────────────────────────

/// Minimum number of 7-bit groups needed for `value`.
#[inline]
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

pub fn encode(value: u64, buf: &mut impl BufMut) {
    let len = encoded_len(value);
    for i in (0..len).rev() {
        let group = ((value >> (7 * i)) & 0x7F) as u8;
        if i == 0 {
            buf.put_u8(group);
        } else {
            buf.put_u8(group | 0x80);
        }
    }
}

pub fn decode_u64(buf: &mut impl Buf) -> Result<u64> {
    decode_bits(buf, 64)
}

pub fn decode_u32(buf: &mut impl Buf) -> Result<u32> {
    decode_bits(buf, 32).map(|v| v as u32)
}

/// Decode a length or count field into `usize`.
pub fn decode_len(buf: &mut impl Buf) -> Result<usize> {
    let value = decode_bits(buf, usize::BITS)?;
    Ok(value as usize)
}

fn decode_bits(buf: &mut impl Buf, bits: u32) -> Result<u64> {
    let max = if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };

    let mut value: u64 = 0;
    let mut first = true;
    loop {
        if !buf.has_remaining() {
            return Err(WireError::Truncated { needed: 1 });
        }
        let byte = buf.get_u8();
        if first && byte == 0x80 {
            return Err(WireError::SdnvOverlong);
        }
        first = false;

        if value > (max >> 7) {
            return Err(WireError::SdnvOverflow { bits });
        }
        value = (value << 7) | (byte & 0x7F) as u64;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Read one SDNV from a blocking byte stream.
///
/// Returns `Ok(None)` on a clean end-of-stream before the first byte.
pub fn read_from(reader: &mut impl Read) -> io::Result<Option<u64>> {
    let mut raw = [0u8; MAX_SDNV_LEN];
    let mut len = 0;
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) if len == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if len == MAX_SDNV_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                WireError::SdnvOverflow { bits: 64 },
            ));
        }
        raw[len] = byte[0];
        len += 1;
        if byte[0] & 0x80 == 0 {
            break;
        }
    }
    let mut slice = &raw[..len];
    decode_u64(&mut slice)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn enc(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode(value, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn known_encodings() {
        assert_eq!(enc(0), vec![0x00]);
        assert_eq!(enc(0x7F), vec![0x7F]);
        assert_eq!(enc(0x80), vec![0x81, 0x00]);
        assert_eq!(enc(300), vec![0x82, 0x2C]);
        assert_eq!(enc(0x3FFF), vec![0xFF, 0x7F]);
        assert_eq!(enc(0x4000), vec![0x81, 0x80, 0x00]);
    }

    #[test]
    fn encoded_len_boundaries() {
        assert_eq!(encoded_len(0), 1);
        assert_eq!(encoded_len(127), 1);
        assert_eq!(encoded_len(128), 2);
        assert_eq!(encoded_len(u32::MAX as u64), 5);
        assert_eq!(encoded_len(u64::MAX), MAX_SDNV_LEN);
    }

    #[test]
    fn u32_overflow_rejected() {
        let mut bytes = enc(u32::MAX as u64 + 1);
        let mut slice = &bytes[..];
        assert_eq!(
            decode_u32(&mut slice),
            Err(WireError::SdnvOverflow { bits: 32 })
        );

        bytes = enc(u32::MAX as u64);
        let mut slice = &bytes[..];
        assert_eq!(decode_u32(&mut slice), Ok(u32::MAX));
    }

    #[test]
    fn u64_overflow_rejected() {
        // eleven groups cannot fit in 64 bits
        let raw = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        let mut slice = &raw[..];
        assert!(matches!(
            decode_u64(&mut slice),
            Err(WireError::SdnvOverflow { bits: 64 })
        ));
    }

    #[test]
    fn overlong_rejected() {
        let raw = [0x80, 0x01];
        let mut slice = &raw[..];
        assert_eq!(decode_u64(&mut slice), Err(WireError::SdnvOverlong));
    }

    #[test]
    fn truncated_rejected() {
        let raw = [0x81];
        let mut slice = &raw[..];
        assert_eq!(
            decode_u64(&mut slice),
            Err(WireError::Truncated { needed: 1 })
        );
    }

    #[test]
    fn read_from_stream() {
        let raw = [0x82u8, 0x2C, 0x05];
        let mut reader = &raw[..];
        assert_eq!(read_from(&mut reader).unwrap(), Some(300));
        assert_eq!(read_from(&mut reader).unwrap(), Some(5));
        assert_eq!(read_from(&mut reader).unwrap(), None);
    }

    #[test]
    fn read_from_truncated_stream() {
        let raw = [0x82u8];
        let mut reader = &raw[..];
        let err = read_from(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
