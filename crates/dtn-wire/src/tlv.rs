//! # TLV framing
//!
//! ```text
//! +--------+--------+-----------------------+-------------------+
//! |  Type  | Flags  | Length (SDNV, total)  |  Data (variable)  |
//! +--------+--------+-----------------------+-------------------+
//! ```
//!
//! The length field counts the whole record, header included, so its own
//! width feeds back into its value. [`total_len`] solves that fixed point.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::eid::EidRegistry;
use crate::error::{Result, WireError};
use crate::sdnv;

/// Type and flags bytes.
pub const TLV_FIXED_HEADER: usize = 2;

/// Total encoded length of a TLV carrying `data_len` bytes of data.
pub fn total_len(data_len: usize) -> usize {
    let mut total = TLV_FIXED_HEADER + 1 + data_len;
    loop {
        let next = TLV_FIXED_HEADER + sdnv::encoded_len(total as u64) + data_len;
        if next == total {
            return total;
        }
        total = next;
    }
}

/// A record that can travel inside a [`Message`](crate::message::Message).
///
/// Implementors describe their header bytes and data body; framing is done
/// by [`encode`] and [`decode`].
pub trait Tlv: Sized {
    fn tlv_type(&self) -> u8;

    fn tlv_flags(&self) -> u8;

    fn encode_data(&self, buf: &mut BytesMut);

    /// Parse the data body of a record whose header was already consumed.
    /// `data` holds exactly the body; leftover bytes are a framing error.
    fn parse(tlv_type: u8, flags: u8, data: &mut Bytes, eids: &EidRegistry) -> Result<Self>;

    /// Length of the data body. The default encodes into scratch space.
    fn data_len(&self) -> usize {
        let mut scratch = BytesMut::new();
        self.encode_data(&mut scratch);
        scratch.len()
    }

    /// Encoded length including the header.
    fn length(&self) -> usize {
        total_len(self.data_len())
    }
}

pub fn encode<T: Tlv>(tlv: &T, buf: &mut BytesMut) {
    let mut data = BytesMut::new();
    tlv.encode_data(&mut data);
    let total = total_len(data.len());

    buf.reserve(total);
    buf.put_u8(tlv.tlv_type());
    buf.put_u8(tlv.tlv_flags());
    sdnv::encode(total as u64, buf);
    buf.put_slice(&data);
}

pub fn decode<T: Tlv>(buf: &mut Bytes, eids: &EidRegistry) -> Result<T> {
    if buf.remaining() < TLV_FIXED_HEADER {
        return Err(WireError::Truncated {
            needed: TLV_FIXED_HEADER - buf.remaining(),
        });
    }
    let tlv_type = buf.get_u8();
    let flags = buf.get_u8();
    let total = sdnv::decode_len(buf)?;

    let header = TLV_FIXED_HEADER + sdnv::encoded_len(total as u64);
    if total < header {
        return Err(WireError::LengthMismatch {
            declared: total,
            actual: header,
        });
    }
    let data_len = total - header;
    if buf.remaining() < data_len {
        return Err(WireError::Truncated {
            needed: data_len - buf.remaining(),
        });
    }

    let mut data = buf.split_to(data_len);
    let tlv = T::parse(tlv_type, flags, &mut data, eids)?;
    if data.has_remaining() {
        return Err(WireError::LengthMismatch {
            declared: data_len,
            actual: data_len - data.remaining(),
        });
    }
    Ok(tlv)
}

// ─── Raw TLV ─────────────────────────────────────────────────────────────────

/// Uninterpreted record, used where the body is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTlv {
    pub tlv_type: u8,
    pub flags: u8,
    pub data: Bytes,
}

impl RawTlv {
    pub fn new(tlv_type: u8, flags: u8, data: impl Into<Bytes>) -> Self {
        Self {
            tlv_type,
            flags,
            data: data.into(),
        }
    }
}

impl Tlv for RawTlv {
    fn tlv_type(&self) -> u8 {
        self.tlv_type
    }

    fn tlv_flags(&self) -> u8 {
        self.flags
    }

    fn encode_data(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }

    fn parse(tlv_type: u8, flags: u8, data: &mut Bytes, _eids: &EidRegistry) -> Result<Self> {
        let body = data.split_to(data.len());
        Ok(RawTlv::new(tlv_type, flags, body))
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_tlv_has_three_byte_header() {
        assert_eq!(total_len(0), 3);
        assert_eq!(total_len(10), 13);
        assert_eq!(total_len(124), 127);
    }

    #[test]
    fn length_field_width_feeds_back() {
        // 3 + 125 = 128 needs a two byte length field, so the total becomes 129.
        assert_eq!(total_len(125), 129);
        assert_eq!(total_len(126), 130);
        // 2 + 2 + 16380 = 16384 crosses into three bytes.
        assert_eq!(total_len(16379), 16383);
        assert_eq!(total_len(16380), 16385);
    }

    #[test]
    fn total_len_is_a_fixed_point() {
        for data_len in [0usize, 1, 124, 125, 126, 127, 200, 16379, 16380, 70_000] {
            let total = total_len(data_len);
            assert_eq!(total, 2 + sdnv::encoded_len(total as u64) + data_len);
        }
    }

    #[test]
    fn raw_tlv_encode_decode() {
        let eids = EidRegistry::new();
        let tlv = RawTlv::new(0xA1, 0x03, vec![1u8, 2, 3, 4]);
        let mut buf = BytesMut::new();
        encode(&tlv, &mut buf);
        assert_eq!(buf.len(), tlv.length());
        assert_eq!(&buf[..3], &[0xA1, 0x03, 7]);

        let mut bytes = buf.freeze();
        let decoded: RawTlv = decode(&mut bytes, &eids).unwrap();
        assert_eq!(decoded, tlv);
        assert!(bytes.is_empty());
    }

    #[test]
    fn declared_length_shorter_than_header() {
        let eids = EidRegistry::new();
        let mut bytes = Bytes::from_static(&[0x01, 0x00, 0x02]);
        let err = decode::<RawTlv>(&mut bytes, &eids).unwrap_err();
        assert!(matches!(err, WireError::LengthMismatch { .. }));
    }

    #[test]
    fn truncated_body() {
        let eids = EidRegistry::new();
        let mut bytes = Bytes::from_static(&[0x01, 0x00, 0x08, 0xAA]);
        let err = decode::<RawTlv>(&mut bytes, &eids).unwrap_err();
        assert_eq!(err, WireError::Truncated { needed: 4 });
    }
}
