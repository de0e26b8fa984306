//! # Message envelope
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Protocol    |Version| Flags |    Result     |     Code      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       Receiver Instance       |        Sender Instance        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Transaction Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |S|     SubMessage Number       |  Length (SDNV, whole message) |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        TLVs (variable)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Big-endian throughout. The length counts the fixed header, the length
//! field itself and every TLV.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::eid::EidRegistry;
use crate::error::{Result, WireError};
use crate::sdnv;
use crate::tlv::{self, Tlv};

/// Fixed header bytes before the length field.
pub const MESSAGE_HEADER_LEN: usize = 14;

/// Envelope version emitted by this implementation.
pub const MESSAGE_VERSION: u8 = 1;

/// Highest value representable in the 4-bit flags field.
pub const MAX_FLAGS: u8 = 0x0F;

/// Marks a non-zero submessage number.
pub const SUBMESSAGE_FLAG: u16 = 0x8000;

/// A request/response envelope carrying an ordered list of TLVs.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    pub protocol: u8,
    pub version: u8,
    pub flags: u8,
    pub result: u8,
    pub code: u8,
    pub receiver: u16,
    pub sender: u16,
    pub id: u32,
    pub submessage: u16,
    pub tlvs: Vec<T>,
}

impl<T: Tlv> Message<T> {
    /// New envelope with protocol 0, the current version and no TLVs.
    ///
    /// The sender instance identifies an active exchange and must be non-zero.
    pub fn new(sender: u16, receiver: u16, id: u32) -> Result<Self> {
        if sender == 0 {
            return Err(WireError::invalid("sender", "instance must be non-zero"));
        }
        Ok(Self {
            protocol: 0,
            version: MESSAGE_VERSION,
            flags: 0,
            result: 0,
            code: 0,
            receiver,
            sender,
            id,
            submessage: 0,
            tlvs: Vec::new(),
        })
    }

    pub fn with_flags(mut self, flags: u8) -> Result<Self> {
        if flags > MAX_FLAGS {
            return Err(WireError::invalid("flags", format!("{flags:#04x} exceeds 4 bits")));
        }
        self.flags = flags;
        Ok(self)
    }

    pub fn with_result(mut self, result: u8, code: u8) -> Self {
        self.result = result;
        self.code = code;
        self
    }

    /// A non-zero number is stored with [`SUBMESSAGE_FLAG`] set.
    pub fn with_submessage(mut self, number: u16) -> Self {
        self.submessage = if number == 0 {
            0
        } else {
            number | SUBMESSAGE_FLAG
        };
        self
    }

    pub fn with_tlv(mut self, tlv: T) -> Self {
        self.tlvs.push(tlv);
        self
    }

    pub fn push(&mut self, tlv: T) {
        self.tlvs.push(tlv);
    }

    /// Encoded size of the whole message.
    pub fn encoded_len(&self) -> usize {
        let body = MESSAGE_HEADER_LEN + self.tlvs.iter().map(Tlv::length).sum::<usize>();
        let mut total = body + 1;
        loop {
            let next = body + sdnv::encoded_len(total as u64);
            if next == total {
                return total;
            }
            total = next;
        }
    }

    pub fn encode(&self) -> Bytes {
        let total = self.encoded_len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(self.protocol);
        buf.put_u8((self.version << 4) | (self.flags & MAX_FLAGS));
        buf.put_u8(self.result);
        buf.put_u8(self.code);
        buf.put_u16(self.receiver);
        buf.put_u16(self.sender);
        buf.put_u32(self.id);
        buf.put_u16(self.submessage);
        sdnv::encode(total as u64, &mut buf);
        for tlv in &self.tlvs {
            tlv::encode(tlv, &mut buf);
        }
        debug_assert_eq!(buf.len(), total);
        buf.freeze()
    }

    /// Decode one message occupying the whole of `buf`.
    pub fn decode(mut buf: Bytes, eids: &EidRegistry) -> Result<Self> {
        if buf.remaining() < MESSAGE_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: MESSAGE_HEADER_LEN - buf.remaining(),
            });
        }
        let protocol = buf.get_u8();
        let version_flags = buf.get_u8();
        let result = buf.get_u8();
        let code = buf.get_u8();
        let receiver = buf.get_u16();
        let sender = buf.get_u16();
        let id = buf.get_u32();
        let submessage = buf.get_u16();

        let declared = sdnv::decode_len(&mut buf)?;
        let overhead = MESSAGE_HEADER_LEN + sdnv::encoded_len(declared as u64);
        let expected = declared.checked_sub(overhead);
        if expected != Some(buf.remaining()) {
            return Err(WireError::LengthMismatch {
                declared,
                actual: overhead + buf.remaining(),
            });
        }

        let mut tlvs = Vec::new();
        while buf.has_remaining() {
            tlvs.push(tlv::decode::<T>(&mut buf, eids)?);
        }

        Ok(Self {
            protocol,
            version: version_flags >> 4,
            flags: version_flags & MAX_FLAGS,
            result,
            code,
            receiver,
            sender,
            id,
            submessage,
            tlvs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::RawTlv;

    fn message(tlvs: Vec<RawTlv>) -> Message<RawTlv> {
        let mut msg = Message::new(0x1234, 0x0000, 0xDEAD_BEEF).unwrap();
        for t in tlvs {
            msg.push(t);
        }
        msg
    }

    #[test]
    fn empty_message_layout() {
        let msg = message(vec![]);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 15);
        assert_eq!(
            &bytes[..],
            &[
                0x00, 0x10, 0x00, 0x00, // protocol, version|flags, result, code
                0x00, 0x00, 0x12, 0x34, // receiver, sender
                0xDE, 0xAD, 0xBE, 0xEF, // id
                0x00, 0x00, // submessage
                15,   // length
            ]
        );
    }

    #[test]
    fn roundtrip_with_tlvs() {
        let eids = EidRegistry::new();
        let msg = message(vec![
            RawTlv::new(0x01, 0x02, vec![9u8; 4]),
            RawTlv::new(0xA1, 0x00, vec![7u8; 300]),
        ])
        .with_submessage(3)
        .with_result(1, 2);

        let bytes = msg.encode();
        assert_eq!(bytes.len(), msg.encoded_len());
        let decoded = Message::<RawTlv>::decode(bytes, &eids).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.submessage, 0x8003);
    }

    #[test]
    fn zero_sender_rejected() {
        assert!(Message::<RawTlv>::new(0, 1, 1).is_err());
    }

    #[test]
    fn wide_flags_rejected() {
        let msg = message(vec![]);
        assert!(msg.clone().with_flags(0x0F).is_ok());
        assert!(msg.with_flags(0x10).is_err());
    }

    #[test]
    fn length_mismatch_is_framing_error() {
        let eids = EidRegistry::new();
        let mut raw = message(vec![RawTlv::new(1, 0, vec![1u8, 2])]).encode().to_vec();
        raw.push(0xFF);
        let err = Message::<RawTlv>::decode(Bytes::from(raw), &eids).unwrap_err();
        assert!(matches!(err, WireError::LengthMismatch { .. }));
    }

    #[test]
    fn truncated_header() {
        let eids = EidRegistry::new();
        let err = Message::<RawTlv>::decode(Bytes::from_static(&[0, 0x10, 0]), &eids).unwrap_err();
        assert_eq!(err, WireError::Truncated { needed: 11 });
    }
}
