//! Prophet control records.
//!
//! | Type | Name            | Flags        | Data                                   |
//! |------|-----------------|--------------|----------------------------------------|
//! | 0x01 | Hello           | kind (1..=4) | timer SDNV, EID                        |
//! | 0x02 | Error           | kind         | opaque                                 |
//! | 0xA1 | RoutingInfo     | 0            | dictionary, count, (index, f32 BE)*    |
//! | 0xA4 | BundleOffer     | 0            | dictionary, count, offer entries       |
//! | 0xA5 | BundleResponse  | 0            | dictionary, count, offer entries       |
//!
//! An offer entry is `flags u8, source index, destination index, creation
//! time, creation sequence`, all but the flags as SDNV.

use bytes::{BufMut, Bytes, BytesMut};
use dtn_wire::{Bundle, BundleId, Eid, EidRegistry, Tlv, WireError, sdnv};

use crate::router::dictionary::{EidDictionary, ensure, get_f32, get_u8};

pub const HELLO: u8 = 0x01;
pub const ERROR: u8 = 0x02;
pub const ROUTING_INFO: u8 = 0xA1;
pub const BUNDLE_OFFER: u8 = 0xA4;
pub const BUNDLE_RESPONSE: u8 = 0xA5;

/// Set on response entries the receiver accepts.
pub const OFFER_ACCEPTED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloKind {
    Syn,
    SynAck,
    Ack,
    RstAck,
}

impl HelloKind {
    fn flags(self) -> u8 {
        match self {
            HelloKind::Syn => 1,
            HelloKind::SynAck => 2,
            HelloKind::Ack => 3,
            HelloKind::RstAck => 4,
        }
    }

    fn from_flags(flags: u8) -> Result<Self, WireError> {
        Ok(match flags {
            1 => HelloKind::Syn,
            2 => HelloKind::SynAck,
            3 => HelloKind::Ack,
            4 => HelloKind::RstAck,
            other => {
                return Err(WireError::InvalidField {
                    field: "hello kind",
                    reason: format!("flags {other}"),
                });
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DictionaryConflict,
    BadStringId,
}

impl ErrorKind {
    fn flags(self) -> u8 {
        match self {
            ErrorKind::DictionaryConflict => 0,
            ErrorKind::BadStringId => 1,
        }
    }

    fn from_flags(flags: u8) -> Result<Self, WireError> {
        match flags {
            0 => Ok(ErrorKind::DictionaryConflict),
            1 => Ok(ErrorKind::BadStringId),
            other => Err(WireError::InvalidField {
                field: "error kind",
                reason: format!("flags {other}"),
            }),
        }
    }
}

/// Summary of one bundle, enough to recognize it on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OfferEntry {
    pub flags: u8,
    pub source: Eid,
    pub destination: Eid,
    pub creation_time: u64,
    pub creation_seq: u64,
}

impl OfferEntry {
    pub fn of(bundle: &Bundle) -> Self {
        let info = bundle.info();
        Self {
            flags: 0,
            source: info.source.clone(),
            destination: info.destination.clone(),
            creation_time: info.creation_time,
            creation_seq: info.creation_seq,
        }
    }

    pub fn accepted(mut self) -> Self {
        self.flags |= OFFER_ACCEPTED;
        self
    }

    pub fn is_accepted(&self) -> bool {
        self.flags & OFFER_ACCEPTED != 0
    }

    pub fn bundle_id(&self) -> BundleId {
        BundleId {
            source: self.source.clone(),
            creation_time: self.creation_time,
            creation_seq: self.creation_seq,
            fragment_offset: 0,
        }
    }

    pub fn matches(&self, bundle: &Bundle) -> bool {
        let info = bundle.info();
        info.source == self.source
            && info.destination == self.destination
            && info.creation_time == self.creation_time
            && info.creation_seq == self.creation_seq
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProphetTlv {
    Hello { kind: HelloKind, timer: u32, eid: Eid },
    Error { kind: ErrorKind, data: Bytes },
    RoutingInfo(Vec<(Eid, f32)>),
    Offer(Vec<OfferEntry>),
    Response(Vec<OfferEntry>),
}

impl ProphetTlv {
    pub fn name(&self) -> &'static str {
        match self {
            ProphetTlv::Hello { .. } => "Hello",
            ProphetTlv::Error { .. } => "Error",
            ProphetTlv::RoutingInfo(_) => "RoutingInfo",
            ProphetTlv::Offer(_) => "BundleOffer",
            ProphetTlv::Response(_) => "BundleResponse",
        }
    }
}

fn encode_entries(entries: &[OfferEntry], buf: &mut BytesMut) {
    let mut dict = EidDictionary::new();
    let indexed: Vec<_> = entries
        .iter()
        .map(|e| (e, dict.index_of(&e.source), dict.index_of(&e.destination)))
        .collect();
    dict.encode(buf);
    sdnv::encode(indexed.len() as u64, buf);
    for (entry, src, dst) in indexed {
        buf.put_u8(entry.flags);
        sdnv::encode(src, buf);
        sdnv::encode(dst, buf);
        sdnv::encode(entry.creation_time, buf);
        sdnv::encode(entry.creation_seq, buf);
    }
}

fn parse_entries(data: &mut Bytes, eids: &EidRegistry) -> Result<Vec<OfferEntry>, WireError> {
    let dict = EidDictionary::decode(data, eids)?;
    let count = sdnv::decode_len(data)?;
    // flags plus four one-byte SDNVs at minimum
    ensure(&*data, count.saturating_mul(5))?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let flags = get_u8(data)?;
        let source = dict.resolve(sdnv::decode_u64(data)?, "offer source")?;
        let destination = dict.resolve(sdnv::decode_u64(data)?, "offer destination")?;
        entries.push(OfferEntry {
            flags,
            source,
            destination,
            creation_time: sdnv::decode_u64(data)?,
            creation_seq: sdnv::decode_u64(data)?,
        });
    }
    Ok(entries)
}

impl Tlv for ProphetTlv {
    fn tlv_type(&self) -> u8 {
        match self {
            ProphetTlv::Hello { .. } => HELLO,
            ProphetTlv::Error { .. } => ERROR,
            ProphetTlv::RoutingInfo(_) => ROUTING_INFO,
            ProphetTlv::Offer(_) => BUNDLE_OFFER,
            ProphetTlv::Response(_) => BUNDLE_RESPONSE,
        }
    }

    fn tlv_flags(&self) -> u8 {
        match self {
            ProphetTlv::Hello { kind, .. } => kind.flags(),
            ProphetTlv::Error { kind, .. } => kind.flags(),
            _ => 0,
        }
    }

    fn encode_data(&self, buf: &mut BytesMut) {
        match self {
            ProphetTlv::Hello { timer, eid, .. } => {
                sdnv::encode(u64::from(*timer), buf);
                eid.encode(buf);
            }
            ProphetTlv::Error { data, .. } => buf.put_slice(data),
            ProphetTlv::RoutingInfo(entries) => {
                let mut dict = EidDictionary::new();
                let indexed: Vec<_> = entries.iter().map(|(eid, p)| (dict.index_of(eid), *p)).collect();
                dict.encode(buf);
                sdnv::encode(indexed.len() as u64, buf);
                for (index, p) in indexed {
                    sdnv::encode(index, buf);
                    buf.put_f32(p);
                }
            }
            ProphetTlv::Offer(entries) | ProphetTlv::Response(entries) => encode_entries(entries, buf),
        }
    }

    fn parse(tlv_type: u8, flags: u8, data: &mut Bytes, eids: &EidRegistry) -> Result<Self, WireError> {
        match tlv_type {
            HELLO => {
                let kind = HelloKind::from_flags(flags)?;
                let timer = sdnv::decode_u32(data)?;
                let eid = Eid::decode(data, eids)?;
                Ok(ProphetTlv::Hello { kind, timer, eid })
            }
            ERROR => {
                let kind = ErrorKind::from_flags(flags)?;
                let len = data.len();
                Ok(ProphetTlv::Error {
                    kind,
                    data: data.split_to(len),
                })
            }
            ROUTING_INFO => {
                let dict = EidDictionary::decode(data, eids)?;
                let count = sdnv::decode_len(data)?;
                ensure(&*data, count.saturating_mul(5))?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let eid = dict.resolve(sdnv::decode_u64(data)?, "routing info endpoint")?;
                    entries.push((eid, get_f32(data)?));
                }
                Ok(ProphetTlv::RoutingInfo(entries))
            }
            BUNDLE_OFFER => Ok(ProphetTlv::Offer(parse_entries(data, eids)?)),
            BUNDLE_RESPONSE => Ok(ProphetTlv::Response(parse_entries(data, eids)?)),
            other => Err(WireError::UnknownTlv(other)),
        }
    }
}
