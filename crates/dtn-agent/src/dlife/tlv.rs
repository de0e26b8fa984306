//! DLife control records.
//!
//! | Type | Name   | Flags          | Data                                    |
//! |------|--------|----------------|-----------------------------------------|
//! | 0x01 | Hello  | kind (1..=3)   | EID, timer SDNV, storage SDNV           |
//! | 0x02 | Ack    | kind (0..=3)   | empty, or two bytes for EID problems    |
//! | 0xA1 | Social | 0              | see [`Social`]                          |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dtn_wire::{Bundle, Eid, EidRegistry, Tlv, WireError, sdnv};

use crate::router::dictionary::{EidDictionary, ensure, get_f32};

pub const HELLO: u8 = 0x01;
pub const ACK: u8 = 0x02;
pub const SOCIAL: u8 = 0xA1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloKind {
    Hel,
    Syn,
    Ack,
}

impl HelloKind {
    fn flags(self) -> u8 {
        match self {
            HelloKind::Hel => 1,
            HelloKind::Syn => 2,
            HelloKind::Ack => 3,
        }
    }

    fn from_flags(flags: u8) -> Result<Self, WireError> {
        match flags {
            1 => Ok(HelloKind::Hel),
            2 => Ok(HelloKind::Syn),
            3 => Ok(HelloKind::Ack),
            other => Err(WireError::InvalidField {
                field: "hello kind",
                reason: format!("flags {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Break,
    Social,
    EidDiscrepancy([u8; 2]),
    EidUnknown([u8; 2]),
}

impl AckKind {
    fn flags(self) -> u8 {
        match self {
            AckKind::Break => 0,
            AckKind::Social => 1,
            AckKind::EidDiscrepancy(_) => 2,
            AckKind::EidUnknown(_) => 3,
        }
    }
}

/// Compact reference to a bundle: its destination plus a 32-bit digest of
/// source, creation time and sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleSpec {
    pub destination: Eid,
    pub id: u32,
}

impl BundleSpec {
    pub fn of(bundle: &Bundle) -> Self {
        let info = bundle.info();
        let mut digest = Fnv1a::new();
        digest.write(info.source.to_string().as_bytes());
        digest.write(&info.creation_time.to_be_bytes());
        digest.write(&info.creation_seq.to_be_bytes());
        Self {
            destination: info.destination.clone(),
            id: digest.finish(),
        }
    }

    pub fn matches(&self, bundle: &Bundle) -> bool {
        *self == Self::of(bundle)
    }
}

struct Fnv1a(u32);

impl Fnv1a {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    fn new() -> Self {
        Fnv1a(Self::OFFSET)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= u32::from(b);
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    fn finish(&self) -> u32 {
        self.0
    }
}

/// Social state a node shares with a neighbor.
///
/// ```text
/// importance f32 | dictionary | n, (index, weight f32)*
///                | n, (id, index)* carried | n, (id, index)* acked
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Social {
    pub importance: f32,
    pub weights: Vec<(Eid, f32)>,
    pub carried: Vec<BundleSpec>,
    pub acked: Vec<BundleSpec>,
}

fn encode_specs(specs: &[BundleSpec], dict: &mut EidDictionary) -> Vec<(u32, u64)> {
    specs.iter().map(|s| (s.id, dict.index_of(&s.destination))).collect()
}

fn put_specs(entries: &[(u32, u64)], buf: &mut BytesMut) {
    sdnv::encode(entries.len() as u64, buf);
    for &(id, index) in entries {
        sdnv::encode(u64::from(id), buf);
        sdnv::encode(index, buf);
    }
}

fn parse_specs(data: &mut Bytes, dict: &EidDictionary) -> Result<Vec<BundleSpec>, WireError> {
    let count = sdnv::decode_len(data)?;
    ensure(&*data, count.saturating_mul(2))?;
    let mut specs = Vec::with_capacity(count);
    for _ in 0..count {
        let id = sdnv::decode_u32(data)?;
        let destination = dict.resolve(sdnv::decode_u64(data)?, "bundle spec destination")?;
        specs.push(BundleSpec { destination, id });
    }
    Ok(specs)
}

impl Social {
    fn encode(&self, buf: &mut BytesMut) {
        let mut dict = EidDictionary::new();
        let weights: Vec<_> = self.weights.iter().map(|(eid, w)| (dict.index_of(eid), *w)).collect();
        let carried = encode_specs(&self.carried, &mut dict);
        let acked = encode_specs(&self.acked, &mut dict);

        buf.put_f32(self.importance);
        dict.encode(buf);
        sdnv::encode(weights.len() as u64, buf);
        for (index, weight) in weights {
            sdnv::encode(index, buf);
            buf.put_f32(weight);
        }
        put_specs(&carried, buf);
        put_specs(&acked, buf);
    }

    fn parse(data: &mut Bytes, eids: &EidRegistry) -> Result<Self, WireError> {
        let importance = get_f32(data)?;
        let dict = EidDictionary::decode(data, eids)?;
        let count = sdnv::decode_len(data)?;
        ensure(&*data, count.saturating_mul(5))?;
        let mut weights = Vec::with_capacity(count);
        for _ in 0..count {
            let eid = dict.resolve(sdnv::decode_u64(data)?, "neighbor weight")?;
            weights.push((eid, get_f32(data)?));
        }
        let carried = parse_specs(data, &dict)?;
        let acked = parse_specs(data, &dict)?;
        Ok(Social {
            importance,
            weights,
            carried,
            acked,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DLifeTlv {
    Hello {
        kind: HelloKind,
        eid: Eid,
        timer: u32,
        storage: u64,
    },
    Ack(AckKind),
    Social(Social),
}

impl DLifeTlv {
    pub fn name(&self) -> &'static str {
        match self {
            DLifeTlv::Hello { .. } => "Hello",
            DLifeTlv::Ack(_) => "Ack",
            DLifeTlv::Social(_) => "Social",
        }
    }
}

impl Tlv for DLifeTlv {
    fn tlv_type(&self) -> u8 {
        match self {
            DLifeTlv::Hello { .. } => HELLO,
            DLifeTlv::Ack(_) => ACK,
            DLifeTlv::Social(_) => SOCIAL,
        }
    }

    fn tlv_flags(&self) -> u8 {
        match self {
            DLifeTlv::Hello { kind, .. } => kind.flags(),
            DLifeTlv::Ack(kind) => kind.flags(),
            DLifeTlv::Social(_) => 0,
        }
    }

    fn encode_data(&self, buf: &mut BytesMut) {
        match self {
            DLifeTlv::Hello {
                eid, timer, storage, ..
            } => {
                eid.encode(buf);
                sdnv::encode(u64::from(*timer), buf);
                sdnv::encode(*storage, buf);
            }
            DLifeTlv::Ack(AckKind::EidDiscrepancy(data) | AckKind::EidUnknown(data)) => buf.put_slice(data),
            DLifeTlv::Ack(_) => {}
            DLifeTlv::Social(social) => social.encode(buf),
        }
    }

    fn parse(tlv_type: u8, flags: u8, data: &mut Bytes, eids: &EidRegistry) -> Result<Self, WireError> {
        match tlv_type {
            HELLO => {
                let kind = HelloKind::from_flags(flags)?;
                let eid = Eid::decode(data, eids)?;
                let timer = sdnv::decode_u32(data)?;
                let storage = sdnv::decode_u64(data)?;
                Ok(DLifeTlv::Hello {
                    kind,
                    eid,
                    timer,
                    storage,
                })
            }
            ACK => {
                let kind = match flags {
                    0 => AckKind::Break,
                    1 => AckKind::Social,
                    2 | 3 => {
                        ensure(&*data, 2)?;
                        let raw = [data.get_u8(), data.get_u8()];
                        if flags == 2 {
                            AckKind::EidDiscrepancy(raw)
                        } else {
                            AckKind::EidUnknown(raw)
                        }
                    }
                    other => {
                        return Err(WireError::InvalidField {
                            field: "ack kind",
                            reason: format!("flags {other}"),
                        });
                    }
                };
                Ok(DLifeTlv::Ack(kind))
            }
            SOCIAL => Ok(DLifeTlv::Social(Social::parse(data, eids)?)),
            other => Err(WireError::UnknownTlv(other)),
        }
    }
}
