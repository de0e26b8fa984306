//! # Bundles
//!
//! A bundle is a primary block followed by one or more canonical blocks, the
//! last of which carries [`LAST_BLOCK_FLAG`]. Only the payload block is
//! interpreted; other block types are skipped.
//!
//! ```text
//! Primary block
//! +---------+-------------------+--------------------+
//! | Version | Proc. flags (SDNV)| Block length (SDNV)|
//! +---------+-------------------+--------------------+
//! | dest scheme off | dest ssp off | src scheme off | src ssp off     |
//! | rpt scheme off  | rpt ssp off  | cust scheme off| cust ssp off    |
//! +-----------------+--------------+----------------+-----------------+
//! | creation time | creation seq | lifetime | dict len | dictionary... |
//! +---------------+--------------+----------+----------+---------------+
//! | fragment offset | total ADU length |   (only with FRAGMENT)
//! +-----------------+------------------+
//!
//! Canonical block
//! +------+-------------+--------------+--------------+
//! | Type | Flags (SDNV)| Length (SDNV)| Data         |
//! +------+-------------+--------------+--------------+
//! ```
//!
//! Every offset is an SDNV into the dictionary, which holds each distinct
//! scheme or SSP string once, NUL terminated.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::debug;

use crate::eid::{Eid, EidRegistry};
use crate::error::{Result, WireError};
use crate::sdnv;

pub const BUNDLE_VERSION: u8 = 0x06;

pub const PAYLOAD_BLOCK_TYPE: u8 = 0x01;

/// Block processing flag: no further blocks follow.
pub const LAST_BLOCK_FLAG: u64 = 0x08;

/// Block processing flag: an EID reference list precedes the length.
pub const EID_REFERENCE_FLAG: u64 = 0x40;

/// 2000-01-01T00:00:00Z in Unix milliseconds.
pub const DTN_EPOCH_MS: u64 = 946_684_800_000;

// ─── Flags ───────────────────────────────────────────────────────────────────

/// Bundle processing control flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BundleFlags(u64);

impl BundleFlags {
    pub const FRAGMENT: BundleFlags = BundleFlags(0x01);
    pub const ADMIN_RECORD: BundleFlags = BundleFlags(0x02);
    pub const NO_FRAGMENT: BundleFlags = BundleFlags(0x04);
    pub const CUSTODY: BundleFlags = BundleFlags(0x08);
    pub const SINGLETON: BundleFlags = BundleFlags(0x10);
    pub const ACK_REQUESTED: BundleFlags = BundleFlags(0x20);

    pub const fn empty() -> Self {
        BundleFlags(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        BundleFlags(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: BundleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BundleFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BundleFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for BundleFlags {
    type Output = BundleFlags;

    fn bitor(self, rhs: Self) -> Self {
        BundleFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for BundleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(BundleFlags, &str); 6] = [
            (BundleFlags::FRAGMENT, "FRAGMENT"),
            (BundleFlags::ADMIN_RECORD, "ADMIN_RECORD"),
            (BundleFlags::NO_FRAGMENT, "NO_FRAGMENT"),
            (BundleFlags::CUSTODY, "CUSTODY"),
            (BundleFlags::SINGLETON, "SINGLETON"),
            (BundleFlags::ACK_REQUESTED, "ACK_REQUESTED"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

// ─── Metadata ────────────────────────────────────────────────────────────────

/// Primary block contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleInfo {
    pub destination: Eid,
    pub source: Eid,
    pub report_to: Eid,
    pub custodian: Eid,
    /// Seconds since [`DTN_EPOCH_MS`].
    pub creation_time: u64,
    /// Disambiguates bundles created within the same second.
    pub creation_seq: u64,
    /// Seconds after `creation_time`.
    pub lifetime: u64,
    pub fragment_offset: u64,
    pub total_data_len: u64,
    pub flags: BundleFlags,
}

impl BundleInfo {
    /// Singleton bundle with null report-to and custodian.
    pub fn new(
        eids: &EidRegistry,
        source: Eid,
        destination: Eid,
        creation_time: u64,
        creation_seq: u64,
        lifetime: u64,
    ) -> Self {
        Self {
            destination,
            source,
            report_to: eids.null(),
            custodian: eids.null(),
            creation_time,
            creation_seq,
            lifetime,
            fragment_offset: 0,
            total_data_len: 0,
            flags: BundleFlags::SINGLETON,
        }
    }

    pub fn is_fragment(&self) -> bool {
        self.flags.contains(BundleFlags::FRAGMENT)
    }

    pub fn expires_at_ms(&self) -> u64 {
        DTN_EPOCH_MS
            .saturating_add(self.creation_time.saturating_add(self.lifetime).saturating_mul(1000))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }

    fn eids(&self) -> [&Eid; 4] {
        [&self.destination, &self.source, &self.report_to, &self.custodian]
    }
}

/// Identity of a bundle: two bundles with equal ids are the same bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId {
    pub source: Eid,
    pub creation_time: u64,
    pub creation_seq: u64,
    pub fragment_offset: u64,
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.source, self.creation_time, self.creation_seq)?;
        if self.fragment_offset != 0 {
            write!(f, "+{}", self.fragment_offset)?;
        }
        Ok(())
    }
}

// ─── Bundle ──────────────────────────────────────────────────────────────────

/// An immutable bundle. Cloning shares the payload.
#[derive(Debug, Clone)]
pub struct Bundle {
    info: BundleInfo,
    payload: Bytes,
}

impl Bundle {
    pub fn new(info: BundleInfo, payload: impl Into<Bytes>) -> Self {
        Self {
            info,
            payload: payload.into(),
        }
    }

    pub fn info(&self) -> &BundleInfo {
        &self.info
    }

    pub fn source(&self) -> &Eid {
        &self.info.source
    }

    pub fn destination(&self) -> &Eid {
        &self.info.destination
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn id(&self) -> BundleId {
        BundleId {
            source: self.info.source.clone(),
            creation_time: self.info.creation_time,
            creation_seq: self.info.creation_seq,
            fragment_offset: self.info.fragment_offset,
        }
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.info.expires_at_ms()
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.info.is_expired(now_ms)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.payload.len());
        encode_primary(&self.info, &mut buf);

        buf.put_u8(PAYLOAD_BLOCK_TYPE);
        sdnv::encode(LAST_BLOCK_FLAG, &mut buf);
        sdnv::encode(self.payload.len() as u64, &mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes, eids: &EidRegistry) -> Result<Bundle> {
        let info = decode_primary(&mut buf, eids)?;

        let mut payload = None;
        loop {
            if !buf.has_remaining() {
                return Err(WireError::Truncated { needed: 1 });
            }
            let block_type = buf.get_u8();
            let flags = sdnv::decode_u64(&mut buf)?;
            if flags & EID_REFERENCE_FLAG != 0 {
                let refs = sdnv::decode_len(&mut buf)?;
                // scheme and ssp offset per reference
                for _ in 0..refs {
                    sdnv::decode_u64(&mut buf)?;
                    sdnv::decode_u64(&mut buf)?;
                }
            }
            let len = sdnv::decode_len(&mut buf)?;
            if buf.remaining() < len {
                return Err(WireError::Truncated {
                    needed: len - buf.remaining(),
                });
            }
            let data = buf.split_to(len);
            if block_type == PAYLOAD_BLOCK_TYPE {
                payload = Some(data);
            } else {
                debug!(block_type, len, "skipping extension block");
            }
            if flags & LAST_BLOCK_FLAG != 0 {
                break;
            }
        }

        if buf.has_remaining() {
            return Err(WireError::LengthMismatch {
                declared: 0,
                actual: buf.remaining(),
            });
        }
        let payload = payload.ok_or_else(|| WireError::invalid("payload", "no payload block"))?;
        Ok(Bundle { info, payload })
    }
}

impl PartialEq for Bundle {
    fn eq(&self, other: &Self) -> bool {
        self.info.source == other.info.source
            && self.info.creation_time == other.info.creation_time
            && self.info.creation_seq == other.info.creation_seq
            && self.info.fragment_offset == other.info.fragment_offset
    }
}

impl Eq for Bundle {}

impl Hash for Bundle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.info.source.hash(state);
        self.info.creation_time.hash(state);
        self.info.creation_seq.hash(state);
        self.info.fragment_offset.hash(state);
    }
}

// ─── Primary block ───────────────────────────────────────────────────────────

struct Dictionary {
    bytes: Vec<u8>,
    entries: Vec<(usize, usize)>,
}

impl Dictionary {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Offset of `value`, adding it if this is its first occurrence.
    fn offset(&mut self, value: &str) -> usize {
        for &(offset, len) in &self.entries {
            if &self.bytes[offset..offset + len] == value.as_bytes() {
                return offset;
            }
        }
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self.entries.push((offset, value.len()));
        offset
    }
}

fn lookup(dictionary: &[u8], offset: usize) -> Result<&str> {
    let tail = dictionary
        .get(offset..)
        .ok_or_else(|| WireError::invalid("dictionary", format!("offset {offset} out of range")))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| WireError::invalid("dictionary", "unterminated string"))?;
    std::str::from_utf8(&tail[..end]).map_err(|_| WireError::invalid("dictionary", "invalid UTF-8"))
}

fn encode_primary(info: &BundleInfo, buf: &mut BytesMut) {
    let mut dict = Dictionary::new();
    let offsets: Vec<usize> = info
        .eids()
        .iter()
        .flat_map(|eid| [eid.scheme(), eid.ssp()])
        .map(|part| dict.offset(part))
        .collect();

    let mut body = BytesMut::new();
    for offset in offsets {
        sdnv::encode(offset as u64, &mut body);
    }
    sdnv::encode(info.creation_time, &mut body);
    sdnv::encode(info.creation_seq, &mut body);
    sdnv::encode(info.lifetime, &mut body);
    sdnv::encode(dict.bytes.len() as u64, &mut body);
    body.put_slice(&dict.bytes);
    if info.is_fragment() {
        sdnv::encode(info.fragment_offset, &mut body);
        sdnv::encode(info.total_data_len, &mut body);
    }

    buf.put_u8(BUNDLE_VERSION);
    sdnv::encode(info.flags.bits(), buf);
    sdnv::encode(body.len() as u64, buf);
    buf.put_slice(&body);
}

fn decode_primary(buf: &mut Bytes, eids: &EidRegistry) -> Result<BundleInfo> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated { needed: 1 });
    }
    let version = buf.get_u8();
    if version != BUNDLE_VERSION {
        return Err(WireError::invalid("version", format!("unsupported {version:#04x}")));
    }
    let flags = BundleFlags::from_bits(sdnv::decode_u64(buf)?);
    let block_len = sdnv::decode_len(buf)?;
    if buf.remaining() < block_len {
        return Err(WireError::Truncated {
            needed: block_len - buf.remaining(),
        });
    }
    let mut block = buf.split_to(block_len);

    let mut offsets = [0usize; 8];
    for offset in offsets.iter_mut() {
        *offset = sdnv::decode_len(&mut block)?;
    }
    let creation_time = sdnv::decode_u64(&mut block)?;
    let creation_seq = sdnv::decode_u64(&mut block)?;
    let lifetime = sdnv::decode_u64(&mut block)?;
    let dict_len = sdnv::decode_len(&mut block)?;
    if block.remaining() < dict_len {
        return Err(WireError::Truncated {
            needed: dict_len - block.remaining(),
        });
    }
    let dictionary = block.split_to(dict_len);

    let mut parts = [""; 8];
    for (part, &offset) in parts.iter_mut().zip(offsets.iter()) {
        *part = lookup(&dictionary, offset)?;
    }
    let eid = |i: usize| eids.from_parts(parts[i * 2], parts[i * 2 + 1]);
    let destination = eid(0)?;
    let source = eid(1)?;
    let report_to = eid(2)?;
    let custodian = eid(3)?;

    let (fragment_offset, total_data_len) = if flags.contains(BundleFlags::FRAGMENT) {
        (sdnv::decode_u64(&mut block)?, sdnv::decode_u64(&mut block)?)
    } else {
        (0, 0)
    };
    if block.has_remaining() {
        return Err(WireError::LengthMismatch {
            declared: block_len,
            actual: block_len - block.remaining(),
        });
    }

    Ok(BundleInfo {
        destination,
        source,
        report_to,
        custodian,
        creation_time,
        creation_seq,
        lifetime,
        fragment_offset,
        total_data_len,
        flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(eids: &EidRegistry) -> Bundle {
        let info = BundleInfo::new(
            eids,
            eids.host("alpha").unwrap(),
            eids.host("beta").unwrap(),
            700_000_000,
            3,
            3600,
        );
        Bundle::new(info, Bytes::from_static(b"hello"))
    }

    #[test]
    fn dictionary_deduplicates_across_fields() {
        let eids = EidRegistry::new();
        let bundle = sample(&eids);
        let bytes = bundle.encode();

        // "dtn" appears once even though four EIDs use it, "none" once for
        // report-to and custodian.
        let text = &bytes[..];
        let count = |needle: &[u8]| text.windows(needle.len()).filter(|w| *w == needle).count();
        assert_eq!(count(b"dtn\0"), 1);
        assert_eq!(count(b"none\0"), 1);
        assert_eq!(count(b"//alpha\0"), 1);
    }

    #[test]
    fn roundtrip_plain() {
        let eids = EidRegistry::new();
        let bundle = sample(&eids);
        let decoded = Bundle::decode(bundle.encode(), &eids).unwrap();
        assert_eq!(decoded.info(), bundle.info());
        assert_eq!(decoded.payload(), bundle.payload());
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn fragment_fields_only_with_flag() {
        let eids = EidRegistry::new();
        let plain = sample(&eids);

        let mut info = plain.info().clone();
        info.flags.insert(BundleFlags::FRAGMENT);
        info.fragment_offset = 1000;
        info.total_data_len = 5000;
        let fragment = Bundle::new(info, plain.payload().clone());

        // two extra SDNVs: 1000 takes two bytes, 5000 takes two bytes
        assert_eq!(fragment.encode().len(), plain.encode().len() + 4);

        let decoded = Bundle::decode(fragment.encode(), &eids).unwrap();
        assert_eq!(decoded.info().fragment_offset, 1000);
        assert_eq!(decoded.info().total_data_len, 5000);
        assert_ne!(decoded, plain);
    }

    #[test]
    fn extension_blocks_are_skipped() {
        let eids = EidRegistry::new();
        let bundle = sample(&eids);
        let mut buf = BytesMut::new();
        encode_primary(bundle.info(), &mut buf);
        buf.put_u8(0x09);
        sdnv::encode(0, &mut buf);
        sdnv::encode(3, &mut buf);
        buf.put_slice(b"abc");
        buf.put_u8(PAYLOAD_BLOCK_TYPE);
        sdnv::encode(LAST_BLOCK_FLAG, &mut buf);
        sdnv::encode(5, &mut buf);
        buf.put_slice(b"hello");

        let decoded = Bundle::decode(buf.freeze(), &eids).unwrap();
        assert_eq!(&decoded.payload()[..], b"hello");
    }

    #[test]
    fn huge_reference_count_is_truncation() {
        let eids = EidRegistry::new();
        let bundle = sample(&eids);
        let mut buf = BytesMut::new();
        encode_primary(bundle.info(), &mut buf);
        buf.put_u8(0xC0);
        sdnv::encode(EID_REFERENCE_FLAG | LAST_BLOCK_FLAG, &mut buf);
        sdnv::encode(u64::MAX, &mut buf);
        sdnv::encode(1, &mut buf);
        sdnv::encode(2, &mut buf);
        assert!(matches!(
            Bundle::decode(buf.freeze(), &eids),
            Err(WireError::Truncated { .. } | WireError::SdnvOverflow { .. })
        ));
    }

    #[test]
    fn missing_payload_rejected() {
        let eids = EidRegistry::new();
        let bundle = sample(&eids);
        let mut buf = BytesMut::new();
        encode_primary(bundle.info(), &mut buf);
        buf.put_u8(0x09);
        sdnv::encode(LAST_BLOCK_FLAG, &mut buf);
        sdnv::encode(0, &mut buf);
        assert!(matches!(
            Bundle::decode(buf.freeze(), &eids),
            Err(WireError::InvalidField { field: "payload", .. })
        ));
    }

    #[test]
    fn bad_version_rejected() {
        let eids = EidRegistry::new();
        let mut raw = sample(&eids).encode().to_vec();
        raw[0] = 0x07;
        assert!(Bundle::decode(Bytes::from(raw), &eids).is_err());
    }

    #[test]
    fn expiry() {
        let eids = EidRegistry::new();
        let bundle = sample(&eids);
        let expires = DTN_EPOCH_MS + (700_000_000 + 3600) * 1000;
        assert_eq!(bundle.expires_at_ms(), expires);
        assert!(!bundle.is_expired(expires - 1));
        assert!(bundle.is_expired(expires));
    }

    #[test]
    fn identity_ignores_payload() {
        let eids = EidRegistry::new();
        let a = sample(&eids);
        let b = Bundle::new(a.info().clone(), Bytes::from_static(b"other"));
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().to_string(), "dtn://alpha/700000000.3");
    }
}
