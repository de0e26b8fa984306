//! Per-TLV endpoint dictionary.
//!
//! Routing TLVs that mention many endpoints list each distinct EID once and
//! refer to it by SDNV index:
//!
//! ```text
//! +-----------+-------+-------+-----+
//! | count SDNV| EID 0 | EID 1 | ... |
//! +-----------+-------+-------+-----+
//! ```

use bytes::{Buf, BufMut, Bytes};
use dtn_wire::{Eid, EidRegistry, WireError, sdnv};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EidDictionary {
    eids: Vec<Eid>,
}

impl EidDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `eid`, appending it when absent.
    pub fn index_of(&mut self, eid: &Eid) -> u64 {
        let index = match self.eids.iter().position(|e| e == eid) {
            Some(index) => index,
            None => {
                self.eids.push(eid.clone());
                self.eids.len() - 1
            }
        };
        index as u64
    }

    pub fn resolve(&self, index: u64, field: &'static str) -> Result<Eid, WireError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.eids.get(i))
            .cloned()
            .ok_or_else(|| WireError::InvalidField {
                field,
                reason: format!("dictionary index {index} out of {}", self.eids.len()),
            })
    }

    pub fn len(&self) -> usize {
        self.eids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eids.is_empty()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        sdnv::encode(self.eids.len() as u64, buf);
        for eid in &self.eids {
            eid.encode(buf);
        }
    }

    pub fn decode(buf: &mut Bytes, eids: &EidRegistry) -> Result<Self, WireError> {
        let count = sdnv::decode_len(buf)?;
        // every entry takes at least one byte
        ensure(&*buf, count)?;
        let mut dict = Vec::with_capacity(count);
        for _ in 0..count {
            dict.push(Eid::decode(buf, eids)?);
        }
        Ok(Self { eids: dict })
    }
}

/// Fails with [`WireError::Truncated`] unless `n` bytes remain.
pub fn ensure(buf: &impl Buf, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::Truncated {
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_f32(buf: &mut impl Buf) -> Result<f32, WireError> {
    ensure(&*buf, 4)?;
    Ok(buf.get_f32())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8, WireError> {
    ensure(&*buf, 1)?;
    Ok(buf.get_u8())
}
