//! # Endpoint identifiers
//!
//! An EID is `scheme:scheme-specific-part`. Values are interned through an
//! [`EidRegistry`] owned by whoever needs one (normally the agent), so equal
//! strings resolve to one shared value and scheme/SSP strings are shared
//! between EIDs.
//!
//! Wire form: `SDNV(byte length) | UTF-8 "scheme:ssp"`.

use bytes::{Buf, BufMut};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::error::{Result, WireError};
use crate::sdnv;

/// The null endpoint.
pub const NULL_EID: &str = "dtn:none";

/// Scheme used by base (node) identities.
pub const DTN_SCHEME: &str = "dtn";

/// Upper bound for either the scheme or the SSP, in bytes.
pub const MAX_PART_LEN: usize = 1023;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EidError {
    #[error("EID {0:?} has no ':' separator")]
    MissingSeparator(String),

    #[error("invalid scheme {0:?}: expected [a-z0-9]+")]
    InvalidScheme(String),

    #[error("EID {0:?} has an empty scheme-specific part")]
    EmptySsp(String),

    #[error("EID part exceeds {MAX_PART_LEN} bytes ({0})")]
    TooLong(usize),

    #[error("EID bytes are not valid UTF-8")]
    InvalidUtf8,

    #[error("{0:?} is not a valid hostname")]
    InvalidHostname(String),
}

struct EidInner {
    scheme: Arc<str>,
    ssp: Arc<str>,
}

/// An interned endpoint identifier. Cloning is cheap.
#[derive(Clone)]
pub struct Eid(Arc<EidInner>);

impl Eid {
    pub fn scheme(&self) -> &str {
        &self.0.scheme
    }

    pub fn ssp(&self) -> &str {
        &self.0.ssp
    }

    /// Shared scheme string; identical across every EID from one registry.
    pub fn scheme_arc(&self) -> &Arc<str> {
        &self.0.scheme
    }

    pub fn ssp_arc(&self) -> &Arc<str> {
        &self.0.ssp
    }

    pub fn is_null(&self) -> bool {
        self.scheme() == DTN_SCHEME && self.ssp() == "none"
    }

    /// `dtn://hostname` with a well-formed hostname.
    pub fn is_base(&self) -> bool {
        self.scheme() == DTN_SCHEME && self.host().is_some()
    }

    /// Hostname part of an SSP of the form `//hostname`, in any scheme.
    pub fn host(&self) -> Option<&str> {
        let host = self.ssp().strip_prefix("//")?;
        is_hostname(host).then_some(host)
    }

    /// Same SSP under another scheme.
    pub fn with_scheme(&self, registry: &EidRegistry, scheme: &str) -> std::result::Result<Eid, EidError> {
        if self.scheme() == scheme {
            return Ok(self.clone());
        }
        registry.from_parts(scheme, self.ssp())
    }

    fn text_len(&self) -> usize {
        self.scheme().len() + 1 + self.ssp().len()
    }

    pub fn encoded_len(&self) -> usize {
        let len = self.text_len();
        sdnv::encoded_len(len as u64) + len
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        sdnv::encode(self.text_len() as u64, buf);
        buf.put_slice(self.scheme().as_bytes());
        buf.put_u8(b':');
        buf.put_slice(self.ssp().as_bytes());
    }

    pub fn decode(buf: &mut impl Buf, registry: &EidRegistry) -> Result<Eid> {
        let len = sdnv::decode_len(buf)?;
        if buf.remaining() < len {
            return Err(WireError::Truncated {
                needed: len - buf.remaining(),
            });
        }
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        let text = String::from_utf8(raw).map_err(|_| EidError::InvalidUtf8)?;
        Ok(registry.intern(&text)?)
    }
}

impl PartialEq for Eid {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.scheme == other.0.scheme && self.0.ssp == other.0.ssp)
    }
}

impl Eq for Eid {}

impl Hash for Eid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scheme().hash(state);
        self.ssp().hash(state);
    }
}

impl PartialOrd for Eid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Eid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.scheme(), self.ssp()).cmp(&(other.scheme(), other.ssp()))
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme(), self.ssp())
    }
}

impl fmt::Debug for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eid({self})")
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    eids: HashMap<String, Eid>,
    parts: HashSet<Arc<str>>,
}

impl RegistryState {
    fn part(&mut self, value: &str) -> Arc<str> {
        if let Some(existing) = self.parts.get(value) {
            return existing.clone();
        }
        let part: Arc<str> = Arc::from(value);
        self.parts.insert(part.clone());
        part
    }
}

/// Intern table for endpoint identifiers.
///
/// Cloning shares the table. Entries live as long as the registry.
#[derive(Clone)]
pub struct EidRegistry {
    state: Arc<Mutex<RegistryState>>,
    null: Eid,
}

impl EidRegistry {
    pub fn new() -> Self {
        let mut state = RegistryState::default();
        let null = Eid(Arc::new(EidInner {
            scheme: state.part(DTN_SCHEME),
            ssp: state.part("none"),
        }));
        state.eids.insert(NULL_EID.to_string(), null.clone());
        Self {
            state: Arc::new(Mutex::new(state)),
            null,
        }
    }

    pub fn null(&self) -> Eid {
        self.null.clone()
    }

    /// `None` yields the null EID.
    pub fn get(&self, value: Option<&str>) -> std::result::Result<Eid, EidError> {
        match value {
            None => Ok(self.null()),
            Some(text) => self.intern(text),
        }
    }

    pub fn intern(&self, text: &str) -> std::result::Result<Eid, EidError> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(eid) = state.eids.get(text) {
                return Ok(eid.clone());
            }
        }
        let (scheme, ssp) = text
            .split_once(':')
            .ok_or_else(|| EidError::MissingSeparator(text.to_string()))?;
        self.from_parts(scheme, ssp)
    }

    pub fn from_parts(&self, scheme: &str, ssp: &str) -> std::result::Result<Eid, EidError> {
        validate_scheme(scheme)?;
        if ssp.is_empty() {
            return Err(EidError::EmptySsp(format!("{scheme}:")));
        }
        if ssp.len() > MAX_PART_LEN {
            return Err(EidError::TooLong(ssp.len()));
        }

        let key = format!("{scheme}:{ssp}");
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(eid) = state.eids.get(&key) {
            return Ok(eid.clone());
        }
        let eid = Eid(Arc::new(EidInner {
            scheme: state.part(scheme),
            ssp: state.part(ssp),
        }));
        state.eids.insert(key, eid.clone());
        Ok(eid)
    }

    /// Base identity `dtn://hostname`.
    pub fn host(&self, hostname: &str) -> std::result::Result<Eid, EidError> {
        if !is_hostname(hostname) {
            return Err(EidError::InvalidHostname(hostname.to_string()));
        }
        self.from_parts(DTN_SCHEME, &format!("//{hostname}"))
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).eids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EidRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EidRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EidRegistry").field("len", &self.len()).finish()
    }
}

/// `[a-z0-9]+`, at most [`MAX_PART_LEN`] bytes.
pub fn validate_scheme(scheme: &str) -> std::result::Result<(), EidError> {
    if scheme.len() > MAX_PART_LEN {
        return Err(EidError::TooLong(scheme.len()));
    }
    let valid = !scheme.is_empty()
        && scheme
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(EidError::InvalidScheme(scheme.to_string()))
    }
}

/// Dot-separated labels of `[a-z0-9-]+`.
pub fn is_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn interning_shares_parts() {
        let registry = EidRegistry::new();
        let a = registry.intern("dtn://host").unwrap();
        let b = registry.get(Some("dtn://host")).unwrap();
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(a.scheme_arc(), b.scheme_arc()));
        assert!(Arc::ptr_eq(a.ssp_arc(), b.ssp_arc()));

        let other = registry.intern("dtn://other").unwrap();
        assert!(Arc::ptr_eq(a.scheme_arc(), other.scheme_arc()));
    }

    #[test]
    fn none_is_null() {
        let registry = EidRegistry::new();
        let null = registry.get(None).unwrap();
        assert!(null.is_null());
        assert_eq!(null.to_string(), NULL_EID);
        assert_eq!(registry.intern(NULL_EID).unwrap(), null);
    }

    #[test]
    fn base_detection() {
        let registry = EidRegistry::new();
        assert!(registry.intern("dtn://node-1.lab").unwrap().is_base());
        assert!(!registry.intern("dtn://Node").unwrap().is_base());
        assert!(!registry.intern("prophet://node").unwrap().is_base());
        assert!(!registry.intern("dtn:none").unwrap().is_base());
        assert!(!registry.intern("dtn://a..b").unwrap().is_base());
    }

    #[test]
    fn invalid_schemes() {
        let registry = EidRegistry::new();
        assert!(matches!(
            registry.intern("DTN://x"),
            Err(EidError::InvalidScheme(_))
        ));
        assert!(matches!(
            registry.intern("nocolon"),
            Err(EidError::MissingSeparator(_))
        ));
        assert!(matches!(registry.intern(":x"), Err(EidError::InvalidScheme(_))));
        assert!(matches!(registry.intern("dtn:"), Err(EidError::EmptySsp(_))));
    }

    #[test]
    fn with_scheme_keeps_ssp() {
        let registry = EidRegistry::new();
        let base = registry.host("alpha").unwrap();
        let reg = base.with_scheme(&registry, "prophet").unwrap();
        assert_eq!(reg.to_string(), "prophet://alpha");
        assert_eq!(reg.host(), Some("alpha"));
        assert_eq!(reg.with_scheme(&registry, "dtn").unwrap(), base);
    }

    #[test]
    fn wire_form() {
        let registry = EidRegistry::new();
        let eid = registry.intern("dtn://a").unwrap();
        let mut buf = BytesMut::new();
        eid.encode(&mut buf);
        assert_eq!(&buf[..], b"\x07dtn://a");
        assert_eq!(buf.len(), eid.encoded_len());

        let mut bytes = buf.freeze();
        let decoded = Eid::decode(&mut bytes, &registry).unwrap();
        assert_eq!(decoded, eid);
    }

    #[test]
    fn oversized_ssp_rejected() {
        let registry = EidRegistry::new();
        let ssp = "x".repeat(MAX_PART_LEN + 1);
        assert_eq!(
            registry.from_parts("dtn", &ssp),
            Err(EidError::TooLong(MAX_PART_LEN + 1))
        );
    }
}
