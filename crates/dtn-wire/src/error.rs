use thiserror::Error;

use crate::eid::EidError;

/// Failure while decoding (or validating for encoding) a wire structure.
///
/// Every variant is local to the buffer being parsed: callers drop the
/// offending message or close the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("buffer truncated: {needed} more byte(s) required")]
    Truncated { needed: usize },

    #[error("SDNV value exceeds {bits} bits")]
    SdnvOverflow { bits: u32 },

    #[error("over-long SDNV encoding (leading zero group)")]
    SdnvOverlong,

    #[error("declared length {declared} does not match remaining {actual} byte(s)")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown TLV type 0x{0:02X}")]
    UnknownTlv(u8),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error(transparent)]
    Eid(#[from] EidError),
}

impl WireError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        WireError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
