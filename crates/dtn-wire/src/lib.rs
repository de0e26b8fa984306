//! # dtn-wire
//!
//! Wire format of the DTN bundle agent.
//!
//! Everything here is pure encoding: no threads, no I/O beyond reading a
//! single SDNV from a blocking stream. Decoders that produce endpoint
//! identifiers take an [`EidRegistry`](eid::EidRegistry) so the results are
//! interned.
//!
//! ## Crate structure
//!
//! - [`sdnv`]: Self-delimiting numeric values
//! - [`tlv`]: Type/flags/length/data records with a self-referential length
//! - [`message`]: Request/response envelope carrying TLVs
//! - [`eid`]: Endpoint identifiers and their intern table
//! - [`bundle`]: Primary block with dictionary compression, payload block
//! - [`error`]: Decode failures

pub mod bundle;
pub mod eid;
pub mod error;
pub mod message;
pub mod sdnv;
pub mod tlv;

pub use bundle::{Bundle, BundleFlags, BundleId, BundleInfo};
pub use eid::{Eid, EidError, EidRegistry};
pub use error::WireError;
pub use message::Message;
pub use tlv::{RawTlv, Tlv};
