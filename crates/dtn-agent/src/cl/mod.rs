//! Convergence layers: transports normalized to "deliver this bundle to
//! that neighbor".
//!
//! A [`ConvergenceLayer`] creates [`Adapter`]s from configuration. Each
//! adapter accepts inbound streams and may expose a [`Discovery`] that
//! reports neighbors before any byte stream exists. Both paths end in a
//! [`Connection`] handed to [`AdapterEvents::on_connection`].

pub mod adapter;
pub mod connection;
pub mod vnet;

use dtn_wire::{Eid, EidRegistry};
use std::sync::Arc;

pub use adapter::{Accepted, Acceptor, Adapter, AdapterDriver, AdapterStatus};
pub use connection::{Connection, ConnectionListener, ConnectionState, Connector, StreamPair};
pub use vnet::VirtualNetwork;

use crate::config::AdapterConfig;
use crate::error::AgentError;

/// Neighbor discovery attached to an adapter.
pub trait Discovery: Send + Sync {
    fn start(&self) -> anyhow::Result<()>;

    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Adapter-level notifications consumed by the agent.
pub trait AdapterEvents: Send + Sync {
    fn on_connection(&self, connection: Arc<Connection>);

    fn on_adapter_stopped(&self, adapter: &str, error: Option<&anyhow::Error>);
}

/// What an adapter needs from the agent that owns it.
#[derive(Clone)]
pub struct AdapterContext {
    pub local: Eid,
    pub hostname: String,
    pub eids: EidRegistry,
    pub events: Arc<dyn AdapterEvents>,
    pub listener: Arc<dyn ConnectionListener>,
}

pub trait ConvergenceLayer: Send + Sync {
    /// Value of `kind` in configuration that selects this layer.
    fn kind(&self) -> &str;

    fn create_adapter(
        &self,
        config: &AdapterConfig,
        ctx: AdapterContext,
    ) -> Result<Arc<dyn Adapter>, AgentError>;
}
