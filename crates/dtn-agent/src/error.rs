use dtn_wire::{EidError, WireError};
use thiserror::Error;

use crate::agent::AgentState;

/// Failures surfaced by the agent's public operations.
///
/// Transport and protocol-sequence problems inside a running exchange are
/// logged where they happen; only what a caller can act on ends up here.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("agent is {found:?}, expected {expected:?}")]
    State {
        expected: AgentState,
        found: AgentState,
    },

    #[error("transport: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("framing: {0}")]
    Wire(#[from] WireError),

    #[error("endpoint: {0}")]
    Eid(#[from] EidError),

    #[error("task queue {0} is closed")]
    QueueClosed(String),

    #[error("{0} must run on the {1} worker")]
    WrongThread(&'static str, String),

    #[error("storage: {0}")]
    Storage(String),
}

impl AgentError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        AgentError::Config(msg.into())
    }
}
