//! # dtn-agent
//!
//! Store-and-forward bundle agent for intermittently connected nodes.
//!
//! Every stateful component runs on its own single-worker [`task`] queue.
//! Transports are normalized by the convergence layers in [`cl`], shared
//! per neighbor by a [`link::Link`], and used by routing strategies through
//! park/unpark sessions ([`router`]). Two strategies are built in:
//! delivery predictability ([`prophet`]) and daily social patterns
//! ([`dlife`]).
//!
//! ## Crate structure
//!
//! - [`agent`]: Lifecycle, bundle dispatch, storage access for routers
//! - [`task`]: Ordered single-worker task queues with timers
//! - [`timeout`]: Presence timeouts and contact arbitration
//! - [`clock`]: Time-scaled wall clock
//! - [`cl`]: Adapter/connection framework and the in-process transport
//! - [`link`]: Per-neighbor connection sets and park/unpark
//! - [`router`]: Router trait, sessions, request/response exchanges
//! - [`prophet`]: Probabilistic routing
//! - [`dlife`]: Social routing
//! - [`forwarding`]: Destination index with next-hop aliases
//! - [`storage`]: Bundle storage
//! - [`config`]: TOML configuration
//! - [`error`]: Agent errors

pub mod agent;
pub mod cl;
pub mod clock;
pub mod config;
pub mod dlife;
pub mod error;
pub mod forwarding;
pub mod link;
pub mod prophet;
pub mod router;
pub mod storage;
pub mod task;
pub mod timeout;

pub use agent::{Agent, AgentHandle, AgentState, Environment};
pub use config::AgentConfig;
pub use error::AgentError;
