use dtn_wire::Eid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connection::{Connection, StreamPair};
use super::{AdapterContext, Discovery};
use crate::error::AgentError;

/// Readiness is polled in fixed steps of this length.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const RUNNING_POLLS: u32 = 3;
pub const READY_POLLS: u32 = 6;

/// One listening context of a convergence layer.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    /// Starts accepting connections. `Ok(false)` if the adapter did not
    /// become ready in time.
    fn start(&self) -> Result<bool, AgentError>;

    fn stop(&self);

    fn is_running(&self) -> bool;

    fn discovery(&self) -> Option<Arc<dyn Discovery>> {
        None
    }
}

/// An inbound stream and the identity of whoever opened it.
pub struct Accepted {
    pub peer: Eid,
    pub streams: StreamPair,
}

/// Platform side of an adapter: preparation and a blocking accept.
pub trait Acceptor: Send + 'static {
    fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Next inbound connection, `None` once the listener is shut.
    fn accept(&mut self) -> anyhow::Result<Option<Accepted>>;

    fn close(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStatus {
    Idle,
    Preparing,
    Running,
    Ready,
    Stopped,
    Failed(String),
}

impl AdapterStatus {
    fn rank(&self) -> u8 {
        match self {
            AdapterStatus::Idle => 0,
            AdapterStatus::Preparing => 1,
            AdapterStatus::Running => 2,
            AdapterStatus::Ready => 3,
            AdapterStatus::Stopped | AdapterStatus::Failed(_) => 4,
        }
    }
}

#[derive(Default)]
struct StatusCell {
    status: Mutex<Option<AdapterStatus>>,
    changed: Condvar,
}

impl StatusCell {
    fn set(&self, status: AdapterStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
        self.changed.notify_all();
    }

    fn get(&self) -> AdapterStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or(AdapterStatus::Idle)
    }

    /// Waits up to `polls` intervals for a status ranked at least `target`.
    fn wait_for(&self, target: &AdapterStatus, polls: u32) -> AdapterStatus {
        let mut guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..=polls {
            let current = guard.clone().unwrap_or(AdapterStatus::Idle);
            if current.rank() >= target.rank() {
                return current;
            }
            guard = self
                .changed
                .wait_timeout(guard, READY_POLL_INTERVAL)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        guard.clone().unwrap_or(AdapterStatus::Idle)
    }
}

/// Runs an [`Acceptor`] on its own thread and hands every accepted stream
/// to the agent as a connected [`Connection`].
pub struct AdapterDriver {
    name: String,
    ctx: AdapterContext,
    status: Arc<StatusCell>,
    stopping: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterDriver {
    pub fn new(name: impl Into<String>, ctx: AdapterContext) -> Self {
        Self {
            name: name.into(),
            ctx,
            status: Arc::new(StatusCell::default()),
            stopping: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn status(&self) -> AdapterStatus {
        self.status.get()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), AdapterStatus::Running | AdapterStatus::Ready)
    }

    pub fn start(&self, acceptor: Box<dyn Acceptor>) -> Result<bool, AgentError> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return Ok(self.status() == AdapterStatus::Ready);
        }
        self.stopping.store(false, Ordering::Release);
        self.status.set(AdapterStatus::Preparing);

        let name = self.name.clone();
        let ctx = self.ctx.clone();
        let status = self.status.clone();
        let stopping = self.stopping.clone();
        *handle = Some(
            thread::Builder::new()
                .name(format!("dtn-accept-{name}"))
                .spawn(move || accept_loop(name, ctx, acceptor, status, stopping))
                .expect("failed to spawn adapter accept thread"),
        );
        drop(handle);

        match self.status.wait_for(&AdapterStatus::Running, RUNNING_POLLS) {
            AdapterStatus::Failed(reason) => {
                return Err(AgentError::Transport(format!("adapter {}: {reason}", self.name)));
            }
            AdapterStatus::Running | AdapterStatus::Ready => {}
            other => {
                warn!(adapter = %self.name, status = ?other, "adapter not running in time");
                return Ok(false);
            }
        }
        match self.status.wait_for(&AdapterStatus::Ready, READY_POLLS) {
            AdapterStatus::Ready => {
                info!(adapter = %self.name, "adapter ready");
                Ok(true)
            }
            AdapterStatus::Failed(reason) => {
                Err(AgentError::Transport(format!("adapter {}: {reason}", self.name)))
            }
            other => {
                warn!(adapter = %self.name, status = ?other, "adapter not ready in time");
                Ok(false)
            }
        }
    }

    /// Marks the driver as stopping and joins the accept thread. The caller
    /// must first make the acceptor's `accept` return.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    name: String,
    ctx: AdapterContext,
    mut acceptor: Box<dyn Acceptor>,
    status: Arc<StatusCell>,
    stopping: Arc<AtomicBool>,
) {
    if let Err(e) = acceptor.prepare() {
        warn!(adapter = %name, error = %e, "adapter preparation failed");
        status.set(AdapterStatus::Failed(e.to_string()));
        ctx.events.on_adapter_stopped(&name, Some(&e));
        return;
    }
    status.set(AdapterStatus::Running);
    status.set(AdapterStatus::Ready);

    let mut failure = None;
    while !stopping.load(Ordering::Acquire) {
        match acceptor.accept() {
            Ok(Some(accepted)) => {
                debug!(adapter = %name, peer = %accepted.peer, "accepted connection");
                let conn = Connection::accepted(
                    accepted.peer,
                    name.clone(),
                    accepted.streams,
                    ctx.eids.clone(),
                    ctx.listener.clone(),
                );
                ctx.events.on_connection(conn);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(adapter = %name, error = %e, "accept failed");
                failure = Some(e);
                break;
            }
        }
    }

    acceptor.close();
    status.set(match &failure {
        Some(e) => AdapterStatus::Failed(e.to_string()),
        None => AdapterStatus::Stopped,
    });
    debug!(adapter = %name, "accept loop finished");
    ctx.events.on_adapter_stopped(&name, failure.as_ref());
}
