//! In-process transport.
//!
//! A [`VirtualNetwork`] is shared by every agent in one process. Adapters
//! register an endpoint under `hostname/adapter`; [`VirtualNetwork::contact`]
//! brings two hosts into range so their discoveries report each other, and
//! dialing an endpoint hands it one end of a pair of in-memory pipes.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dtn_wire::Eid;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::adapter::{Accepted, Acceptor, Adapter, AdapterDriver};
use super::connection::{Connection, Connector, StreamPair};
use super::{AdapterContext, ConvergenceLayer, Discovery};
use crate::config::AdapterConfig;
use crate::error::AgentError;

const READ_POLL: Duration = Duration::from_millis(50);

// ─── Pipes ───────────────────────────────────────────────────────────────────

/// Writing half of an in-memory pipe.
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reading half of an in-memory pipe. Returns end-of-stream once the
/// writer is gone and everything it wrote has been read, or as soon as it
/// is closed locally.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    closed: Arc<AtomicBool>,
}

/// Closes a [`PipeReader`] from another thread.
#[derive(Clone)]
pub struct PipeCloser(Arc<AtomicBool>);

impl PipeCloser {
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl PipeReader {
    pub fn closer(&self) -> PipeCloser {
        PipeCloser(self.closed.clone())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.pending.len() {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            match self.rx.recv_timeout(READ_POLL) {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = unbounded();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            pos: 0,
            closed: Arc::new(AtomicBool::new(false)),
        },
    )
}

/// Two stream pairs connected back to back.
pub(crate) fn duplex() -> (StreamPair, StreamPair) {
    let (w1, r1) = pipe();
    let (w2, r2) = pipe();
    let near_closer = r2.closer();
    let far_closer = r1.closer();
    (
        StreamPair::new(Box::new(r2), Box::new(w1)).on_shutdown(move || near_closer.close()),
        StreamPair::new(Box::new(r1), Box::new(w2)).on_shutdown(move || far_closer.close()),
    )
}

// ─── Network ─────────────────────────────────────────────────────────────────

type DiscoveryHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct Endpoint {
    host: String,
    adapter: String,
    eid: String,
    incoming: Option<Sender<(String, StreamPair)>>,
    discovery: Option<DiscoveryHook>,
}

/// Shared medium for virtual adapters, endpoints keyed by address.
/// Cloning shares the network.
#[derive(Clone, Default)]
pub struct VirtualNetwork {
    endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl VirtualNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn address(host: &str, adapter: &str) -> String {
        format!("{host}/{adapter}")
    }

    fn register(&self, host: &str, adapter: &str, eid: &Eid) -> Result<String, AgentError> {
        let address = Self::address(host, adapter);
        let mut endpoints = self.lock();
        if endpoints.contains_key(&address) {
            return Err(AgentError::Transport(format!("address {address} already in use")));
        }
        endpoints.insert(
            address.clone(),
            Endpoint {
                host: host.to_string(),
                adapter: adapter.to_string(),
                eid: eid.to_string(),
                incoming: None,
                discovery: None,
            },
        );
        Ok(address)
    }

    fn listen(&self, address: &str, tx: Option<Sender<(String, StreamPair)>>) {
        if let Some(endpoint) = self.lock().get_mut(address) {
            endpoint.incoming = tx;
        }
    }

    fn set_discovery(&self, address: &str, hook: Option<DiscoveryHook>) {
        if let Some(endpoint) = self.lock().get_mut(address) {
            endpoint.discovery = hook;
        }
    }

    /// Brings `host_a` and `host_b` into range. Every pair of their
    /// endpoints sharing an adapter name discovers the other side.
    pub fn contact(&self, host_a: &str, host_b: &str) {
        let mut reports: Vec<(DiscoveryHook, String, String)> = Vec::new();
        {
            let endpoints = self.lock();
            for (addr_a, a) in endpoints.iter().filter(|(_, e)| e.host == host_a) {
                for (addr_b, b) in endpoints
                    .iter()
                    .filter(|(_, e)| e.host == host_b && e.adapter == a.adapter)
                {
                    if let Some(hook) = &a.discovery {
                        reports.push((hook.clone(), b.eid.clone(), addr_b.clone()));
                    }
                    if let Some(hook) = &b.discovery {
                        reports.push((hook.clone(), a.eid.clone(), addr_a.clone()));
                    }
                }
            }
        }
        info!(a = host_a, b = host_b, reports = reports.len(), "contact");
        for (hook, eid, address) in reports {
            hook(&eid, &address);
        }
    }

    /// Opens a stream from `from_eid` to the endpoint at `address`.
    pub fn dial(&self, from_eid: &str, address: &str) -> io::Result<StreamPair> {
        let incoming = {
            let endpoints = self.lock();
            let endpoint = endpoints
                .get(address)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, address.to_string()))?;
            endpoint
                .incoming
                .clone()
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?
        };
        let (near, far) = duplex();
        incoming
            .send((from_eid.to_string(), far))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(near)
    }
}

impl std::fmt::Debug for VirtualNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualNetwork")
            .field("endpoints", &self.lock().len())
            .finish()
    }
}

impl ConvergenceLayer for VirtualNetwork {
    fn kind(&self) -> &str {
        "virtual"
    }

    fn create_adapter(
        &self,
        config: &AdapterConfig,
        ctx: AdapterContext,
    ) -> Result<Arc<dyn Adapter>, AgentError> {
        let address = self.register(&ctx.hostname, &config.name, &ctx.local)?;
        let discovery = config.discovery.then(|| {
            Arc::new(VirtualDiscovery {
                inner: Arc::new(DiscoveryInner {
                    network: self.clone(),
                    adapter: config.name.clone(),
                    ctx: ctx.clone(),
                }),
                address: address.clone(),
                running: AtomicBool::new(false),
            })
        });
        Ok(Arc::new(VirtualAdapter {
            network: self.clone(),
            name: config.name.clone(),
            address,
            driver: AdapterDriver::new(config.name.clone(), ctx.clone()),
            eids: ctx.eids,
            discovery,
        }))
    }
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct VirtualAdapter {
    network: VirtualNetwork,
    name: String,
    address: String,
    driver: AdapterDriver,
    eids: dtn_wire::EidRegistry,
    discovery: Option<Arc<VirtualDiscovery>>,
}

impl Adapter for VirtualAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<bool, AgentError> {
        let (tx, rx) = unbounded();
        self.network.listen(&self.address, Some(tx));
        self.driver.start(Box::new(VirtualAcceptor {
            rx,
            eids: self.eids.clone(),
        }))
    }

    fn stop(&self) {
        self.network.listen(&self.address, None);
        self.driver.stop();
    }

    fn is_running(&self) -> bool {
        self.driver.is_running()
    }

    fn discovery(&self) -> Option<Arc<dyn Discovery>> {
        self.discovery.clone().map(|d| d as Arc<dyn Discovery>)
    }
}

struct VirtualAcceptor {
    rx: Receiver<(String, StreamPair)>,
    eids: dtn_wire::EidRegistry,
}

impl Acceptor for VirtualAcceptor {
    fn accept(&mut self) -> anyhow::Result<Option<Accepted>> {
        loop {
            let Ok((from, streams)) = self.rx.recv() else {
                return Ok(None);
            };
            match self.eids.intern(&from) {
                Ok(peer) => return Ok(Some(Accepted { peer, streams })),
                Err(e) => warn!(from, error = %e, "rejecting stream from invalid EID"),
            }
        }
    }
}

// ─── Discovery ───────────────────────────────────────────────────────────────

pub struct VirtualDiscovery {
    inner: Arc<DiscoveryInner>,
    address: String,
    running: AtomicBool,
}

struct DiscoveryInner {
    network: VirtualNetwork,
    adapter: String,
    ctx: AdapterContext,
}

impl DiscoveryInner {
    /// Turns a sighting into an outgoing, not yet connected, connection.
    fn discovered(&self, peer: &str, address: &str) {
        let peer = match self.ctx.eids.intern(peer) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(peer, error = %e, "discovered invalid EID");
                return;
            }
        };
        debug!(adapter = %self.adapter, %peer, address, "discovered neighbor");
        let connector = Arc::new(VirtualConnector {
            network: self.network.clone(),
            from: self.ctx.local.to_string(),
            address: address.to_string(),
        });
        let conn = Connection::outgoing(
            peer,
            self.adapter.clone(),
            connector,
            self.ctx.eids.clone(),
            self.ctx.listener.clone(),
        );
        self.ctx.events.on_connection(conn);
    }
}

impl Discovery for VirtualDiscovery {
    fn start(&self) -> anyhow::Result<()> {
        let inner = self.inner.clone();
        let hook: DiscoveryHook =
            Arc::new(move |peer: &str, address: &str| inner.discovered(peer, address));
        self.inner.network.set_discovery(&self.address, Some(hook));
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.inner.network.set_discovery(&self.address, None);
        self.running.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Connector dialing a virtual endpoint.
pub struct VirtualConnector {
    network: VirtualNetwork,
    from: String,
    address: String,
}

impl Connector for VirtualConnector {
    fn connect(&self) -> io::Result<StreamPair> {
        self.network.dial(&self.from, &self.address)
    }

    fn address(&self) -> &str {
        &self.address
    }
}
