//! The bundle protocol agent.
//!
//! An [`Agent`] owns one task queue, the bundle storage with its
//! [`ForwardingStore`] index, the [`LinkRegistry`], the configured adapters
//! and the routers. Everything that touches storage runs on the agent queue;
//! the public accessors below post to it and wait.
//!
//! ```text
//!  adapter ──on_connection──▶ agent queue ──register──▶ link queue
//!                                  │ created connection
//!                                  └──notify_link_near──▶ routers, flush_bundles
//!  connection ──on_bundle──▶ agent queue ──┬─ dtn, ours:       inbox
//!                                          ├─ dtn, elsewhere:  storage
//!                                          └─ router scheme:   router queue
//! ```
//!
//! Lifecycle: `Clear → Initialized → Loading → Loaded → Starting → Started`,
//! and `Stopped` from anywhere through [`Agent::shutdown`].

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dtn_wire::eid::DTN_SCHEME;
use dtn_wire::{Bundle, BundleId, BundleInfo, Eid, EidRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::cl::{
    Adapter, AdapterContext, AdapterEvents, Connection, ConnectionListener, ConnectionState,
    ConvergenceLayer, VirtualNetwork,
};
use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::forwarding::ForwardingStore;
use crate::link::{Link, LinkRegistry};
use crate::router::{downcast, DynRouter, Router, RouterContext, RouterFactories};
use crate::storage::{BundleStorage, MemoryStorage};
use crate::task::{TaskHandle, TaskQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Clear,
    Initialized,
    Loading,
    Loaded,
    Starting,
    Started,
    Stopped,
}

/// What the agent is built from besides its configuration: the endpoint
/// registry, the transports it may instantiate and the router kinds it
/// knows.
#[derive(Clone)]
pub struct Environment {
    pub eids: EidRegistry,
    pub layers: Vec<Arc<dyn ConvergenceLayer>>,
    pub routers: RouterFactories,
}

impl Environment {
    pub fn new(eids: EidRegistry) -> Self {
        Self {
            eids,
            layers: Vec::new(),
            routers: RouterFactories::default(),
        }
    }

    /// Environment whose only transport is `network`.
    pub fn virtual_network(eids: EidRegistry, network: &VirtualNetwork) -> Self {
        Self::new(eids).with_layer(Arc::new(network.clone()))
    }

    pub fn with_layer(mut self, layer: Arc<dyn ConvergenceLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    fn layer(&self, kind: &str) -> Option<&Arc<dyn ConvergenceLayer>> {
        self.layers.iter().find(|layer| layer.kind() == kind)
    }
}

// ─── Loaded state ────────────────────────────────────────────────────────────

struct Store {
    storage: Box<dyn BundleStorage>,
    forwarding: ForwardingStore,
    expirations: HashMap<BundleId, TaskHandle>,
    /// Bundles handed to the local inbox, so a relayed copy is not taken
    /// twice.
    delivered: HashSet<BundleId>,
}

struct Core {
    hostname: String,
    base: Eid,
    clock: Clock,
    queue: TaskQueue,
    links: LinkRegistry,
    store: Mutex<Store>,
    adapters: Vec<Arc<dyn Adapter>>,
    routers: Vec<Arc<dyn DynRouter>>,
    registrations: HashMap<String, Arc<dyn DynRouter>>,
    inbox: (Sender<Bundle>, Receiver<Bundle>),
    sequence: AtomicU64,
}

impl Core {
    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_local(&self, eid: &Eid) -> bool {
        eid.ssp() == self.base.ssp()
    }
}

struct AgentInner {
    env: Environment,
    state: Mutex<AgentState>,
    core: OnceLock<Arc<Core>>,
}

/// Handle to a running agent. Cloning shares it.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

/// Non-owning reference held by routers and adapters.
#[derive(Clone, Default)]
pub struct AgentHandle(Weak<AgentInner>);

impl AgentHandle {
    /// A handle that never upgrades.
    pub fn detached() -> Self {
        Self(Weak::new())
    }

    pub fn upgrade(&self) -> Option<Agent> {
        self.0.upgrade().map(|inner| Agent { inner })
    }
}

impl Agent {
    pub fn new(env: Environment) -> Self {
        let agent = Self {
            inner: Arc::new(AgentInner {
                env,
                state: Mutex::new(AgentState::Clear),
                core: OnceLock::new(),
            }),
        };
        let _ = agent.transition(AgentState::Clear, AgentState::Initialized);
        agent
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle(Arc::downgrade(&self.inner))
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, expected: AgentState, next: AgentState) -> Result<(), AgentError> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != expected {
            return Err(AgentError::State {
                expected,
                found: *state,
            });
        }
        debug!(from = ?*state, to = ?next, "agent state");
        *state = next;
        Ok(())
    }

    fn core(&self) -> Result<&Arc<Core>, AgentError> {
        self.inner.core.get().ok_or_else(|| AgentError::State {
            expected: AgentState::Loaded,
            found: self.state(),
        })
    }

    /// Runs `f` on the agent queue and waits for it.
    fn on_worker<R, F>(&self, f: F) -> Result<R, AgentError>
    where
        F: FnOnce(&Agent, &Core) -> R + Send + 'static,
        R: Send + 'static,
    {
        let core = self.core()?.clone();
        let agent = self.clone();
        core.queue.clone().post_and_wait(move || f(&agent, &*core))
    }

    /// Posts `f` to the agent queue without waiting.
    fn post<F>(&self, f: F)
    where
        F: FnOnce(&Agent, &Core) + Send + 'static,
    {
        let Ok(core) = self.core().cloned() else {
            debug!("agent not loaded, event dropped");
            return;
        };
        let agent = self.clone();
        core.queue.clone().post(move || {
            f(&agent, &*core);
            Ok(())
        });
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Builds storage, adapters and routers from `config`.
    pub fn load(&self, config: AgentConfig) -> Result<(), AgentError> {
        self.transition(AgentState::Initialized, AgentState::Loading)?;
        match self.build(config) {
            Ok(core) => {
                info!(
                    host = %core.base,
                    adapters = core.adapters.len(),
                    routers = core.routers.len(),
                    "agent loaded"
                );
                let _ = self.inner.core.set(Arc::new(core));
                self.transition(AgentState::Loading, AgentState::Loaded)
            }
            Err(e) => {
                error!(error = %e, "agent load failed");
                *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = AgentState::Stopped;
                Err(e)
            }
        }
    }

    fn build(&self, config: AgentConfig) -> Result<Core, AgentError> {
        let env = &self.inner.env;
        let eids = env.eids.clone();
        let base = eids.host(&config.hostname)?;
        let clock = Clock::new(config.time_scale);
        let queue = TaskQueue::with_time_scale(format!("agent-{}", config.hostname), config.time_scale);

        let events = Arc::new(AgentEvents { agent: self.handle() });
        let mut adapters = Vec::new();
        for layer_config in &config.convergence_layers {
            let layer = env.layer(&layer_config.kind).ok_or_else(|| {
                AgentError::config(format!("unknown convergence layer {:?}", layer_config.kind))
            })?;
            for adapter_config in &layer_config.adapters {
                debug!(layer = %layer_config.kind, adapter = %adapter_config.name, "creating adapter");
                let ctx = AdapterContext {
                    local: base.clone(),
                    hostname: config.hostname.clone(),
                    eids: eids.clone(),
                    events: events.clone(),
                    listener: events.clone(),
                };
                adapters.push(layer.create_adapter(adapter_config, ctx)?);
            }
        }

        let mut routers = Vec::new();
        let mut registrations = HashMap::new();
        for (id, router_config) in config.routers.iter().enumerate() {
            let factory = env.routers.get(&router_config.kind).ok_or_else(|| {
                AgentError::config(format!(
                    "unknown router kind {:?}, expected one of {:?}",
                    router_config.kind,
                    env.routers.kinds()
                ))
            })?;
            let ctx = RouterContext::new(
                id,
                router_config.kind.clone(),
                router_config.registration.clone(),
                base.clone(),
                eids.clone(),
                clock.clone(),
                config.absence_timeout,
                self.handle(),
            )?;
            let router = factory(ctx, &router_config.properties)?;
            debug!(kind = %router_config.kind, registration = %router_config.registration, "router loaded");
            registrations.insert(router_config.registration.clone(), router.clone());
            routers.push(router);
        }

        Ok(Core {
            hostname: config.hostname.clone(),
            base,
            links: LinkRegistry::new(config.time_scale),
            store: Mutex::new(Store {
                storage: Box::new(MemoryStorage::new(config.storage.capacity)),
                forwarding: ForwardingStore::new(eids),
                expirations: HashMap::new(),
                delivered: HashSet::new(),
            }),
            clock,
            queue,
            adapters,
            routers,
            registrations,
            inbox: unbounded(),
            sequence: AtomicU64::new(0),
        })
    }

    /// Starts discovery and adapters, then the routers.
    pub fn start(&self) -> Result<(), AgentError> {
        self.transition(AgentState::Loaded, AgentState::Starting)?;
        let core = self.core()?.clone();
        info!(host = %core.base, "starting agent");

        for adapter in &core.adapters {
            match adapter.discovery() {
                Some(discovery) => {
                    if let Err(e) = discovery.start() {
                        warn!(adapter = adapter.name(), error = %e, "discovery failed to start");
                    }
                }
                None => debug!(adapter = adapter.name(), "no discovery"),
            }
            match adapter.start() {
                Ok(true) => info!(adapter = adapter.name(), "adapter started"),
                Ok(false) => warn!(adapter = adapter.name(), "adapter did not become ready"),
                Err(e) => warn!(adapter = adapter.name(), error = %e, "adapter failed to start"),
            }
        }

        for router in &core.routers {
            router.start();
        }
        self.transition(AgentState::Starting, AgentState::Started)
    }

    /// Stops adapters, routers, links and the agent queue. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == AgentState::Stopped {
                return;
            }
            *state = AgentState::Stopped;
        }
        let Some(core) = self.inner.core.get() else {
            return;
        };
        info!(host = %core.base, "agent shutting down");
        for adapter in &core.adapters {
            if let Some(discovery) = adapter.discovery() {
                discovery.stop();
            }
            adapter.stop();
        }
        for router in &core.routers {
            router.shutdown();
        }
        core.links.shutdown_all();
        for (_, timer) in core.store().expirations.drain() {
            timer.cancel();
        }
        core.queue.shutdown();
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn eids(&self) -> &EidRegistry {
        &self.inner.env.eids
    }

    pub fn hostname(&self) -> Result<&str, AgentError> {
        Ok(&self.core()?.hostname)
    }

    /// `dtn://hostname`.
    pub fn base_eid(&self) -> Result<Eid, AgentError> {
        Ok(self.core()?.base.clone())
    }

    pub fn clock(&self) -> Result<Clock, AgentError> {
        Ok(self.core()?.clock.clone())
    }

    /// Bundles delivered to this host, in arrival order.
    pub fn delivered(&self) -> Result<Receiver<Bundle>, AgentError> {
        Ok(self.core()?.inbox.1.clone())
    }

    /// The router registered under `registration`, if it is an `R`.
    pub fn router<R: Router>(&self, registration: &str) -> Option<Arc<R>> {
        let core = self.core().ok()?;
        core.registrations
            .get(registration)
            .and_then(|router| downcast::<R>(router.as_ref()))
    }

    pub fn link(&self, eid: &Eid) -> Option<Arc<Link>> {
        self.core().ok()?.links.get(eid)
    }

    // ─── Bundles ─────────────────────────────────────────────────────────

    /// Originates a bundle from this host.
    pub fn send(&self, destination: &Eid, payload: impl Into<Bytes>, lifetime_secs: u64) -> Result<BundleId, AgentError> {
        let core = self.core()?;
        let info = BundleInfo::new(
            self.eids(),
            core.base.clone(),
            destination.clone(),
            core.clock.dtn_seconds(),
            core.sequence.fetch_add(1, Ordering::Relaxed),
            lifetime_secs,
        );
        let bundle = Bundle::new(info, payload);
        let id = bundle.id();
        if !self.add_bundle(bundle)? {
            return Err(AgentError::Storage(format!("bundle {id} refused")));
        }
        info!(%id, %destination, "bundle created");
        let next = destination.with_scheme(self.eids(), DTN_SCHEME)?;
        if let Some(link) = core.links.get(&next) {
            self.flush_bundles(&link)?;
        }
        Ok(id)
    }

    /// Stores `bundle` and indexes it for forwarding. Expired bundles and
    /// bundles the storage refuses are dropped and `false` is returned.
    pub fn add_bundle(&self, bundle: Bundle) -> Result<bool, AgentError> {
        self.on_worker(move |agent, core| agent.store_bundle(core, bundle))
    }

    fn store_bundle(&self, core: &Core, bundle: Bundle) -> bool {
        let id = bundle.id();
        let now = core.clock.now_ms();
        if bundle.is_expired(now) {
            warn!(%id, "bundle already expired");
            return false;
        }
        let mut store = core.store();
        if let Err(e) = store.storage.add(bundle.clone()) {
            warn!(%id, error = %e, "bundle dropped");
            return false;
        }
        store.forwarding.add(bundle.clone());

        let delay = Duration::from_millis(bundle.expires_at_ms().saturating_sub(now));
        let agent = self.handle();
        let expiring = id.clone();
        let timer = core.queue.schedule(delay, move || {
            let Some(agent) = agent.upgrade() else {
                return Ok(());
            };
            let core = agent.core()?;
            debug!(id = %expiring, "bundle expired");
            agent.drop_bundle(core, &expiring);
            Ok(())
        });
        store.expirations.insert(id.clone(), timer);
        trace!(%id, stored = store.storage.len(), "bundle stored");
        true
    }

    pub fn remove_bundle(&self, id: &BundleId) -> Result<Option<Bundle>, AgentError> {
        let id = id.clone();
        self.on_worker(move |agent, core| agent.drop_bundle(core, &id))
    }

    fn drop_bundle(&self, core: &Core, id: &BundleId) -> Option<Bundle> {
        let mut store = core.store();
        if let Some(timer) = store.expirations.remove(id) {
            timer.cancel();
        }
        let bundle = store.storage.remove(id)?;
        store.forwarding.remove(&bundle);
        debug!(%id, "bundle removed");
        Some(bundle)
    }

    /// `true` if the bundle is stored here or was already delivered here.
    pub fn contains_bundle(&self, id: &BundleId) -> Result<bool, AgentError> {
        let id = id.clone();
        self.on_worker(move |_, core| {
            let store = core.store();
            store.storage.contains(&id) || store.delivered.contains(&id)
        })
    }

    pub fn bundles(&self) -> Result<Vec<Bundle>, AgentError> {
        self.on_worker(|_, core| core.store().storage.bundles())
    }

    /// Stored bundles that should be handed to `target`.
    pub fn search_bundles(&self, target: &Eid) -> Result<Vec<Bundle>, AgentError> {
        let target = target.clone();
        self.on_worker(move |_, core| core.store().forwarding.search_bundles(&target))
    }

    pub fn storage_available(&self) -> Result<usize, AgentError> {
        self.on_worker(|_, core| core.store().storage.available())
    }

    pub fn route_link(&self, dst: &Eid, next: &Eid) -> Result<bool, AgentError> {
        let (dst, next) = (dst.clone(), next.clone());
        self.on_worker(move |_, core| {
            debug!(%dst, %next, "forwarding link");
            core.store().forwarding.link(&dst, &next)
        })
    }

    pub fn route_unlink(&self, dst: &Eid, next: &Eid) -> Result<bool, AgentError> {
        let (dst, next) = (dst.clone(), next.clone());
        self.on_worker(move |_, core| {
            debug!(%dst, %next, "forwarding unlink");
            core.store().forwarding.unlink(&dst, &next)
        })
    }

    /// Hands everything stored for `link`'s neighbor straight to it.
    /// Bundles that reached their destination host are dropped from
    /// storage once handed over.
    pub fn flush_bundles(&self, link: &Arc<Link>) -> Result<usize, AgentError> {
        let bundles = self.search_bundles(link.eid())?;
        if bundles.is_empty() {
            return Ok(0);
        }
        let count = bundles.len();
        info!(link = %link.eid(), count, "sending bundles directly");
        let agent = self.handle();
        let peer = link.eid().clone();
        link.deliver(
            bundles,
            Box::new(move |sent: Vec<Bundle>| {
                let Some(agent) = agent.upgrade() else {
                    return;
                };
                agent.post(move |agent, core| {
                    for bundle in sent.iter().filter(|b| b.destination().ssp() == peer.ssp()) {
                        agent.drop_bundle(core, &bundle.id());
                    }
                });
            }),
        );
        Ok(count)
    }

    // ─── Events ──────────────────────────────────────────────────────────

    fn notify_link_near(&self, core: &Core, link: &Arc<Link>) {
        if !link.eid().is_base() {
            warn!(link = %link.eid(), "link near for a non-base EID, ignoring");
            return;
        }
        debug!(link = %link.eid(), "link near");
        for router in &core.routers {
            router.notify_link_near(link);
        }
        // on the agent worker: the search runs inline
        if let Err(e) = self.flush_bundles(link) {
            warn!(link = %link.eid(), error = %e, "flush failed");
        }
    }

    fn notify_bundle_received(&self, core: &Core, bundle: Bundle) {
        let destination = bundle.destination().clone();
        trace!(source = %bundle.source(), %destination, "bundle received");

        if !core.is_local(&destination) {
            if destination.scheme() == DTN_SCHEME {
                debug!(id = %bundle.id(), %destination, "storing bundle for forwarding");
                self.store_bundle(core, bundle);
            } else {
                warn!(source = %bundle.source(), %destination, "control bundle for another host dropped");
            }
            return;
        }

        if destination.scheme() == DTN_SCHEME {
            self.deliver_local(core, bundle);
            return;
        }

        let Some(router) = core.registrations.get(destination.scheme()) else {
            warn!(source = %bundle.source(), %destination, "no registration for bundle");
            return;
        };
        match bundle.source().with_scheme(self.eids(), DTN_SCHEME) {
            Ok(peer) => {
                let link = core.links.get_or_create(&peer);
                router.deliver(&link, bundle);
            }
            Err(e) => warn!(source = %bundle.source(), error = %e, "control bundle from bad source"),
        }
    }

    fn deliver_local(&self, core: &Core, bundle: Bundle) {
        let id = bundle.id();
        if !core.store().delivered.insert(id.clone()) {
            debug!(%id, "duplicate delivery ignored");
            return;
        }
        info!(%id, source = %bundle.source(), "bundle delivered");

        // a copy arriving after expiry would be dropped anyway
        let delay = Duration::from_millis(bundle.expires_at_ms().saturating_sub(core.clock.now_ms()));
        let agent = self.handle();
        let forget = id.clone();
        core.queue.schedule(delay, move || {
            let Some(agent) = agent.upgrade() else {
                return Ok(());
            };
            agent.core()?.store().delivered.remove(&forget);
            trace!(id = %forget, "delivery record expired");
            Ok(())
        });

        for router in &core.routers {
            router.bundle_delivered(&bundle);
        }
        let _ = core.inbox.0.send(bundle);
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Agent");
        s.field("state", &self.state());
        if let Ok(core) = self.core() {
            s.field("base", &core.base).field("routers", &core.routers.len());
        }
        s.finish()
    }
}

// ─── Adapter callbacks ───────────────────────────────────────────────────────

/// Adapter and connection callbacks, funneled into the agent queue.
struct AgentEvents {
    agent: AgentHandle,
}

impl AgentEvents {
    fn link_for(agent: &Agent, core: &Core, peer: &Eid) -> Option<Arc<Link>> {
        match peer.with_scheme(agent.eids(), DTN_SCHEME) {
            Ok(base) => Some(core.links.get_or_create(&base)),
            Err(e) => {
                warn!(%peer, error = %e, "connection to a bad EID");
                None
            }
        }
    }
}

impl AdapterEvents for AgentEvents {
    fn on_connection(&self, connection: Arc<Connection>) {
        let Some(agent) = self.agent.upgrade() else {
            return;
        };
        agent.post(move |agent, core| {
            let Some(link) = Self::link_for(agent, core, connection.peer()) else {
                return;
            };
            let discovered = connection.state() == ConnectionState::Created;
            debug!(link = %link.eid(), id = connection.id(), adapter = connection.adapter(), discovered, "new connection");
            link.notify_connection_registered(connection);
            if discovered {
                agent.notify_link_near(core, &link);
            }
        });
    }

    fn on_adapter_stopped(&self, adapter: &str, error: Option<&anyhow::Error>) {
        match error {
            Some(e) => error!(adapter, error = %e, "adapter stopped"),
            None => debug!(adapter, "adapter stopped"),
        }
    }
}

impl ConnectionListener for AgentEvents {
    fn on_bundle(&self, _connection: &Arc<Connection>, bundle: Bundle) {
        let Some(agent) = self.agent.upgrade() else {
            return;
        };
        agent.post(move |agent, core| agent.notify_bundle_received(core, bundle));
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        let Some(agent) = self.agent.upgrade() else {
            return;
        };
        let connection = connection.clone();
        // behind every bundle already read from this connection
        agent.post(move |agent, core| {
            if let Some(link) = Self::link_for(agent, core, connection.peer()) {
                link.notify_connection_closed(connection);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(host: &str) -> Agent {
        let agent = Agent::new(Environment::virtual_network(EidRegistry::new(), &VirtualNetwork::new()));
        agent.load(AgentConfig::new(host)).unwrap();
        agent
    }

    #[test]
    fn lifecycle_rejects_out_of_order_calls() {
        let agent = Agent::new(Environment::new(EidRegistry::new()));
        assert_eq!(agent.state(), AgentState::Initialized);
        assert!(matches!(
            agent.start(),
            Err(AgentError::State {
                expected: AgentState::Loaded,
                found: AgentState::Initialized
            })
        ));
        assert!(agent.bundles().is_err());
    }

    #[test]
    fn unknown_layer_fails_load() {
        let agent = Agent::new(Environment::new(EidRegistry::new()));
        assert!(matches!(agent.load(AgentConfig::new("a")), Err(AgentError::Config(_))));
        assert_eq!(agent.state(), AgentState::Stopped);
    }

    #[test]
    fn send_stores_and_indexes() {
        let agent = loaded("a");
        let dst = agent.eids().host("b").unwrap();
        let id = agent.send(&dst, vec![1, 2, 3], 60).unwrap();
        assert!(agent.contains_bundle(&id).unwrap());
        assert_eq!(agent.search_bundles(&dst).unwrap().len(), 1);
        assert_eq!(agent.storage_available().unwrap(), crate::config::DEFAULT_STORAGE_CAPACITY - 1);

        let relay = agent.eids().host("r").unwrap();
        assert!(agent.route_link(&dst, &relay).unwrap());
        assert_eq!(agent.search_bundles(&relay).unwrap().len(), 1);

        assert!(agent.remove_bundle(&id).unwrap().is_some());
        assert!(agent.bundles().unwrap().is_empty());
        agent.shutdown();
        assert_eq!(agent.state(), AgentState::Stopped);
    }

    #[test]
    fn expired_bundles_are_refused() {
        let agent = loaded("a");
        let eids = agent.eids();
        let info = BundleInfo::new(eids, eids.host("x").unwrap(), eids.host("b").unwrap(), 1, 0, 1);
        assert!(!agent.add_bundle(Bundle::new(info, vec![0])).unwrap());
        agent.shutdown();
    }

    #[test]
    fn local_bundles_reach_the_inbox_once() {
        let agent = loaded("a");
        let core = agent.core().unwrap().clone();
        let eids = agent.eids();
        let clock = agent.clock().unwrap();
        let info = BundleInfo::new(eids, eids.host("x").unwrap(), eids.host("a").unwrap(), clock.dtn_seconds(), 0, 60);
        let bundle = Bundle::new(info, vec![9]);
        let inbox = agent.delivered().unwrap();

        let (a, b) = (agent.clone(), bundle.clone());
        core.queue
            .post_and_wait(move || {
                let core = a.core().unwrap();
                a.notify_bundle_received(core, b.clone());
                a.notify_bundle_received(core, b);
            })
            .unwrap();
        assert_eq!(inbox.try_recv().unwrap().id(), bundle.id());
        assert!(inbox.try_recv().is_err());
        assert!(agent.contains_bundle(&bundle.id()).unwrap());
        agent.shutdown();
    }

    #[test]
    fn delivery_records_expire_with_the_bundle() {
        let agent = loaded("a");
        let core = agent.core().unwrap().clone();
        let eids = agent.eids();
        let clock = agent.clock().unwrap();
        let info = BundleInfo::new(eids, eids.host("x").unwrap(), eids.host("a").unwrap(), clock.dtn_seconds(), 0, 2);
        let bundle = Bundle::new(info, vec![3]);
        let inbox = agent.delivered().unwrap();

        let (a, b) = (agent.clone(), bundle.clone());
        core.queue
            .post_and_wait(move || {
                let core = a.core().unwrap();
                a.notify_bundle_received(core, b);
            })
            .unwrap();
        assert_eq!(inbox.try_recv().unwrap().id(), bundle.id());
        assert!(agent.contains_bundle(&bundle.id()).unwrap());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while agent.contains_bundle(&bundle.id()).unwrap() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!agent.contains_bundle(&bundle.id()).unwrap());
        agent.shutdown();
    }
}
