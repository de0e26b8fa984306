//! Routing strategies and their per-neighbor sessions.
//!
//! A [`Router`] is one configured strategy. It owns a [`TaskQueue`] and,
//! for every [`Link`] it touches, one [`Session`] wrapping its strategy
//! specific [`LinkConnection`]. Sessions are parked and unparked by the link
//! and run their exchange through the [`message`] provider.
//!
//! ```text
//!  agent ──notify_link_near──▶ router queue ──on_link_near──▶ link.request_park
//!  link  ──notify_parked─────▶ router queue ──on_parked────▶ exchange starts
//!  agent ──deliver───────────▶ router queue ──on_bundle_received
//! ```

pub mod dictionary;
pub mod message;

use bytes::Bytes;
use dtn_wire::{Bundle, BundleInfo, Eid, EidRegistry, Message, Tlv};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::agent::{Agent, AgentHandle};
use crate::clock::Clock;
use crate::error::AgentError;
use crate::link::Link;
use crate::task::{TaskHandle, TaskQueue};

/// Position of a router in the agent's configuration.
pub type RouterId = usize;

/// Lifetime of control bundles, in seconds.
pub const CONTROL_LIFETIME_SECS: u64 = 60;

/// Everything a router gets from the agent that hosts it.
#[derive(Clone)]
pub struct RouterContext {
    pub id: RouterId,
    pub kind: String,
    /// Scheme control bundles are addressed to.
    pub registration: String,
    /// `registration://hostname`, source of control bundles.
    pub local: Eid,
    /// `dtn://hostname`.
    pub base: Eid,
    pub eids: EidRegistry,
    pub clock: Clock,
    pub queue: TaskQueue,
    pub absence_timeout: Duration,
    pub agent: AgentHandle,
    sequence: Arc<AtomicU64>,
}

impl RouterContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: RouterId,
        kind: impl Into<String>,
        registration: impl Into<String>,
        base: Eid,
        eids: EidRegistry,
        clock: Clock,
        absence_timeout: Duration,
        agent: AgentHandle,
    ) -> Result<Self, AgentError> {
        let kind = kind.into();
        let registration = registration.into();
        let local = base.with_scheme(&eids, &registration)?;
        let queue = TaskQueue::with_time_scale(format!("{kind}-{registration}"), clock.time_scale());
        Ok(Self {
            id,
            kind,
            registration,
            local,
            base,
            eids,
            clock,
            queue,
            absence_timeout,
            agent,
            sequence: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn agent(&self) -> Result<Agent, AgentError> {
        self.agent
            .upgrade()
            .ok_or_else(|| AgentError::Transport(format!("router {} outlived its agent", self.kind)))
    }

    /// Next creation sequence number for control bundles.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// `true` when `eid` is addressed to this router on this host.
    pub fn is_registration(&self, eid: &Eid) -> bool {
        eid.scheme() == self.registration && eid.ssp() == self.base.ssp()
    }
}

impl std::fmt::Debug for RouterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("local", &self.local)
            .finish()
    }
}

// ─── Strategy traits ─────────────────────────────────────────────────────────

/// A routing strategy.
pub trait Router: Send + Sync + Sized + 'static {
    type Connection: LinkConnection<Router = Self>;

    fn context(&self) -> &RouterContext;

    /// Per-link state for `link`, or `None` to decline the link.
    fn create_connection(self: &Arc<Self>, link: &Arc<Link>) -> Option<Self::Connection>;

    /// An open connection to the session's neighbor may be available.
    /// Returning `true` asks the link to park.
    fn on_link_near(self: &Arc<Self>, session: &Arc<Session<Self::Connection>>) -> bool {
        !session.is_parked()
    }

    fn start(self: &Arc<Self>) {}

    /// A bundle reached its final destination on this node.
    fn on_bundle_delivered(&self, _bundle: &Bundle) {}

    fn shutdown(&self) {}
}

/// A router's state for one neighbor. Callbacks run on the router queue.
pub trait LinkConnection: Send + Sync + Sized + 'static {
    type Router: Router;

    fn on_created(&self, _session: &Arc<Session<Self>>) {}

    fn on_parked(&self, _session: &Arc<Session<Self>>) {}

    fn on_unparked(&self, _session: &Arc<Session<Self>>) {}

    /// A control bundle addressed to the router arrived from the neighbor.
    fn on_bundle_received(&self, session: &Arc<Session<Self>>, bundle: Bundle) -> anyhow::Result<()>;
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Binds a [`LinkConnection`] to its link and router.
pub struct Session<C: LinkConnection> {
    link: Arc<Link>,
    router: Arc<C::Router>,
    parked: AtomicBool,
    inner: C,
}

impl<C: LinkConnection> Session<C> {
    pub(crate) fn new(link: Arc<Link>, router: Arc<C::Router>, inner: C) -> Self {
        Self {
            link,
            router,
            parked: AtomicBool::new(false),
            inner,
        }
    }

    pub(crate) fn created(self: &Arc<Self>) {
        self.inner.on_created(self);
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn router(&self) -> &Arc<C::Router> {
        &self.router
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn peer(&self) -> &Eid {
        self.link.eid()
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }

    pub fn router_id(&self) -> RouterId {
        self.router.context().id
    }

    pub fn request_park(&self) -> TaskHandle {
        self.link.request_park(self.router_id())
    }

    /// Releases the link for every router.
    pub fn unpark(&self) -> TaskHandle {
        self.link.request_unpark(self.router_id())
    }

    /// Hands `bundle` to the link. Must be called from the router queue.
    pub fn send(&self, bundle: Bundle) -> Result<(), AgentError> {
        let ctx = self.router.context();
        if !ctx.queue.is_on_worker() {
            return Err(AgentError::WrongThread("session send", ctx.queue.name().to_string()));
        }
        trace!(peer = %self.peer(), bundle = %bundle.id(), "session send");
        self.link.send(bundle);
        Ok(())
    }

    pub fn send_all(&self, bundles: Vec<Bundle>) -> Result<(), AgentError> {
        let ctx = self.router.context();
        if !ctx.queue.is_on_worker() {
            return Err(AgentError::WrongThread("session send", ctx.queue.name().to_string()));
        }
        self.link.send_all(bundles);
        Ok(())
    }

    /// Wraps `payload` in a control bundle for the neighbor's router.
    pub fn control_bundle(&self, payload: Bytes) -> Result<Bundle, AgentError> {
        let ctx = self.router.context();
        let destination = self.peer().with_scheme(&ctx.eids, &ctx.registration)?;
        let info = BundleInfo::new(
            &ctx.eids,
            ctx.local.clone(),
            destination,
            ctx.clock.dtn_seconds(),
            ctx.next_sequence(),
            CONTROL_LIFETIME_SECS,
        );
        Ok(Bundle::new(info, payload))
    }

    pub fn send_message<T: Tlv>(&self, message: &Message<T>) -> Result<(), AgentError> {
        let bundle = self.control_bundle(message.encode())?;
        self.send(bundle)
    }
}

/// Type-erased view of a session used by its link.
pub trait SessionHooks: Send + Sync {
    fn router_id(&self) -> RouterId;

    fn is_parked(&self) -> bool;

    fn notify_parked(self: Arc<Self>);

    fn notify_unparked(self: Arc<Self>);
}

impl<C: LinkConnection> SessionHooks for Session<C> {
    fn router_id(&self) -> RouterId {
        Session::router_id(self)
    }

    fn is_parked(&self) -> bool {
        Session::is_parked(self)
    }

    fn notify_parked(self: Arc<Self>) {
        if self.parked.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = self.router.context().queue.clone();
        queue.post(move || {
            trace!(peer = %self.peer(), router = self.router_id(), "parked");
            self.inner.on_parked(&self);
            Ok(())
        });
    }

    fn notify_unparked(self: Arc<Self>) {
        if !self.parked.swap(false, Ordering::AcqRel) {
            return;
        }
        let queue = self.router.context().queue.clone();
        queue.post(move || {
            trace!(peer = %self.peer(), router = self.router_id(), "unparked");
            self.inner.on_unparked(&self);
            Ok(())
        });
    }
}

// ─── Type erasure ────────────────────────────────────────────────────────────

/// Object-safe face of a [`Router`], held by the agent.
pub trait DynRouter: Send + Sync {
    fn context(&self) -> &RouterContext;

    fn start(&self);

    fn notify_link_near(&self, link: &Arc<Link>);

    /// Routes a control bundle from `link`'s neighbor to its session.
    fn deliver(&self, link: &Arc<Link>, bundle: Bundle);

    fn bundle_delivered(&self, bundle: &Bundle);

    fn as_any(&self) -> &dyn Any;

    fn shutdown(&self);
}

pub struct RouterEntry<R: Router>(pub Arc<R>);

impl<R: Router> DynRouter for RouterEntry<R> {
    fn context(&self) -> &RouterContext {
        self.0.context()
    }

    fn start(&self) {
        let router = self.0.clone();
        self.0.context().queue.post(move || {
            router.start();
            Ok(())
        });
    }

    fn notify_link_near(&self, link: &Arc<Link>) {
        let router = self.0.clone();
        let link = link.clone();
        self.0.context().queue.post(move || {
            let Some(session) = link.connection(&router) else {
                return Ok(());
            };
            if router.on_link_near(&session) {
                session.request_park();
            }
            Ok(())
        });
    }

    fn deliver(&self, link: &Arc<Link>, bundle: Bundle) {
        let router = self.0.clone();
        let link = link.clone();
        self.0.context().queue.post(move || {
            let Some(session) = link.connection(&router) else {
                return Ok(());
            };
            session.inner().on_bundle_received(&session, bundle)
        });
    }

    fn bundle_delivered(&self, bundle: &Bundle) {
        let router = self.0.clone();
        let bundle = bundle.clone();
        self.0.context().queue.post(move || {
            router.on_bundle_delivered(&bundle);
            Ok(())
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn shutdown(&self) {
        self.0.shutdown();
        self.0.context().queue.shutdown();
    }
}

pub fn erase<R: Router>(router: Arc<R>) -> Arc<dyn DynRouter> {
    Arc::new(RouterEntry(router))
}

pub fn downcast<R: Router>(router: &dyn DynRouter) -> Option<Arc<R>> {
    router
        .as_any()
        .downcast_ref::<RouterEntry<R>>()
        .map(|entry| entry.0.clone())
}

// ─── Factories ───────────────────────────────────────────────────────────────

pub type RouterFactory =
    Arc<dyn Fn(RouterContext, &toml::Table) -> Result<Arc<dyn DynRouter>, AgentError> + Send + Sync>;

/// Router constructors by configured `kind`.
#[derive(Clone)]
pub struct RouterFactories {
    factories: HashMap<String, RouterFactory>,
}

impl RouterFactories {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &str, factory: RouterFactory) {
        self.factories.insert(kind.to_ascii_lowercase(), factory);
    }

    pub fn get(&self, kind: &str) -> Option<&RouterFactory> {
        self.factories.get(&kind.to_ascii_lowercase())
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for RouterFactories {
    fn default() -> Self {
        let mut factories = Self::empty();
        factories.register(
            crate::prophet::KIND,
            Arc::new(|ctx: RouterContext, props: &toml::Table| {
                Ok(erase(crate::prophet::ProphetRouter::create(ctx, props)?))
            }),
        );
        factories.register(
            crate::dlife::KIND,
            Arc::new(|ctx: RouterContext, props: &toml::Table| {
                Ok(erase(crate::dlife::DLifeRouter::create(ctx, props)?))
            }),
        );
        factories
    }
}

#[cfg(test)]
pub(crate) fn test_context(id: RouterId, kind: &str, registration: &str, eids: &EidRegistry) -> RouterContext {
    RouterContext::new(
        id,
        kind,
        registration,
        eids.host("local").unwrap(),
        eids.clone(),
        Clock::new(1.0),
        crate::timeout::DEFAULT_ABSENCE,
        AgentHandle::detached(),
    )
    .unwrap()
}
