//! Probabilistic routing using delivery predictabilities.
//!
//! Each node keeps a [`Predictability`] per endpoint. On contact the two
//! routers run one exchange:
//!
//! ```text
//!   initiator                          responder
//!   Hello SYN          ───────────────▶
//!                      ◀─────────────── Hello SYNACK
//!   Hello ACK          ───────────────▶
//!                      ◀─────────────── RoutingInfo (p_bc for every c)
//!   BundleOffer        ───────────────▶
//!                      ◀─────────────── BundleResponse (accepted entries)
//!   accepted bundles   ───────────────▶
//! ```
//!
//! The initiator turns the peer's table into transitive updates and
//! forwarding aliases, offers whatever the forwarding store has for the
//! peer, then sends what was accepted and releases the link.

pub mod predictability;
pub mod tlv;

use dtn_wire::{Bundle, Eid};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

pub use predictability::Predictability;
pub use tlv::{ErrorKind, HelloKind, OfferEntry, ProphetTlv};

use crate::error::AgentError;
use crate::link::Link;
use crate::router::message::{Exchange, ExchangeContext, MessageProvider};
use crate::router::{LinkConnection, Router, RouterContext, Session};
use crate::timeout::{ContactArbiter, TimeoutHandler, TimeoutHelper};

/// Configuration `kind` selecting this strategy.
pub const KIND: &str = "prophet";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProphetParams {
    /// Advertised in Hello, in seconds. Informational only.
    pub hello_timer: u32,
}

impl ProphetParams {
    pub fn from_properties(props: &toml::Table) -> Result<Self, AgentError> {
        let mut params = Self::default();
        if let Some(value) = props.get("hello_timer") {
            let timer = value
                .as_integer()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| AgentError::config(format!("prophet hello_timer: invalid value {value}")))?;
            params.hello_timer = timer;
        }
        Ok(params)
    }
}

/// Where one exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Undefined,
    SynSent,
    Estab,
    InfoExch,
    Finished,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub struct ProphetRouter {
    ctx: RouterContext,
    params: ProphetParams,
    table: Mutex<Predictability>,
    arbiter: ContactArbiter,
    presence: TimeoutHelper<Eid>,
    states: Mutex<HashMap<Eid, ExchangeState>>,
}

struct Presence;

impl TimeoutHandler<Eid> for Presence {
    fn on_inserted(&self, peer: &Eid) {
        trace!(%peer, "prophet neighbor present");
    }

    fn on_timeout(&self, peer: &Eid, permanence_ms: u64) {
        debug!(%peer, permanence_ms, "prophet neighbor gone");
    }
}

impl ProphetRouter {
    pub fn create(ctx: RouterContext, props: &toml::Table) -> Result<Arc<Self>, AgentError> {
        let params = ProphetParams::from_properties(props)?;
        Ok(Self::new(ctx, params))
    }

    pub fn new(ctx: RouterContext, params: ProphetParams) -> Arc<Self> {
        let arbiter = ContactArbiter::new(
            &ctx.base.to_string(),
            ctx.queue.clone(),
            ctx.clock.clone(),
            ctx.absence_timeout,
        );
        let presence = TimeoutHelper::new(
            ctx.queue.clone(),
            ctx.clock.clone(),
            ctx.absence_timeout,
            Arc::new(Presence),
        );
        Arc::new(Self {
            ctx,
            params,
            table: Mutex::new(Predictability::new()),
            arbiter,
            presence,
            states: Mutex::new(HashMap::new()),
        })
    }

    pub fn params(&self) -> ProphetParams {
        self.params
    }

    fn table(&self) -> MutexGuard<'_, Predictability> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current predictability towards `eid`, without aging.
    pub fn predictability(&self, eid: &Eid) -> f32 {
        self.table().get(eid)
    }

    /// Last state reached by the exchange with `peer`.
    pub fn state_of(&self, peer: &Eid) -> Option<ExchangeState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .copied()
    }

    fn record_state(&self, peer: &Eid, state: ExchangeState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.clone(), state);
    }

    /// Every sighting is an encounter, even while the neighbor is still
    /// marked present.
    fn neighbor_seen(&self, peer: &Eid) {
        self.presence.refresh(peer.clone());
        self.record_encounter(peer);
    }

    fn record_encounter(&self, peer: &Eid) {
        let now = self.ctx.clock.now_ms();
        let p = self.table().encounter(peer, now);
        debug!(%peer, p, "prophet encounter");
    }

    /// Aged table as advertised to neighbors.
    pub fn routing_information(&self) -> Vec<(Eid, f32)> {
        let now = self.ctx.clock.now_ms();
        let mut table = self.table();
        table.age_all(now);
        table.predictions()
    }

    /// Folds `peer`'s table into ours. Returns, for every endpoint it
    /// mentions, whether bundles for it should now also go to `peer`.
    pub fn apply_routing_information(&self, peer: &Eid, entries: &[(Eid, f32)], now_ms: u64) -> Vec<(Eid, bool)> {
        let mut table = self.table();
        let p_ab = table.get(peer);
        let mut decisions = Vec::with_capacity(entries.len());
        for (c, p_bc) in entries {
            if c == &self.ctx.base || c == peer {
                continue;
            }
            let p_ac = table.get(c);
            let updated = table.transitive(c, p_ab, *p_bc, now_ms);
            trace!(%peer, %c, p_ac, p_bc, updated, "transitive update");
            decisions.push((c.clone(), p_ac < *p_bc));
        }
        decisions
    }
}

impl Router for ProphetRouter {
    type Connection = ProphetConnection;

    fn context(&self) -> &RouterContext {
        &self.ctx
    }

    fn create_connection(self: &Arc<Self>, link: &Arc<Link>) -> Option<ProphetConnection> {
        trace!(peer = %link.eid(), "prophet connection created");
        Some(ProphetConnection::default())
    }

    fn on_link_near(self: &Arc<Self>, session: &Arc<Session<ProphetConnection>>) -> bool {
        let peer = session.peer().clone();
        self.neighbor_seen(&peer);
        let initiate = self.arbiter.update(&peer.to_string());
        debug!(%peer, initiate, parked = session.is_parked(), "prophet link near");
        session.inner().initiator.store(initiate, Ordering::Release);
        if session.is_parked() {
            session.inner().maybe_initiate(session);
            return false;
        }
        initiate
    }

    fn start(self: &Arc<Self>) {
        info!(registration = %self.ctx.registration, hello_timer = self.params.hello_timer, "prophet router started");
    }
}

// ─── Per-neighbor connection ─────────────────────────────────────────────────

#[derive(Default)]
pub struct ProphetConnection {
    provider: MessageProvider<ProphetExchange>,
    initiator: AtomicBool,
    started: AtomicBool,
}

impl ProphetConnection {
    /// Opens the exchange once per park, on the side chosen to initiate.
    fn maybe_initiate(&self, session: &Arc<Session<Self>>) {
        if !session.is_parked() || !self.initiator.load(Ordering::Acquire) {
            return;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %session.peer(), "prophet exchange initiated");
        self.provider.create(session, ProphetExchange::new());
    }

    pub fn exchanges(&self) -> usize {
        self.provider.len()
    }
}

impl LinkConnection for ProphetConnection {
    type Router = ProphetRouter;

    fn on_parked(&self, session: &Arc<Session<Self>>) {
        self.maybe_initiate(session);
    }

    fn on_unparked(&self, session: &Arc<Session<Self>>) {
        trace!(peer = %session.peer(), "prophet session unparked");
        self.started.store(false, Ordering::Release);
        self.provider.clear();
    }

    fn on_bundle_received(&self, session: &Arc<Session<Self>>, bundle: Bundle) -> anyhow::Result<()> {
        session.router().presence.refresh(session.peer().clone());
        self.provider.deliver(session, bundle.payload().clone())
    }
}

// ─── Exchange ────────────────────────────────────────────────────────────────

/// What a pending request waits for.
#[derive(Debug, Clone)]
pub enum ProphetListener {
    Hello,
    RoutingInfo,
    /// Bundles behind an offer, kept until the response says which to send.
    Offered(Vec<Bundle>),
}

pub struct ProphetExchange {
    state: ExchangeState,
}

impl ProphetExchange {
    fn new() -> Self {
        Self {
            state: ExchangeState::Undefined,
        }
    }

    fn enter(&mut self, ctx: &ExchangeContext<'_, Self>, next: ExchangeState) {
        debug!(peer = %ctx.session().peer(), from = ?self.state, to = ?next, "prophet state");
        self.state = next;
        ctx.session().router().record_state(ctx.session().peer(), next);
    }

    fn hello(ctx: &ExchangeContext<'_, Self>, kind: HelloKind) -> ProphetTlv {
        let router = ctx.session().router();
        ProphetTlv::Hello {
            kind,
            timer: router.params.hello_timer,
            eid: router.ctx.local.clone(),
        }
    }

    fn unexpected(&self, ctx: &ExchangeContext<'_, Self>, tlv: &ProphetTlv) {
        warn!(
            peer = %ctx.session().peer(),
            state = ?self.state,
            tlv = tlv.name(),
            "unexpected prophet TLV ignored"
        );
    }

    /// Initiator side: the peer's table arrived, answer with an offer.
    fn on_routing_info(&mut self, ctx: &mut ExchangeContext<'_, Self>, id: u32, entries: Vec<(Eid, f32)>) {
        let session = ctx.session().clone();
        let router = session.router();
        let peer = session.peer();
        let decisions = router.apply_routing_information(peer, &entries, router.ctx.clock.now_ms());

        let offered = match router.ctx.agent() {
            Ok(agent) => {
                for (c, link) in decisions {
                    let result = if link {
                        agent.route_link(&c, peer)
                    } else {
                        agent.route_unlink(&c, peer)
                    };
                    if let Err(e) = result {
                        warn!(%peer, %c, error = %e, "forwarding alias update failed");
                    }
                }
                agent.search_bundles(peer).unwrap_or_else(|e| {
                    warn!(%peer, error = %e, "bundle search failed");
                    Vec::new()
                })
            }
            Err(e) => {
                warn!(%peer, error = %e, "no agent for routing update");
                Vec::new()
            }
        };

        let entries = offered.iter().map(OfferEntry::of).collect();
        debug!(%peer, offered = offered.len(), "offering bundles");
        ctx.send_response(id, Some(ProphetListener::Offered(offered)), vec![ProphetTlv::Offer(entries)]);
        self.enter(ctx, ExchangeState::InfoExch);
    }

    /// Responder side: keep what we do not hold yet.
    fn on_offer(&mut self, ctx: &mut ExchangeContext<'_, Self>, id: u32, entries: Vec<OfferEntry>) {
        let peer = ctx.session().peer().clone();
        let accepted: Vec<OfferEntry> = match ctx.session().router().ctx.agent() {
            Ok(agent) => entries
                .into_iter()
                .filter(|entry| !agent.contains_bundle(&entry.bundle_id()).unwrap_or(false))
                .map(OfferEntry::accepted)
                .collect(),
            Err(e) => {
                warn!(%peer, error = %e, "no agent to check offers");
                Vec::new()
            }
        };
        debug!(%peer, accepted = accepted.len(), "answering offer");
        ctx.send_response(id, None, vec![ProphetTlv::Response(accepted)]);
        self.enter(ctx, ExchangeState::Finished);
        ctx.close();
    }

    /// Initiator side: send what the peer asked for and release the link.
    fn on_bundle_response(&mut self, ctx: &mut ExchangeContext<'_, Self>, offered: Vec<Bundle>, entries: Vec<OfferEntry>) {
        let session = ctx.session().clone();
        let wanted: Vec<Bundle> = offered
            .into_iter()
            .filter(|bundle| entries.iter().any(|e| e.is_accepted() && e.matches(bundle)))
            .collect();
        info!(peer = %session.peer(), sent = wanted.len(), "prophet exchange finished");
        if let Err(e) = session.send_all(wanted) {
            warn!(peer = %session.peer(), error = %e, "accepted bundles not sent");
        }
        self.enter(ctx, ExchangeState::Finished);
        ctx.close();
        session.unpark();
    }
}

impl Exchange for ProphetExchange {
    type Tlv = ProphetTlv;
    type Listener = ProphetListener;
    type Owner = ProphetConnection;

    fn create(_session: &Arc<Session<ProphetConnection>>) -> Self {
        Self::new()
    }

    fn init(&mut self, ctx: &mut ExchangeContext<'_, Self>, initiator: bool) {
        if initiator {
            let hello = Self::hello(ctx, HelloKind::Syn);
            ctx.send_message(Some(ProphetListener::Hello), vec![hello]);
            self.enter(ctx, ExchangeState::SynSent);
        } else {
            let peer = ctx.session().peer().to_string();
            ctx.session().router().arbiter.remove(&peer);
            self.enter(ctx, ExchangeState::Undefined);
        }
    }

    fn on_received(&mut self, ctx: &mut ExchangeContext<'_, Self>, id: u32, tlv: ProphetTlv) {
        match (self.state, tlv) {
            (ExchangeState::Undefined, ProphetTlv::Hello { kind: HelloKind::Syn, .. }) => {
                let hello = Self::hello(ctx, HelloKind::SynAck);
                ctx.send_response(id, None, vec![hello]);
                self.enter(ctx, ExchangeState::Estab);
            }
            (ExchangeState::Estab, ProphetTlv::Hello { kind: HelloKind::Ack, .. }) => {
                let rib = ctx.session().router().routing_information();
                ctx.send_message(Some(ProphetListener::RoutingInfo), vec![ProphetTlv::RoutingInfo(rib)]);
                self.enter(ctx, ExchangeState::InfoExch);
            }
            (ExchangeState::Estab, ProphetTlv::RoutingInfo(entries)) => self.on_routing_info(ctx, id, entries),
            (_, ProphetTlv::Error { kind, data }) => {
                warn!(peer = %ctx.session().peer(), ?kind, len = data.len(), "prophet error from peer");
            }
            (_, tlv) => self.unexpected(ctx, &tlv),
        }
    }

    fn on_response(&mut self, ctx: &mut ExchangeContext<'_, Self>, listener: ProphetListener, id: u32, tlv: ProphetTlv) {
        match (listener, tlv) {
            (ProphetListener::Hello, ProphetTlv::Hello { kind: HelloKind::SynAck, .. })
                if self.state == ExchangeState::SynSent =>
            {
                let hello = Self::hello(ctx, HelloKind::Ack);
                ctx.send_response(id, None, vec![hello]);
                self.enter(ctx, ExchangeState::Estab);
            }
            (ProphetListener::RoutingInfo, ProphetTlv::Offer(entries)) => self.on_offer(ctx, id, entries),
            (ProphetListener::Offered(offered), ProphetTlv::Response(entries)) => {
                self.on_bundle_response(ctx, offered, entries)
            }
            (_, tlv) => self.unexpected(ctx, &tlv),
        }
    }
}
