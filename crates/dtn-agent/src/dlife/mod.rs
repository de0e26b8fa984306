//! Social routing from daily contact patterns.
//!
//! Both sides of a contact run the same exchange. Each announces itself
//! with a Hello, the Hello ACK lets it send its [`Social`] record, and the
//! peer acknowledges that with `Ack(Social)`. The exchange is over once our
//! record was acknowledged and the peer's record arrived.
//!
//! A peer's record steers forwarding: destinations it is socially closer to
//! than we are are aliased onto it, and every stored bundle for those
//! destinations that it does not carry yet is handed over.

pub mod social;
pub mod tlv;

use dtn_wire::{Bundle, Eid};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, trace, warn};

pub use social::{SocialInformation, SocialParams};
pub use tlv::{AckKind, BundleSpec, DLifeTlv, HelloKind, Social};

use crate::error::AgentError;
use crate::link::Link;
use crate::router::message::{Exchange, ExchangeContext, MessageProvider};
use crate::router::{LinkConnection, Router, RouterContext, Session};
use crate::task::TaskHandle;
use crate::timeout::{ContactArbiter, TimeoutHandler, TimeoutHelper};

/// Configuration `kind` selecting this strategy.
pub const KIND: &str = "dlife";

fn params_from_properties(props: &toml::Table) -> Result<SocialParams, AgentError> {
    let mut params = SocialParams::default();
    if let Some(value) = props.get("dslen") {
        params.dslen = value
            .as_integer()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| AgentError::config(format!("dlife dslen: invalid value {value}")))?;
    }
    if let Some(value) = props.get("dsdur") {
        params.dsdur_secs = value
            .as_integer()
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| AgentError::config(format!("dlife dsdur: invalid value {value}")))?;
    }
    if let Some(value) = props.get("damping_factor") {
        params.damping = value
            .as_float()
            .or_else(|| value.as_integer().map(|v| v as f64))
            .map(|v| v as f32)
            .ok_or_else(|| AgentError::config(format!("dlife damping_factor: invalid value {value}")))?;
    }
    params.validate()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLifeState {
    Undefined,
    HelloExchange,
    SocialExchange,
    Finished,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub struct DLifeRouter {
    ctx: RouterContext,
    social: Mutex<SocialInformation>,
    arbiter: ContactArbiter,
    presence: TimeoutHelper<Eid>,
    acked: Mutex<HashSet<BundleSpec>>,
    states: Mutex<HashMap<Eid, DLifeState>>,
    slice_timer: Mutex<Option<TaskHandle>>,
}

struct Presence {
    router: Weak<DLifeRouter>,
}

impl TimeoutHandler<Eid> for Presence {
    fn on_timeout(&self, peer: &Eid, permanence_ms: u64) {
        if let Some(router) = self.router.upgrade() {
            router.social().update_tct(peer, permanence_ms as f32 / 1e3);
        }
    }
}

impl DLifeRouter {
    pub fn create(ctx: RouterContext, props: &toml::Table) -> Result<Arc<Self>, AgentError> {
        let params = params_from_properties(props)?;
        Self::new(ctx, params)
    }

    pub fn new(ctx: RouterContext, params: SocialParams) -> Result<Arc<Self>, AgentError> {
        let social = SocialInformation::new(params, ctx.clock.now_ms())?;
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
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
                Arc::new(Presence { router: weak.clone() }),
            );
            Self {
                ctx,
                social: Mutex::new(social),
                arbiter,
                presence,
                acked: Mutex::new(HashSet::new()),
                states: Mutex::new(HashMap::new()),
                slice_timer: Mutex::new(None),
            }
        }))
    }

    pub fn social(&self) -> MutexGuard<'_, SocialInformation> {
        self.social.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acked(&self) -> MutexGuard<'_, HashSet<BundleSpec>> {
        self.acked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_acked(&self, spec: &BundleSpec) -> bool {
        self.acked().contains(spec)
    }

    pub fn state_of(&self, peer: &Eid) -> Option<DLifeState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .copied()
    }

    fn record_state(&self, peer: &Eid, state: DLifeState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.clone(), state);
    }

    /// Our record for a neighbor: sampled weights, bundles held, bundles
    /// known delivered, own importance.
    fn local_social(&self) -> Social {
        let carried = match self.ctx.agent().and_then(|agent| agent.bundles()) {
            Ok(bundles) => {
                let mut specs: Vec<_> = bundles.iter().map(BundleSpec::of).collect();
                specs.sort();
                specs
            }
            Err(e) => {
                warn!(error = %e, "carried bundles unavailable");
                Vec::new()
            }
        };
        let mut acked: Vec<_> = self.acked().iter().cloned().collect();
        acked.sort();
        let social = self.social();
        Social {
            importance: social.tecdi(),
            weights: social.sample_weights(),
            carried,
            acked,
        }
    }

    /// Link decisions for the destinations a peer reports weights for.
    /// `true` means bundles for that destination should also go to `peer`.
    pub fn routing_decisions(&self, peer: &Eid, record: &Social) -> Vec<(Eid, bool)> {
        let social = self.social();
        let tecdi = social.tecdi();
        record
            .weights
            .iter()
            .filter(|(eid, _)| eid != &self.ctx.base && eid != peer)
            .map(|(eid, weight)| {
                let link = match social.weight(eid) {
                    Some(local) => *weight >= local,
                    None => tecdi < record.importance,
                };
                (eid.clone(), link)
            })
            .collect()
    }

    fn schedule_slice_end(self: &Arc<Self>) {
        let wait = self.social().next_boundary_wait(self.ctx.clock.now_ms());
        trace!(wait_ms = wait.as_millis() as u64, "slice end scheduled");
        let weak = Arc::downgrade(self);
        let handle = self.ctx.queue.schedule(wait, move || {
            if let Some(router) = weak.upgrade() {
                router.end_of_slice();
            }
            Ok(())
        });
        if let Some(old) = self
            .slice_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.cancel();
        }
    }

    fn end_of_slice(self: &Arc<Self>) {
        let now = self.ctx.clock.now_ms();
        let closed = {
            let mut social = self.social();
            if social.ds_at(now) == social.current_ds() {
                debug!("slice not finished yet, rescheduling");
                0
            } else {
                social.advance(now)
            }
        };
        if closed > 0 {
            debug!(closed, "end of slice");
        }
        self.schedule_slice_end();
    }
}

impl Router for DLifeRouter {
    type Connection = DLifeConnection;

    fn context(&self) -> &RouterContext {
        &self.ctx
    }

    fn create_connection(self: &Arc<Self>, _link: &Arc<Link>) -> Option<DLifeConnection> {
        Some(DLifeConnection::default())
    }

    fn on_link_near(self: &Arc<Self>, session: &Arc<Session<DLifeConnection>>) -> bool {
        let peer = session.peer().clone();
        self.presence.refresh(peer.clone());
        let initiate = self.arbiter.update(&peer.to_string());
        debug!(%peer, initiate, parked = session.is_parked(), "dlife link near");
        session.inner().initiator.store(initiate, Ordering::Release);
        if session.is_parked() {
            session.inner().maybe_initiate(session);
            return false;
        }
        initiate
    }

    fn start(self: &Arc<Self>) {
        let params = self.social().params();
        info!(
            registration = %self.ctx.registration,
            dslen = params.dslen,
            dsdur = params.dsdur_secs,
            "dlife router started"
        );
        self.schedule_slice_end();
    }

    fn on_bundle_delivered(&self, bundle: &Bundle) {
        self.acked().insert(BundleSpec::of(bundle));
    }

    fn shutdown(&self) {
        if let Some(timer) = self.slice_timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            timer.cancel();
        }
    }
}

// ─── Per-neighbor connection ─────────────────────────────────────────────────

#[derive(Default)]
pub struct DLifeConnection {
    provider: MessageProvider<DLifeExchange>,
    initiator: AtomicBool,
    started: AtomicBool,
    /// Storage the neighbor advertised in its Hello.
    storage: AtomicU64,
    carried: Mutex<HashSet<BundleSpec>>,
    acked: Mutex<HashSet<BundleSpec>>,
}

impl DLifeConnection {
    fn maybe_initiate(&self, session: &Arc<Session<Self>>) {
        if !session.is_parked() || !self.initiator.load(Ordering::Acquire) {
            return;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %session.peer(), "dlife exchange initiated");
        self.provider.create(session, DLifeExchange::new());
    }

    pub fn peer_storage(&self) -> u64 {
        self.storage.load(Ordering::Acquire)
    }

    pub fn peer_carries(&self, spec: &BundleSpec) -> bool {
        self.carried.lock().unwrap_or_else(|e| e.into_inner()).contains(spec)
    }

    /// Merges the peer's record into what we know about it.
    fn absorb(&self, record: &Social) {
        let mut carried = self.carried.lock().unwrap_or_else(|e| e.into_inner());
        let mut acked = self.acked.lock().unwrap_or_else(|e| e.into_inner());
        carried.extend(record.carried.iter().cloned());
        for spec in &record.acked {
            carried.remove(spec);
            acked.insert(spec.clone());
        }
    }
}

impl LinkConnection for DLifeConnection {
    type Router = DLifeRouter;

    fn on_parked(&self, session: &Arc<Session<Self>>) {
        self.maybe_initiate(session);
    }

    fn on_unparked(&self, session: &Arc<Session<Self>>) {
        trace!(peer = %session.peer(), "dlife session unparked");
        self.started.store(false, Ordering::Release);
        self.provider.clear();
    }

    fn on_bundle_received(&self, session: &Arc<Session<Self>>, bundle: Bundle) -> anyhow::Result<()> {
        session.router().presence.refresh(session.peer().clone());
        self.provider.deliver(session, bundle.payload().clone())
    }
}

// ─── Exchange ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLifeListener {
    Hello,
    Social,
}

pub struct DLifeExchange {
    state: DLifeState,
    initiator: bool,
    social_acked: bool,
    social_received: bool,
}

impl DLifeExchange {
    fn new() -> Self {
        Self {
            state: DLifeState::Undefined,
            initiator: false,
            social_acked: false,
            social_received: false,
        }
    }

    fn enter(&mut self, ctx: &ExchangeContext<'_, Self>, next: DLifeState) {
        debug!(peer = %ctx.session().peer(), from = ?self.state, to = ?next, "dlife state");
        self.state = next;
        ctx.session().router().record_state(ctx.session().peer(), next);
    }

    fn hello(ctx: &ExchangeContext<'_, Self>, kind: HelloKind) -> DLifeTlv {
        let router = ctx.session().router();
        let storage = if kind == HelloKind::Hel {
            router
                .ctx
                .agent()
                .and_then(|agent| agent.storage_available())
                .map(|n| n as u64)
                .unwrap_or(0)
        } else {
            0
        };
        DLifeTlv::Hello {
            kind,
            eid: router.ctx.local.clone(),
            timer: 0,
            storage,
        }
    }

    fn unexpected(&self, ctx: &ExchangeContext<'_, Self>, tlv: &DLifeTlv) {
        warn!(
            peer = %ctx.session().peer(),
            state = ?self.state,
            tlv = tlv.name(),
            "unexpected dlife TLV ignored"
        );
    }

    fn on_hello(&mut self, ctx: &mut ExchangeContext<'_, Self>, id: u32, eid: Eid, storage: u64) {
        let session = ctx.session().clone();
        let router = session.router();
        match session.peer().with_scheme(&router.ctx.eids, &router.ctx.registration) {
            Ok(expected) if expected != eid => {
                warn!(peer = %session.peer(), announced = %eid, "hello from unexpected endpoint");
            }
            Ok(_) => {}
            Err(e) => warn!(peer = %session.peer(), error = %e, "cannot derive peer registration"),
        }
        session.inner().storage.store(storage, Ordering::Release);
        let ack = Self::hello(ctx, HelloKind::Ack);
        ctx.send_response(id, None, vec![ack]);
        trace!(peer = %session.peer(), storage, "hello acknowledged");
    }

    fn on_social(&mut self, ctx: &mut ExchangeContext<'_, Self>, id: u32, record: Social) {
        let session = ctx.session().clone();
        let router = session.router();
        let peer = session.peer();

        let decisions = router.routing_decisions(peer, &record);
        session.inner().absorb(&record);
        router.social().set_neighbor_tecdi(peer, record.importance);
        router.acked().extend(record.acked.iter().cloned());

        match router.ctx.agent() {
            Ok(agent) => {
                for (dst, link) in decisions {
                    let result = if link {
                        agent.route_link(&dst, peer)
                    } else {
                        agent.route_unlink(&dst, peer)
                    };
                    if let Err(e) = result {
                        warn!(%peer, %dst, error = %e, "forwarding alias update failed");
                    }
                }

                let stored = agent.bundles().unwrap_or_default();
                for bundle in stored.iter().filter(|b| record.acked.iter().any(|s| s.matches(b))) {
                    if let Err(e) = agent.remove_bundle(&bundle.id()) {
                        warn!(%peer, bundle = %bundle.id(), error = %e, "acked bundle not removed");
                    }
                }

                let forward: Vec<Bundle> = agent
                    .search_bundles(peer)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|b| {
                        let spec = BundleSpec::of(b);
                        !session.inner().peer_carries(&spec) && !router.is_acked(&spec)
                    })
                    .collect();
                debug!(%peer, forward = forward.len(), importance = record.importance, "social applied");
                if let Err(e) = session.send_all(forward) {
                    warn!(%peer, error = %e, "bundles not forwarded");
                }
            }
            Err(e) => warn!(%peer, error = %e, "no agent for social update"),
        }

        ctx.send_response(id, None, vec![DLifeTlv::Ack(AckKind::Social)]);
        self.social_received = true;
        self.maybe_finish(ctx);
    }

    fn maybe_finish(&mut self, ctx: &mut ExchangeContext<'_, Self>) {
        if !(self.social_acked && self.social_received) {
            return;
        }
        self.enter(ctx, DLifeState::Finished);
        ctx.close();
        info!(peer = %ctx.session().peer(), initiator = self.initiator, "dlife exchange finished");
        if self.initiator {
            ctx.session().unpark();
        }
    }
}

impl Exchange for DLifeExchange {
    type Tlv = DLifeTlv;
    type Listener = DLifeListener;
    type Owner = DLifeConnection;

    fn create(_session: &Arc<Session<DLifeConnection>>) -> Self {
        Self::new()
    }

    fn init(&mut self, ctx: &mut ExchangeContext<'_, Self>, initiator: bool) {
        self.initiator = initiator;
        if !initiator {
            let peer = ctx.session().peer().to_string();
            ctx.session().router().arbiter.remove(&peer);
        }
        let hello = Self::hello(ctx, HelloKind::Hel);
        ctx.send_message(Some(DLifeListener::Hello), vec![hello]);
        self.enter(ctx, DLifeState::HelloExchange);
    }

    fn on_received(&mut self, ctx: &mut ExchangeContext<'_, Self>, id: u32, tlv: DLifeTlv) {
        match (self.state, tlv) {
            (
                DLifeState::HelloExchange | DLifeState::SocialExchange,
                DLifeTlv::Hello {
                    kind: HelloKind::Hel,
                    eid,
                    storage,
                    ..
                },
            ) => self.on_hello(ctx, id, eid, storage),
            (DLifeState::HelloExchange | DLifeState::SocialExchange, DLifeTlv::Social(record))
                if !self.social_received =>
            {
                self.on_social(ctx, id, record)
            }
            (_, DLifeTlv::Ack(AckKind::Break)) => {
                debug!(peer = %ctx.session().peer(), "peer broke the exchange");
                ctx.close();
            }
            (_, tlv) => self.unexpected(ctx, &tlv),
        }
    }

    fn on_response(&mut self, ctx: &mut ExchangeContext<'_, Self>, listener: DLifeListener, _id: u32, tlv: DLifeTlv) {
        match (listener, tlv) {
            (DLifeListener::Hello, DLifeTlv::Hello { kind: HelloKind::Ack, .. }) => {
                self.enter(ctx, DLifeState::SocialExchange);
                let record = ctx.session().router().local_social();
                ctx.send_message(Some(DLifeListener::Social), vec![DLifeTlv::Social(record)]);
            }
            (DLifeListener::Social, DLifeTlv::Ack(AckKind::Social)) => {
                self.social_acked = true;
                self.maybe_finish(ctx);
            }
            (_, tlv) => self.unexpected(ctx, &tlv),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_context;
    use dtn_wire::{BundleInfo, EidRegistry};

    fn router(eids: &EidRegistry) -> Arc<DLifeRouter> {
        DLifeRouter::create(test_context(0, KIND, "dlife", eids), &toml::Table::new()).unwrap()
    }

    #[test]
    fn properties_are_validated() {
        let mut props = toml::Table::new();
        props.insert("dslen".into(), toml::Value::Integer(12));
        props.insert("dsdur".into(), toml::Value::Integer(120));
        props.insert("damping_factor".into(), toml::Value::Float(0.5));
        let params = params_from_properties(&props).unwrap();
        assert_eq!((params.dslen, params.dsdur_secs, params.damping), (12, 120, 0.5));

        props.insert("dsdur".into(), toml::Value::Integer(30));
        assert!(params_from_properties(&props).is_err());
        props.insert("dsdur".into(), toml::Value::String("x".into()));
        assert!(params_from_properties(&props).is_err());
    }

    #[test]
    fn decisions_compare_weights_then_importance() {
        let eids = EidRegistry::new();
        let r = router(&eids);
        let peer = eids.host("peer").unwrap();
        let known = eids.host("known").unwrap();
        let stranger = eids.host("stranger").unwrap();
        r.social().update_tct(&known, 5.0);
        // known has weight 0 until its slice closes

        let record = Social {
            importance: 10.0,
            weights: vec![
                (known.clone(), 1.0),
                (stranger.clone(), 1.0),
                (peer.clone(), 3.0),
                (r.ctx.base.clone(), 3.0),
            ],
            ..Social::default()
        };
        assert_eq!(
            r.routing_decisions(&peer, &record),
            vec![(known.clone(), true), (stranger.clone(), true)]
        );

        let humble = Social {
            importance: 0.0,
            weights: vec![(stranger.clone(), 1.0)],
            ..Social::default()
        };
        assert_eq!(r.routing_decisions(&peer, &humble), vec![(stranger, false)]);
        r.ctx.queue.shutdown();
    }

    #[test]
    fn delivered_bundles_are_acked() {
        let eids = EidRegistry::new();
        let r = router(&eids);
        let info = BundleInfo::new(&eids, eids.host("a").unwrap(), eids.host("local").unwrap(), 1, 1, 60);
        let bundle = Bundle::new(info, vec![1]);
        r.on_bundle_delivered(&bundle);
        assert!(r.is_acked(&BundleSpec::of(&bundle)));
        r.ctx.queue.shutdown();
    }

    #[test]
    fn absorb_moves_acked_out_of_carried() {
        let eids = EidRegistry::new();
        let conn = DLifeConnection::default();
        let spec = BundleSpec {
            destination: eids.host("d").unwrap(),
            id: 7,
        };
        conn.absorb(&Social {
            carried: vec![spec.clone()],
            ..Social::default()
        });
        assert!(conn.peer_carries(&spec));
        conn.absorb(&Social {
            acked: vec![spec.clone()],
            ..Social::default()
        });
        assert!(!conn.peer_carries(&spec));
    }
}
