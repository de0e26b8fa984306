//! Request/response exchanges multiplexed over one session.
//!
//! Every exchange is identified locally by a random non-zero sender
//! instance. The first message of an exchange carries `receiver = 0`; the
//! peer answers from its own new instance and both sides address each other
//! from then on.
//!
//! ```text
//!   A (sender=0x1a2b, receiver=0)      ──▶  B spawns responder 0x7c01
//!   A ◀──  (sender=0x7c01, receiver=0x1a2b)  B
//!   A (sender=0x1a2b, receiver=0x7c01) ──▶  B
//! ```
//!
//! A request may register a listener. The first response carrying the
//! request's id consumes it; later responses with that id are treated as
//! unsolicited.

use anyhow::Context as _;
use bytes::Bytes;
use dtn_wire::{Message, Tlv};
use rand::RngExt as _;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use super::{LinkConnection, Router, Session};

/// One side of a strategy's exchange.
pub trait Exchange: Sized + Send + 'static {
    type Tlv: Tlv + Send + Debug;
    /// What a request remembers until its response arrives.
    type Listener: Clone + Send + Debug;
    type Owner: LinkConnection;

    /// Responder for an exchange opened by the peer.
    fn create(session: &Arc<Session<Self::Owner>>) -> Self;

    fn init(&mut self, ctx: &mut ExchangeContext<'_, Self>, initiator: bool);

    /// A TLV that answers none of our requests.
    fn on_received(&mut self, ctx: &mut ExchangeContext<'_, Self>, id: u32, tlv: Self::Tlv);

    /// A TLV in response to a request registered with `listener`.
    fn on_response(
        &mut self,
        ctx: &mut ExchangeContext<'_, Self>,
        listener: Self::Listener,
        id: u32,
        tlv: Self::Tlv,
    );
}

/// Sending side of an exchange, valid for one callback.
pub struct ExchangeContext<'a, E: Exchange> {
    session: &'a Arc<Session<E::Owner>>,
    sender: u16,
    receiver: u16,
    listeners: &'a mut HashMap<u32, E::Listener>,
    closed: &'a mut bool,
}

impl<E: Exchange> ExchangeContext<'_, E> {
    pub fn session(&self) -> &Arc<Session<E::Owner>> {
        self.session
    }

    pub fn sender(&self) -> u16 {
        self.sender
    }

    pub fn receiver(&self) -> u16 {
        self.receiver
    }

    pub fn is_closed(&self) -> bool {
        *self.closed
    }

    /// Ends the exchange once the current callback returns.
    pub fn close(&mut self) {
        *self.closed = true;
    }

    /// Sends a request. Returns its id, or `None` if nothing was sent.
    pub fn send_message(&mut self, listener: Option<E::Listener>, tlvs: Vec<E::Tlv>) -> Option<u32> {
        let mut rng = rand::rng();
        let mut id: u32 = rng.random();
        while self.listeners.contains_key(&id) {
            id = rng.random();
        }
        if !self.transmit(id, tlvs) {
            return None;
        }
        if let Some(listener) = listener {
            self.listeners.insert(id, listener);
        }
        Some(id)
    }

    /// Answers the message `id`. A listener catches the reply to this answer.
    pub fn send_response(&mut self, id: u32, listener: Option<E::Listener>, tlvs: Vec<E::Tlv>) -> bool {
        if !self.transmit(id, tlvs) {
            return false;
        }
        if let Some(listener) = listener {
            self.listeners.insert(id, listener);
        }
        true
    }

    fn transmit(&mut self, id: u32, tlvs: Vec<E::Tlv>) -> bool {
        if *self.closed {
            warn!(peer = %self.session.peer(), sender = self.sender, id, "send on closed exchange rejected");
            return false;
        }
        let mut message = match Message::new(self.sender, self.receiver, id) {
            Ok(message) => message,
            Err(e) => {
                error!(peer = %self.session.peer(), error = %e, "cannot build message");
                return false;
            }
        };
        for tlv in tlvs {
            message.push(tlv);
        }
        trace!(peer = %self.session.peer(), sender = self.sender, receiver = self.receiver, id, tlvs = ?message.tlvs, "message out");
        match self.session.send_message(&message) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %self.session.peer(), error = %e, "message not sent");
                false
            }
        }
    }
}

struct Slot<E: Exchange> {
    exchange: E,
    receiver: u16,
    listeners: HashMap<u32, E::Listener>,
    closed: bool,
}

impl<E: Exchange> Slot<E> {
    fn run<R>(
        &mut self,
        session: &Arc<Session<E::Owner>>,
        sender: u16,
        f: impl FnOnce(&mut E, &mut ExchangeContext<'_, E>) -> R,
    ) -> R {
        let Slot {
            exchange,
            receiver,
            listeners,
            closed,
        } = self;
        let mut ctx = ExchangeContext {
            session,
            sender,
            receiver: *receiver,
            listeners,
            closed,
        };
        f(exchange, &mut ctx)
    }
}

/// Exchanges of one session, keyed by local sender instance.
pub struct MessageProvider<E: Exchange> {
    slots: Mutex<HashMap<u16, Slot<E>>>,
}

impl<E: Exchange> Default for MessageProvider<E> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<E: Exchange> MessageProvider<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, Slot<E>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every exchange.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn allocate(slots: &HashMap<u16, Slot<E>>) -> u16 {
        let mut rng = rand::rng();
        loop {
            let id = rng.random_range(1..=u16::MAX);
            if !slots.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&self, exchange: E, receiver: u16) -> u16 {
        let mut slots = self.lock();
        let sender = Self::allocate(&slots);
        slots.insert(
            sender,
            Slot {
                exchange,
                receiver,
                listeners: HashMap::new(),
                closed: false,
            },
        );
        sender
    }

    fn take(&self, sender: u16) -> Option<Slot<E>> {
        self.lock().remove(&sender)
    }

    fn restore(&self, sender: u16, slot: Slot<E>) {
        if slot.closed {
            debug!(sender, "exchange closed");
            return;
        }
        self.lock().insert(sender, slot);
    }

    /// Opens an exchange as initiator. Returns its sender instance.
    pub fn create(&self, session: &Arc<Session<E::Owner>>, exchange: E) -> u16 {
        let sender = self.insert(exchange, 0);
        if let Some(mut slot) = self.take(sender) {
            slot.run(session, sender, |exchange, ctx| exchange.init(ctx, true));
            self.restore(sender, slot);
        }
        sender
    }

    /// Feeds a control payload from the peer to its exchange.
    ///
    /// Framing errors are returned. Messages for unknown exchanges are
    /// dropped with a warning.
    pub fn deliver(&self, session: &Arc<Session<E::Owner>>, payload: Bytes) -> anyhow::Result<()> {
        let eids = &session.router().context().eids;
        let message = Message::<E::Tlv>::decode(payload, eids)
            .with_context(|| format!("undecodable control message from {}", session.peer()))?;

        if message.sender == 0 {
            error!(peer = %session.peer(), id = message.id, "message without sender instance dropped");
            return Ok(());
        }

        let sender = if message.receiver == 0 {
            let existing = self
                .lock()
                .iter()
                .find(|(_, slot)| slot.receiver == message.sender)
                .map(|(id, _)| *id);
            match existing {
                Some(id) => id,
                None => self.spawn(session, message.sender),
            }
        } else {
            message.receiver
        };

        let Some(mut slot) = self.take(sender) else {
            warn!(peer = %session.peer(), receiver = message.receiver, id = message.id, "message for unknown exchange dropped");
            return Ok(());
        };
        if slot.receiver == 0 {
            slot.receiver = message.sender;
        }

        let id = message.id;
        let listener = slot.listeners.remove(&id);
        trace!(peer = %session.peer(), sender, id, tlvs = ?message.tlvs, "message in");
        for tlv in message.tlvs {
            if slot.closed {
                debug!(peer = %session.peer(), sender, "ignoring TLVs after close");
                break;
            }
            match &listener {
                Some(listener) => {
                    let listener = listener.clone();
                    slot.run(session, sender, |exchange, ctx| exchange.on_response(ctx, listener, id, tlv));
                }
                None => {
                    slot.run(session, sender, |exchange, ctx| exchange.on_received(ctx, id, tlv));
                }
            }
        }
        self.restore(sender, slot);
        Ok(())
    }

    fn spawn(&self, session: &Arc<Session<E::Owner>>, peer_sender: u16) -> u16 {
        let sender = self.insert(E::create(session), peer_sender);
        debug!(peer = %session.peer(), sender, peer_sender, "responder exchange spawned");
        if let Some(mut slot) = self.take(sender) {
            slot.run(session, sender, |exchange, ctx| exchange.init(ctx, false));
            // keep the slot even if init closed it so the message is not
            // reported as unknown; restore drops it after delivery
            self.lock().insert(sender, slot);
        }
        sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::router::{test_context, RouterContext};
    use dtn_wire::{Bundle, EidRegistry, RawTlv};

    struct EchoRouter {
        ctx: RouterContext,
    }

    #[derive(Default)]
    struct EchoConnection {
        provider: MessageProvider<Echo>,
        seen: Mutex<Vec<(bool, u8)>>,
    }

    impl Router for EchoRouter {
        type Connection = EchoConnection;

        fn context(&self) -> &RouterContext {
            &self.ctx
        }

        fn create_connection(self: &Arc<Self>, _link: &Arc<Link>) -> Option<EchoConnection> {
            Some(EchoConnection::default())
        }
    }

    impl LinkConnection for EchoConnection {
        type Router = EchoRouter;

        fn on_bundle_received(&self, session: &Arc<Session<Self>>, bundle: Bundle) -> anyhow::Result<()> {
            self.provider.deliver(session, bundle.payload().clone())
        }
    }

    struct Echo {
        initiator: bool,
    }

    impl Exchange for Echo {
        type Tlv = RawTlv;
        type Listener = u8;
        type Owner = EchoConnection;

        fn create(_session: &Arc<Session<EchoConnection>>) -> Self {
            Echo { initiator: false }
        }

        fn init(&mut self, ctx: &mut ExchangeContext<'_, Self>, initiator: bool) {
            self.initiator = initiator;
            if initiator {
                ctx.send_message(Some(7), vec![RawTlv::new(1, 0, vec![1])]);
            }
        }

        fn on_received(&mut self, ctx: &mut ExchangeContext<'_, Self>, _id: u32, tlv: RawTlv) {
            ctx.session().inner().seen.lock().unwrap().push((self.initiator, tlv.tlv_type));
            if tlv.tlv_type == 9 {
                ctx.close();
            }
        }

        fn on_response(&mut self, ctx: &mut ExchangeContext<'_, Self>, listener: u8, _id: u32, tlv: RawTlv) {
            ctx.session().inner().seen.lock().unwrap().push((self.initiator, listener + tlv.tlv_type));
        }
    }

    fn payload(sender: u16, receiver: u16, id: u32, tlv_type: u8) -> Bytes {
        Message::new(sender, receiver, id)
            .unwrap()
            .with_tlv(RawTlv::new(tlv_type, 0, vec![0]))
            .encode()
    }

    fn session(eids: &EidRegistry) -> (Arc<EchoRouter>, Arc<Link>, Arc<Session<EchoConnection>>) {
        let router = Arc::new(EchoRouter {
            ctx: test_context(1, "echo", "echo", eids),
        });
        let link = Link::new(eids.host("peer").unwrap(), 1.0);
        let session = link.connection(&router).unwrap();
        (router, link, session)
    }

    #[test]
    fn responder_spawned_and_addressed() {
        let eids = EidRegistry::new();
        let (router, link, session) = session(&eids);
        let s = session.clone();
        router
            .ctx
            .queue
            .post_and_wait(move || {
                let provider = &s.inner().provider;
                provider.deliver(&s, payload(0x42, 0, 1, 3)).unwrap();
                assert_eq!(provider.len(), 1);
                // same peer instance, still unaddressed: same responder
                provider.deliver(&s, payload(0x42, 0, 2, 4)).unwrap();
                assert_eq!(provider.len(), 1);
                // closing TLV ends the exchange
                provider.deliver(&s, payload(0x42, 0, 3, 9)).unwrap();
                assert!(provider.is_empty());
            })
            .unwrap();
        assert_eq!(
            *session.inner().seen.lock().unwrap(),
            vec![(false, 3), (false, 4), (false, 9)]
        );
        link.shutdown();
        router.ctx.queue.shutdown();
    }

    #[test]
    fn response_consumes_listener_once() {
        let eids = EidRegistry::new();
        let (router, link, session) = session(&eids);
        let s = session.clone();
        router
            .ctx
            .queue
            .post_and_wait(move || {
                let provider = &s.inner().provider;
                let sender = provider.create(&s, Echo { initiator: true });
                let id = {
                    let slots = provider.lock();
                    *slots[&sender].listeners.keys().next().unwrap()
                };
                provider.deliver(&s, payload(0x99, sender, id, 2)).unwrap();
                provider.deliver(&s, payload(0x99, sender, id, 2)).unwrap();
                assert_eq!(provider.lock()[&sender].receiver, 0x99);
            })
            .unwrap();
        assert_eq!(*session.inner().seen.lock().unwrap(), vec![(true, 9), (true, 2)]);
        link.shutdown();
        router.ctx.queue.shutdown();
    }

    #[test]
    fn unknown_receiver_and_garbage() {
        let eids = EidRegistry::new();
        let (router, link, session) = session(&eids);
        let s = session.clone();
        router
            .ctx
            .queue
            .post_and_wait(move || {
                let provider = &s.inner().provider;
                provider.deliver(&s, payload(0x10, 0x4444, 1, 3)).unwrap();
                assert!(provider.is_empty());
                assert!(provider.deliver(&s, Bytes::from_static(&[0, 0x10, 0])).is_err());
            })
            .unwrap();
        assert!(session.inner().seen.lock().unwrap().is_empty());
        link.shutdown();
        router.ctx.queue.shutdown();
    }
}
