//! One [`Link`] per neighbor EID.
//!
//! A link aggregates every connection known for its neighbor and lets the
//! routers share them. Connections live in two disjoint sets:
//!
//! ```text
//!             register (created)          connect() ok
//!  discovery ─────────────────▶ available ─────────────▶ open
//!  accept    ─────────────────────────────────────────▶ open
//!                                   closed: removed everywhere
//! ```
//!
//! Parking is link-wide. The first open connection parks every session;
//! an unpark request from any session closes every open connection and
//! unparks them all. Losing the last open connection unparks them too.
//!
//! All set bookkeeping happens on the link's own [`TaskQueue`]. Connects
//! block, so they run on a short-lived thread and report back to the
//! worker; sends issued meanwhile wait for the outcome.

use dtn_wire::{Bundle, Eid};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, info, trace, warn};

use crate::cl::{Connection, ConnectionState};
use crate::error::AgentError;
use crate::router::{Router, RouterId, Session, SessionHooks};
use crate::task::{TaskHandle, TaskQueue};

#[derive(Default)]
struct ConnectionSets {
    available: Vec<Arc<Connection>>,
    open: Vec<Arc<Connection>>,
    all: Vec<Arc<Connection>>,
}

impl ConnectionSets {
    fn contains(list: &[Arc<Connection>], conn: &Connection) -> bool {
        list.iter().any(|c| c.id() == conn.id())
    }

    fn remove(list: &mut Vec<Arc<Connection>>, conn: &Connection) -> bool {
        let before = list.len();
        list.retain(|c| c.id() != conn.id());
        list.len() != before
    }
}

struct SessionEntry {
    any: Arc<dyn Any + Send + Sync>,
    hooks: Arc<dyn SessionHooks>,
}

/// Called with the bundles that were handed to a connection.
pub type SentCallback = Box<dyn FnOnce(Vec<Bundle>) + Send + 'static>;

struct PendingSend {
    bundles: Vec<Bundle>,
    on_sent: Option<SentCallback>,
}

impl PendingSend {
    fn finish(self, sent: Vec<Bundle>) {
        if let Some(on_sent) = self.on_sent {
            on_sent(sent);
        }
    }
}

/// Sends held back while a connect runs off the worker.
#[derive(Default)]
struct Pending {
    connecting: bool,
    queued: Vec<PendingSend>,
}

pub struct Link {
    eid: Eid,
    queue: TaskQueue,
    sets: Mutex<ConnectionSets>,
    sessions: Mutex<HashMap<RouterId, SessionEntry>>,
    pending: Mutex<Pending>,
}

impl Link {
    pub fn new(eid: Eid, time_scale: f64) -> Arc<Self> {
        let queue = TaskQueue::with_time_scale(format!("link-{eid}"), time_scale);
        Arc::new(Self {
            eid,
            queue,
            sets: Mutex::new(ConnectionSets::default()),
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(Pending::default()),
        })
    }

    pub fn eid(&self) -> &Eid {
        &self.eid
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    fn lock_sets(&self) -> MutexGuard<'_, ConnectionSets> {
        self.sets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<RouterId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Racy snapshot of `(available, open)` counts.
    pub fn connection_counts(&self) -> (usize, usize) {
        let sets = self.lock_sets();
        (sets.available.len(), sets.open.len())
    }

    pub fn has_open_connection(&self) -> bool {
        !self.lock_sets().open.is_empty()
    }

    // ─── Connection bookkeeping ──────────────────────────────────────────

    pub fn notify_connection_registered(self: &Arc<Self>, conn: Arc<Connection>) -> TaskHandle {
        let link = self.clone();
        self.queue.post(move || {
            link.register(conn);
            Ok(())
        })
    }

    pub fn notify_connection_closed(self: &Arc<Self>, conn: Arc<Connection>) -> TaskHandle {
        let link = self.clone();
        self.queue.post(move || {
            link.closed(&conn);
            Ok(())
        })
    }

    fn register(&self, conn: Arc<Connection>) {
        let first_open = {
            let mut sets = self.lock_sets();
            if ConnectionSets::contains(&sets.all, &conn) {
                trace!(link = %self.eid, id = conn.id(), "connection already registered");
                return;
            }
            match conn.state() {
                ConnectionState::Closed => {
                    debug!(link = %self.eid, id = conn.id(), "ignoring closed connection");
                    return;
                }
                ConnectionState::Connected => {
                    sets.all.push(conn.clone());
                    sets.open.push(conn.clone());
                    sets.open.len() == 1
                }
                ConnectionState::Created | ConnectionState::Connecting => {
                    // rediscovery through the same adapter supersedes the stale entry
                    let stale: Vec<_> = sets
                        .available
                        .iter()
                        .filter(|c| c.adapter() == conn.adapter() && c.state() == ConnectionState::Created)
                        .cloned()
                        .collect();
                    for old in &stale {
                        ConnectionSets::remove(&mut sets.available, old);
                        ConnectionSets::remove(&mut sets.all, old);
                    }
                    sets.all.push(conn.clone());
                    sets.available.push(conn.clone());
                    false
                }
            }
        };
        debug!(link = %self.eid, id = conn.id(), state = ?conn.state(), "connection registered");
        if first_open {
            self.park_all();
        }
    }

    fn closed(&self, conn: &Connection) {
        let lost_last_open = {
            let mut sets = self.lock_sets();
            let was_open = ConnectionSets::remove(&mut sets.open, conn);
            ConnectionSets::remove(&mut sets.available, conn);
            ConnectionSets::remove(&mut sets.all, conn);
            was_open && sets.open.is_empty()
        };
        debug!(link = %self.eid, id = conn.id(), "connection removed");
        if lost_last_open {
            self.unpark_all();
        }
    }

    /// Repairs set divergence caused by connection state changes observed
    /// outside this worker. Returns the number of repairs.
    pub fn cleanup(self: &Arc<Self>) -> Result<usize, AgentError> {
        let link = self.clone();
        self.queue.post_and_wait(move || link.reconcile())
    }

    fn reconcile(&self) -> usize {
        let mut repairs = 0;
        let (gained_open, lost_open) = {
            let mut sets = self.lock_sets();
            let had_open = !sets.open.is_empty();

            for conn in sets.available.clone().into_iter().chain(sets.open.clone()) {
                if !ConnectionSets::contains(&sets.all, &conn) {
                    warn!(link = %self.eid, id = conn.id(), "connection missing from registry, adding");
                    sets.all.push(conn);
                    repairs += 1;
                }
            }

            for conn in sets.all.clone() {
                let in_available = ConnectionSets::contains(&sets.available, &conn);
                let in_open = ConnectionSets::contains(&sets.open, &conn);
                match conn.state() {
                    ConnectionState::Closed => {
                        warn!(link = %self.eid, id = conn.id(), "dropping closed connection");
                        ConnectionSets::remove(&mut sets.available, &conn);
                        ConnectionSets::remove(&mut sets.open, &conn);
                        ConnectionSets::remove(&mut sets.all, &conn);
                        repairs += 1;
                    }
                    ConnectionState::Connected if !in_open || in_available => {
                        warn!(link = %self.eid, id = conn.id(), "connected connection not in open set");
                        ConnectionSets::remove(&mut sets.available, &conn);
                        if !in_open {
                            sets.open.push(conn);
                        }
                        repairs += 1;
                    }
                    ConnectionState::Created | ConnectionState::Connecting
                        if in_open || !in_available =>
                    {
                        warn!(link = %self.eid, id = conn.id(), "unconnected connection not in available set");
                        ConnectionSets::remove(&mut sets.open, &conn);
                        if !in_available {
                            sets.available.push(conn);
                        }
                        repairs += 1;
                    }
                    _ => {}
                }
            }
            let has_open = !sets.open.is_empty();
            (!had_open && has_open, had_open && !has_open)
        };

        if gained_open {
            self.park_all();
        }
        if lost_open {
            self.unpark_all();
        }
        repairs
    }

    /// Starts connecting the available connections in turn on a dedicated
    /// thread, first success wins. The outcome comes back through
    /// [`connect_finished`](Self::connect_finished) on the link worker.
    /// Returns `false` when there is nothing to try.
    fn open_available(self: &Arc<Self>) -> bool {
        let mut pending = self.lock_pending();
        if pending.connecting {
            return true;
        }
        let candidates = self.lock_sets().available.clone();
        if candidates.is_empty() {
            return false;
        }
        pending.connecting = true;
        drop(pending);

        let link = self.clone();
        thread::Builder::new()
            .name(format!("dtn-connect-{}", self.eid.host().unwrap_or(self.eid.ssp())))
            .spawn(move || {
                let opened = candidates.into_iter().find(|conn| match conn.connect() {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(link = %link.eid, id = conn.id(), error = %e, "connection attempt failed");
                        false
                    }
                });
                let done = link.clone();
                link.queue.post(move || {
                    done.connect_finished(opened);
                    Ok(())
                });
            })
            .expect("failed to spawn link connect thread");
        true
    }

    fn connect_finished(&self, opened: Option<Arc<Connection>>) {
        let queued = {
            let mut pending = self.lock_pending();
            pending.connecting = false;
            std::mem::take(&mut pending.queued)
        };
        match opened {
            Some(conn) if conn.is_connected() => {
                let first_open = {
                    let mut sets = self.lock_sets();
                    ConnectionSets::remove(&mut sets.available, &conn);
                    if !ConnectionSets::contains(&sets.all, &conn) {
                        sets.all.push(conn.clone());
                    }
                    if ConnectionSets::contains(&sets.open, &conn) {
                        false
                    } else {
                        sets.open.push(conn.clone());
                        sets.open.len() == 1
                    }
                };
                info!(link = %self.eid, id = conn.id(), adapter = conn.adapter(), "link opened");
                if first_open {
                    self.park_all();
                }
            }
            Some(conn) => {
                debug!(link = %self.eid, id = conn.id(), "connection closed before it was opened");
            }
            None => debug!(link = %self.eid, "no connection could be opened"),
        }
        for send in queued {
            self.write(send);
        }
    }

    fn open_connection(&self) -> Option<Arc<Connection>> {
        self.lock_sets()
            .open
            .iter()
            .find(|c| c.is_connected())
            .cloned()
    }

    // ─── Park / unpark ───────────────────────────────────────────────────

    fn hooks(&self) -> Vec<Arc<dyn SessionHooks>> {
        self.lock_sessions()
            .values()
            .map(|entry| entry.hooks.clone())
            .collect()
    }

    fn session_hooks(&self, router: RouterId) -> Option<Arc<dyn SessionHooks>> {
        self.lock_sessions().get(&router).map(|entry| entry.hooks.clone())
    }

    fn park_all(&self) {
        for hooks in self.hooks() {
            if !hooks.is_parked() {
                hooks.notify_parked();
            }
        }
    }

    fn unpark_all(&self) {
        for hooks in self.hooks() {
            if hooks.is_parked() {
                hooks.notify_unparked();
            }
        }
    }

    /// Asks for an open connection on behalf of `router`.
    pub fn request_park(self: &Arc<Self>, router: RouterId) -> TaskHandle {
        let link = self.clone();
        self.queue.post(move || {
            link.reconcile();
            let Some(hooks) = link.session_hooks(router) else {
                warn!(link = %link.eid, router, "park request from unknown session");
                return Ok(());
            };
            if link.has_open_connection() {
                if !hooks.is_parked() {
                    hooks.notify_parked();
                }
            } else if !link.open_available() {
                debug!(link = %link.eid, router, "no connection to open");
            }
            Ok(())
        })
    }

    /// Closes every open connection and unparks every session.
    pub fn request_unpark(self: &Arc<Self>, router: RouterId) -> TaskHandle {
        let link = self.clone();
        self.queue.post(move || {
            match link.session_hooks(router) {
                Some(hooks) if hooks.is_parked() => {}
                _ => {
                    warn!(link = %link.eid, router, "unpark request from a session that is not parked");
                    return Ok(());
                }
            }
            let open = std::mem::take(&mut link.lock_sets().open);
            for conn in &open {
                let mut sets = link.lock_sets();
                ConnectionSets::remove(&mut sets.all, conn);
                drop(sets);
                if let Err(e) = conn.close() {
                    debug!(link = %link.eid, id = conn.id(), error = %e, "close on unpark");
                }
            }
            info!(link = %link.eid, closed = open.len(), "link released");
            link.unpark_all();
            Ok(())
        })
    }

    // ─── Sessions ────────────────────────────────────────────────────────

    /// The session `router` holds on this link, created on first use.
    /// `None` if the router declines the link.
    pub fn connection<R: Router>(
        self: &Arc<Self>,
        router: &Arc<R>,
    ) -> Option<Arc<Session<R::Connection>>> {
        let id = router.context().id;
        if let Some(entry) = self.lock_sessions().get(&id) {
            return entry.any.clone().downcast::<Session<R::Connection>>().ok();
        }

        let Some(inner) = router.create_connection(self) else {
            warn!(link = %self.eid, router = %router.context().kind, "router declined link");
            return None;
        };
        let session = Arc::new(Session::new(self.clone(), router.clone(), inner));
        {
            let mut sessions = self.lock_sessions();
            if let Some(existing) = sessions.get(&id) {
                return existing.any.clone().downcast::<Session<R::Connection>>().ok();
            }
            sessions.insert(
                id,
                SessionEntry {
                    any: session.clone(),
                    hooks: session.clone(),
                },
            );
        }
        session.created();
        Some(session)
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    // ─── Sending ─────────────────────────────────────────────────────────

    pub fn send(self: &Arc<Self>, bundle: Bundle) -> TaskHandle {
        self.send_all(vec![bundle])
    }

    /// Hands `bundles` to the first open connection, opening one if
    /// needed. Bundles are dropped when no connection can be made.
    pub fn send_all(self: &Arc<Self>, bundles: Vec<Bundle>) -> TaskHandle {
        let link = self.clone();
        self.queue.post(move || {
            link.dispatch(PendingSend { bundles, on_sent: None });
            Ok(())
        })
    }

    /// Like [`send_all`](Self::send_all), reporting what was handed over.
    /// The callback runs on the link worker, after the connect if one
    /// was needed.
    pub fn deliver(self: &Arc<Self>, bundles: Vec<Bundle>, on_sent: SentCallback) -> TaskHandle {
        let link = self.clone();
        self.queue.post(move || {
            link.dispatch(PendingSend {
                bundles,
                on_sent: Some(on_sent),
            });
            Ok(())
        })
    }

    fn dispatch(self: &Arc<Self>, send: PendingSend) {
        if send.bundles.is_empty() {
            send.finish(Vec::new());
            return;
        }
        // queued sends keep their order behind a connect in flight
        let waiting = {
            let pending = self.lock_pending();
            pending.connecting || !pending.queued.is_empty()
        };
        if !waiting && self.open_connection().is_some() {
            self.write(send);
        } else if self.open_available() {
            trace!(link = %self.eid, count = send.bundles.len(), "bundles wait for connect");
            self.lock_pending().queued.push(send);
        } else {
            debug!(link = %self.eid, count = send.bundles.len(), "no connection, bundles not sent");
            send.finish(Vec::new());
        }
    }

    fn write(&self, send: PendingSend) {
        let Some(conn) = self.open_connection() else {
            debug!(link = %self.eid, count = send.bundles.len(), "no connection, bundles not sent");
            send.finish(Vec::new());
            return;
        };
        let mut sent = Vec::with_capacity(send.bundles.len());
        for bundle in &send.bundles {
            match conn.send(bundle.clone()) {
                Ok(()) => sent.push(bundle.clone()),
                Err(e) => {
                    warn!(link = %self.eid, id = conn.id(), error = %e, "send failed");
                    break;
                }
            }
        }
        trace!(link = %self.eid, sent = sent.len(), "bundles handed to connection");
        send.finish(sent);
    }

    /// Closes every connection and stops the worker.
    pub fn shutdown(&self) {
        let all = std::mem::take(&mut *self.lock_sets());
        for conn in all.open {
            let _ = conn.close();
        }
        self.queue.shutdown();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (available, open) = self.connection_counts();
        f.debug_struct("Link")
            .field("eid", &self.eid)
            .field("available", &available)
            .field("open", &open)
            .finish()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Links by neighbor EID, created lazily.
pub struct LinkRegistry {
    time_scale: f64,
    links: Mutex<HashMap<Eid, Arc<Link>>>,
}

impl LinkRegistry {
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale,
            links: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Eid, Arc<Link>>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_or_create(&self, eid: &Eid) -> Arc<Link> {
        self.lock()
            .entry(eid.clone())
            .or_insert_with(|| Link::new(eid.clone(), self.time_scale))
            .clone()
    }

    pub fn get(&self, eid: &Eid) -> Option<Arc<Link>> {
        self.lock().get(eid).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Link>> {
        self.lock().values().cloned().collect()
    }

    pub fn shutdown_all(&self) {
        let links: Vec<_> = self.lock().drain().map(|(_, link)| link).collect();
        for link in links {
            link.shutdown();
        }
    }
}
