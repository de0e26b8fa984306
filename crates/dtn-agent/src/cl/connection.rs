//! Byte-stream connections carrying SDNV-framed bundles.
//!
//! ```text
//!  created ──connect()──▶ connecting ──ok──▶ connected ──┬─ input duty  ─┐
//!     ▲                        │                         └─ output duty ─┴─▶ closed
//!     └──────── error ─────────┘
//! ```
//!
//! A connection only starts its I/O duties once it has a [`StreamPair`], so
//! a connection without streams can never process data. The connection is
//! closed when both duties have exited.

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use dtn_wire::{sdnv, Bundle, Eid, EidRegistry};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, trace, warn};

use crate::error::AgentError;

/// Largest bundle accepted from a stream.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// The two halves of a duplex byte stream.
pub struct StreamPair {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    on_shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamPair {
    pub fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            reader,
            writer,
            on_shutdown: None,
        }
    }

    /// Runs once the output duty has released the writer, typically to
    /// unblock a reader that would otherwise wait forever.
    pub fn on_shutdown(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_shutdown = Some(Box::new(f));
        self
    }
}

/// Opens the byte stream for an outgoing connection.
pub trait Connector: Send + Sync {
    fn connect(&self) -> io::Result<StreamPair>;

    fn address(&self) -> &str;
}

/// Receives what arrives on, and what happens to, a connection.
pub trait ConnectionListener: Send + Sync {
    fn on_bundle(&self, connection: &Arc<Connection>, bundle: Bundle);

    fn on_closed(&self, connection: &Arc<Connection>);
}

pub struct Connection {
    id: u64,
    peer: Eid,
    adapter: String,
    eids: EidRegistry,
    listener: Arc<dyn ConnectionListener>,
    connector: Option<Arc<dyn Connector>>,
    state: Mutex<ConnectionState>,
    outbox: Mutex<Option<Sender<Bundle>>>,
    duties: AtomicU8,
}

impl Connection {
    /// A connection to `peer` that is opened on demand through `connector`.
    pub fn outgoing(
        peer: Eid,
        adapter: impl Into<String>,
        connector: Arc<dyn Connector>,
        eids: EidRegistry,
        listener: Arc<dyn ConnectionListener>,
    ) -> Arc<Self> {
        Arc::new(Self::build(peer, adapter.into(), Some(connector), eids, listener))
    }

    /// An inbound connection whose streams are already established.
    pub fn accepted(
        peer: Eid,
        adapter: impl Into<String>,
        streams: StreamPair,
        eids: EidRegistry,
        listener: Arc<dyn ConnectionListener>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self::build(peer, adapter.into(), None, eids, listener));
        *conn.lock_state() = ConnectionState::Connected;
        conn.start_io(streams);
        conn
    }

    fn build(
        peer: Eid,
        adapter: String,
        connector: Option<Arc<dyn Connector>>,
        eids: EidRegistry,
        listener: Arc<dyn ConnectionListener>,
    ) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            adapter,
            eids,
            listener,
            connector,
            state: Mutex::new(ConnectionState::Created),
            outbox: Mutex::new(None),
            duties: AtomicU8::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &Eid {
        &self.peer
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Opens an outgoing connection. Blocks on the connector.
    pub fn connect(self: &Arc<Self>) -> Result<(), AgentError> {
        {
            let mut state = self.lock_state();
            match *state {
                ConnectionState::Created => *state = ConnectionState::Connecting,
                ConnectionState::Connected => return Ok(()),
                other => {
                    return Err(AgentError::Transport(format!(
                        "connection {} is {other:?}",
                        self.id
                    )));
                }
            }
        }

        let Some(connector) = self.connector.clone() else {
            *self.lock_state() = ConnectionState::Created;
            return Err(AgentError::Transport(format!(
                "connection {} has no connector",
                self.id
            )));
        };

        match connector.connect() {
            Ok(streams) => {
                debug!(peer = %self.peer, address = connector.address(), id = self.id, "connected");
                *self.lock_state() = ConnectionState::Connected;
                self.start_io(streams);
                Ok(())
            }
            Err(e) => {
                *self.lock_state() = ConnectionState::Created;
                warn!(peer = %self.peer, address = connector.address(), error = %e, "connect failed");
                Err(AgentError::Io(e))
            }
        }
    }

    /// Queues `bundle` for the output duty.
    pub fn send(&self, bundle: Bundle) -> Result<(), AgentError> {
        let outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        match outbox.as_ref() {
            Some(tx) => tx
                .send(bundle)
                .map_err(|_| AgentError::Transport(format!("connection {} output stopped", self.id))),
            None => Err(AgentError::Transport(format!(
                "connection {} is not open",
                self.id
            ))),
        }
    }

    /// Stops accepting bundles. Already queued bundles are still written
    /// before the stream shuts down.
    pub fn close(&self) -> Result<(), AgentError> {
        match self.state() {
            ConnectionState::Created | ConnectionState::Closed => {
                return Err(AgentError::Transport(format!(
                    "close on connection {} in state {:?}",
                    self.id,
                    self.state()
                )));
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }
        let outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        if outbox.is_some() {
            debug!(peer = %self.peer, id = self.id, "closing connection");
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_io(self: &Arc<Self>, streams: StreamPair) {
        let (tx, rx) = unbounded();
        *self.outbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        self.duties.store(2, Ordering::Release);

        let StreamPair {
            reader,
            writer,
            on_shutdown,
        } = streams;

        let input = self.clone();
        thread::Builder::new()
            .name(format!("dtn-in-{}", self.id))
            .spawn(move || input.input_duty(reader))
            .expect("failed to spawn connection input thread");

        let output = self.clone();
        thread::Builder::new()
            .name(format!("dtn-out-{}", self.id))
            .spawn(move || output.output_duty(rx, writer, on_shutdown))
            .expect("failed to spawn connection output thread");
    }

    fn input_duty(self: Arc<Self>, mut reader: Box<dyn Read + Send>) {
        loop {
            match read_frame(&mut reader) {
                Ok(Some(frame)) => match Bundle::decode(frame, &self.eids) {
                    Ok(bundle) => {
                        trace!(peer = %self.peer, bundle = %bundle.id(), "bundle received");
                        self.listener.on_bundle(&self, bundle);
                    }
                    Err(e) => {
                        warn!(peer = %self.peer, id = self.id, error = %e, "bundle framing error, closing");
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %self.peer, id = self.id, error = %e, "input stream ended");
                    break;
                }
            }
        }
        // no more input: let the output duty drain and stop
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.finish_duty();
    }

    fn output_duty(
        self: Arc<Self>,
        rx: Receiver<Bundle>,
        mut writer: Box<dyn Write + Send>,
        on_shutdown: Option<Box<dyn FnOnce() + Send>>,
    ) {
        while let Ok(bundle) = rx.recv() {
            let frame = bundle.encode();
            let mut header = BytesMut::with_capacity(sdnv::MAX_SDNV_LEN);
            sdnv::encode(frame.len() as u64, &mut header);
            let result = writer
                .write_all(&header)
                .and_then(|_| writer.write_all(&frame))
                .and_then(|_| writer.flush());
            if let Err(e) = result {
                warn!(peer = %self.peer, id = self.id, error = %e, "write failed");
                break;
            }
        }
        drop(writer);
        if let Some(f) = on_shutdown {
            f();
        }
        self.finish_duty();
    }

    fn finish_duty(self: &Arc<Self>) {
        if self.duties.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.lock_state() = ConnectionState::Closed;
            debug!(peer = %self.peer, id = self.id, "connection closed");
            self.listener.on_closed(self);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("adapter", &self.adapter)
            .field("state", &self.state())
            .finish()
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Option<Bytes>> {
    let Some(len) = sdnv::read_from(reader)? else {
        return Ok(None);
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame)?;
    Ok(Some(Bytes::from(frame)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cl::vnet::{duplex, pipe};
    use dtn_wire::BundleInfo;
    use std::time::Duration;

    struct Collect {
        bundles: Sender<Bundle>,
        closed: Sender<u64>,
    }

    impl ConnectionListener for Collect {
        fn on_bundle(&self, _connection: &Arc<Connection>, bundle: Bundle) {
            let _ = self.bundles.send(bundle);
        }

        fn on_closed(&self, connection: &Arc<Connection>) {
            let _ = self.closed.send(connection.id());
        }
    }

    fn listener() -> (Arc<Collect>, Receiver<Bundle>, Receiver<u64>) {
        let (btx, brx) = unbounded();
        let (ctx, crx) = unbounded();
        (
            Arc::new(Collect {
                bundles: btx,
                closed: ctx,
            }),
            brx,
            crx,
        )
    }

    fn bundle(eids: &EidRegistry, seq: u64) -> Bundle {
        let info = BundleInfo::new(
            eids,
            eids.host("a").unwrap(),
            eids.host("b").unwrap(),
            100,
            seq,
            60,
        );
        Bundle::new(info, vec![seq as u8; 32])
    }

    #[test]
    fn bundles_cross_and_close_is_mutual() {
        let eids = EidRegistry::new();
        let (left, right) = duplex();
        let (la, _lb, lc) = listener();
        let (ra, rb, rc) = listener();
        let a = Connection::accepted(eids.host("b").unwrap(), "t", left, eids.clone(), la);
        let b = Connection::accepted(eids.host("a").unwrap(), "t", right, eids.clone(), ra);

        for seq in 0..5 {
            a.send(bundle(&eids, seq)).unwrap();
        }
        a.close().unwrap();

        for seq in 0..5 {
            let got = rb.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(got.info().creation_seq, seq);
        }
        assert_eq!(lc.recv_timeout(Duration::from_secs(2)).unwrap(), a.id());
        assert_eq!(rc.recv_timeout(Duration::from_secs(2)).unwrap(), b.id());
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
        assert!(a.close().is_err());
        assert!(a.send(bundle(&eids, 9)).is_err());
    }

    #[test]
    fn garbage_frame_closes_connection() {
        let eids = EidRegistry::new();
        let (w, r) = pipe();
        let (w_out, _r_out) = pipe();
        let (l, _b, closed) = listener();
        let conn = Connection::accepted(
            eids.host("x").unwrap(),
            "t",
            StreamPair::new(Box::new(r), Box::new(w_out)),
            eids,
            l,
        );
        let mut w = w;
        w.write_all(&[0x03, 0xFF, 0xFF, 0xFF]).unwrap();
        assert_eq!(closed.recv_timeout(Duration::from_secs(2)).unwrap(), conn.id());
    }

    struct Refuse;

    impl Connector for Refuse {
        fn connect(&self) -> io::Result<StreamPair> {
            Err(io::ErrorKind::ConnectionRefused.into())
        }

        fn address(&self) -> &str {
            "nowhere"
        }
    }

    #[test]
    fn failed_connect_returns_to_created() {
        let eids = EidRegistry::new();
        let (l, _b, _c) = listener();
        let conn = Connection::outgoing(eids.host("x").unwrap(), "t", Arc::new(Refuse), eids, l);
        assert!(conn.connect().is_err());
        assert_eq!(conn.state(), ConnectionState::Created);
        assert!(conn.close().is_err());
    }
}
