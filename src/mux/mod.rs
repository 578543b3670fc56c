//! TCP-like stream multiplexing over the device's bulk USB pipe.
//!
//! The device end of the pipe speaks a reduced TCP: SYN/ACK/FIN/RST, byte
//! counting sequence numbers and a receive window, all framed by the fixed
//! header in [`packet`]. One reader task drains bulk-in and dispatches
//! payloads to per-connection buffers; writers share one lock so packets
//! always hit the wire whole.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use log::{debug, trace, warn};
use tokio::{sync::mpsc, time::Instant};

use crate::Error;

pub mod packet;
mod socket;

pub use packet::{MuxFlags, MuxPacket};
pub use socket::MuxSocket;

/// Receive window advertised to the device, in bytes.
pub(crate) const WINDOW_SIZE: u16 = 0xFFFE;

/// First source port handed out by a transport.
pub(crate) const FIRST_SOURCE_PORT: u16 = 0x1234;

/// Largest payload put in a single packet. Total packet length has to fit
/// the 16-bit copy of the length field.
const MAX_PAYLOAD: usize = 0xF000;

const RX_TRANSFER_SIZE: usize = 0x10000;
const RX_POLL_MS: u64 = 100;
const WRITE_TIMEOUT_MS: u64 = 1000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const FIN_WAIT: Duration = Duration::from_millis(500);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Contract the mux transport consumes from the USB layer.
///
/// The real implementation wraps a claimed bulk interface; tests substitute
/// a scripted device. Reads and writes time out rather than block forever,
/// and a timeout leaves the backend usable.
pub trait MuxBackend: Send + Sync + std::fmt::Debug + 'static {
    /// Writes `buf` to the bulk-out endpoint, returning the bytes accepted.
    fn bulk_write(
        &self,
        buf: &[u8],
        timeout_ms: u64,
    ) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Reads up to `max_len` bytes from the bulk-in endpoint.
    fn bulk_read(
        &self,
        max_len: usize,
        timeout_ms: u64,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Releases the backend. Further reads and writes fail.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Lifecycle of one multiplexed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// SYN sent, waiting for the device to acknowledge
    Connecting,
    /// Established, data flows both ways
    Open,
    /// FIN sent locally, draining whatever the device still delivers
    HalfClosed,
    Closed,
}

#[derive(Debug)]
pub(crate) struct ConnState {
    pub(crate) phase: ConnectionPhase,
    /// Payload bytes sent to the device on this connection
    pub(crate) seq: u32,
    /// Payload bytes accepted from the device on this connection
    pub(crate) ack: u32,
    /// Highest ack value the device has reported back to us
    pub(crate) peer_acked: u32,
    /// Send window the device advertised most recently
    pub(crate) peer_window: u32,
    /// Feeds received payload to the owning socket; dropped on close so a
    /// blocked receiver wakes up
    pub(crate) tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Reason the connection died, when it did not close cleanly
    pub(crate) failure: Option<String>,
}

impl ConnState {
    pub(crate) fn close_error(&self) -> Error {
        match &self.failure {
            Some(e) => Error::MuxError(e.clone()),
            None => Error::ConnectionClosed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ConnShared {
    pub(crate) source_port: u16,
    pub(crate) dest_port: u16,
    pub(crate) state: Mutex<ConnState>,
    /// Pinged on every state change: handshake completion, window updates,
    /// closure. Waiters re-check state after every wakeup.
    pub(crate) events: tokio::sync::Notify,
}

impl ConnShared {
    fn new(source_port: u16, dest_port: u16, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            source_port,
            dest_port,
            state: Mutex::new(ConnState {
                phase: ConnectionPhase::Connecting,
                seq: 0,
                ack: 0,
                peer_acked: 0,
                peer_window: WINDOW_SIZE as u32,
                tx: Some(tx),
                failure: None,
            }),
            events: tokio::sync::Notify::new(),
        }
    }

    fn snapshot_counters(&self) -> (u32, u32) {
        let st = self.state.lock().unwrap();
        (st.seq, st.ack)
    }
}

#[derive(Debug)]
pub(crate) struct TransportInner<B: MuxBackend> {
    backend: B,
    /// Serializes every bulk-out so packets are never interleaved
    out_lock: tokio::sync::Mutex<()>,
    connections: Mutex<HashMap<u16, Arc<ConnShared>>>,
    next_port: AtomicU16,
    shutdown: AtomicBool,
}

impl<B: MuxBackend> TransportInner<B> {
    async fn transmit(&self, wire: &[u8]) -> Result<(), Error> {
        let _guard = self.out_lock.lock().await;
        let written = self.backend.bulk_write(wire, WRITE_TIMEOUT_MS).await?;
        if written != wire.len() {
            return Err(Error::MuxError(format!(
                "short bulk write: {written} of {} bytes",
                wire.len()
            )));
        }
        Ok(())
    }

    async fn send_control(&self, conn: &ConnShared, flags: MuxFlags) -> Result<(), Error> {
        let (seq, ack) = conn.snapshot_counters();
        let wire = MuxPacket::create(
            conn.source_port,
            conn.dest_port,
            seq,
            ack,
            flags,
            WINDOW_SIZE,
            &[],
        );
        self.transmit(&wire).await
    }

    /// Sends one chunk of payload, waiting for send window as needed.
    async fn send_data_chunk(&self, conn: &ConnShared, chunk: &[u8]) -> Result<(), Error> {
        let deadline = Instant::now() + SEND_TIMEOUT;
        let (seq, ack) = loop {
            let notified = conn.events.notified();
            tokio::pin!(notified);
            // register for wakeups before inspecting state, or a notify
            // between the check and the await is lost
            notified.as_mut().enable();
            {
                let st = conn.state.lock().unwrap();
                match st.phase {
                    ConnectionPhase::Open => {}
                    ConnectionPhase::Closed => return Err(st.close_error()),
                    ConnectionPhase::HalfClosed | ConnectionPhase::Connecting => {
                        return Err(Error::ConnectionClosed)
                    }
                }
                let in_flight = st.seq.wrapping_sub(st.peer_acked) as usize;
                if in_flight + chunk.len() <= st.peer_window as usize {
                    break (st.seq, st.ack);
                }
                trace!(
                    "sport {}: window full ({in_flight} in flight, window {})",
                    conn.source_port,
                    st.peer_window
                );
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        };

        let wire = MuxPacket::create(
            conn.source_port,
            conn.dest_port,
            seq,
            ack,
            MuxFlags::ack(),
            WINDOW_SIZE,
            chunk,
        );
        if let Err(e) = self.transmit(&wire).await {
            self.close_conn(conn, Some(format!("send failed: {e}")));
            return Err(e);
        }

        let mut st = conn.state.lock().unwrap();
        st.seq = st.seq.wrapping_add(chunk.len() as u32);
        Ok(())
    }

    pub(crate) async fn send_on(&self, conn: &ConnShared, data: &[u8]) -> Result<(), Error> {
        for chunk in data.chunks(MAX_PAYLOAD) {
            self.send_data_chunk(conn, chunk).await?;
        }
        Ok(())
    }

    /// Opens a new connection to `dest_port` on the device.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        dest_port: u16,
    ) -> Result<MuxSocket<B>, Error> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let source_port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ConnShared::new(source_port, dest_port, tx));
        self.connections
            .lock()
            .unwrap()
            .insert(source_port, conn.clone());

        debug!("Connecting {source_port} -> {dest_port}");
        let syn = MuxPacket::create(source_port, dest_port, 0, 0, MuxFlags::syn(), WINDOW_SIZE, &[]);
        if let Err(e) = self.transmit(&syn).await {
            self.remove_conn(source_port);
            return Err(e);
        }

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            let notified = conn.events.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = conn.state.lock().unwrap();
                match st.phase {
                    ConnectionPhase::Open => break,
                    ConnectionPhase::Closed => {
                        let e = st.close_error();
                        drop(st);
                        self.remove_conn(source_port);
                        return Err(e);
                    }
                    _ => {}
                }
            }
            let now = Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, notified)
                    .await
                    .is_err()
            {
                self.close_conn(&conn, None);
                self.remove_conn(source_port);
                return Err(Error::Timeout);
            }
        }

        Ok(MuxSocket::new(self.clone(), conn, rx))
    }

    /// Graceful close: FIN, then drain until the device answers or the wait
    /// elapses.
    pub(crate) async fn disconnect_conn(&self, conn: &Arc<ConnShared>) -> Result<(), Error> {
        {
            let mut st = conn.state.lock().unwrap();
            match st.phase {
                ConnectionPhase::Closed => {
                    drop(st);
                    self.remove_conn(conn.source_port);
                    return Ok(());
                }
                ConnectionPhase::Connecting => {
                    st.phase = ConnectionPhase::Closed;
                    st.tx = None;
                    drop(st);
                    conn.events.notify_waiters();
                    self.remove_conn(conn.source_port);
                    return Ok(());
                }
                ConnectionPhase::Open => st.phase = ConnectionPhase::HalfClosed,
                ConnectionPhase::HalfClosed => {}
            }
        }

        if let Err(e) = self.send_control(conn, MuxFlags::fin()).await {
            debug!("FIN for {} failed: {e:?}", conn.source_port);
        }

        let deadline = Instant::now() + FIN_WAIT;
        loop {
            let notified = conn.events.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if conn.state.lock().unwrap().phase == ConnectionPhase::Closed {
                break;
            }
            let now = Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, notified)
                    .await
                    .is_err()
            {
                break;
            }
        }

        self.close_conn(conn, None);
        self.remove_conn(conn.source_port);
        Ok(())
    }

    /// Abortive close: RST and forget.
    pub(crate) async fn reset_conn(&self, conn: &Arc<ConnShared>) {
        let still_open = conn.state.lock().unwrap().phase != ConnectionPhase::Closed;
        if still_open {
            if let Err(e) = self.send_control(conn, MuxFlags::rst()).await {
                debug!("RST for {} failed: {e:?}", conn.source_port);
            }
        }
        self.close_conn(conn, None);
        self.remove_conn(conn.source_port);
    }

    pub(crate) fn close_conn(&self, conn: &ConnShared, failure: Option<String>) {
        {
            let mut st = conn.state.lock().unwrap();
            if st.phase != ConnectionPhase::Closed {
                st.phase = ConnectionPhase::Closed;
                if st.failure.is_none() {
                    st.failure = failure;
                }
                st.tx = None;
            }
        }
        conn.events.notify_waiters();
    }

    pub(crate) fn remove_conn(&self, source_port: u16) {
        self.connections.lock().unwrap().remove(&source_port);
    }

    /// Forgets every connection and wakes their receivers, returning the
    /// ones that were still open and owe the device an RST.
    fn detach_all(&self) -> Vec<Arc<ConnShared>> {
        let conns: Vec<_> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, c)| c).collect()
        };
        let mut open = Vec::new();
        for conn in conns {
            let was_open = conn.state.lock().unwrap().phase != ConnectionPhase::Closed;
            self.close_conn(&conn, None);
            if was_open {
                open.push(conn);
            }
        }
        open
    }

    /// Wire-side half of a shutdown: RST the detached connections, drain
    /// residual bulk-in traffic and release the backend.
    async fn abort_peers(self: Arc<Self>, conns: Vec<Arc<ConnShared>>) {
        for conn in conns {
            if let Err(e) = self.send_control(&conn, MuxFlags::rst()).await {
                debug!("RST during shutdown failed: {e:?}");
            }
        }

        // Leave the pipe empty for whoever claims the device next
        for _ in 0..64 {
            match self.backend.bulk_read(RX_TRANSFER_SIZE, 50).await {
                Ok(bytes) if !bytes.is_empty() => continue,
                _ => break,
            }
        }

        self.backend.close().await;
    }

    fn fail_all(&self, message: &str) {
        let conns: Vec<_> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            self.close_conn(&conn, Some(message.to_string()));
        }
    }

    /// Routes one inbound packet to its connection.
    async fn handle_inbound(&self, mut packet: MuxPacket) {
        let conn = {
            let map = self.connections.lock().unwrap();
            map.get(&packet.dest_port).cloned()
        };
        let Some(conn) = conn else {
            debug!(
                "Dropping packet for unknown local port {}",
                packet.dest_port
            );
            return;
        };
        if conn.dest_port != packet.source_port {
            debug!(
                "Dropping packet from device port {} (connection expects {})",
                packet.source_port, conn.dest_port
            );
            return;
        }

        let mut send_ack = false;
        {
            let mut st = conn.state.lock().unwrap();
            if packet.flags.rst {
                debug!("Device reset connection {}", conn.source_port);
                st.phase = ConnectionPhase::Closed;
                if st.failure.is_none() {
                    st.failure = Some("connection reset by device".into());
                }
                st.tx = None;
            } else {
                match st.phase {
                    ConnectionPhase::Connecting => {
                        if packet.flags.syn && packet.flags.ack {
                            st.peer_acked = packet.ack;
                            st.peer_window = packet.window as u32;
                            st.phase = ConnectionPhase::Open;
                        } else {
                            st.phase = ConnectionPhase::Closed;
                            st.failure = Some("unexpected reply to connection request".into());
                            st.tx = None;
                        }
                    }
                    ConnectionPhase::Open | ConnectionPhase::HalfClosed => {
                        st.peer_acked = packet.ack;
                        st.peer_window = packet.window as u32;

                        if !packet.payload.is_empty() {
                            if packet.seq != st.ack {
                                warn!(
                                    "Out of order packet on {}: seq {} but {} bytes received",
                                    conn.source_port, packet.seq, st.ack
                                );
                                st.phase = ConnectionPhase::Closed;
                                st.failure = Some(format!(
                                    "out of order packet: seq {} with {} bytes received",
                                    packet.seq, st.ack
                                ));
                                st.tx = None;
                            } else {
                                let payload = std::mem::take(&mut packet.payload);
                                st.ack = st.ack.wrapping_add(payload.len() as u32);
                                if let Some(tx) = &st.tx {
                                    let _ = tx.send(payload);
                                }
                                send_ack = true;
                            }
                        }

                        if packet.flags.fin && st.phase != ConnectionPhase::Closed {
                            debug!("Device finished connection {}", conn.source_port);
                            st.phase = ConnectionPhase::Closed;
                            st.tx = None;
                        }
                    }
                    ConnectionPhase::Closed => {
                        trace!("Packet for closed connection {}", conn.source_port);
                    }
                }
            }
        }
        conn.events.notify_waiters();

        if send_ack {
            if let Err(e) = self.send_control(&conn, MuxFlags::ack()).await {
                debug!("Failed to acknowledge payload: {e:?}");
            }
        }
    }
}

async fn run_reader<B: MuxBackend>(inner: Arc<TransportInner<B>>) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match inner.backend.bulk_read(RX_TRANSFER_SIZE, RX_POLL_MS).await {
            Ok(bytes) => {
                if bytes.is_empty() {
                    continue;
                }
                buf.extend_from_slice(&bytes);
                loop {
                    match MuxPacket::parse(&buf) {
                        packet::ParseOutcome::NotEnough => break,
                        packet::ParseOutcome::Invalid(e) => {
                            warn!("Unparseable mux traffic, shutting the transport down: {e}");
                            inner.fail_all(&e);
                            return;
                        }
                        packet::ParseOutcome::Ok {
                            packet,
                            bytes_consumed,
                        } => {
                            buf.drain(..bytes_consumed);
                            inner.handle_inbound(packet).await;
                        }
                    }
                }
            }
            Err(Error::Timeout) => continue,
            Err(e) => {
                if !inner.shutdown.load(Ordering::SeqCst) {
                    debug!("Mux reader exiting: {e:?}");
                    inner.fail_all(&e.to_string());
                }
                break;
            }
        }
    }
}

/// Multiplexes logical connections over one [`MuxBackend`].
///
/// Owns the dedicated reader task for its backend. Dropping the transport
/// closes every connection it carries.
#[derive(Debug)]
pub struct MuxTransport<B: MuxBackend> {
    inner: Arc<TransportInner<B>>,
    reader: tokio::task::JoinHandle<()>,
}

impl<B: MuxBackend> MuxTransport<B> {
    pub fn new(backend: B) -> Self {
        let inner = Arc::new(TransportInner {
            backend,
            out_lock: tokio::sync::Mutex::new(()),
            connections: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(FIRST_SOURCE_PORT),
            shutdown: AtomicBool::new(false),
        });
        let reader = tokio::spawn(run_reader(inner.clone()));
        Self { inner, reader }
    }

    /// Opens a connection to a port on the device.
    pub async fn connect(&self, dest_port: u16) -> Result<MuxSocket<B>, Error> {
        self.inner.connect(dest_port).await
    }

    /// Number of connections currently tracked.
    pub fn open_connections(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// Resets every live connection, stops the reader, drains residual
    /// bulk-in traffic and releases the backend.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader.abort();
        let open = self.inner.detach_all();
        self.inner.clone().abort_peers(open).await;
    }
}

impl<B: MuxBackend> Drop for MuxTransport<B> {
    fn drop(&mut self) {
        self.reader.abort();
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // Same cleanup the explicit shutdown performs. Without a runtime
        // there is nobody to carry the RSTs; local state is still torn
        // down so blocked receivers wake immediately.
        let open = self.inner.detach_all();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move {
                inner.abort_peers(open).await;
            });
        }
    }
}
