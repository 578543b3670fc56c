//! Caller-facing handle for one multiplexed connection.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
    task::JoinHandle,
};

use super::{ConnShared, ConnectionPhase, MuxBackend, MuxFlags, MuxPacket, TransportInner, WINDOW_SIZE};
use crate::Error;

/// In-flight transmit driven by the poll-based write path. Spawned rather
/// than stored as a boxed future so the socket stays `Sync`.
type IoTask = JoinHandle<Result<(), Error>>;

/// One TCP-like stream multiplexed over the device's USB pipe.
///
/// Obtained from [`MuxTransport::connect`](super::MuxTransport::connect) or
/// [`Device::connect`](crate::Device::connect). Offers both a message-style
/// `send`/`recv` API and `AsyncRead`/`AsyncWrite`, so TLS sessions and
/// plist framing can be layered directly on top.
///
/// Dropping the socket resets the connection if it is still open.
pub struct MuxSocket<B: MuxBackend> {
    transport: Arc<TransportInner<B>>,
    conn: Arc<ConnShared>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    flush_state: Option<IoTask>,
    shutdown_state: Option<IoTask>,
}

impl<B: MuxBackend> MuxSocket<B> {
    pub(crate) fn new(
        transport: Arc<TransportInner<B>>,
        conn: Arc<ConnShared>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            transport,
            conn,
            rx,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
            flush_state: None,
            shutdown_state: None,
        }
    }

    /// Local port of this connection, unique per transport.
    pub fn source_port(&self) -> u16 {
        self.conn.source_port
    }

    /// Port on the device this connection is attached to.
    pub fn dest_port(&self) -> u16 {
        self.conn.dest_port
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.conn.state.lock().unwrap().phase
    }

    fn close_error(&self) -> Error {
        self.conn.state.lock().unwrap().close_error()
    }

    /// Sends payload bytes, blocking while the device's receive window is
    /// exhausted. Bytes are delivered in order.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.transport.send_on(&self.conn, data).await
    }

    /// Receives the next chunk of payload.
    ///
    /// * `None` waits until data arrives or the connection closes.
    /// * A zero timeout polls: it reports [`Error::Timeout`] immediately
    ///   when nothing is buffered.
    /// * Otherwise waits up to the given duration; [`Error::Timeout`]
    ///   leaves the connection usable.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        if !self.read_buffer.is_empty() {
            return Ok(std::mem::take(&mut self.read_buffer));
        }
        match timeout {
            Some(d) if d.is_zero() => match self.rx.try_recv() {
                Ok(data) => Ok(data),
                Err(mpsc::error::TryRecvError::Empty) => Err(Error::Timeout),
                Err(mpsc::error::TryRecvError::Disconnected) => Err(self.close_error()),
            },
            Some(d) => match tokio::time::timeout(d, self.rx.recv()).await {
                Err(_) => Err(Error::Timeout),
                Ok(Some(data)) => Ok(data),
                Ok(None) => Err(self.close_error()),
            },
            None => match self.rx.recv().await {
                Some(data) => Ok(data),
                None => Err(self.close_error()),
            },
        }
    }

    /// Gracefully closes the connection: FIN, then a short drain for the
    /// device's own FIN.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        self.transport.disconnect_conn(&self.conn).await
    }

    /// Abortively closes the connection with an RST.
    pub async fn reset(&mut self) {
        self.transport.reset_conn(&self.conn).await;
    }
}

impl<B: MuxBackend> AsyncRead for MuxSocket<B> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if !this.read_buffer.is_empty() {
            let n = buf.remaining().min(this.read_buffer.len());
            buf.put_slice(&this.read_buffer[..n]);
            this.read_buffer.drain(..n);
            return Poll::Ready(Ok(()));
        }

        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(data)) => {
                let n = buf.remaining().min(data.len());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    this.read_buffer.extend_from_slice(&data[n..]);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => match this.close_error() {
                // clean closure reads as end of stream
                Error::ConnectionClosed => Poll::Ready(Ok(())),
                e => Poll::Ready(Err(e.into())),
            },
        }
    }
}

impl<B: MuxBackend> AsyncWrite for MuxSocket<B> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let this = self.get_mut();
        if this.phase() == ConnectionPhase::Closed {
            return Poll::Ready(Err(this.close_error().into()));
        }
        this.write_buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.get_mut();
        loop {
            if let Some(task) = &mut this.flush_state {
                match Pin::new(task).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(result) => {
                        this.flush_state = None;
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => return Poll::Ready(Err(e.into())),
                            Err(e) => {
                                return Poll::Ready(Err(std::io::Error::other(e.to_string())))
                            }
                        }
                    }
                }
            }
            if this.write_buffer.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let data = std::mem::take(&mut this.write_buffer);
            let transport = this.transport.clone();
            let conn = this.conn.clone();
            this.flush_state = Some(tokio::spawn(async move {
                transport.send_on(&conn, &data).await
            }));
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.get_mut();
        if this.shutdown_state.is_none() {
            match Pin::new(&mut *this).poll_flush(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            let transport = this.transport.clone();
            let conn = this.conn.clone();
            this.shutdown_state = Some(tokio::spawn(async move {
                transport.disconnect_conn(&conn).await
            }));
        }
        let task = this.shutdown_state.as_mut().unwrap();
        match Pin::new(task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.shutdown_state = None;
                match result {
                    Ok(inner) => Poll::Ready(inner.map_err(Into::into)),
                    Err(e) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
                }
            }
        }
    }
}

impl<B: MuxBackend> Drop for MuxSocket<B> {
    fn drop(&mut self) {
        let counters = {
            let mut st = self.conn.state.lock().unwrap();
            if st.phase == ConnectionPhase::Closed {
                None
            } else {
                st.phase = ConnectionPhase::Closed;
                st.tx = None;
                Some((st.seq, st.ack))
            }
        };
        self.conn.events.notify_waiters();
        self.transport.remove_conn(self.conn.source_port);

        // Abortive close for a socket dropped while open. Without a runtime
        // there is nobody to carry the RST; the device learns on reconnect.
        if let Some((seq, ack)) = counters {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let wire = MuxPacket::create(
                    self.conn.source_port,
                    self.conn.dest_port,
                    seq,
                    ack,
                    MuxFlags::rst(),
                    WINDOW_SIZE,
                    &[],
                );
                let transport = self.transport.clone();
                handle.spawn(async move {
                    let _ = transport.transmit(&wire).await;
                });
            }
        }
    }
}

impl<B: MuxBackend> std::fmt::Debug for MuxSocket<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSocket")
            .field("source_port", &self.conn.source_port)
            .field("dest_port", &self.conn.dest_port)
            .field("phase", &self.phase())
            .field("buffered", &self.read_buffer.len())
            .finish()
    }
}
