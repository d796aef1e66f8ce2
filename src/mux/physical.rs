//! Physical connections and their driver task.
//!
//! Each physical connection runs one driver task that owns the outbound queue
//! receiver. The driver dials, then runs a session: an inbound task parses
//! frames and routes them to streams by id while the driver drains the queue
//! to the socket. The first read, write, or parse failure ends the session,
//! every open stream is cancelled with that error, and the driver backs off
//! and redials until the reconnect budget is spent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backoff::ReconnectPolicy;
use super::conn_set::ConnSet;
use super::virtual_conn::StreamShared;
use super::{MuxConfig, MuxError};
use crate::codec::FrameParser;
use crate::endpoint::EndpointKey;
use crate::transport::{dial_with_timeout, DialOptions, Dialer, RawStream, Socket};

const MAX_DATAGRAM: usize = 65535;

/// Everything a driver needs to (re)establish its socket
pub(crate) struct DriverContext {
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) parser: Arc<dyn FrameParser>,
    pub(crate) local_addr: Option<SocketAddr>,
}

struct PhysState {
    streams: HashMap<u32, Arc<StreamShared>>,
    /// No session is up and the connection is not accepting streams
    closed: bool,
    /// The driver has exited for good
    terminated: bool,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    last_error: Option<MuxError>,
}

pub(crate) struct PhysicalConn {
    id: u64,
    key: EndpointKey,
    config: Arc<MuxConfig>,
    tx: mpsc::Sender<Bytes>,
    state: Mutex<PhysState>,
    shutdown: CancellationToken,
    set: Weak<ConnSet>,
    reconnects: AtomicUsize,
}

impl PhysicalConn {
    /// Create a connection and start its driver; the first dial happens in
    /// the background so streams may be opened and written before it lands
    pub(crate) fn spawn(
        id: u64,
        key: EndpointKey,
        config: Arc<MuxConfig>,
        set: Weak<ConnSet>,
        ctx: Arc<DriverContext>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.send_queue_size);
        let conn = Arc::new(Self {
            id,
            key,
            config,
            tx,
            state: Mutex::new(PhysState {
                streams: HashMap::new(),
                closed: false,
                terminated: false,
                local_addr: None,
                remote_addr: None,
                last_error: None,
            }),
            shutdown: CancellationToken::new(),
            set,
            reconnects: AtomicUsize::new(0),
        });

        info!(endpoint = %conn.key, conn = id, "Opened physical connection");
        let driver = Arc::clone(&conn);
        tokio::spawn(async move { driver.run(rx, ctx).await });
        conn
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed || state.terminated
    }

    pub(crate) fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub(crate) fn has_stream(&self, stream_id: u32) -> bool {
        self.state.lock().streams.contains_key(&stream_id)
    }

    pub(crate) fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local_addr
    }

    pub(crate) fn remote_addr(&self) -> Option<SocketAddr> {
        self.state.lock().remote_addr
    }

    /// Install a stream, returning the open stream it displaced
    pub(crate) fn add_stream(
        &self,
        stream: Arc<StreamShared>,
    ) -> Result<Option<Arc<StreamShared>>, MuxError> {
        let mut state = self.state.lock();
        if state.closed || state.terminated {
            return Err(state.last_error.clone().unwrap_or(MuxError::ConnClosed));
        }
        Ok(state.streams.insert(stream.id(), stream))
    }

    /// Detach `stream` if it is still the one registered under its id, then
    /// let the set re-check its idle connections
    pub(crate) fn remove_stream(&self, stream: &Arc<StreamShared>) {
        let removed = {
            let mut state = self.state.lock();
            match state.streams.get(&stream.id()) {
                Some(current) if Arc::ptr_eq(current, stream) => {
                    state.streams.remove(&stream.id());
                    state.streams.is_empty()
                }
                _ => false,
            }
        };

        if removed {
            if let Some(set) = self.set.upgrade() {
                set.evict_idle();
            }
        }
    }

    pub(crate) async fn enqueue(&self, frame: Bytes, stream: &StreamShared) -> Result<(), MuxError> {
        if self.config.drop_full {
            return match self.tx.try_send(frame) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(MuxError::QueueFull),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(MuxError::ConnClosed),
            };
        }

        tokio::select! {
            result = self.tx.send(frame) => result.map_err(|_| MuxError::ConnClosed),
            _ = stream.cancelled() => Err(stream.error()),
        }
    }

    /// Stop the driver without treating it as a failure
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn dispatch(&self, stream_id: u32, frame: Bytes) {
        let stream = self.state.lock().streams.get(&stream_id).cloned();
        match stream {
            Some(stream) => {
                if !stream.deliver(frame) {
                    trace!(conn = self.id, stream_id, "Dropped frame for cancelled stream");
                }
            }
            None => trace!(conn = self.id, stream_id, "Dropped frame for unknown stream"),
        }
    }

    fn mark_connected(&self, socket: &Socket) {
        let mut state = self.state.lock();
        state.closed = false;
        state.last_error = None;
        state.local_addr = socket.local_addr();
        state.remote_addr = socket.peer_addr();
    }

    /// Close the connection and cancel every stream on it with `err`.
    ///
    /// The stream map is swapped for a fresh one so cancelled streams are
    /// never left behind.
    fn fail_all(&self, err: &MuxError) {
        let streams = {
            let mut state = self.state.lock();
            state.closed = true;
            state.last_error = Some(err.clone());
            std::mem::take(&mut state.streams)
        };

        if !streams.is_empty() {
            debug!(
                endpoint = %self.key,
                conn = self.id,
                streams = streams.len(),
                error = %err,
                "Cancelling streams on failed connection"
            );
        }
        for stream in streams.into_values() {
            stream.cancel_with(err.clone());
        }
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Bytes>, ctx: Arc<DriverContext>) {
        let mut policy = ReconnectPolicy::from_config(&self.config);
        let mut exhausted = false;

        loop {
            let failure = match self.dial(&ctx).await {
                Some(Ok(socket)) => {
                    self.mark_connected(&socket);
                    debug!(
                        endpoint = %self.key,
                        conn = self.id,
                        local = ?socket.local_addr(),
                        "Physical connection established"
                    );
                    match socket {
                        Socket::Stream(stream) => self.stream_session(stream, &mut rx, &ctx).await,
                        Socket::Datagram(socket) => self.datagram_session(socket, &mut rx, &ctx).await,
                    }
                }
                Some(Err(e)) => Some(e),
                None => None,
            };

            let Some(err) = failure else {
                break;
            };

            self.fail_all(&err);

            // Writes queued for the dead session are discarded
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }

            match policy.next_delay(Instant::now()) {
                Some(delay) => {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        endpoint = %self.key,
                        conn = self.id,
                        attempt = policy.attempts(),
                        delay = ?delay,
                        dropped_writes = dropped,
                        error = %err,
                        "Physical connection failed, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                None => {
                    warn!(
                        endpoint = %self.key,
                        conn = self.id,
                        attempts = policy.attempts() - 1,
                        error = %err,
                        "Reconnect budget exhausted, removing physical connection"
                    );
                    exhausted = true;
                    break;
                }
            }
        }

        rx.close();
        self.fail_all(&MuxError::ConnClosed);
        self.state.lock().terminated = true;

        if let Some(set) = self.set.upgrade() {
            set.remove_conn(&self, exhausted);
        }
        debug!(endpoint = %self.key, conn = self.id, "Physical connection driver stopped");
    }

    /// `None` when shut down while dialing
    async fn dial(&self, ctx: &DriverContext) -> Option<Result<Socket, MuxError>> {
        let opts = DialOptions::new(self.key.network, self.key.address.clone())
            .with_timeout(self.config.dial_timeout)
            .with_local_addr(ctx.local_addr);

        tokio::select! {
            result = dial_with_timeout(ctx.dialer.as_ref(), &opts) => Some(result.map_err(MuxError::from)),
            _ = self.shutdown.cancelled() => None,
        }
    }

    /// Returns the error that ended the session, or `None` on shutdown
    async fn stream_session(
        self: &Arc<Self>,
        stream: Box<dyn RawStream>,
        rx: &mut mpsc::Receiver<Bytes>,
        ctx: &DriverContext,
    ) -> Option<MuxError> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut inbound = tokio::spawn(read_stream(
            Arc::clone(self),
            reader,
            Arc::clone(&ctx.parser),
            self.config.read_buffer_size,
        ));

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break None,
                res = &mut inbound => break Some(reader_failure(res)),
                frame = rx.recv() => {
                    let Some(frame) = frame else { break None };
                    // A peer that stops reading must not pin the driver here
                    tokio::select! {
                        res = writer.write_all(&frame) => {
                            if let Err(e) = res {
                                break Some(MuxError::from(e));
                            }
                        }
                        _ = self.shutdown.cancelled() => break None,
                        res = &mut inbound => break Some(reader_failure(res)),
                    }
                }
            }
        };

        inbound.abort();
        result
    }

    async fn datagram_session(
        self: &Arc<Self>,
        socket: UdpSocket,
        rx: &mut mpsc::Receiver<Bytes>,
        ctx: &DriverContext,
    ) -> Option<MuxError> {
        let socket = Arc::new(socket);
        let mut inbound = tokio::spawn(read_datagrams(
            Arc::clone(self),
            Arc::clone(&socket),
            Arc::clone(&ctx.parser),
        ));

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break None,
                res = &mut inbound => break Some(reader_failure(res)),
                frame = rx.recv() => {
                    let Some(frame) = frame else { break None };
                    tokio::select! {
                        res = socket.send(&frame) => match res {
                            Ok(n) if n == frame.len() => {}
                            Ok(n) => break Some(MuxError::WriteMismatch { written: n, expected: frame.len() }),
                            Err(e) => break Some(MuxError::from(e)),
                        },
                        _ = self.shutdown.cancelled() => break None,
                        res = &mut inbound => break Some(reader_failure(res)),
                    }
                }
            }
        };

        inbound.abort();
        result
    }
}

/// The error a finished inbound task ended its session with
fn reader_failure(res: Result<MuxError, tokio::task::JoinError>) -> MuxError {
    res.unwrap_or_else(|e| MuxError::from(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

/// Parse frames off a byte stream until it fails.
///
/// Any parse error is fatal: the remaining bytes can no longer be trusted to
/// start on a frame boundary.
async fn read_stream(
    conn: Arc<PhysicalConn>,
    mut reader: ReadHalf<Box<dyn RawStream>>,
    parser: Arc<dyn FrameParser>,
    chunk: usize,
) -> MuxError {
    let mut buf = BytesMut::with_capacity(chunk);
    loop {
        loop {
            match parser.parse(&mut buf) {
                Ok(Some((stream_id, frame))) => conn.dispatch(stream_id, frame),
                Ok(None) => break,
                Err(e) => return MuxError::Frame(e),
            }
        }

        buf.reserve(chunk);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                return MuxError::from(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))
            }
            Ok(_) => {}
            Err(e) => return MuxError::from(e),
        }
    }
}

/// Parse each datagram on its own; a bad packet is dropped, not fatal
async fn read_datagrams(
    conn: Arc<PhysicalConn>,
    socket: Arc<UdpSocket>,
    parser: Arc<dyn FrameParser>,
) -> MuxError {
    let mut packet = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match socket.recv(&mut packet).await {
            Ok(n) => n,
            Err(e) => return MuxError::from(e),
        };

        let mut buf = BytesMut::from(&packet[..n]);
        loop {
            match parser.parse(&mut buf) {
                Ok(Some((stream_id, frame))) => conn.dispatch(stream_id, frame),
                Ok(None) => {
                    if !buf.is_empty() {
                        debug!(conn = conn.id, leftover = buf.len(), "Dropped incomplete datagram frame");
                    }
                    break;
                }
                Err(e) => {
                    debug!(conn = conn.id, error = %e, "Dropped unparseable datagram");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for PhysicalConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConn")
            .field("id", &self.id)
            .field("endpoint", &self.key)
            .field("streams", &self.stream_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
