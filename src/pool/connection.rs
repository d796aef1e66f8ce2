//! Pooled connection state and the handle lent to callers.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use super::conn_pool::PoolShared;
use super::PoolError;
use crate::codec::Framer;
use crate::transport::{Probe, RawStream};

const READ_CHUNK: usize = 4096;

/// One physical connection owned by a pool.
///
/// While idle it is linked in the pool's idle list; while checked out it is
/// owned by exactly one [`PooledConnection`]. Ownership makes the two states
/// exclusive.
pub struct IdleConn {
    stream: Box<dyn RawStream>,
    framer: Option<Box<dyn Framer>>,
    read_buf: BytesMut,
    created_at: Instant,
    idle_since: Instant,
    reuse_count: u64,
    broken: bool,
}

impl IdleConn {
    pub(crate) fn new(stream: Box<dyn RawStream>) -> Self {
        let now = Instant::now();
        Self {
            stream,
            framer: None,
            read_buf: BytesMut::new(),
            created_at: now,
            idle_since: now,
            reuse_count: 0,
            broken: false,
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection was last returned to the idle list
    pub fn idle_since(&self) -> Instant {
        self.idle_since
    }

    pub fn reuse_count(&self) -> u64 {
        self.reuse_count
    }

    /// Non-blocking look at the socket state
    pub fn probe(&self) -> Probe {
        self.stream.probe()
    }

    /// An I/O or framing error was observed while it was checked out
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Bytes were read off the socket but never consumed
    pub fn has_buffered_data(&self) -> bool {
        !self.read_buf.is_empty()
    }

    pub(crate) fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl std::fmt::Debug for IdleConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleConn")
            .field("peer", &self.peer_addr())
            .field("reuse_count", &self.reuse_count)
            .field("broken", &self.broken)
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}

/// A connection checked out of a [`ConnectionPool`](super::ConnectionPool).
///
/// Dropping the handle (or calling [`release`](Self::release)) returns the
/// connection to its pool instead of closing the socket. Use
/// [`close`](Self::close) to force the socket closed. Either way the
/// concurrency token is released exactly once.
pub struct PooledConnection {
    conn: Option<IdleConn>,
    pool: Arc<PoolShared>,
    _permit: Option<OwnedSemaphorePermit>,
    force_close: bool,
    reused: bool,
}

impl PooledConnection {
    pub(crate) fn new(
        mut conn: IdleConn,
        pool: Arc<PoolShared>,
        permit: Option<OwnedSemaphorePermit>,
        reused: bool,
    ) -> Self {
        if reused {
            conn.reuse_count += 1;
        }
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
            force_close: false,
            reused,
        }
    }

    pub(crate) fn bind_framer(&mut self, framer: Box<dyn Framer>) {
        if let Some(conn) = self.conn.as_mut() {
            if conn.framer.is_none() {
                conn.framer = Some(framer);
            }
        }
    }

    /// Whether this connection came from the idle list rather than a fresh dial
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn has_framer(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.framer.is_some())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().and_then(|c| c.local_addr())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().and_then(|c| c.peer_addr())
    }

    pub fn created_at(&self) -> Option<Instant> {
        self.conn.as_ref().map(|c| c.created_at)
    }

    /// Close the socket when the handle is returned instead of keeping it
    pub fn mark_broken(&mut self) {
        self.force_close = true;
    }

    /// Read one complete frame through the connection's framer.
    pub async fn read_frame(&mut self) -> Result<Bytes, PoolError> {
        let conn = self.conn.as_mut().ok_or(PoolError::Released)?;
        let IdleConn {
            stream,
            framer,
            read_buf,
            broken,
            ..
        } = conn;
        let framer = framer
            .as_mut()
            .ok_or_else(|| PoolError::Config("no framer bound to this connection".into()))?;

        loop {
            match framer.decode(read_buf) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    *broken = true;
                    return Err(e.into());
                }
            }

            read_buf.reserve(READ_CHUNK);
            match stream.read_buf(read_buf).await {
                Ok(0) => {
                    *broken = true;
                    return Err(PoolError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer mid-frame",
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    *broken = true;
                    return Err(e.into());
                }
            }
        }
    }

    /// Write all of `data` to the connection
    pub async fn write_all_frame(&mut self, data: &[u8]) -> Result<(), PoolError> {
        let conn = self.conn.as_mut().ok_or(PoolError::Released)?;
        if let Err(e) = conn.stream.write_all(data).await {
            conn.broken = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// Return the connection to its pool
    pub fn release(self) {}

    /// Close the underlying socket instead of returning it to the pool
    pub fn close(mut self) {
        self.force_close = true;
    }

    /// Take the raw stream out of the pool for good.
    ///
    /// The concurrency token is released; the pool no longer tracks the
    /// connection.
    pub fn detach(mut self) -> Option<Box<dyn RawStream>> {
        self.conn.take().map(|c| c.stream)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, self.force_close);
        }
        self.pool.release_in_use();
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "pooled connection already released")
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Err(released()));
        };

        // Bytes already pulled in by the framer come first
        if !conn.read_buf.is_empty() {
            let n = conn.read_buf.len().min(buf.remaining());
            buf.put_slice(&conn.read_buf[..n]);
            conn.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }

        let result = Pin::new(&mut conn.stream).poll_read(cx, buf);
        if let Poll::Ready(Err(_)) = &result {
            conn.broken = true;
        }
        result
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Err(released()));
        };
        let result = Pin::new(&mut conn.stream).poll_write(cx, data);
        if let Poll::Ready(Err(_)) = &result {
            conn.broken = true;
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Err(released()));
        };
        let result = Pin::new(&mut conn.stream).poll_flush(cx);
        if let Poll::Ready(Err(_)) = &result {
            conn.broken = true;
        }
        result
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Err(released()));
        };
        // A shut down socket can never be reused
        this.force_close = true;
        Pin::new(&mut conn.stream).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("reused", &self.reused)
            .field("force_close", &self.force_close)
            .finish()
    }
}
