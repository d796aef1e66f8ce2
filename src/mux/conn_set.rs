//! Physical connections opened to one endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::physical::{DriverContext, PhysicalConn};
use super::virtual_conn::{StreamShared, VirtualConnection};
use super::{MuxConfig, MuxError};
use crate::endpoint::EndpointKey;

type ExpelCallback = Box<dyn FnOnce(&EndpointKey) + Send>;

/// Snapshot of a connection set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxStats {
    /// Physical connections in the set
    pub connections: usize,

    /// Physical connections with no open stream
    pub idle_connections: usize,

    /// Open streams across all physical connections
    pub streams: usize,

    /// Reconnect attempts made by the current physical connections
    pub reconnects: usize,

    /// Every connection failed for good and the set left the registry
    pub expelled: bool,
}

struct SetInner {
    conns: Vec<Arc<PhysicalConn>>,
    cursor: usize,
    expelled: bool,
}

pub(crate) struct ConnSet {
    key: EndpointKey,
    config: Arc<MuxConfig>,
    ctx: Arc<DriverContext>,
    inner: Mutex<SetInner>,
    on_expelled: Mutex<Option<ExpelCallback>>,
    next_conn_id: AtomicU64,
}

impl ConnSet {
    pub(crate) fn new(key: EndpointKey, config: Arc<MuxConfig>, ctx: Arc<DriverContext>) -> Arc<Self> {
        Arc::new(Self {
            key,
            config,
            ctx,
            inner: Mutex::new(SetInner {
                conns: Vec::new(),
                cursor: 0,
                expelled: false,
            }),
            on_expelled: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn set_on_expelled(&self, callback: ExpelCallback) {
        *self.on_expelled.lock() = Some(callback);
    }

    pub(crate) fn is_expelled(&self) -> bool {
        self.inner.lock().expelled
    }

    /// Open stream `stream_id` on a physical connection.
    ///
    /// An id that is still open anywhere in the set goes back to the
    /// connection holding it, where the open stream is cancelled with
    /// [`MuxError::DuplicateStreamId`] and replaced.
    pub(crate) fn new_stream(self: &Arc<Self>, stream_id: u32) -> Result<VirtualConnection, MuxError> {
        let (conn, shared, rx, displaced) = {
            let mut inner = self.inner.lock();
            if inner.expelled {
                return Err(MuxError::ConnClosed);
            }
            let holder = inner.conns.iter().find(|c| c.has_stream(stream_id)).cloned();
            let conn = match holder {
                Some(conn) => conn,
                None => self.pick(&mut inner)?,
            };
            let (shared, rx) = StreamShared::new(stream_id);
            let displaced = conn.add_stream(Arc::clone(&shared))?;
            (conn, shared, rx, displaced)
        };

        if let Some(old) = displaced {
            warn!(
                endpoint = %self.key,
                conn = conn.id(),
                stream_id,
                "Stream id reused while still open, cancelling previous stream"
            );
            old.cancel_with(MuxError::DuplicateStreamId(stream_id));
        }

        Ok(VirtualConnection::new(shared, rx, conn))
    }

    fn pick(self: &Arc<Self>, inner: &mut SetInner) -> Result<Arc<PhysicalConn>, MuxError> {
        let max_streams = self.config.max_streams_per_conn;

        if max_streams > 0 {
            let spare = inner
                .conns
                .iter()
                .filter(|c| !c.is_closed())
                .find(|c| c.stream_count() < max_streams);
            if let Some(conn) = spare {
                return Ok(Arc::clone(conn));
            }
            return Ok(self.open(inner));
        }

        if inner.conns.len() < self.config.connections_per_host {
            // With an idle cap, a fresh connection would only be evicted again
            if self.config.max_idle_conns_per_host > 0 {
                let idle = inner
                    .conns
                    .iter()
                    .find(|c| !c.is_closed() && c.stream_count() == 0);
                if let Some(conn) = idle {
                    return Ok(Arc::clone(conn));
                }
            }
            return Ok(self.open(inner));
        }

        let len = inner.conns.len();
        for _ in 0..len {
            let idx = inner.cursor % len;
            inner.cursor = inner.cursor.wrapping_add(1);
            let conn = &inner.conns[idx];
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
        }
        Err(MuxError::ConnClosed)
    }

    fn open(self: &Arc<Self>, inner: &mut SetInner) -> Arc<PhysicalConn> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = PhysicalConn::spawn(
            id,
            self.key.clone(),
            Arc::clone(&self.config),
            Arc::downgrade(self),
            Arc::clone(&self.ctx),
        );
        inner.conns.push(Arc::clone(&conn));
        conn
    }

    /// Close idle connections beyond `max_idle_conns_per_host`
    pub(crate) fn evict_idle(&self) {
        let max_idle = self.config.max_idle_conns_per_host;
        if max_idle == 0 {
            return;
        }

        let evicted: Vec<Arc<PhysicalConn>> = {
            let mut inner = self.inner.lock();
            let idle: Vec<usize> = inner
                .conns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.stream_count() == 0)
                .map(|(i, _)| i)
                .collect();
            if idle.len() <= max_idle {
                return;
            }
            let excess = idle.len() - max_idle;
            // Highest indices first so earlier ones stay valid
            idle.iter()
                .rev()
                .take(excess)
                .map(|&i| inner.conns.remove(i))
                .collect()
        };

        for conn in evicted {
            debug!(endpoint = %self.key, conn = conn.id(), "Closing surplus idle physical connection");
            conn.shutdown();
        }
    }

    /// Drop `conn` from the set. A terminal removal that empties the set
    /// expels it from the registry.
    pub(crate) fn remove_conn(&self, conn: &Arc<PhysicalConn>, terminal: bool) {
        let expelled = {
            let mut inner = self.inner.lock();
            inner.conns.retain(|c| !Arc::ptr_eq(c, conn));
            if terminal && inner.conns.is_empty() && !inner.expelled {
                inner.expelled = true;
                true
            } else {
                false
            }
        };

        if expelled {
            info!(endpoint = %self.key, "All physical connections failed, expelling endpoint");
            let callback = self.on_expelled.lock().take();
            if let Some(callback) = callback {
                callback(&self.key);
            }
        }
    }

    /// Shut down every physical connection and mark the set expelled
    pub(crate) fn close(&self) {
        let conns = {
            let mut inner = self.inner.lock();
            inner.expelled = true;
            std::mem::take(&mut inner.conns)
        };
        for conn in &conns {
            conn.shutdown();
        }
        self.on_expelled.lock().take();
        debug!(endpoint = %self.key, connections = conns.len(), "Closed connection set");
    }

    pub(crate) fn stats(&self) -> MuxStats {
        let inner = self.inner.lock();
        let mut stats = MuxStats {
            connections: inner.conns.len(),
            expelled: inner.expelled,
            ..Default::default()
        };
        for conn in &inner.conns {
            let streams = conn.stream_count();
            if streams == 0 {
                stats.idle_connections += 1;
            }
            stats.streams += streams;
            stats.reconnects += conn.reconnect_count();
        }
        stats
    }
}

impl std::fmt::Debug for ConnSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnSet")
            .field("key", &self.key)
            .field("stats", &self.stats())
            .finish()
    }
}
