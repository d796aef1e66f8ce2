//! Per-endpoint exclusive connection pool.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{IdleConn, PooledConnection};
use super::health::{DefaultHealthChecker, HealthChecker};
use super::idle_list::{IdleList, NodeId};
use super::{GetOptions, IdlePolicy, PoolConfig, PoolError};
use crate::endpoint::EndpointKey;
use crate::transport::{dial_with_timeout, DialOptions, Dialer, Socket};

type DestroyCallback = Box<dyn FnOnce(&EndpointKey) + Send>;

/// Snapshot of a pool's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently in the idle list
    pub idle: usize,

    /// Connections currently checked out
    pub in_use: usize,

    /// Connections successfully dialed
    pub total_dialed: u64,

    /// Acquisitions served from the idle list
    pub total_reused: u64,

    /// Failed dial attempts
    pub dial_failures: u64,

    /// Idle connections evicted because the idle list was full
    pub evicted: u64,

    /// Idle connections closed by a health check
    pub unhealthy_closed: u64,

    pub closed: bool,
}

#[derive(Default)]
struct Counters {
    dialed: AtomicU64,
    reused: AtomicU64,
    dial_failures: AtomicU64,
    evicted: AtomicU64,
    unhealthy: AtomicU64,
}

struct PoolState {
    idle: IdleList<IdleConn>,
    closed: bool,
    /// Min-idle dials in flight, counted against `min_idle` before they land
    pending_fill: usize,
}

pub(crate) struct PoolShared {
    key: EndpointKey,
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    checker: Arc<dyn HealthChecker>,
    tokens: Option<Arc<Semaphore>>,
    state: Mutex<PoolState>,
    in_use: AtomicUsize,
    last_acquired: Mutex<Instant>,
    shutdown: CancellationToken,
    on_destroy: Mutex<Option<DestroyCallback>>,
    counters: Counters,
}

impl PoolShared {
    /// Take back a connection from a handle.
    ///
    /// Closed pools, forced closes, and connections that saw errors or still
    /// hold unread bytes are closed instead of being linked.
    pub(crate) fn put(&self, mut conn: IdleConn, force_close: bool) {
        let reject = if force_close {
            Some("forced")
        } else if conn.is_broken() {
            Some("broken")
        } else if conn.has_buffered_data() {
            Some("unread data")
        } else {
            None
        };

        let evicted = {
            let mut state = self.state.lock();
            if state.closed || reject.is_some() {
                drop(state);
                debug!(
                    endpoint = %self.key,
                    reason = reject.unwrap_or("pool closed"),
                    "Closing returned connection"
                );
                return;
            }

            conn.mark_idle();
            let evicted = if self.config.max_idle > 0 && state.idle.len() >= self.config.max_idle {
                match self.config.idle_policy {
                    IdlePolicy::Stack => state.idle.pop_back(),
                    IdlePolicy::Queue => state.idle.pop_front(),
                }
            } else {
                None
            };
            push_idle(&mut state.idle, self.config.idle_policy, conn);
            evicted
        };

        if let Some(old) = evicted {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(
                endpoint = %self.key,
                reuse_count = old.reuse_count(),
                "Idle list full, evicted oldest connection"
            );
        }
    }

    pub(crate) fn release_in_use(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

fn push_idle(idle: &mut IdleList<IdleConn>, policy: IdlePolicy, conn: IdleConn) -> NodeId {
    match policy {
        IdlePolicy::Stack => idle.push_front(conn),
        IdlePolicy::Queue => idle.push_back(conn),
    }
}

/// Exclusive connection pool for one endpoint.
///
/// Cheap to clone; clones share the same pool. Must be created inside a
/// tokio runtime because it spawns its maintenance loop.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool using the built-in health checker
    pub fn new(key: EndpointKey, config: PoolConfig, dialer: Arc<dyn Dialer>) -> Result<Self, PoolError> {
        let checker = Arc::new(DefaultHealthChecker::new(
            config.idle_timeout,
            config.max_conn_lifetime,
        ));
        Self::with_health_checker(key, config, dialer, checker)
    }

    pub fn with_health_checker(
        key: EndpointKey,
        config: PoolConfig,
        dialer: Arc<dyn Dialer>,
        checker: Arc<dyn HealthChecker>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        if key.network.is_datagram() {
            return Err(PoolError::Config(format!(
                "exclusive pools need a stream network, got {}",
                key.network
            )));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PoolError::Config(
                "connection pools must be created inside a tokio runtime".into(),
            ));
        }

        let tokens = (config.max_active > 0).then(|| Arc::new(Semaphore::new(config.max_active)));

        let shared = Arc::new(PoolShared {
            key,
            config,
            dialer,
            checker,
            tokens,
            state: Mutex::new(PoolState {
                idle: IdleList::new(),
                closed: false,
                pending_fill: 0,
            }),
            in_use: AtomicUsize::new(0),
            last_acquired: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            on_destroy: Mutex::new(None),
            counters: Counters::default(),
        });

        spawn_maintenance(&shared);

        info!(
            endpoint = %shared.key,
            max_active = shared.config.max_active,
            max_idle = shared.config.max_idle,
            min_idle = shared.config.min_idle,
            "Created connection pool"
        );

        Ok(Self { shared })
    }

    pub fn key(&self) -> &EndpointKey {
        &self.shared.key
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub(crate) fn ptr_eq(&self, other: &Weak<PoolShared>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.shared), other.as_ptr())
    }

    pub(crate) fn downgrade(&self) -> Weak<PoolShared> {
        Arc::downgrade(&self.shared)
    }

    /// Register a callback run once when the pool closes, explicitly or
    /// through inactivity
    pub(crate) fn set_on_destroy(&self, callback: DestroyCallback) {
        *self.shared.on_destroy.lock() = Some(callback);
    }

    /// Acquire a connection.
    ///
    /// Takes a concurrency token first (waiting or failing per the pool's
    /// `wait` setting), then reuses the head of the idle list if it passes
    /// the fast health check, else dials.
    pub async fn get(&self, opts: &GetOptions) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let deadline = opts.timeout.map(|t| Instant::now() + t);
        let permit = self.acquire_token(deadline).await?;
        *self.shared.last_acquired.lock() = Instant::now();

        while let Some(conn) = self.pop_idle() {
            if self.shared.checker.is_healthy(&conn, true) {
                self.shared.counters.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(self.checkout(conn, permit, opts, true));
            }
            self.shared.counters.unhealthy.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %self.shared.key, "Discarding unhealthy idle connection");
        }

        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        // On failure the permit drops here, releasing the token
        let conn = self.dial(opts, deadline).await?;

        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(self.checkout(conn, permit, opts, false))
    }

    async fn acquire_token(&self, deadline: Option<Instant>) -> Result<Option<OwnedSemaphorePermit>, PoolError> {
        let Some(tokens) = &self.shared.tokens else {
            return Ok(None);
        };

        if !self.shared.config.wait {
            return match Arc::clone(tokens).try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(TryAcquireError::NoPermits) => Err(PoolError::Exhausted(self.shared.config.max_active)),
                Err(TryAcquireError::Closed) => Err(PoolError::Closed),
            };
        }

        let acquire = Arc::clone(tokens).acquire_owned();
        let permit = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, acquire)
                .await
                .map_err(|_| PoolError::Timeout)?,
            None => acquire.await,
        };
        // The semaphore is closed only by `close`
        permit.map(Some).map_err(|_| PoolError::Closed)
    }

    fn pop_idle(&self) -> Option<IdleConn> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return None;
        }
        state.idle.pop_front()
    }

    fn checkout(
        &self,
        conn: IdleConn,
        permit: Option<OwnedSemaphorePermit>,
        opts: &GetOptions,
        reused: bool,
    ) -> PooledConnection {
        self.shared.in_use.fetch_add(1, Ordering::AcqRel);
        let mut handle = PooledConnection::new(conn, Arc::clone(&self.shared), permit, reused);
        if let Some(builder) = &opts.framer {
            handle.bind_framer(builder.build());
        }
        handle
    }

    async fn dial(&self, opts: &GetOptions, deadline: Option<Instant>) -> Result<IdleConn, PoolError> {
        let mut timeout = opts.dial_timeout.unwrap_or(self.shared.config.dial_timeout);
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::Timeout);
            }
            if timeout.is_zero() || remaining < timeout {
                timeout = remaining;
            }
        }

        let key = &self.shared.key;
        let dial_opts = DialOptions::new(key.network, key.address.clone())
            .with_timeout(timeout)
            .with_local_addr(opts.local_addr);

        let result = tokio::select! {
            result = dial_with_timeout(self.shared.dialer.as_ref(), &dial_opts) => result,
            _ = self.shared.shutdown.cancelled() => return Err(PoolError::Closed),
        };

        match result {
            Ok(Socket::Stream(stream)) => {
                self.shared.counters.dialed.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %key, peer = ?stream.peer_addr(), "Dialed new connection");
                Ok(IdleConn::new(stream))
            }
            Ok(Socket::Datagram(_)) => Err(PoolError::Config(format!(
                "dialer returned a datagram socket for {key}"
            ))),
            Err(source) => {
                self.shared.counters.dial_failures.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint = %key, error = %source, "Failed to dial connection");
                Err(PoolError::Dial {
                    address: key.address.clone(),
                    source,
                })
            }
        }
    }

    /// Close the pool.
    ///
    /// Idle connections are closed immediately; checked-out connections are
    /// closed when their handles are returned. Blocked and future `get` calls
    /// fail with [`PoolError::Closed`].
    pub fn close(&self) {
        let idle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain()
        };

        if let Some(tokens) = &self.shared.tokens {
            tokens.close();
        }
        self.shared.shutdown.cancel();

        info!(
            endpoint = %self.shared.key,
            idle_closed = idle.len(),
            in_use = self.shared.in_use.load(Ordering::Acquire),
            "Closed connection pool"
        );
        drop(idle);

        let callback = self.shared.on_destroy.lock().take();
        if let Some(callback) = callback {
            callback(&self.shared.key);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, closed) = {
            let state = self.shared.state.lock();
            (state.idle.len(), state.closed)
        };
        let c = &self.shared.counters;
        PoolStats {
            idle,
            in_use: self.shared.in_use.load(Ordering::Acquire),
            total_dialed: c.dialed.load(Ordering::Relaxed),
            total_reused: c.reused.load(Ordering::Relaxed),
            dial_failures: c.dial_failures.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            unhealthy_closed: c.unhealthy.load(Ordering::Relaxed),
            closed,
        }
    }

    /// Apply the full health check to every idle connection.
    ///
    /// The list is taken out so the checker runs without the pool lock.
    /// Survivors are merged back behind anything returned meanwhile, which
    /// keeps the list ordered by idle time for either policy.
    fn sweep(&self) {
        let mut detached = {
            let mut state = self.shared.state.lock();
            if state.closed || state.idle.is_empty() {
                return;
            }
            std::mem::take(&mut state.idle)
        };

        let (healthy, failing): (Vec<IdleConn>, Vec<IdleConn>) = detached
            .drain()
            .into_iter()
            .partition(|conn| self.shared.checker.is_healthy(conn, false));

        let policy = self.shared.config.idle_policy;
        let max_idle = self.shared.config.max_idle;
        let (orphaned, evicted) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                (healthy, Vec::new())
            } else {
                match policy {
                    IdlePolicy::Stack => healthy.into_iter().for_each(|conn| {
                        state.idle.push_back(conn);
                    }),
                    IdlePolicy::Queue => healthy.into_iter().rev().for_each(|conn| {
                        state.idle.push_front(conn);
                    }),
                }

                let mut evicted = Vec::new();
                while max_idle > 0 && state.idle.len() > max_idle {
                    let oldest = match policy {
                        IdlePolicy::Stack => state.idle.pop_back(),
                        IdlePolicy::Queue => state.idle.pop_front(),
                    };
                    match oldest {
                        Some(conn) => evicted.push(conn),
                        None => break,
                    }
                }
                (Vec::new(), evicted)
            }
        };

        if !failing.is_empty() {
            self.shared
                .counters
                .unhealthy
                .fetch_add(failing.len() as u64, Ordering::Relaxed);
            debug!(
                endpoint = %self.shared.key,
                removed = failing.len(),
                "Health sweep closed idle connections"
            );
        }
        if !evicted.is_empty() {
            self.shared
                .counters
                .evicted
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        }
        drop(orphaned);
    }

    /// Nothing acquired for `pool_idle_timeout` and nothing checked out
    fn inactivity_expired(&self) -> bool {
        let timeout = self.shared.config.pool_idle_timeout;
        !timeout.is_zero()
            && self.shared.in_use.load(Ordering::Acquire) == 0
            && self.shared.last_acquired.lock().elapsed() > timeout
    }

    /// Dial enough connections to bring the idle list back to `min_idle`
    fn fill_min_idle(&self) {
        let min_idle = self.shared.config.min_idle;
        if min_idle == 0 {
            return;
        }

        let missing = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            let have = state.idle.len() + state.pending_fill;
            let missing = min_idle.saturating_sub(have);
            state.pending_fill += missing;
            missing
        };

        for _ in 0..missing {
            let pool = self.clone();
            tokio::spawn(async move { pool.add_idle().await });
        }
    }

    async fn add_idle(&self) {
        let result = self.dial(&GetOptions::default(), None).await;

        let mut state = self.shared.state.lock();
        state.pending_fill -= 1;
        match result {
            Ok(mut conn) if !state.closed => {
                conn.mark_idle();
                push_idle(&mut state.idle, self.shared.config.idle_policy, conn);
            }
            Ok(conn) => {
                drop(state);
                drop(conn);
            }
            Err(e) => {
                drop(state);
                debug!(endpoint = %self.shared.key, error = %e, "Failed to add min-idle connection");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("key", &self.shared.key)
            .field("stats", &self.stats())
            .finish()
    }
}

fn spawn_maintenance(shared: &Arc<PoolShared>) {
    let weak = Arc::downgrade(shared);
    let shutdown = shared.shutdown.clone();
    let interval = shared.config.check_interval;
    let key = shared.key.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(shared) = weak.upgrade() else {
                break;
            };
            let pool = ConnectionPool { shared };

            pool.sweep();

            if pool.inactivity_expired() {
                info!(
                    endpoint = %key,
                    idle_for = ?pool.shared.config.pool_idle_timeout,
                    "Pool inactive, destroying"
                );
                pool.close();
                break;
            }

            pool.fill_min_idle();
        }

        debug!(endpoint = %key, "Pool maintenance stopped");
    });
}
