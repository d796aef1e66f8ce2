//! Exclusive connection pool
//!
//! One physical connection is lent to exactly one caller at a time:
//! - Per-endpoint [`ConnectionPool`] with a linked idle list (stack or queue discipline)
//! - Token-bounded concurrency (`max_active`), optionally waiting for a token
//! - Fast health check on every reuse, full check on a periodic sweep
//! - Minimum-idle maintenance and self-destruction after a period of inactivity
//! - [`Pool`] registry that lazily creates one pool per endpoint key

mod conn_pool;
mod connection;
mod health;
mod idle_list;
mod registry;

pub use conn_pool::{ConnectionPool, PoolStats};
pub use connection::{IdleConn, PooledConnection};
pub use health::{DefaultHealthChecker, HealthChecker};
pub use idle_list::{IdleList, NodeId};
pub use registry::Pool;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{FrameError, FramerBuilder};
use crate::error::ErrorKind;

/// Error types for exclusive pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,

    #[error("connection pool limit of {0} active connections reached")]
    Exhausted(usize),

    #[error("timed out waiting for a pooled connection")]
    Timeout,

    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pooled connection has already been released")]
    Released,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("invalid pool configuration: {0}")]
    Config(String),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Exhausted(_) | PoolError::Timeout => ErrorKind::Capacity,
            PoolError::Closed | PoolError::Released => ErrorKind::Closed,
            PoolError::Dial { .. } | PoolError::Io(_) => ErrorKind::Io,
            PoolError::Frame(_) => ErrorKind::Protocol,
            PoolError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Where returned connections go in the idle list.
///
/// Acquisition always pops from the head, so this alone decides reuse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    /// Push to head: last in, first out. Reuse concentrates on a few hot
    /// connections and cold ones age out through the idle timeout.
    #[default]
    Stack,

    /// Push to tail: first in, first out. Spreads use evenly, which can keep
    /// many connections alive under light, evenly spaced load.
    Queue,
}

impl std::str::FromStr for IdlePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stack" | "lifo" => Ok(IdlePolicy::Stack),
            "queue" | "fifo" => Ok(IdlePolicy::Queue),
            other => Err(format!("unknown idle policy: {other}")),
        }
    }
}

/// Configuration for one exclusive connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections the maintenance loop keeps warm
    pub min_idle: usize,

    /// Idle list capacity; 0 means unlimited
    pub max_idle: usize,

    /// Concurrently checked-out connections; 0 means unlimited
    pub max_active: usize,

    /// Block for a token when `max_active` is reached instead of failing
    pub wait: bool,

    /// Close idle connections unused for this long; zero disables
    pub idle_timeout: Duration,

    /// Close connections older than this; zero disables
    pub max_conn_lifetime: Duration,

    /// Timeout for establishing a new connection
    pub dial_timeout: Duration,

    pub idle_policy: IdlePolicy,

    /// Destroy the pool after this long without any acquisition while
    /// nothing is checked out; zero disables
    pub pool_idle_timeout: Duration,

    /// Period of the background health sweep
    pub check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_idle: 65536,
            max_active: 0,
            wait: false,
            idle_timeout: Duration::from_secs(50),
            max_conn_lifetime: Duration::ZERO,
            dial_timeout: Duration::from_millis(200),
            idle_policy: IdlePolicy::Stack,
            pool_idle_timeout: Duration::from_secs(100),
            check_interval: Duration::from_secs(3),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.check_interval.is_zero() {
            return Err(PoolError::Config("check_interval must be positive".into()));
        }
        if self.max_idle > 0 && self.min_idle > self.max_idle {
            return Err(PoolError::Config(format!(
                "min_idle ({}) exceeds max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        Ok(())
    }
}

/// Per-acquisition options
#[derive(Clone, Default)]
pub struct GetOptions {
    /// Framer bound to connections dialed or reused by this call, if they
    /// do not have one yet
    pub framer: Option<Arc<dyn FramerBuilder>>,

    /// Local address to bind new connections to
    pub local_addr: Option<SocketAddr>,

    /// Overrides the pool's dial timeout when set
    pub dial_timeout: Option<Duration>,

    /// Overall deadline for the acquisition (token wait and dial)
    pub timeout: Option<Duration>,
}

impl GetOptions {
    pub fn with_framer(mut self, framer: Arc<dyn FramerBuilder>) -> Self {
        self.framer = Some(framer);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetOptions")
            .field("framer", &self.framer.is_some())
            .field("local_addr", &self.local_addr)
            .field("dial_timeout", &self.dial_timeout)
            .field("timeout", &self.timeout)
            .finish()
    }
}
