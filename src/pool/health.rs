//! Health checks for idle pooled connections.
//!
//! Two modes:
//! - **fast**: run on every acquisition from the idle list. Only verifies the
//!   connection has not seen a remote error, EOF, or unexpected inbound bytes
//!   while idle. An idle connection must never have data ready to read.
//! - **full**: run by the periodic sweep. Adds idle-timeout and
//!   maximum-lifetime limits on top of the fast check.

use std::time::Duration;

use tracing::debug;

use super::connection::IdleConn;
use crate::transport::Probe;

/// Decides whether an idle connection may stay pooled.
pub trait HealthChecker: Send + Sync {
    fn is_healthy(&self, conn: &IdleConn, fast: bool) -> bool;
}

impl<F> HealthChecker for F
where
    F: Fn(&IdleConn, bool) -> bool + Send + Sync,
{
    fn is_healthy(&self, conn: &IdleConn, fast: bool) -> bool {
        self(conn, fast)
    }
}

/// Built-in checker used when none is injected
#[derive(Debug, Clone, Default)]
pub struct DefaultHealthChecker {
    /// Zero disables the idle timeout
    pub idle_timeout: Duration,

    /// Zero disables the lifetime limit
    pub max_conn_lifetime: Duration,
}

impl DefaultHealthChecker {
    pub fn new(idle_timeout: Duration, max_conn_lifetime: Duration) -> Self {
        Self {
            idle_timeout,
            max_conn_lifetime,
        }
    }

    /// Socket-level check shared by both modes
    fn is_alive(conn: &IdleConn) -> bool {
        if conn.is_broken() || conn.has_buffered_data() {
            return false;
        }

        match conn.probe() {
            Probe::Idle => true,
            Probe::Closed => {
                debug!(peer = ?conn.peer_addr(), "Idle connection closed by peer");
                false
            }
            Probe::Readable => {
                debug!(peer = ?conn.peer_addr(), "Idle connection has unexpected readable data");
                false
            }
            Probe::Error(e) => {
                debug!(peer = ?conn.peer_addr(), error = %e, "Idle connection reported an error");
                false
            }
        }
    }
}

impl HealthChecker for DefaultHealthChecker {
    fn is_healthy(&self, conn: &IdleConn, fast: bool) -> bool {
        if !Self::is_alive(conn) {
            return false;
        }
        if fast {
            return true;
        }

        if !self.idle_timeout.is_zero() && conn.idle_since().elapsed() > self.idle_timeout {
            return false;
        }
        if !self.max_conn_lifetime.is_zero() && conn.created_at().elapsed() > self.max_conn_lifetime {
            return false;
        }
        true
    }
}
