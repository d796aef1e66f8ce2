//! Multiplexed connection pool
//!
//! Many logical streams share a few physical connections per endpoint:
//! - [`VirtualConnection`]: one caller-identified stream with its own inbound FIFO
//! - Physical connections own the socket, a bounded write queue, an inbound
//!   demultiplexer, and reconnection with exponential backoff
//! - Connection sets pick a physical connection for each new stream
//!   (round-robin, or least-loaded when per-connection capacity is limited)
//! - [`Multiplexed`] registry maps endpoint keys to connection sets

mod backoff;
mod conn_set;
mod physical;
mod registry;
mod virtual_conn;

pub use backoff::ReconnectPolicy;
pub use conn_set::MuxStats;
pub use registry::Multiplexed;
pub use virtual_conn::VirtualConnection;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{FrameError, FrameParser};
use crate::error::ErrorKind;

/// Error types for multiplexed streams.
///
/// Cloneable so a single physical connection failure can be handed to every
/// stream it carried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MuxError {
    #[error("physical connection is closed")]
    ConnClosed,

    #[error("stream is closed")]
    StreamClosed,

    #[error("send queue is full")]
    QueueFull,

    #[error("duplicate stream id {0}")]
    DuplicateStreamId(u32),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("short write: wrote {written} of {expected} bytes")]
    WriteMismatch { written: usize, expected: usize },

    #[error("invalid multiplexing configuration: {0}")]
    Config(String),
}

impl From<io::Error> for MuxError {
    fn from(e: io::Error) -> Self {
        MuxError::Io(Arc::new(e))
    }
}

impl MuxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MuxError::QueueFull => ErrorKind::Capacity,
            MuxError::ConnClosed | MuxError::StreamClosed => ErrorKind::Closed,
            MuxError::DuplicateStreamId(_) | MuxError::Frame(_) | MuxError::WriteMismatch { .. } => {
                ErrorKind::Protocol
            }
            MuxError::Io(_) => ErrorKind::Io,
            MuxError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Configuration for the multiplexed pool
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Physical connections opened per endpoint when stream capacity is unlimited
    pub connections_per_host: usize,

    /// Capacity of each physical connection's outbound queue
    pub send_queue_size: usize,

    /// Fail writes with [`MuxError::QueueFull`] instead of waiting for room
    pub drop_full: bool,

    pub dial_timeout: Duration,

    /// Streams per physical connection; 0 means unlimited
    pub max_streams_per_conn: usize,

    /// Idle physical connections kept per endpoint; 0 means unlimited
    pub max_idle_conns_per_host: usize,

    /// Reconnect attempts allowed within one reset window
    pub max_reconnect_count: u32,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,

    /// The reconnect counter restarts once the last attempt is this old
    pub reconnect_reset_interval: Duration,

    /// Randomize each backoff delay between half and all of its value
    pub backoff_jitter: bool,

    /// Read buffer growth step for stream transports
    pub read_buffer_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        let max_reconnect_count = 10;
        let max_backoff = Duration::from_millis(50);
        Self {
            connections_per_host: 2,
            send_queue_size: 1024,
            drop_full: false,
            dial_timeout: Duration::from_secs(1),
            max_streams_per_conn: 0,
            max_idle_conns_per_host: 0,
            max_reconnect_count,
            initial_backoff: Duration::from_millis(5),
            max_backoff,
            reconnect_reset_interval: max_backoff * max_reconnect_count * 2,
            backoff_jitter: false,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.connections_per_host == 0 {
            return Err(MuxError::Config("connections_per_host must be positive".into()));
        }
        if self.send_queue_size == 0 {
            return Err(MuxError::Config("send_queue_size must be positive".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(MuxError::Config("read_buffer_size must be positive".into()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(MuxError::Config(format!(
                "initial_backoff {:?} exceeds max_backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

/// Per-request options for [`Multiplexed::get_stream`]
#[derive(Clone, Default)]
pub struct MuxOptions {
    /// Protocol name, part of the endpoint key
    pub protocol: String,

    /// Parser used by connections created for this endpoint; falls back to
    /// the registry's parser
    pub parser: Option<Arc<dyn FrameParser>>,

    /// Local address to bind physical connections to
    pub local_addr: Option<SocketAddr>,
}

impl MuxOptions {
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn FrameParser>) -> Self {
        self.parser = Some(parser);
        self
    }
}

impl std::fmt::Debug for MuxOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxOptions")
            .field("protocol", &self.protocol)
            .field("parser", &self.parser.is_some())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
