//! Dialing collaborators consumed by the pools.
//!
//! The pools never create sockets themselves. They call a [`Dialer`], which
//! hands back a [`Socket`]: either a byte stream implementing [`RawStream`]
//! or a connected UDP socket. [`NetDialer`] is the default implementation;
//! tests and callers that need TLS or fault injection supply their own.

mod net;

pub use net::NetDialer;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

use crate::endpoint::Network;

/// Result of a non-blocking look at an idle stream.
#[derive(Debug)]
pub enum Probe {
    /// Nothing to read and no error pending
    Idle,

    /// The peer has closed its side
    Closed,

    /// Bytes are waiting to be read on a connection nobody is reading
    Readable,

    /// The socket reported an error
    Error(io::Error),
}

impl Probe {
    pub fn is_idle(&self) -> bool {
        matches!(self, Probe::Idle)
    }
}

/// A connected byte stream the pools can lend out.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {
    /// Check the socket state without blocking and without waiting for data.
    ///
    /// Used on idle connections only, where any readable byte or EOF means
    /// the connection can no longer be trusted.
    fn probe(&self) -> Probe;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// What a dialer produced.
pub enum Socket {
    Stream(Box<dyn RawStream>),
    Datagram(UdpSocket),
}

impl Socket {
    pub fn is_datagram(&self) -> bool {
        matches!(self, Socket::Datagram(_))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Socket::Stream(s) => s.local_addr(),
            Socket::Datagram(s) => s.local_addr().ok(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Socket::Stream(s) => s.peer_addr(),
            Socket::Datagram(s) => s.peer_addr().ok(),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_datagram() { "datagram" } else { "stream" };
        f.debug_struct("Socket")
            .field("kind", &kind)
            .field("local", &self.local_addr())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

/// Parameters for establishing one connection
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub network: Network,
    pub address: String,

    /// Local address to bind before connecting
    pub local_addr: Option<SocketAddr>,

    /// Upper bound for the whole dial; zero means no limit
    pub timeout: Duration,
}

impl DialOptions {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            local_addr: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_local_addr(mut self, local_addr: Option<SocketAddr>) -> Self {
        self.local_addr = local_addr;
        self
    }
}

/// Establishes the underlying socket for a pool.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, opts: &DialOptions) -> io::Result<Socket>;
}

/// Dial through `dialer`, enforcing `opts.timeout` even if the dialer does not.
pub async fn dial_with_timeout(dialer: &dyn Dialer, opts: &DialOptions) -> io::Result<Socket> {
    if opts.timeout.is_zero() {
        return dialer.dial(opts).await;
    }

    match tokio::time::timeout(opts.timeout, dialer.dial(opts)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial {} timed out after {:?}", opts.address, opts.timeout),
        )),
    }
}
