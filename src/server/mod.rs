//! Loopback echo server
//!
//! Writes every received byte back to its sender. Because it echoes raw
//! bytes, any framing the client uses comes back intact, which makes it a
//! target for both the exclusive and the multiplexed probes.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

/// Echo server bound to a TCP or UDP address
pub enum EchoServer {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

impl EchoServer {
    pub async fn bind_tcp(listen: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .context(format!("Failed to bind to {}", listen))?;
        Ok(EchoServer::Tcp(listener))
    }

    pub async fn bind_udp(listen: &str) -> Result<Self> {
        let socket = UdpSocket::bind(listen)
            .await
            .context(format!("Failed to bind to {}", listen))?;
        Ok(EchoServer::Udp(Arc::new(socket)))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match self {
            EchoServer::Tcp(l) => l.local_addr()?,
            EchoServer::Udp(s) => s.local_addr()?,
        };
        Ok(addr)
    }

    /// Serve until the task is dropped or the socket fails
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        match self {
            EchoServer::Tcp(listener) => {
                info!("Echo server listening on tcp://{}", addr);
                loop {
                    let (stream, peer) = listener.accept().await.context("Accept failed")?;
                    debug!(peer = %peer, "Accepted connection");
                    tokio::spawn(echo_stream(stream, peer));
                }
            }
            EchoServer::Udp(socket) => {
                info!("Echo server listening on udp://{}", addr);
                let mut buf = vec![0u8; 65535];
                loop {
                    let (n, peer) = socket.recv_from(&mut buf).await.context("Receive failed")?;
                    if let Err(e) = socket.send_to(&buf[..n], peer).await {
                        warn!(peer = %peer, error = %e, "Failed to echo datagram");
                    }
                }
            }
        }
    }

    /// Run on a background task, returning the bound address
    pub fn spawn(self) -> Result<SocketAddr> {
        let addr = self.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                warn!(error = %e, "Echo server stopped");
            }
        });
        Ok(addr)
    }
}

async fn echo_stream(mut stream: TcpStream, peer: SocketAddr) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    debug!(peer = %peer, error = %e, "Write failed");
                    break;
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Read failed");
                break;
            }
        }
    }
    debug!(peer = %peer, "Connection closed");
}

/// Run an echo server in the foreground
pub async fn run_echo_server(listen: &str, udp: bool) -> Result<()> {
    let server = if udp {
        EchoServer::bind_udp(listen).await?
    } else {
        EchoServer::bind_tcp(listen).await?
    };
    server.run().await
}
