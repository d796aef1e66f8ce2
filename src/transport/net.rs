use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, trace};

use super::{DialOptions, Dialer, Probe, RawStream, Socket};
use crate::endpoint::Network;

/// Default dialer for TCP, UDP and Unix domain sockets.
///
/// TCP connections get `TCP_NODELAY` and keep-alive. UDP sockets are bound to
/// an ephemeral local port (or `local_addr`) and connected, so that reads only
/// see packets from the endpoint.
#[derive(Debug, Clone, Default)]
pub struct NetDialer {
    /// Disable TCP keep-alive probes on dialed connections
    pub no_keepalive: bool,
}

impl NetDialer {
    pub fn new() -> Self {
        Self::default()
    }

    async fn dial_inner(&self, opts: &DialOptions) -> io::Result<Socket> {
        match opts.network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let stream = self.dial_tcp(opts).await?;
                Ok(Socket::Stream(Box::new(stream)))
            }
            Network::Udp | Network::Udp4 | Network::Udp6 => {
                let socket = dial_udp(opts).await?;
                Ok(Socket::Datagram(socket))
            }
            Network::Unix => dial_unix(opts).await,
        }
    }

    async fn dial_tcp(&self, opts: &DialOptions) -> io::Result<TcpStream> {
        let addrs = resolve(opts.network, &opts.address).await?;

        let mut last_err = None;
        for addr in addrs {
            let attempt = match opts.local_addr {
                Some(local) => {
                    let socket = if addr.is_ipv4() {
                        TcpSocket::new_v4()?
                    } else {
                        TcpSocket::new_v6()?
                    };
                    socket.bind(local)?;
                    socket.connect(addr).await
                }
                None => TcpStream::connect(addr).await,
            };

            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    if !self.no_keepalive {
                        socket2::SockRef::from(&stream).set_keepalive(true)?;
                    }
                    debug!(address = %addr, "TCP connection established");
                    return Ok(stream);
                }
                Err(e) => {
                    trace!(address = %addr, error = %e, "TCP connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no usable address for {}", opts.address),
            )
        }))
    }
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, opts: &DialOptions) -> io::Result<Socket> {
        if opts.timeout.is_zero() {
            return self.dial_inner(opts).await;
        }

        tokio::time::timeout(opts.timeout, self.dial_inner(opts))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {} timed out after {:?}", opts.address, opts.timeout),
                )
            })?
    }
}

/// Resolve `address`, keeping only the families the network allows.
async fn resolve(network: Network, address: &str) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host(address)
        .await?
        .filter(|addr| match network {
            Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
            _ => true,
        })
        .collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{address} did not resolve to a {network} address"),
        ));
    }
    Ok(addrs)
}

async fn dial_udp(opts: &DialOptions) -> io::Result<UdpSocket> {
    let remote = resolve(opts.network, &opts.address).await?[0];

    let local = opts.local_addr.unwrap_or_else(|| {
        if remote.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        }
    });

    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    debug!(address = %remote, "UDP socket connected");
    Ok(socket)
}

#[cfg(unix)]
async fn dial_unix(opts: &DialOptions) -> io::Result<Socket> {
    let stream = tokio::net::UnixStream::connect(&opts.address).await?;
    debug!(path = %opts.address, "Unix socket connected");
    Ok(Socket::Stream(Box::new(stream)))
}

#[cfg(not(unix))]
async fn dial_unix(opts: &DialOptions) -> io::Result<Socket> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets are not available on this platform: {}", opts.address),
    ))
}

fn probe_result(result: io::Result<usize>) -> Probe {
    match result {
        Ok(0) => Probe::Closed,
        Ok(_) => Probe::Readable,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Probe::Idle,
        Err(e) => Probe::Error(e),
    }
}

impl RawStream for TcpStream {
    fn probe(&self) -> Probe {
        let mut byte = [0u8; 1];
        probe_result(self.try_read(&mut byte))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

#[cfg(unix)]
impl RawStream for tokio::net::UnixStream {
    fn probe(&self) -> Probe {
        let mut byte = [0u8; 1];
        probe_result(self.try_read(&mut byte))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_probe_result_mapping() {
        assert!(matches!(probe_result(Ok(0)), Probe::Closed));
        assert!(matches!(probe_result(Ok(1)), Probe::Readable));
        assert!(probe_result(Err(io::ErrorKind::WouldBlock.into())).is_idle());
        assert!(matches!(
            probe_result(Err(io::ErrorKind::ConnectionReset.into())),
            Probe::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_dial_tcp_and_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let dialer = NetDialer::new();
        let opts = DialOptions::new(Network::Tcp, addr.to_string()).with_timeout(Duration::from_secs(1));
        let socket = dialer.dial(&opts).await.unwrap();
        let mut server = accept.await.unwrap();

        let Socket::Stream(stream) = socket else {
            panic!("expected a stream socket");
        };
        assert_eq!(stream.peer_addr(), Some(addr));
        assert!(stream.probe().is_idle());

        server.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(stream.probe(), Probe::Readable));
    }

    #[tokio::test]
    async fn test_dial_udp_connects() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let socket = NetDialer::new()
            .dial(&DialOptions::new(Network::Udp4, addr.to_string()))
            .await
            .unwrap();
        assert!(socket.is_datagram());
        assert_eq!(socket.peer_addr(), Some(addr));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port that is very likely closed
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let result = NetDialer::new()
            .dial(&DialOptions::new(Network::Tcp, addr.to_string()))
            .await;
        assert!(result.is_err());
    }
}
