//! Integration tests for the multiplexed connection pool

use async_trait::async_trait;
use connpool::codec::{FrameError, StreamFramed};
use connpool::endpoint::{EndpointKey, Network};
use connpool::error::ErrorKind;
use connpool::mux::{MuxConfig, MuxError, MuxOptions, Multiplexed, VirtualConnection};
use connpool::server::EchoServer;
use connpool::transport::{DialOptions, Dialer, NetDialer, Socket};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct CountingDialer {
    inner: NetDialer,
    dials: AtomicUsize,
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, opts: &DialOptions) -> io::Result<Socket> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(opts).await
    }
}

/// Refuses every dial and records when each attempt happened
#[derive(Default)]
struct RefusingDialer {
    attempts: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Dialer for RefusingDialer {
    async fn dial(&self, _opts: &DialOptions) -> io::Result<Socket> {
        self.attempts.lock().unwrap().push(Instant::now());
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }
}

/// Never finishes dialing, so queued writes are never drained
struct HangingDialer;

#[async_trait]
impl Dialer for HangingDialer {
    async fn dial(&self, _opts: &DialOptions) -> io::Result<Socket> {
        std::future::pending().await
    }
}

fn mux(config: MuxConfig, dialer: Arc<dyn Dialer>) -> Multiplexed {
    Multiplexed::with_dialer(config, dialer)
        .unwrap()
        .with_parser(Arc::new(StreamFramed::default()))
}

fn tcp_key(addr: SocketAddr) -> EndpointKey {
    EndpointKey::new(Network::Tcp, addr.to_string(), "")
}

async fn echo_server() -> SocketAddr {
    EchoServer::bind_tcp("127.0.0.1:0").await.unwrap().spawn().unwrap()
}

/// Server that hands every accepted socket to the test
async fn capturing_server() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).is_err() {
                break;
            }
        }
    });
    (addr, rx)
}

async fn round_trip(stream: &mut VirtualConnection, payload: &[u8]) -> Result<Vec<u8>, MuxError> {
    stream
        .write(StreamFramed::encode(stream.stream_id(), payload))
        .await?;
    let reply = tokio::time::timeout(Duration::from_secs(2), stream.read())
        .await
        .map_err(|_| MuxError::from(io::Error::from(io::ErrorKind::TimedOut)))??;
    let (id, body) = StreamFramed::decode_frame(&reply)?;
    assert_eq!(id, stream.stream_id());
    Ok(body.to_vec())
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_streams_share_physical_connections() {
    let addr = echo_server().await;
    let dialer = Arc::new(CountingDialer::default());
    let pool = mux(MuxConfig::default(), dialer.clone());
    let opts = MuxOptions::default();

    let mut streams: Vec<VirtualConnection> = (1..=8)
        .map(|id| pool.get_stream("tcp", &addr.to_string(), id, &opts).unwrap())
        .collect();

    for stream in streams.iter_mut() {
        let payload = format!("payload-{}", stream.stream_id());
        let body = round_trip(stream, payload.as_bytes()).await.unwrap();
        assert_eq!(body, payload.as_bytes());
    }

    let stats = pool.stats(&tcp_key(addr)).unwrap();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.streams, 8);
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    assert!(streams[0].remote_addr().is_some());

    drop(streams);
    let stats = pool.stats(&tcp_key(addr)).unwrap();
    assert_eq!(stats.streams, 0);
    assert_eq!(stats.idle_connections, 2);
}

#[tokio::test]
async fn test_duplicate_stream_id_cancels_previous() {
    let addr = echo_server().await;
    let config = MuxConfig {
        connections_per_host: 1,
        ..Default::default()
    };
    let pool = mux(config, Arc::new(NetDialer::default()));
    let opts = MuxOptions::default();

    let mut first = pool.get_stream("tcp", &addr.to_string(), 7, &opts).unwrap();
    let mut second = pool.get_stream("tcp", &addr.to_string(), 7, &opts).unwrap();

    let err = first.read().await.unwrap_err();
    assert!(matches!(err, MuxError::DuplicateStreamId(7)));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(first.is_closed());
    assert!(matches!(
        first.write(StreamFramed::encode(7, b"late")).await,
        Err(MuxError::DuplicateStreamId(7))
    ));

    // Closing the displaced stream must not detach its replacement
    drop(first);
    assert_eq!(round_trip(&mut second, b"still here").await.unwrap(), b"still here");
}

#[tokio::test]
async fn test_duplicate_stream_id_cancels_previous_with_default_config() {
    let addr = echo_server().await;
    let dialer = Arc::new(CountingDialer::default());
    let pool = mux(MuxConfig::default(), dialer.clone());
    let opts = MuxOptions::default();
    let target = addr.to_string();

    let mut first = pool.get_stream("tcp", &target, 7, &opts).unwrap();
    let mut second = pool.get_stream("tcp", &target, 7, &opts).unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), first.read())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, MuxError::DuplicateStreamId(7)));
    assert!(first.is_closed());
    assert_eq!(round_trip(&mut second, b"replacement").await.unwrap(), b"replacement");

    // A second id grows the set; reusing 7 still finds the connection holding it
    let mut other = pool.get_stream("tcp", &target, 8, &opts).unwrap();
    let mut third = pool.get_stream("tcp", &target, 7, &opts).unwrap();
    assert_eq!(pool.stats(&tcp_key(addr)).unwrap().connections, 2);

    let err = tokio::time::timeout(Duration::from_secs(2), second.read())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, MuxError::DuplicateStreamId(7)));
    assert_eq!(round_trip(&mut third, b"third").await.unwrap(), b"third");
    assert_eq!(round_trip(&mut other, b"other").await.unwrap(), b"other");

    let stats = pool.stats(&tcp_key(addr)).unwrap();
    assert_eq!(stats.streams, 2);
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_socket_failure_cancels_every_stream_and_reconnects() {
    let (addr, mut accepted) = capturing_server().await;
    let config = MuxConfig {
        connections_per_host: 1,
        ..Default::default()
    };
    let pool = mux(config, Arc::new(NetDialer::default()));
    let opts = MuxOptions::default();

    let mut streams: Vec<VirtualConnection> = (1..=3)
        .map(|id| pool.get_stream("tcp", &addr.to_string(), id, &opts).unwrap())
        .collect();

    let server_side = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    drop(server_side);

    let mut errors = Vec::new();
    for stream in streams.iter_mut() {
        let err = tokio::time::timeout(Duration::from_secs(2), stream.read())
            .await
            .unwrap()
            .unwrap_err();
        errors.push(err);
    }

    let MuxError::Io(first) = &errors[0] else {
        panic!("expected an I/O error, got {:?}", errors[0]);
    };
    assert_eq!(first.kind(), io::ErrorKind::UnexpectedEof);
    for err in &errors[1..] {
        match err {
            MuxError::Io(other) => assert!(Arc::ptr_eq(first, other)),
            other => panic!("expected the shared I/O error, got {other:?}"),
        }
    }

    // The driver backs off and dials again
    let reconnected = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .unwrap();
    assert!(reconnected.is_some());
    assert!(pool.stats(&tcp_key(addr)).unwrap().reconnects >= 1);
}

#[tokio::test]
async fn test_reconnect_budget_exhaustion_expels_endpoint() {
    let dialer = Arc::new(RefusingDialer::default());
    let config = MuxConfig {
        connections_per_host: 1,
        max_reconnect_count: 3,
        initial_backoff: Duration::from_millis(2),
        max_backoff: Duration::from_millis(8),
        reconnect_reset_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let pool = mux(config, dialer.clone());

    let mut stream = pool
        .get_stream("tcp", "127.0.0.1:9", 1, &MuxOptions::default())
        .unwrap();
    assert_eq!(pool.len(), 1);

    let err = tokio::time::timeout(Duration::from_secs(2), stream.read())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);

    assert!(eventually(|| pool.is_empty()).await);

    // One initial dial plus three reconnects, spaced by a growing backoff
    let attempts = dialer.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 4);
    let expected = [2u64, 4, 8];
    for (pair, min_gap) in attempts.windows(2).zip(expected) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(min_gap));
    }

    // The next request starts a fresh connection set
    let _again = pool
        .get_stream("tcp", "127.0.0.1:9", 1, &MuxOptions::default())
        .unwrap();
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn test_idle_physical_connections_are_bounded() {
    let addr = echo_server().await;
    let config = MuxConfig {
        connections_per_host: 1,
        max_idle_conns_per_host: 1,
        ..Default::default()
    };
    let pool = mux(config, Arc::new(NetDialer::default()));
    let key = tcp_key(addr);

    for id in 1..=3 {
        let mut stream = pool
            .get_stream("tcp", &addr.to_string(), id, &MuxOptions::default())
            .unwrap();
        round_trip(&mut stream, b"ping").await.unwrap();
        stream.close();
        stream.close();

        let stats = pool.stats(&key).unwrap();
        assert!(stats.idle_connections <= 1);
        assert_eq!(stats.connections, 1);
    }
}

#[tokio::test]
async fn test_surplus_idle_connection_is_closed() {
    let addr = echo_server().await;
    let config = MuxConfig {
        connections_per_host: 2,
        max_idle_conns_per_host: 1,
        ..Default::default()
    };
    let pool = mux(config, Arc::new(NetDialer::default()));
    let key = tcp_key(addr);
    let opts = MuxOptions::default();

    let a = pool.get_stream("tcp", &addr.to_string(), 1, &opts).unwrap();
    let b = pool.get_stream("tcp", &addr.to_string(), 2, &opts).unwrap();
    assert_eq!(pool.stats(&key).unwrap().connections, 2);

    a.close();
    assert_eq!(pool.stats(&key).unwrap().connections, 2);
    b.close();

    let stats = pool.stats(&key).unwrap();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.idle_connections, 1);
}

#[tokio::test]
async fn test_sequential_streams_reuse_idle_connection() {
    let addr = echo_server().await;
    let dialer = Arc::new(CountingDialer::default());
    let config = MuxConfig {
        connections_per_host: 2,
        max_idle_conns_per_host: 1,
        ..Default::default()
    };
    let pool = mux(config, dialer.clone());

    for id in 1..=10 {
        let mut stream = pool
            .get_stream("tcp", &addr.to_string(), id, &MuxOptions::default())
            .unwrap();
        round_trip(&mut stream, b"ping").await.unwrap();
        stream.close();
    }

    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    let stats = pool.stats(&tcp_key(addr)).unwrap();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.idle_connections, 1);
}

#[tokio::test]
async fn test_full_queue_drops_writes() {
    let config = MuxConfig {
        connections_per_host: 1,
        send_queue_size: 1,
        drop_full: true,
        ..Default::default()
    };
    let pool = mux(config, Arc::new(HangingDialer));
    let stream = pool
        .get_stream("tcp", "127.0.0.1:9", 1, &MuxOptions::default())
        .unwrap();

    stream.write(StreamFramed::encode(1, b"queued")).await.unwrap();
    let err = stream.write(StreamFramed::encode(1, b"dropped")).await.unwrap_err();
    assert!(matches!(err, MuxError::QueueFull));
    assert_eq!(err.kind(), ErrorKind::Capacity);
}

#[tokio::test]
async fn test_write_after_close_fails() {
    let addr = echo_server().await;
    let pool = mux(MuxConfig::default(), Arc::new(NetDialer::default()));
    let stream = pool
        .get_stream("tcp", &addr.to_string(), 1, &MuxOptions::default())
        .unwrap();

    stream.close();
    assert!(stream.is_closed());
    let err = stream.write(StreamFramed::encode(1, b"x")).await.unwrap_err();
    assert!(matches!(err, MuxError::StreamClosed));
}

#[tokio::test]
async fn test_datagram_round_trip() {
    let addr = EchoServer::bind_udp("127.0.0.1:0").await.unwrap().spawn().unwrap();
    let pool = mux(MuxConfig::default(), Arc::new(NetDialer::default()));

    let mut stream = pool
        .get_stream("udp", &addr.to_string(), 42, &MuxOptions::default())
        .unwrap();
    assert_eq!(round_trip(&mut stream, b"over udp").await.unwrap(), b"over udp");
}

#[tokio::test]
async fn test_close_all_cancels_streams() {
    let addr = echo_server().await;
    let pool = mux(MuxConfig::default(), Arc::new(NetDialer::default()));
    let mut stream = pool
        .get_stream("tcp", &addr.to_string(), 1, &MuxOptions::default())
        .unwrap();
    round_trip(&mut stream, b"before").await.unwrap();

    pool.close_all();
    assert!(pool.is_empty());

    let err = tokio::time::timeout(Duration::from_secs(2), stream.read())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, MuxError::ConnClosed));
}

#[tokio::test]
async fn test_missing_parser_is_a_config_error() {
    let pool = Multiplexed::with_dialer(MuxConfig::default(), Arc::new(NetDialer::default())).unwrap();
    let err = pool
        .get_stream("tcp", "127.0.0.1:9", 1, &MuxOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    let err = pool
        .get_stream("carrier-pigeon", "127.0.0.1:9", 1, &MuxOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_close_all_interrupts_blocked_socket_write() {
    let (addr, mut accepted) = capturing_server().await;
    let config = MuxConfig {
        connections_per_host: 1,
        ..Default::default()
    };
    let pool = mux(config, Arc::new(NetDialer::default()));
    let mut stream = pool
        .get_stream("tcp", &addr.to_string(), 1, &MuxOptions::default())
        .unwrap();

    // Held open but never read, so the client's socket buffers fill up
    let _server_side = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .unwrap()
        .unwrap();

    let payload = vec![0u8; 32 * 1024 * 1024];
    stream.write(StreamFramed::encode(1, &payload)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    pool.close_all();
    let err = tokio::time::timeout(Duration::from_secs(2), stream.read())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, MuxError::ConnClosed));
}

#[tokio::test]
async fn test_stream_parse_error_fails_every_stream() {
    let (addr, mut accepted) = capturing_server().await;
    let config = MuxConfig {
        connections_per_host: 1,
        ..Default::default()
    };
    let pool = mux(config, Arc::new(NetDialer::default()));
    let mut streams: Vec<VirtualConnection> = (1..=2)
        .map(|id| pool.get_stream("tcp", &addr.to_string(), id, &MuxOptions::default()).unwrap())
        .collect();

    let mut server_side = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .unwrap()
        .unwrap();

    // A header announcing a frame far past the parser's limit
    let mut header = Vec::new();
    header.extend_from_slice(&1u32.to_be_bytes());
    header.extend_from_slice(&u32::MAX.to_be_bytes());
    server_side.write_all(&header).await.unwrap();

    for stream in streams.iter_mut() {
        let err = tokio::time::timeout(Duration::from_secs(2), stream.read())
            .await
            .unwrap()
            .unwrap_err();
        assert!(
            matches!(err, MuxError::Frame(FrameError::Oversized { .. })),
            "unexpected error {err:?}"
        );
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(stream.is_closed());
    }
}

#[tokio::test]
async fn test_malformed_datagram_is_dropped() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let pool = mux(MuxConfig::default(), Arc::new(NetDialer::default()));

    let mut stream = pool
        .get_stream("udp", &addr.to_string(), 5, &MuxOptions::default())
        .unwrap();
    stream.write(StreamFramed::encode(5, b"hello")).await.unwrap();

    let mut buf = vec![0u8; 1024];
    let (_, peer) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let mut oversized = Vec::new();
    oversized.extend_from_slice(&5u32.to_be_bytes());
    oversized.extend_from_slice(&u32::MAX.to_be_bytes());
    server.send_to(&oversized, peer).await.unwrap();
    server.send_to(&[0, 0, 0], peer).await.unwrap();
    server.send_to(&StreamFramed::encode(5, b"after"), peer).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), stream.read())
        .await
        .unwrap()
        .unwrap();
    let (id, body) = StreamFramed::decode_frame(&reply).unwrap();
    assert_eq!(id, 5);
    assert_eq!(&body[..], b"after");

    assert!(!stream.is_closed());
    let stats = pool.stats(&EndpointKey::new(Network::Udp, addr.to_string(), "")).unwrap();
    assert_eq!(stats.reconnects, 0);
    assert_eq!(stats.streams, 1);
}
