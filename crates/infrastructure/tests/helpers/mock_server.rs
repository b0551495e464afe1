use ferrous_forward_infrastructure::dns::message::{decode, encode, question_name, response_to};
use ferrous_forward_infrastructure::dns::transport::framing::{read_framed, write_framed};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// `qN.<anything>` is answered with 10.0.0.N, every other name with 10.0.0.1.
pub fn answer_for(query: &Message, truncated: bool) -> Vec<u8> {
    let mut response = response_to(query, ResponseCode::NoError);
    let name = question_name(query).unwrap_or_default();
    let octet = name
        .split('.')
        .next()
        .and_then(|label| label.strip_prefix('q'))
        .and_then(|n| n.parse::<u8>().ok())
        .unwrap_or(1);
    response.set_truncated(truncated);
    if !truncated {
        let owner = query.queries()[0].name().clone();
        response.add_answer(Record::from_rdata(
            owner,
            60,
            RData::A(A(Ipv4Addr::new(10, 0, 0, octet))),
        ));
    }
    encode(&response).unwrap()
}

/// A reply carrying `count` A records, large enough to overflow a UDP buffer.
pub fn bulky_answer_for(query: &Message, count: u8) -> Vec<u8> {
    let mut response = response_to(query, ResponseCode::NoError);
    let owner = query.queries()[0].name().clone();
    for host in 0..count {
        for net in 0..2u8 {
            response.add_answer(Record::from_rdata(
                owner.clone(),
                60,
                RData::A(A(Ipv4Addr::new(10, net, 0, host))),
            ));
        }
    }
    encode(&response).unwrap()
}

#[derive(Clone, Copy)]
enum UdpReply {
    Answer,
    Truncated,
    Bulky,
}

/// Answers every UDP query on an ephemeral loopback port.
pub struct MockUdpServer {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl MockUdpServer {
    pub async fn start() -> Self {
        Self::start_with(UdpReply::Answer).await
    }

    /// Every reply has TC set and no answers.
    pub async fn start_truncating() -> Self {
        Self::start_with(UdpReply::Truncated).await
    }

    /// Every reply is a datagram of several kilobytes.
    pub async fn start_bulky() -> Self {
        Self::start_with(UdpReply::Bulky).await
    }

    async fn start_with(mode: UdpReply) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        tokio::spawn({
            let queries = Arc::clone(&queries);
            let shutdown = shutdown.clone();
            async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let (n, peer) = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = socket.recv_from(&mut buf) => match received {
                            Ok(r) => r,
                            Err(_) => continue,
                        },
                    };
                    let Ok(query) = decode(&buf[..n]) else {
                        continue;
                    };
                    queries.fetch_add(1, Ordering::SeqCst);
                    let reply = match mode {
                        UdpReply::Answer => answer_for(&query, false),
                        UdpReply::Truncated => answer_for(&query, true),
                        UdpReply::Bulky => bulky_answer_for(&query, 200),
                    };
                    let _ = socket.send_to(&reply, peer).await;
                }
            }
        });

        Self {
            addr,
            queries,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Drop for MockUdpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Length-prefixed DNS over TCP. Names containing `slow` are answered
/// after a delay, so replies on one connection can come back out of order.
pub struct MockTcpServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    queries: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl MockTcpServer {
    pub async fn start() -> Self {
        Self::bind("127.0.0.1:0".parse().unwrap()).await
    }

    /// Listens on `addr`, e.g. the port of a [`MockUdpServer`].
    pub async fn bind(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let queries = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        tokio::spawn({
            let connections = Arc::clone(&connections);
            let queries = Arc::clone(&queries);
            let shutdown = shutdown.clone();
            async move {
                loop {
                    let stream = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(_) => continue,
                        },
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_connection(
                        stream,
                        Arc::clone(&queries),
                        shutdown.clone(),
                    ));
                }
            }
        });

        Self {
            addr,
            connections,
            queries,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Drop for MockTcpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    queries: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_framed(&mut reader) => frame,
        };
        let Ok(bytes) = frame else {
            break;
        };
        let Ok(query) = decode(&bytes) else {
            continue;
        };
        queries.fetch_add(1, Ordering::SeqCst);

        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let slow = question_name(&query).is_some_and(|n| n.contains("slow"));
            if slow {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let reply = answer_for(&query, false);
            let mut writer = writer.lock().await;
            let _ = write_framed(&mut *writer, &reply).await;
        });
    }
}
