pub mod bootstrap;
pub mod dialer;
pub mod doh;
pub mod framing;
pub mod parallel;
pub mod pipeline;
pub mod pool;
pub mod socks5;
pub mod stream;
pub mod target;
pub mod tls_config;
pub mod udp;

#[cfg(feature = "dns-over-https")]
pub mod https;

#[cfg(any(feature = "dns-over-quic", feature = "dns-over-h3"))]
pub mod quic_conn;

#[cfg(feature = "dns-over-quic")]
pub mod quic;

#[cfg(feature = "dns-over-h3")]
pub mod h3;

pub use bootstrap::Bootstrap;
pub use dialer::{BoxedStream, Datagram, Dialer, PacketConn};
pub use parallel::{dial_parallel, listen_parallel};
pub use pipeline::{PipelineConnector, PipelinePool, PipelinedConn, MAX_IN_FLIGHT_PER_CONN};
pub use pool::{ConnPool, PoolManager, PoolStats, DEFAULT_POOL_CAPACITY};
pub use socks5::Socks5Proxy;
pub use stream::{StreamConnector, StreamUpstream};
pub use target::ServerTarget;
pub use udp::UdpUpstream;
