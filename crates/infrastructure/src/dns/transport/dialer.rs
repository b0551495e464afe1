use ferrous_forward_domain::{CommonTransportOptions, DomainError, ResolverAddr};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::debug;

use super::socks5::{self, Socks5Proxy};

const UDP_RECV_BUFFER: usize = 4096;

/// One received UDP payload.
#[derive(Debug)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub clipped: bool,
}

/// Any byte stream a DNS exchange can run over (TCP, or TLS on top of TCP).
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens outbound sockets, optionally through SOCKS5 and/or pinned to an
/// interface (`SO_BINDTODEVICE`) and firewall mark (`SO_MARK`).
#[derive(Debug, Clone)]
pub struct Dialer {
    socks5: Option<Arc<Socks5Proxy>>,
    interface: Option<Arc<str>>,
    mark: Option<u32>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn direct(connect_timeout: Duration) -> Self {
        Self {
            socks5: None,
            interface: None,
            mark: None,
            connect_timeout,
        }
    }

    pub fn from_options(options: &CommonTransportOptions) -> Result<Self, DomainError> {
        let socks5 = options
            .socks5
            .as_ref()
            .map(Socks5Proxy::from_options)
            .transpose()?
            .map(Arc::new);

        if let Some(interface) = &options.interface {
            if interface.is_empty() || interface.len() > 15 {
                return Err(DomainError::ConfigError(format!(
                    "Interface name must be 1-15 bytes: '{}'",
                    interface
                )));
            }
        }

        Ok(Self {
            socks5,
            interface: options.interface.as_deref().map(Arc::from),
            mark: options.mark,
            connect_timeout: options.connect_timeout(),
        })
    }

    pub fn with_interface(mut self, interface: impl Into<Arc<str>>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn uses_proxy(&self) -> bool {
        self.socks5.is_some()
    }

    pub fn socks5(&self) -> Option<&Socks5Proxy> {
        self.socks5.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn mark(&self) -> Option<u32> {
        self.mark
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn apply_options(&self, socket: &Socket) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if let Some(interface) = &self.interface {
                socket.bind_device(Some(interface.as_bytes()))?;
            }
            if let Some(mark) = self.mark {
                socket.set_mark(mark)?;
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = socket;
            if self.interface.is_some() || self.mark.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "interface and mark binding need Linux",
                ));
            }
        }

        Ok(())
    }

    /// Unconnected UDP socket on `bind_addr` with interface and mark applied.
    pub fn udp_socket(&self, bind_addr: SocketAddr) -> Result<std::net::UdpSocket, DomainError> {
        let build = || -> io::Result<std::net::UdpSocket> {
            let domain = if bind_addr.is_ipv4() {
                Domain::IPV4
            } else {
                Domain::IPV6
            };
            let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
            self.apply_options(&socket)?;
            socket.bind(&bind_addr.into())?;
            socket.set_nonblocking(true)?;
            Ok(socket.into())
        };
        build().map_err(|e| DomainError::IoError(format!("Failed to open UDP socket: {}", e)))
    }

    async fn connect_socket(&self, addr: SocketAddr) -> Result<TcpStream, DomainError> {
        let server = addr.to_string();
        let socket = (|| -> io::Result<TcpSocket> {
            let domain = if addr.is_ipv4() {
                Domain::IPV4
            } else {
                Domain::IPV6
            };
            let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
            self.apply_options(&socket)?;
            socket.set_nonblocking(true)?;
            Ok(TcpSocket::from_std_stream(socket.into()))
        })()
        .map_err(|e| DomainError::from_io(server.clone(), e))?;

        let stream = tokio::time::timeout(self.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| DomainError::TransportTimeout {
                server: server.clone(),
            })?
            .map_err(|e| DomainError::from_io(server.clone(), e))?;

        stream
            .set_nodelay(true)
            .map_err(|e| DomainError::from_io(server, e))?;
        Ok(stream)
    }

    async fn connect_proxy(&self, proxy: &Socks5Proxy) -> Result<TcpStream, DomainError> {
        match &proxy.addr {
            ResolverAddr::Ip(addr) => self.connect_socket(*addr).await,
            ResolverAddr::Domain { domain, port } => {
                let target = format!("{}:{}", domain, port);
                let addrs: Vec<SocketAddr> = tokio::time::timeout(
                    self.connect_timeout,
                    tokio::net::lookup_host(target.clone()),
                )
                .await
                .map_err(|_| DomainError::TransportTimeout {
                    server: target.clone(),
                })?
                .map_err(|e| DomainError::from_io(target.clone(), e))?
                .collect();

                let mut last_err = DomainError::Socks5Error(format!("No address for proxy {}", target));
                for addr in addrs {
                    match self.connect_socket(addr).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) => last_err = e,
                    }
                }
                Err(last_err)
            }
        }
    }

    /// TCP stream to `target`. Domain targets are only allowed through SOCKS5,
    /// where the proxy resolves them.
    pub async fn dial_tcp(&self, target: &ResolverAddr) -> Result<TcpStream, DomainError> {
        match &self.socks5 {
            Some(proxy) => {
                let stream = self.connect_proxy(proxy).await?;
                tokio::time::timeout(self.connect_timeout, proxy.connect(stream, target))
                    .await
                    .map_err(|_| DomainError::TransportTimeout {
                        server: target.to_string(),
                    })?
            }
            None => {
                let addr = target.socket_addr().ok_or_else(|| {
                    DomainError::ConfigError(format!(
                        "Cannot dial unresolved address {} without a proxy",
                        target
                    ))
                })?;
                self.connect_socket(addr).await
            }
        }
    }

    /// Datagram channel to `target`, relayed through SOCKS5 UDP ASSOCIATE
    /// when a proxy is configured.
    pub async fn dial_udp(&self, target: &ResolverAddr) -> Result<PacketConn, DomainError> {
        match &self.socks5 {
            Some(proxy) => {
                let control = self.connect_proxy(proxy).await?;
                let (control, relay) =
                    tokio::time::timeout(self.connect_timeout, proxy.associate(control))
                        .await
                        .map_err(|_| DomainError::TransportTimeout {
                            server: proxy.addr.to_string(),
                        })??;

                let socket = self.bind_connected_udp(relay).await?;
                debug!(relay = %relay, target = %target, "UDP relay through SOCKS5");
                Ok(PacketConn::Socks5 {
                    socket,
                    target: target.clone(),
                    _control: control,
                })
            }
            None => {
                let addr = target.socket_addr().ok_or_else(|| {
                    DomainError::ConfigError(format!(
                        "Cannot dial unresolved address {} without a proxy",
                        target
                    ))
                })?;
                Ok(PacketConn::Direct(self.bind_connected_udp(addr).await?))
            }
        }
    }

    async fn bind_connected_udp(&self, peer: SocketAddr) -> Result<UdpSocket, DomainError> {
        let bind_addr = unspecified_for(&peer);
        let socket = UdpSocket::from_std(self.udp_socket(bind_addr)?)
            .map_err(|e| DomainError::from_io(peer.to_string(), e))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| DomainError::from_io(peer.to_string(), e))?;
        Ok(socket)
    }
}

pub fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// A connected datagram socket, direct or wrapped in SOCKS5 UDP headers.
#[derive(Debug)]
pub enum PacketConn {
    Direct(UdpSocket),
    Socks5 {
        socket: UdpSocket,
        target: ResolverAddr,
        // The association lives as long as this stream stays open.
        _control: TcpStream,
    },
}

impl PacketConn {
    pub async fn send(&self, data: &[u8]) -> Result<(), DomainError> {
        match self {
            PacketConn::Direct(socket) => {
                socket.send(data).await.map_err(|e| udp_err(socket, e))?;
            }
            PacketConn::Socks5 { socket, target, .. } => {
                let packet = socks5::encapsulate(target, data)?;
                socket.send(&packet).await.map_err(|e| udp_err(socket, e))?;
            }
        }
        Ok(())
    }

    /// Next datagram payload. `clipped` is set when the datagram did not fit
    /// the receive buffer.
    pub async fn recv(&self) -> Result<Datagram, DomainError> {
        let mut buf = vec![0u8; UDP_RECV_BUFFER + 1];
        match self {
            PacketConn::Direct(socket) => {
                let n = socket.recv(&mut buf).await.map_err(|e| udp_err(socket, e))?;
                buf.truncate(n.min(UDP_RECV_BUFFER));
                Ok(Datagram {
                    payload: buf,
                    clipped: n > UDP_RECV_BUFFER,
                })
            }
            PacketConn::Socks5 { socket, .. } => {
                let n = socket.recv(&mut buf).await.map_err(|e| udp_err(socket, e))?;
                let payload = socks5::decapsulate(&buf[..n])?.to_vec();
                Ok(Datagram {
                    payload,
                    clipped: n > UDP_RECV_BUFFER,
                })
            }
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            PacketConn::Direct(socket) => socket.peer_addr().ok(),
            PacketConn::Socks5 { target, .. } => target.socket_addr(),
        }
    }
}

fn udp_err(socket: &UdpSocket, e: io::Error) -> DomainError {
    let server = socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "udp".to_string());
    DomainError::from_io(server, e)
}
