//! Minimal SOCKS5 client (RFC 1928, RFC 1929): CONNECT and UDP ASSOCIATE.

use bytes::{BufMut, BytesMut};
use ferrous_forward_domain::{DomainError, ResolverAddr, Socks5Options};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_METHOD_NONE: u8 = 0x00;
const AUTH_METHOD_PASSWORD: u8 = 0x02;
const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;

const fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[derive(Debug, Clone)]
pub struct Socks5Proxy {
    pub addr: ResolverAddr,
    auth: Option<(String, String)>,
}

impl Socks5Proxy {
    pub fn from_options(options: &Socks5Options) -> Result<Self, DomainError> {
        let addr = ResolverAddr::parse_with_default_port(&options.address, 1080)?;
        let auth = match (&options.username, &options.password) {
            (Some(user), password) => {
                let password = password.clone().unwrap_or_default();
                if user.len() > 255 || password.len() > 255 {
                    return Err(DomainError::ConfigError(
                        "SOCKS5 username and password must be at most 255 bytes".into(),
                    ));
                }
                Some((user.clone(), password))
            }
            (None, _) => None,
        };
        Ok(Self { addr, auth })
    }

    /// `socks5h://` URL for HTTP clients, so the proxy resolves target names.
    pub fn url(&self) -> String {
        format!("socks5h://{}", self.addr)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()))
    }

    /// Method selection plus optional username/password sub-negotiation.
    async fn handshake(&self, stream: &mut TcpStream) -> Result<(), DomainError> {
        let methods: &[u8] = if self.auth.is_some() {
            &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
        } else {
            &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
        };
        stream.write_all(methods).await.map_err(io_err)?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await.map_err(io_err)?;
        if response[0] != SOCKS5_VERSION {
            return Err(DomainError::Socks5Error(format!(
                "unexpected version {:#04x}",
                response[0]
            )));
        }

        match response[1] {
            AUTH_METHOD_NONE => Ok(()),
            AUTH_METHOD_PASSWORD => {
                let (user, password) = self.auth.as_ref().ok_or_else(|| {
                    DomainError::Socks5Error("proxy requires authentication".into())
                })?;
                let mut request = Vec::with_capacity(3 + user.len() + password.len());
                request.push(AUTH_PASSWORD_VERSION);
                request.push(user.len() as u8);
                request.extend_from_slice(user.as_bytes());
                request.push(password.len() as u8);
                request.extend_from_slice(password.as_bytes());
                stream.write_all(&request).await.map_err(io_err)?;

                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await.map_err(io_err)?;
                if status[1] != 0x00 {
                    return Err(DomainError::Socks5Error("authentication failed".into()));
                }
                Ok(())
            }
            AUTH_METHOD_NO_ACCEPTABLE => {
                Err(DomainError::Socks5Error("no acceptable auth method".into()))
            }
            other => Err(DomainError::Socks5Error(format!(
                "unsupported auth method {:#04x}",
                other
            ))),
        }
    }

    async fn request(
        &self,
        stream: &mut TcpStream,
        command: u8,
        target: &ResolverAddr,
    ) -> Result<SocketAddr, DomainError> {
        let mut request = BytesMut::with_capacity(22);
        request.put_u8(SOCKS5_VERSION);
        request.put_u8(command);
        request.put_u8(0x00);
        put_address(&mut request, target)?;
        stream.write_all(&request).await.map_err(io_err)?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.map_err(io_err)?;
        if header[1] != REPLY_SUCCEEDED {
            return Err(DomainError::Socks5Error(format!(
                "request rejected: {}",
                reply_message(header[1])
            )));
        }

        let ip = match header[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await.map_err(io_err)?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await.map_err(io_err)?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            ATYP_DOMAIN => {
                let len = stream.read_u8().await.map_err(io_err)? as usize;
                let mut name = vec![0u8; len];
                stream.read_exact(&mut name).await.map_err(io_err)?;
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }
            other => {
                return Err(DomainError::Socks5Error(format!(
                    "invalid address type {:#04x}",
                    other
                )))
            }
        };
        let port = stream.read_u16().await.map_err(io_err)?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Tunnels `stream` (already connected to the proxy) to `target`.
    /// Domain targets are resolved by the proxy.
    pub async fn connect(
        &self,
        mut stream: TcpStream,
        target: &ResolverAddr,
    ) -> Result<TcpStream, DomainError> {
        self.handshake(&mut stream).await?;
        self.request(&mut stream, CMD_CONNECT, target).await?;
        trace!(proxy = %self.addr, target = %target, "SOCKS5 CONNECT established");
        Ok(stream)
    }

    /// Returns the control stream, which must stay open for the association's
    /// lifetime, and the relay address datagrams go to.
    pub async fn associate(
        &self,
        mut stream: TcpStream,
    ) -> Result<(TcpStream, SocketAddr), DomainError> {
        self.handshake(&mut stream).await?;
        let unspecified = ResolverAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let mut relay = self.request(&mut stream, CMD_UDP_ASSOCIATE, &unspecified).await?;

        // Many proxies answer 0.0.0.0 meaning "same host as the control connection".
        if relay.ip().is_unspecified() {
            let peer = stream.peer_addr().map_err(io_err)?;
            relay.set_ip(peer.ip());
        }
        trace!(proxy = %self.addr, relay = %relay, "SOCKS5 UDP ASSOCIATE established");
        Ok((stream, relay))
    }
}

fn io_err(e: std::io::Error) -> DomainError {
    DomainError::Socks5Error(e.to_string())
}

fn put_address(buf: &mut BytesMut, target: &ResolverAddr) -> Result<(), DomainError> {
    match target {
        ResolverAddr::Ip(SocketAddr::V4(v4)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        ResolverAddr::Ip(SocketAddr::V6(v6)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
        ResolverAddr::Domain { domain, port } => {
            if domain.len() > 255 {
                return Err(DomainError::Socks5Error(format!(
                    "domain too long: {}",
                    domain
                )));
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(domain.len() as u8);
            buf.put_slice(domain.as_bytes());
            buf.put_u16(*port);
        }
    }
    Ok(())
}

/// Wraps a datagram in the SOCKS5 UDP request header: RSV, FRAG, address.
pub fn encapsulate(target: &ResolverAddr, data: &[u8]) -> Result<BytesMut, DomainError> {
    let mut packet = BytesMut::with_capacity(32 + data.len());
    packet.put_u16(0);
    packet.put_u8(0);
    put_address(&mut packet, target)?;
    packet.put_slice(data);
    Ok(packet)
}

/// Strips the SOCKS5 UDP header and returns the payload.
pub fn decapsulate(packet: &[u8]) -> Result<&[u8], DomainError> {
    if packet.len() < 4 {
        return Err(DomainError::Socks5Error("UDP packet too short".into()));
    }
    if packet[2] != 0 {
        return Err(DomainError::Socks5Error("fragmented UDP packet".into()));
    }
    let offset = match packet[3] {
        ATYP_IPV4 => 4 + 4 + 2,
        ATYP_IPV6 => 4 + 16 + 2,
        ATYP_DOMAIN => {
            let len = *packet
                .get(4)
                .ok_or_else(|| DomainError::Socks5Error("UDP packet too short".into()))?
                as usize;
            5 + len + 2
        }
        other => {
            return Err(DomainError::Socks5Error(format!(
                "invalid address type {:#04x}",
                other
            )))
        }
    };
    packet
        .get(offset..)
        .ok_or_else(|| DomainError::Socks5Error("UDP packet too short".into()))
}
