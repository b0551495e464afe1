use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::DomainError;

/// Address of an upstream server: either a concrete socket address or a
/// domain name that still has to be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolverAddr {
    Ip(SocketAddr),
    Domain { domain: Arc<str>, port: u16 },
}

impl ResolverAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            ResolverAddr::Ip(addr) => Some(*addr),
            ResolverAddr::Domain { .. } => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ResolverAddr::Ip(addr) => addr.port(),
            ResolverAddr::Domain { port, .. } => *port,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            ResolverAddr::Ip(_) => None,
            ResolverAddr::Domain { domain, .. } => Some(domain),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, ResolverAddr::Domain { .. })
    }

    /// Host part without port or brackets.
    pub fn host(&self) -> String {
        match self {
            ResolverAddr::Ip(addr) => addr.ip().to_string(),
            ResolverAddr::Domain { domain, .. } => domain.to_string(),
        }
    }

    /// Parses `host:port`, `[v6]:port`, or a bare host when `default_port` is given.
    pub fn parse_with_default_port(s: &str, default_port: u16) -> Result<Self, DomainError> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(ResolverAddr::Ip(addr));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(ResolverAddr::Ip(SocketAddr::new(ip, default_port)));
        }
        if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            let ip = inner
                .parse::<IpAddr>()
                .map_err(|_| DomainError::InvalidAddress(s.to_string()))?;
            return Ok(ResolverAddr::Ip(SocketAddr::new(ip, default_port)));
        }
        match parse_host_port(s) {
            Some((host, port)) => domain_addr(host, port, s),
            None if !s.contains(':') => domain_addr(s, default_port, s),
            None => Err(DomainError::InvalidAddress(s.to_string())),
        }
    }
}

fn domain_addr(host: &str, port: u16, original: &str) -> Result<ResolverAddr, DomainError> {
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
    if !valid {
        return Err(DomainError::InvalidAddress(original.to_string()));
    }
    Ok(ResolverAddr::Domain {
        domain: host.trim_end_matches('.').to_ascii_lowercase().into(),
        port,
    })
}

fn parse_host_port(s: &str) -> Option<(&str, u16)> {
    if s.starts_with('[') {
        let end = s.find(']')?;
        let host = &s[1..end];
        let rest = &s[end + 1..];
        let port_str = rest.strip_prefix(':')?;
        let port = port_str.parse::<u16>().ok()?;
        Some((host, port))
    } else {
        let (host, port_str) = s.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        let port = port_str.parse::<u16>().ok()?;
        Some((host, port))
    }
}

impl FromStr for ResolverAddr {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(ResolverAddr::Ip(addr));
        }
        let (host, port) =
            parse_host_port(s).ok_or_else(|| DomainError::InvalidAddress(s.to_string()))?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ResolverAddr::Ip(SocketAddr::new(ip, port)));
        }
        domain_addr(host, port, s)
    }
}

impl fmt::Display for ResolverAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverAddr::Ip(addr) => write!(f, "{}", addr),
            ResolverAddr::Domain { domain, port } => write!(f, "{}:{}", domain, port),
        }
    }
}

impl Serialize for ResolverAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResolverAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointScheme {
    Udp,
    Tcp,
    Tls,
    Quic,
    Https,
    H3,
}

impl EndpointScheme {
    pub fn default_port(&self) -> u16 {
        match self {
            EndpointScheme::Udp | EndpointScheme::Tcp => 53,
            EndpointScheme::Tls | EndpointScheme::Quic => 853,
            EndpointScheme::Https | EndpointScheme::H3 => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointScheme::Udp => "udp",
            EndpointScheme::Tcp => "tcp",
            EndpointScheme::Tls => "tls",
            EndpointScheme::Quic => "quic",
            EndpointScheme::Https => "https",
            EndpointScheme::H3 => "h3",
        }
    }

    fn from_prefix(scheme: &str) -> Option<Self> {
        match scheme {
            "udp" => Some(EndpointScheme::Udp),
            "tcp" => Some(EndpointScheme::Tcp),
            "tls" => Some(EndpointScheme::Tls),
            "quic" | "doq" => Some(EndpointScheme::Quic),
            "https" | "doh" => Some(EndpointScheme::Https),
            "h3" => Some(EndpointScheme::H3),
            _ => None,
        }
    }
}

/// An `address` value from configuration, split into scheme, server address
/// and (for HTTPS) request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoint {
    pub scheme: EndpointScheme,
    pub addr: ResolverAddr,
    pub path: Arc<str>,
}

impl UpstreamEndpoint {
    /// The host name to present in SNI and HTTP `Host`.
    pub fn server_name(&self) -> String {
        self.addr.host()
    }
}

impl FromStr for UpstreamEndpoint {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match s.split_once("://") {
            Some((prefix, rest)) => {
                let scheme = EndpointScheme::from_prefix(&prefix.to_ascii_lowercase())
                    .ok_or_else(|| {
                        DomainError::InvalidAddress(format!(
                            "Unknown scheme '{}' in '{}'. Expected udp, tcp, tls, quic, https or h3",
                            prefix, s
                        ))
                    })?;
                (scheme, rest)
            }
            None => (EndpointScheme::Udp, s),
        };

        let (host_part, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if host_part.is_empty() {
            return Err(DomainError::InvalidAddress(format!("Missing host in '{}'", s)));
        }

        let addr = ResolverAddr::parse_with_default_port(host_part, scheme.default_port())?;
        let path: Arc<str> = match scheme {
            EndpointScheme::Https | EndpointScheme::H3 if path.is_empty() => "/dns-query".into(),
            _ => path.into(),
        };

        Ok(UpstreamEndpoint { scheme, addr, path })
    }
}

impl fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme.as_str(), self.addr, self.path)
    }
}
