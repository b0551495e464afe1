use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options shared by every wire-protocol upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommonTransportOptions {
    pub address: String,

    /// Seconds allowed for dial and handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds an unused pooled connection is kept.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds allowed for one exchange, retries included.
    #[serde(default = "default_query_timeout")]
    pub query_timeout: u64,

    #[serde(default = "default_retry")]
    pub retry: usize,

    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,

    #[serde(default)]
    pub socks5: Option<Socks5Options>,

    /// Bind outgoing sockets to this network interface.
    #[serde(default)]
    pub interface: Option<String>,

    /// Firewall mark applied to outgoing sockets.
    #[serde(default)]
    pub mark: Option<u32>,

    #[serde(default)]
    pub bootstrap: Option<BootstrapOptions>,
}

impl CommonTransportOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            query_timeout: default_query_timeout(),
            retry: default_retry(),
            max_idle_conns: default_max_idle_conns(),
            socks5: None,
            interface: None,
            mark: None,
            bootstrap: None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Socks5Options {
    pub address: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootstrapOptions {
    /// Tag of the upstream used to resolve this server's own name.
    pub upstream: String,

    #[serde(default)]
    pub strategy: BootstrapStrategy,

    /// Seconds a resolved address list stays cached.
    #[serde(default = "default_bootstrap_cache_ttl")]
    pub cache_ttl: u64,
}

impl BootstrapOptions {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapStrategy {
    Ipv4Only,
    Ipv6Only,
    #[default]
    Ipv4Prefer,
    Ipv6Prefer,
}

impl BootstrapStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipv4Only => "ipv4-only",
            Self::Ipv6Only => "ipv6-only",
            Self::Ipv4Prefer => "ipv4-prefer",
            Self::Ipv6Prefer => "ipv6-prefer",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsSettings {
    /// SNI and certificate name; defaults to the host part of `address`.
    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    #[serde(default)]
    pub ca_file: Option<String>,

    #[serde(default)]
    pub client_cert_file: Option<String>,

    #[serde(default)]
    pub client_key_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UdpOptions {
    #[serde(flatten)]
    pub common: CommonTransportOptions,

    /// Retry over TCP when the query is oversized or the reply truncated.
    #[serde(default)]
    pub fallback_tcp: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TcpOptions {
    #[serde(flatten)]
    pub common: CommonTransportOptions,

    #[serde(default)]
    pub enable_pipeline: bool,

    /// Shared connections kept in pipeline mode.
    #[serde(default = "default_max_pipeline_conns")]
    pub max_conns: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsOptions {
    #[serde(flatten)]
    pub common: CommonTransportOptions,

    #[serde(flatten)]
    pub tls: TlsSettings,

    #[serde(default)]
    pub enable_pipeline: bool,

    #[serde(default = "default_max_pipeline_conns")]
    pub max_conns: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuicOptions {
    #[serde(flatten)]
    pub common: CommonTransportOptions,

    #[serde(flatten)]
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpsOptions {
    #[serde(flatten)]
    pub common: CommonTransportOptions,

    #[serde(flatten)]
    pub tls: TlsSettings,

    /// Send queries as POST bodies instead of GET `?dns=` parameters.
    #[serde(default)]
    pub use_post: bool,

    /// Use HTTP/3 over QUIC.
    #[serde(default)]
    pub http3: bool,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_query_timeout() -> u64 {
    15
}

fn default_retry() -> usize {
    3
}

fn default_max_idle_conns() -> usize {
    16
}

fn default_max_pipeline_conns() -> usize {
    2
}

fn default_bootstrap_cache_ttl() -> u64 {
    3600
}
