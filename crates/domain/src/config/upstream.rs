use serde::{Deserialize, Serialize};

use super::composite::{
    DhcpOptions, FallbackOptions, GroupOptions, HostsOptions, QueryTestOptions,
};
use super::transport::{
    CommonTransportOptions, HttpsOptions, QuicOptions, TcpOptions, TlsOptions, UdpOptions,
};

/// One `[[upstreams]]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamEntry {
    pub tag: String,

    #[serde(flatten)]
    pub kind: UpstreamKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamKind {
    Udp(UdpOptions),
    Tcp(TcpOptions),
    Tls(TlsOptions),
    #[serde(alias = "doq")]
    Quic(QuicOptions),
    #[serde(alias = "doh")]
    Https(HttpsOptions),
    Hosts(HostsOptions),
    Dhcp(DhcpOptions),
    Random(GroupOptions),
    Parallel(GroupOptions),
    #[serde(rename = "querytest", alias = "query-test")]
    QueryTest(QueryTestOptions),
    Fallback(FallbackOptions),
}

impl UpstreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp(_) => "udp",
            Self::Tcp(_) => "tcp",
            Self::Tls(_) => "tls",
            Self::Quic(_) => "quic",
            Self::Https(_) => "https",
            Self::Hosts(_) => "hosts",
            Self::Dhcp(_) => "dhcp",
            Self::Random(_) => "random",
            Self::Parallel(_) => "parallel",
            Self::QueryTest(_) => "querytest",
            Self::Fallback(_) => "fallback",
        }
    }

    pub fn common(&self) -> Option<&CommonTransportOptions> {
        match self {
            Self::Udp(o) => Some(&o.common),
            Self::Tcp(o) => Some(&o.common),
            Self::Tls(o) => Some(&o.common),
            Self::Quic(o) => Some(&o.common),
            Self::Https(o) => Some(&o.common),
            _ => None,
        }
    }
}

impl UpstreamEntry {
    /// Tags of the upstreams this entry needs built and started first.
    pub fn dependencies(&self) -> Vec<String> {
        if let Some(common) = self.kind.common() {
            return common
                .bootstrap
                .iter()
                .map(|b| b.upstream.clone())
                .collect();
        }
        match &self.kind {
            UpstreamKind::Random(o) | UpstreamKind::Parallel(o) => o.upstreams.clone(),
            UpstreamKind::QueryTest(o) => o.upstreams.clone(),
            UpstreamKind::Fallback(o) => {
                vec![o.main_upstream.clone(), o.fallback_upstream.clone()]
            }
            UpstreamKind::Hosts(o) => o.fallback.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }
}
