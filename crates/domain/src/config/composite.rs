use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Member list used by `random` and `parallel` upstreams.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupOptions {
    pub upstreams: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueryTestOptions {
    pub upstreams: Vec<String>,

    #[serde(default = "default_test_domain")]
    pub test_domain: String,

    /// Seconds between probe rounds.
    #[serde(default = "default_test_interval")]
    pub test_interval: u64,

    /// Minimum latency improvement, in milliseconds, before switching.
    #[serde(default = "default_tolerance")]
    pub tolerance: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
}

impl QueryTestOptions {
    pub fn test_interval(&self) -> Duration {
        Duration::from_secs(self.test_interval)
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.tolerance)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FallbackOptions {
    pub main_upstream: String,

    pub fallback_upstream: String,

    /// Seconds between health probes of an unhealthy main upstream.
    #[serde(default = "default_test_interval")]
    pub check_interval: u64,

    #[serde(default = "default_test_domain")]
    pub test_domain: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
}

impl FallbackOptions {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostsRule {
    /// Regular expression matched against the query name (no trailing dot).
    pub pattern: String,

    /// Addresses or CIDR prefixes answered for A queries.
    #[serde(default)]
    pub ipv4: Vec<String>,

    /// Addresses or CIDR prefixes answered for AAAA queries.
    #[serde(default)]
    pub ipv6: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostsOptions {
    #[serde(default)]
    pub rules: Vec<HostsRule>,

    #[serde(default = "default_hosts_ttl")]
    pub ttl: u32,

    /// Upstream used for names no rule matches.
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DhcpOptions {
    /// Interface to probe; the default-route interface when absent.
    #[serde(default)]
    pub interface: Option<String>,

    #[serde(default = "default_dhcp_interval")]
    pub check_interval: u64,

    #[serde(default)]
    pub fallback_tcp: bool,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,

    #[serde(default = "default_dhcp_query_timeout")]
    pub query_timeout: u64,

    #[serde(default = "default_dhcp_idle_timeout")]
    pub idle_timeout: u64,
}

impl DhcpOptions {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }
}

fn default_test_domain() -> String {
    "www.example.com".to_string()
}

fn default_test_interval() -> u64 {
    600
}

fn default_tolerance() -> u64 {
    3
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_hosts_ttl() -> u32 {
    10
}

fn default_dhcp_interval() -> u64 {
    60
}

fn default_dhcp_query_timeout() -> u64 {
    15
}

fn default_dhcp_idle_timeout() -> u64 {
    60
}
