//! Ferrous Forward Domain Layer
pub mod config;
pub mod errors;
pub mod resolver_addr;

pub use config::{
    BootstrapOptions, BootstrapStrategy, CommonTransportOptions, Config, ConfigError,
    DhcpOptions, FallbackOptions, GroupOptions, HostsOptions, HostsRule, HttpsOptions,
    LoggingConfig, QueryTestOptions, QuicOptions, Socks5Options, TcpOptions, TlsOptions,
    TlsSettings, UdpOptions, UpstreamEntry, UpstreamKind,
};
pub use errors::DomainError;
pub use resolver_addr::{EndpointScheme, ResolverAddr, UpstreamEndpoint};
