pub mod composite;
pub mod errors;
pub mod logging;
pub mod root;
pub mod transport;
pub mod upstream;

pub use composite::{
    DhcpOptions, FallbackOptions, GroupOptions, HostsOptions, HostsRule, QueryTestOptions,
};
pub use errors::ConfigError;
pub use logging::LoggingConfig;
pub use root::Config;
pub use transport::{
    BootstrapOptions, BootstrapStrategy, CommonTransportOptions, HttpsOptions, QuicOptions,
    Socks5Options, TcpOptions, TlsOptions, TlsSettings, UdpOptions,
};
pub use upstream::{UpstreamEntry, UpstreamKind};
