use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DomainError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Duplicate upstream tag: {0}")]
    DuplicateTag(String),

    #[error("Upstream '{upstream}' depends on unknown upstream '{dependency}'")]
    UnknownDependency { upstream: String, dependency: String },

    #[error("Cyclic upstream dependency: {0}")]
    CyclicDependency(String),

    #[error("Transport timeout connecting to {server}")]
    TransportTimeout { server: String },

    #[error("Transport connection refused by {server}")]
    TransportConnectionRefused { server: String },

    #[error("Transport connection reset by {server}")]
    TransportConnectionReset { server: String },

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Bootstrap resolution failed for {domain}: {reason}")]
    BootstrapFailed { domain: String, reason: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid DNS response: {0}")]
    InvalidDnsResponse(String),

    #[error("DNS message too large for UDP: {0} bytes")]
    MessageTooLarge(usize),

    #[error("SOCKS5 error: {0}")]
    Socks5Error(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Exchange cancelled")]
    Cancelled,

    #[error("Query timeout")]
    QueryTimeout,

    #[error("No upstream available: {0}")]
    NoUpstreamAvailable(String),

    #[error("All upstreams failed")]
    AllUpstreamsFailed,
}

impl DomainError {
    /// Transient failures worth another attempt on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DomainError::TransportTimeout { .. }
                | DomainError::TransportConnectionRefused { .. }
                | DomainError::TransportConnectionReset { .. }
                | DomainError::IoError(_)
                | DomainError::ConnectionClosed(_)
                | DomainError::BootstrapFailed { .. }
                | DomainError::QueryTimeout
                | DomainError::AllUpstreamsFailed
                | DomainError::NoUpstreamAvailable(_)
        )
    }

    /// Failures caused by shutdown or by the caller giving up.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DomainError::Cancelled | DomainError::PoolClosed)
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            DomainError::ConfigError(_)
                | DomainError::InvalidAddress(_)
                | DomainError::DuplicateTag(_)
                | DomainError::UnknownDependency { .. }
                | DomainError::CyclicDependency(_)
        )
    }

    /// Maps an I/O error onto the transport taxonomy for `server`.
    pub fn from_io(server: impl Into<String>, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let server = server.into();
        match err.kind() {
            ErrorKind::TimedOut => DomainError::TransportTimeout { server },
            ErrorKind::ConnectionRefused => DomainError::TransportConnectionRefused { server },
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                DomainError::TransportConnectionReset { server }
            }
            ErrorKind::UnexpectedEof => {
                DomainError::ConnectionClosed(format!("{} closed the connection", server))
            }
            _ => DomainError::IoError(format!("{}: {}", server, err)),
        }
    }
}
