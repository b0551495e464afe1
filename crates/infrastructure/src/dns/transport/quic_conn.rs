//! Shared QUIC connection used by DoQ and DoH3.

use ferrous_forward_application::ports::ExchangeContext;
use ferrous_forward_domain::{DomainError, TlsSettings};
use parking_lot::Mutex;
use quinn::crypto::rustls::QuicClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::dialer::unspecified_for;
use super::parallel::dial_parallel;
use super::target::ServerTarget;
use super::tls_config::build_client_config;

pub struct QuicConnector {
    target: Arc<ServerTarget>,
    client_config: quinn::ClientConfig,
    server_name: String,
    // IPv4 and IPv6 endpoints, opened on first use.
    endpoints: Mutex<[Option<quinn::Endpoint>; 2]>,
    conn: tokio::sync::Mutex<Option<quinn::Connection>>,
}

impl QuicConnector {
    pub fn new(
        target: Arc<ServerTarget>,
        settings: &TlsSettings,
        alpn: &[u8],
        idle_timeout: Duration,
    ) -> Result<Self, DomainError> {
        if target.dialer().uses_proxy() {
            return Err(DomainError::ConfigError(format!(
                "SOCKS5 is not supported for QUIC upstream {}",
                target.addr()
            )));
        }

        let mut tls = build_client_config(settings, &[alpn])?;
        tls.enable_early_data = true;
        let crypto = QuicClientConfig::try_from(Arc::new(tls))
            .map_err(|e| DomainError::ConfigError(format!("Invalid QUIC TLS config: {}", e)))?;

        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(quinn::IdleTimeout::try_from(idle_timeout).ok());
        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(Arc::new(transport));

        let server_name = settings
            .server_name
            .clone()
            .unwrap_or_else(|| target.addr().host());

        Ok(Self {
            target,
            client_config,
            server_name,
            endpoints: Mutex::new([None, None]),
            conn: tokio::sync::Mutex::new(None),
        })
    }

    pub fn target(&self) -> &Arc<ServerTarget> {
        &self.target
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn endpoint_for(&self, addr: &SocketAddr) -> Result<quinn::Endpoint, DomainError> {
        let slot = usize::from(addr.is_ipv6());
        let mut endpoints = self.endpoints.lock();
        if let Some(endpoint) = &endpoints[slot] {
            return Ok(endpoint.clone());
        }

        let socket = self.target.dialer().udp_socket(unspecified_for(addr))?;
        let endpoint = quinn::Endpoint::new(
            quinn::EndpointConfig::default(),
            None,
            socket,
            Arc::new(quinn::TokioRuntime),
        )
        .map_err(|e| DomainError::from_io(addr.to_string(), e))?;
        endpoints[slot] = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn connect_addr(&self, addr: SocketAddr) -> Result<quinn::Connection, DomainError> {
        let endpoint = self.endpoint_for(&addr)?;
        let connecting = endpoint
            .connect_with(self.client_config.clone(), addr, &self.server_name)
            .map_err(|e| {
                DomainError::ProtocolError(format!(
                    "Failed to initiate QUIC connection to {}: {}",
                    addr, e
                ))
            })?;

        // 0-RTT when a resumption ticket is cached, otherwise a full handshake.
        let conn = match connecting.into_0rtt() {
            Ok((conn, _accepted)) => conn,
            Err(connecting) => {
                tokio::time::timeout(self.target.dialer().connect_timeout(), connecting)
                    .await
                    .map_err(|_| DomainError::TransportTimeout {
                        server: addr.to_string(),
                    })?
                    .map_err(|e| DomainError::TransportConnectionRefused {
                        server: format!("{}({}): {}", self.server_name, addr, e),
                    })?
            }
        };

        debug!(server = %addr, name = %self.server_name, "QUIC connection established");
        Ok(conn)
    }

    /// Dials a new connection, racing every resolved address.
    pub async fn dial(&self, ctx: &ExchangeContext) -> Result<quinn::Connection, DomainError> {
        let ips = self.target.resolve(ctx).await?;
        let port = self.target.addr().port();
        ctx.run(dial_parallel(&ips, port, |addr| self.connect_addr(addr)))
            .await
    }

    /// The live shared connection, dialing a new one when it is missing or
    /// closed. The flag is true for a freshly dialed connection.
    pub async fn connection(
        &self,
        ctx: &ExchangeContext,
    ) -> Result<(quinn::Connection, bool), DomainError> {
        let mut guard = ctx.run(async { Ok(self.conn.lock().await) }).await?;
        if let Some(conn) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok((conn.clone(), false));
            }
        }
        let conn = self.dial(ctx).await?;
        *guard = Some(conn.clone());
        Ok((conn, true))
    }

    /// Forgets `stale` if it is still the shared connection.
    pub async fn discard(&self, stale: &quinn::Connection) {
        let mut guard = self.conn.lock().await;
        if guard.as_ref().map(|c| c.stable_id()) == Some(stale.stable_id()) {
            *guard = None;
        }
        stale.close(0u32.into(), b"");
    }

    pub async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close(0u32.into(), b"");
        }
        let endpoints = std::mem::take(&mut *self.endpoints.lock());
        for endpoint in endpoints.into_iter().flatten() {
            endpoint.close(0u32.into(), b"");
        }
        self.target.close().await;
    }
}

/// QUIC stream errors mapped onto the transport taxonomy.
pub fn stream_err(server: &str, err: impl std::fmt::Display) -> DomainError {
    DomainError::ConnectionClosed(format!("{}: {}", server, err))
}
