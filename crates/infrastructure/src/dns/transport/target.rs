use ferrous_forward_application::ports::ExchangeContext;
use ferrous_forward_domain::{DomainError, ResolverAddr};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

use super::bootstrap::Bootstrap;
use super::dialer::{Dialer, PacketConn};
use super::parallel::{dial_parallel, listen_parallel};

/// Where a transport sends its queries and how it gets there.
pub struct ServerTarget {
    addr: ResolverAddr,
    dialer: Dialer,
    bootstrap: Option<Arc<Bootstrap>>,
}

impl std::fmt::Debug for ServerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTarget")
            .field("addr", &self.addr)
            .field("dialer", &self.dialer)
            .field("bootstrap", &self.bootstrap.is_some())
            .finish()
    }
}

impl ServerTarget {
    pub fn new(
        addr: ResolverAddr,
        dialer: Dialer,
        bootstrap: Option<Arc<Bootstrap>>,
    ) -> Result<Self, DomainError> {
        if addr.is_domain() && !dialer.uses_proxy() && bootstrap.is_none() {
            return Err(DomainError::ConfigError(format!(
                "Server {} is a domain name; configure a bootstrap upstream or a SOCKS5 proxy",
                addr
            )));
        }
        Ok(Self {
            addr,
            dialer,
            bootstrap,
        })
    }

    pub fn addr(&self) -> &ResolverAddr {
        &self.addr
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub fn bootstrap(&self) -> Option<&Arc<Bootstrap>> {
        self.bootstrap.as_ref()
    }

    /// Unresolved domains go to the proxy as-is.
    fn proxy_resolves(&self) -> bool {
        self.dialer.uses_proxy() && self.bootstrap.is_none()
    }

    pub async fn resolve(&self, ctx: &ExchangeContext) -> Result<Arc<Vec<IpAddr>>, DomainError> {
        match &self.addr {
            ResolverAddr::Ip(addr) => Ok(Arc::new(vec![addr.ip()])),
            ResolverAddr::Domain { domain, .. } => {
                let bootstrap = self.bootstrap.as_ref().ok_or_else(|| {
                    DomainError::ConfigError(format!("No bootstrap configured for {}", domain))
                })?;
                bootstrap.lookup(ctx, domain).await
            }
        }
    }

    pub async fn dial_tcp(&self, ctx: &ExchangeContext) -> Result<TcpStream, DomainError> {
        ctx.run(async {
            if self.proxy_resolves() {
                return self.dialer.dial_tcp(&self.addr).await;
            }
            let ips = self.resolve(ctx).await?;
            let dialer = &self.dialer;
            dial_parallel(&ips, self.addr.port(), |addr| async move {
                dialer.dial_tcp(&ResolverAddr::Ip(addr)).await
            })
            .await
        })
        .await
    }

    pub async fn dial_udp(&self, ctx: &ExchangeContext) -> Result<PacketConn, DomainError> {
        ctx.run(async {
            if self.proxy_resolves() {
                return self.dialer.dial_udp(&self.addr).await;
            }
            let ips = self.resolve(ctx).await?;
            listen_parallel(&self.dialer, &ips, self.addr.port()).await
        })
        .await
    }

    pub fn start(&self) {
        if let Some(bootstrap) = &self.bootstrap {
            bootstrap.start();
        }
    }

    pub async fn close(&self) {
        if let Some(bootstrap) = &self.bootstrap {
            bootstrap.close().await;
        }
    }
}
