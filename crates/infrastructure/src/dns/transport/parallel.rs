//! Races connection attempts across candidate server addresses.

use ferrous_forward_domain::{DomainError, ResolverAddr};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use super::dialer::{Dialer, PacketConn};

/// Launches `dial` for every IP at once and returns the first success.
/// Remaining attempts are dropped, which cancels them. When every attempt
/// fails the error of the last one to finish is returned.
pub async fn dial_parallel<T, F, Fut>(ips: &[IpAddr], port: u16, dial: F) -> Result<T, DomainError>
where
    F: Fn(SocketAddr) -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
{
    if ips.is_empty() {
        return Err(DomainError::NoUpstreamAvailable(
            "no addresses to dial".to_string(),
        ));
    }
    if ips.len() == 1 {
        return dial(SocketAddr::new(ips[0], port)).await;
    }

    let mut attempts: FuturesUnordered<_> = ips
        .iter()
        .map(|ip| dial(SocketAddr::new(*ip, port)))
        .collect();

    let mut last_err = None;
    while let Some(result) = attempts.next().await {
        match result {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                debug!(error = %e, "Parallel dial attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(DomainError::AllUpstreamsFailed))
}

/// Packet-socket counterpart of [`dial_parallel`]. A direct dialer needs no
/// handshake and takes the first IP; a SOCKS5 dialer races UDP ASSOCIATE.
pub async fn listen_parallel(
    dialer: &Dialer,
    ips: &[IpAddr],
    port: u16,
) -> Result<PacketConn, DomainError> {
    if !dialer.uses_proxy() {
        let ip = ips.first().ok_or_else(|| {
            DomainError::NoUpstreamAvailable("no addresses to dial".to_string())
        })?;
        return dialer.dial_udp(&ResolverAddr::Ip(SocketAddr::new(*ip, port))).await;
    }
    dial_parallel(ips, port, |addr| async move {
        dialer.dial_udp(&ResolverAddr::Ip(addr)).await
    })
    .await
}
