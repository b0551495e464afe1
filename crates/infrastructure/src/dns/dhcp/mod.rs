//! Upstream set learned from the local DHCP server's DNS option.

pub mod packet;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream, UpstreamStatistics};
use ferrous_forward_domain::{DhcpOptions, DomainError, ResolverAddr};
use hickory_proto::op::Message;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::packet::{build_discover, parse_offer, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use super::load_balancer::race_exchange;
use super::transport::{
    Dialer, ServerTarget, StreamConnector, StreamUpstream, UdpUpstream, DEFAULT_POOL_CAPACITY,
};
use super::upstream::GenericUpstream;
use crate::system::LinuxInterfaceReader;

struct DhcpServer {
    addr: SocketAddr,
    upstream: Arc<dyn Upstream>,
}

struct DhcpInner {
    tag: String,
    options: DhcpOptions,
    interfaces: LinuxInterfaceReader,
    servers: ArcSwap<Vec<Arc<DhcpServer>>>,
    update_lock: tokio::sync::Mutex<()>,
}

impl DhcpInner {
    async fn interface(&self) -> Result<String, DomainError> {
        match &self.options.interface {
            Some(name) => Ok(name.clone()),
            None => self.interfaces.default_route_interface().await,
        }
    }

    fn build_server(&self, addr: SocketAddr, interface: &str) -> Result<Arc<dyn Upstream>, DomainError> {
        let mut dialer = Dialer::direct(self.options.probe_timeout());
        if !interface.is_empty() {
            dialer = dialer.with_interface(interface);
        }
        let target = Arc::new(ServerTarget::new(ResolverAddr::Ip(addr), dialer, None)?);
        let idle_timeout = Duration::from_secs(self.options.idle_timeout);
        let name = format!("{}[{}]", self.tag, addr);

        let tcp = self.options.fallback_tcp.then(|| {
            StreamUpstream::exclusive(
                name.clone(),
                StreamConnector::tcp(Arc::clone(&target)),
                DEFAULT_POOL_CAPACITY,
                idle_timeout,
            )
        });
        let udp = UdpUpstream::new(name, target, DEFAULT_POOL_CAPACITY, idle_timeout, tcp);
        Ok(Arc::new(GenericUpstream::new(
            Arc::new(udp),
            Duration::from_secs(self.options.query_timeout),
            1,
        )))
    }

    /// Replaces the server set with `ips`, keeping upstreams whose address
    /// is unchanged.
    async fn apply(&self, ips: &[IpAddr], interface: &str) -> Result<(), DomainError> {
        self.apply_with(ips, interface, |addr| self.build_server(addr, interface))
            .await
    }

    async fn apply_with<F>(
        &self,
        ips: &[IpAddr],
        interface: &str,
        mut build: F,
    ) -> Result<(), DomainError>
    where
        F: FnMut(SocketAddr) -> Result<Arc<dyn Upstream>, DomainError>,
    {
        let _update = self.update_lock.lock().await;
        let current = self.servers.load_full();

        let mut next: Vec<Arc<DhcpServer>> = Vec::with_capacity(ips.len());
        let mut removed = Vec::new();
        for server in current.iter() {
            if ips.contains(&server.addr.ip()) {
                next.push(Arc::clone(server));
            } else {
                removed.push(Arc::clone(server));
            }
        }

        let mut added: Vec<Arc<DhcpServer>> = Vec::new();
        for ip in ips {
            if next.iter().chain(&added).any(|s| s.addr.ip() == *ip) {
                continue;
            }
            let addr = SocketAddr::new(*ip, 53);
            let started = match build(addr) {
                Ok(upstream) => match upstream.start().await {
                    Ok(()) => Ok(upstream),
                    Err(e) => {
                        upstream.close().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            match started {
                Ok(upstream) => added.push(Arc::new(DhcpServer { addr, upstream })),
                Err(e) => {
                    // The current set stays in place; only this pass's servers go.
                    for server in added {
                        server.upstream.close().await;
                    }
                    return Err(e);
                }
            }
        }

        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }

        let added_count = added.len();
        next.extend(added);
        self.servers.store(Arc::new(next));
        info!(
            tag = %self.tag,
            interface,
            added = added_count,
            removed = removed.len(),
            "DHCP DNS servers updated"
        );
        for server in removed {
            server.upstream.close().await;
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<(), DomainError> {
        let interface = self.interface().await?;
        let mac = self.interfaces.mac_address(&interface).await?;
        let servers = discover(&interface, mac, self.options.probe_timeout()).await?;
        let ips: Vec<IpAddr> = servers.into_iter().map(IpAddr::V4).collect();
        if ips.is_empty() {
            warn!(tag = %self.tag, interface = %interface, "DHCP offer carried no DNS servers");
            return Ok(());
        }
        self.apply(&ips, &interface).await
    }

    async fn close_servers(&self) {
        let _update = self.update_lock.lock().await;
        let servers = self.servers.swap(Arc::new(Vec::new()));
        for server in servers.iter() {
            server.upstream.close().await;
        }
    }
}

/// Broadcasts one DHCPDISCOVER on `interface` and returns the DNS servers
/// of the first matching offer.
async fn discover(interface: &str, mac: [u8; 6], timeout: Duration) -> Result<Vec<Ipv4Addr>, DomainError> {
    let socket = broadcast_socket(interface)
        .map_err(|e| DomainError::IoError(format!("DHCP socket on {}: {}", interface, e)))?;
    let xid = fastrand::u32(..);
    let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_SERVER_PORT);

    socket
        .send_to(&build_discover(xid, mac), server)
        .await
        .map_err(|e| DomainError::from_io(server.to_string(), e))?;
    debug!(interface, xid, "DHCPDISCOVER sent");

    let mut buf = vec![0u8; 1500];
    tokio::time::timeout(timeout, async {
        loop {
            let (n, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| DomainError::from_io(server.to_string(), e))?;
            if let Some(servers) = parse_offer(&buf[..n], xid) {
                debug!(interface, from = %from, servers = servers.len(), "DHCPOFFER received");
                return Ok(servers);
            }
        }
    })
    .await
    .map_err(|_| DomainError::TransportTimeout {
        server: format!("DHCP on {}", interface),
    })?
}

fn broadcast_socket(interface: &str) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    socket.bind_device(Some(interface.as_bytes()))?;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = interface;
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DHCP_CLIENT_PORT);
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

pub struct DhcpUpstream {
    inner: Arc<DhcpInner>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: UpstreamStatistics,
}

impl DhcpUpstream {
    pub fn new(tag: impl Into<String>, options: DhcpOptions) -> Self {
        Self::with_interface_reader(tag, options, LinuxInterfaceReader::new())
    }

    pub fn with_interface_reader(
        tag: impl Into<String>,
        options: DhcpOptions,
        interfaces: LinuxInterfaceReader,
    ) -> Self {
        Self {
            inner: Arc::new(DhcpInner {
                tag: tag.into(),
                options,
                interfaces,
                servers: ArcSwap::from_pointee(Vec::new()),
                update_lock: tokio::sync::Mutex::new(()),
            }),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            stats: UpstreamStatistics::new(),
        }
    }

    /// Installs a server set directly, as a DHCP offer would.
    pub async fn apply_servers(&self, ips: &[IpAddr]) -> Result<(), DomainError> {
        let interface = self.inner.options.interface.clone().unwrap_or_default();
        self.inner.apply(ips, &interface).await
    }

    pub fn servers(&self) -> Vec<SocketAddr> {
        self.inner.servers.load().iter().map(|s| s.addr).collect()
    }
}

#[async_trait]
impl Upstream for DhcpUpstream {
    fn tag(&self) -> &str {
        &self.inner.tag
    }

    fn kind(&self) -> &'static str {
        "dhcp"
    }

    async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        let servers = self.inner.servers.load_full();
        if servers.is_empty() {
            self.stats.record(false);
            return Err(DomainError::NoUpstreamAvailable(format!(
                "no DNS servers learned by '{}'",
                self.inner.tag
            )));
        }
        let members: Vec<Arc<dyn Upstream>> =
            servers.iter().map(|s| Arc::clone(&s.upstream)).collect();
        let result = race_exchange(&members, ctx, &query).await;
        self.stats.record(result.is_ok());
        result
    }

    async fn start(&self) -> Result<(), DomainError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.options.check_interval());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.refresh().await {
                            warn!(tag = %inner.tag, error = %e, "DHCP probe failed");
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
        self.inner.close_servers().await;
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = self.stats.to_map();
        let servers: Vec<String> = self.servers().iter().map(|s| s.to_string()).collect();
        map.insert("servers".into(), json!(servers));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TrackedUpstream {
        fail_start: bool,
        closes: Arc<AtomicUsize>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Upstream for TrackedUpstream {
        fn tag(&self) -> &str {
            "tracked"
        }

        fn kind(&self) -> &'static str {
            "udp"
        }

        async fn exchange(
            &self,
            _ctx: &ExchangeContext,
            _query: Message,
        ) -> Result<Message, DomainError> {
            Err(DomainError::NoUpstreamAvailable("tracked".into()))
        }

        async fn start(&self) -> Result<(), DomainError> {
            if self.fail_start {
                return Err(DomainError::ConfigError("refused".into()));
            }
            Ok(())
        }

        async fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn options() -> DhcpOptions {
        DhcpOptions {
            interface: None,
            check_interval: 60,
            fallback_tcp: false,
            probe_timeout: 5,
            query_timeout: 15,
            idle_timeout: 60,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn tracked(fail_start: bool, closes: &Arc<AtomicUsize>) -> Arc<dyn Upstream> {
        Arc::new(TrackedUpstream {
            fail_start,
            closes: Arc::clone(closes),
            closed: AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn test_failed_apply_closes_servers_started_in_that_pass() {
        let dhcp = DhcpUpstream::new("dhcp", options());
        let kept_closes = Arc::new(AtomicUsize::new(0));
        dhcp.inner
            .apply_with(&[ip("10.0.0.1")], "", |_| Ok(tracked(false, &kept_closes)))
            .await
            .unwrap();

        let fresh_closes = Arc::new(AtomicUsize::new(0));
        let err = dhcp
            .inner
            .apply_with(&[ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")], "", |addr| {
                Ok(tracked(addr.ip() == ip("10.0.0.3"), &fresh_closes))
            })
            .await
            .unwrap_err();

        assert!(err.is_config());
        assert_eq!(fresh_closes.load(Ordering::SeqCst), 2);
        assert_eq!(kept_closes.load(Ordering::SeqCst), 0);
        assert_eq!(dhcp.servers(), vec!["10.0.0.1:53".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_failed_build_keeps_current_set() {
        let dhcp = DhcpUpstream::new("dhcp", options());
        let closes = Arc::new(AtomicUsize::new(0));
        dhcp.inner
            .apply_with(&[ip("10.0.0.1")], "", |_| Ok(tracked(false, &closes)))
            .await
            .unwrap();

        let result = dhcp
            .inner
            .apply_with(&[ip("10.0.0.2"), ip("10.0.0.3")], "", |addr| {
                if addr.ip() == ip("10.0.0.3") {
                    return Err(DomainError::ConfigError("bad server".into()));
                }
                Ok(tracked(false, &closes))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(dhcp.servers(), vec!["10.0.0.1:53".parse::<SocketAddr>().unwrap()]);
    }
}
