//! DNS over HTTPS (RFC 8484) over HTTP/1.1 and HTTP/2.
//!
//! One `reqwest` client per upstream. For domain servers the client's
//! resolver is pinned to the bootstrap result, so `reqwest` never looks the
//! name up itself; the client is rebuilt when that result changes.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream};
use ferrous_forward_domain::DomainError;
use hickory_proto::op::Message;
use serde_json::{json, Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::doh::{
    endpoint_url, get_url, parse_reply, status_error, wire_query, DNS_MESSAGE_CONTENT_TYPE,
};
use super::target::ServerTarget;

pub struct HttpsSettings {
    pub host: String,
    pub path: String,
    pub use_post: bool,
    pub idle_timeout: Duration,
    pub max_idle: usize,
}

struct PinnedClient {
    ips: Option<Arc<Vec<IpAddr>>>,
    client: reqwest::Client,
}

pub struct HttpsUpstream {
    tag: String,
    target: Arc<ServerTarget>,
    settings: HttpsSettings,
    url: String,
    tls: rustls::ClientConfig,
    client: ArcSwapOption<PinnedClient>,
}

impl HttpsUpstream {
    /// `tls` should advertise `h2` and `http/1.1`.
    pub fn new(
        tag: impl Into<String>,
        target: Arc<ServerTarget>,
        tls: rustls::ClientConfig,
        settings: HttpsSettings,
    ) -> Self {
        let tag = tag.into();
        if target.dialer().mark().is_some() {
            warn!(tag = %tag, "Firewall mark is not applied to HTTPS upstreams");
        }
        let url = endpoint_url(&settings.host, target.addr(), &settings.path);
        Self {
            tag,
            target,
            settings,
            url,
            tls,
            client: ArcSwapOption::empty(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_client(&self, ips: Option<&[IpAddr]>) -> Result<reqwest::Client, DomainError> {
        let dialer = self.target.dialer();
        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(self.tls.clone())
            .connect_timeout(dialer.connect_timeout())
            .pool_idle_timeout(self.settings.idle_timeout)
            .pool_max_idle_per_host(self.settings.max_idle);

        builder = match dialer.socks5() {
            Some(proxy) => {
                let mut p = reqwest::Proxy::all(proxy.url()).map_err(|e| {
                    DomainError::ConfigError(format!("Invalid SOCKS5 proxy {}: {}", proxy.addr, e))
                })?;
                if let Some((user, password)) = proxy.credentials() {
                    p = p.basic_auth(user, password);
                }
                builder.proxy(p)
            }
            None => builder.no_proxy(),
        };

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
        {
            if let Some(interface) = dialer.interface() {
                builder = builder.interface(interface);
            }
        }

        if let Some(ips) = ips {
            let port = self.target.addr().port();
            let addrs: Vec<SocketAddr> = ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
            builder = builder.resolve_to_addrs(&self.settings.host, &addrs);
        }

        builder
            .build()
            .map_err(|e| DomainError::ConfigError(format!("Failed to build HTTPS client: {}", e)))
    }

    async fn client(&self, ctx: &ExchangeContext) -> Result<reqwest::Client, DomainError> {
        let proxy_resolves = self.target.dialer().uses_proxy() && self.target.bootstrap().is_none();
        let ips = if proxy_resolves {
            None
        } else {
            Some(self.target.resolve(ctx).await?)
        };

        if let Some(current) = self.client.load_full() {
            let same = match (&current.ips, &ips) {
                (Some(a), Some(b)) => a == b,
                (None, None) => true,
                _ => false,
            };
            if same {
                return Ok(current.client.clone());
            }
        }

        let client = self.build_client(ips.as_deref().map(|v| v.as_slice()))?;
        debug!(tag = %self.tag, url = %self.url, "Built HTTPS client");
        self.client.store(Some(Arc::new(PinnedClient {
            ips,
            client: client.clone(),
        })));
        Ok(client)
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        query: &Message,
    ) -> Result<Message, DomainError> {
        let wire = wire_query(query)?;
        let request = if self.settings.use_post {
            client
                .post(&self.url)
                .header("content-type", DNS_MESSAGE_CONTENT_TYPE)
                .body(wire)
        } else {
            client.get(get_url(&self.url, &wire))
        };

        let response = request
            .header("accept", DNS_MESSAGE_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| request_error(&self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&self.url, status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(&self.url, e))?;
        parse_reply(query, &body)
    }
}

fn request_error(url: &str, err: reqwest::Error) -> DomainError {
    if err.is_timeout() {
        DomainError::TransportTimeout {
            server: url.to_string(),
        }
    } else if err.is_connect() {
        DomainError::TransportConnectionRefused {
            server: format!("{}: {}", url, err),
        }
    } else {
        DomainError::IoError(format!("DoH request to {} failed: {}", url, err))
    }
}

#[async_trait]
impl Upstream for HttpsUpstream {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> &'static str {
        "https"
    }

    fn dependencies(&self) -> Vec<String> {
        self.target
            .bootstrap()
            .map(|b| vec![b.upstream_tag().to_string()])
            .unwrap_or_default()
    }

    async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        let client = self.client(ctx).await?;
        ctx.run(self.send(&client, &query)).await
    }

    async fn start(&self) -> Result<(), DomainError> {
        self.target.start();
        Ok(())
    }

    async fn close(&self) {
        self.client.store(None);
        self.target.close().await;
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("url".into(), json!(self.url));
        map.insert(
            "method".into(),
            json!(if self.settings.use_post { "POST" } else { "GET" }),
        );
        map
    }
}
