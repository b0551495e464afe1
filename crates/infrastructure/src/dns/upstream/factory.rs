use ferrous_forward_application::ports::Upstream;
use ferrous_forward_application::use_cases::sort_upstreams;
use ferrous_forward_domain::{
    CommonTransportOptions, Config, DomainError, EndpointScheme, UpstreamEndpoint, UpstreamEntry,
    UpstreamKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::generic::GenericUpstream;
use crate::dns::dhcp::DhcpUpstream;
use crate::dns::hosts::HostsUpstream;
use crate::dns::load_balancer::fallback::FallbackSettings;
use crate::dns::load_balancer::query_test::QueryTestSettings;
use crate::dns::load_balancer::{
    FallbackUpstream, ParallelUpstream, QueryTestUpstream, RandomUpstream,
};
use crate::dns::transport::{
    Bootstrap, Dialer, ServerTarget, StreamConnector, StreamUpstream, UdpUpstream,
};

/// Builds upstreams from configuration in dependency order, so every entry
/// can look up the already-built upstreams it refers to.
///
/// Must be used inside a Tokio runtime; connection pools spawn their
/// sweepers on construction.
#[derive(Default)]
pub struct UpstreamFactory {
    built: HashMap<String, Arc<dyn Upstream>>,
}

impl UpstreamFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the built upstreams in start order.
    pub fn build_all(config: &Config) -> Result<Vec<Arc<dyn Upstream>>, DomainError> {
        let order = sort_upstreams(&config.upstreams)?;
        let mut factory = Self::new();
        let mut ordered = Vec::with_capacity(order.len());

        for i in order {
            let entry = &config.upstreams[i];
            let upstream = factory.build(entry)?;
            debug!(tag = %entry.tag, kind = upstream.kind(), "Upstream built");
            factory
                .built
                .insert(entry.tag.clone(), Arc::clone(&upstream));
            ordered.push(upstream);
        }

        info!(count = ordered.len(), "Upstreams built");
        Ok(ordered)
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<dyn Upstream>> {
        self.built.get(tag)
    }

    /// Builds one entry. Its dependencies must already be registered.
    pub fn build(&self, entry: &UpstreamEntry) -> Result<Arc<dyn Upstream>, DomainError> {
        let tag = entry.tag.as_str();
        match &entry.kind {
            UpstreamKind::Udp(o) => {
                let (endpoint, target) = self.target(tag, &o.common, EndpointScheme::Udp)?;
                let tcp = o.fallback_tcp.then(|| {
                    StreamUpstream::exclusive(
                        tag,
                        StreamConnector::tcp(Arc::clone(&target)),
                        o.common.max_idle_conns,
                        o.common.idle_timeout(),
                    )
                });
                debug!(tag, server = %endpoint, tcp_fallback = tcp.is_some(), "UDP upstream");
                let udp = UdpUpstream::new(
                    tag,
                    target,
                    o.common.max_idle_conns,
                    o.common.idle_timeout(),
                    tcp,
                );
                Ok(wrap(udp, &o.common))
            }
            UpstreamKind::Tcp(o) => {
                let (_, target) = self.target(tag, &o.common, EndpointScheme::Tcp)?;
                let connector = StreamConnector::tcp(target);
                Ok(wrap(
                    stream_upstream(tag, connector, &o.common, o.enable_pipeline, o.max_conns),
                    &o.common,
                ))
            }
            UpstreamKind::Tls(o) => self.build_tls(tag, o),
            UpstreamKind::Quic(o) => self.build_quic(tag, o),
            UpstreamKind::Https(o) => self.build_https(tag, o),
            UpstreamKind::Hosts(o) => {
                let fallback = o
                    .fallback
                    .as_deref()
                    .map(|f| self.member(tag, f))
                    .transpose()?;
                Ok(Arc::new(HostsUpstream::new(tag, o, fallback)?))
            }
            UpstreamKind::Dhcp(o) => Ok(Arc::new(DhcpUpstream::new(tag, o.clone()))),
            UpstreamKind::Random(o) => Ok(Arc::new(RandomUpstream::new(
                tag,
                self.members(tag, &o.upstreams)?,
            )?)),
            UpstreamKind::Parallel(o) => Ok(Arc::new(ParallelUpstream::new(
                tag,
                self.members(tag, &o.upstreams)?,
            )?)),
            UpstreamKind::QueryTest(o) => {
                let settings = QueryTestSettings {
                    test_domain: o.test_domain.clone(),
                    interval: o.test_interval(),
                    tolerance: o.tolerance(),
                    probe_timeout: o.probe_timeout(),
                };
                Ok(Arc::new(QueryTestUpstream::new(
                    tag,
                    self.members(tag, &o.upstreams)?,
                    settings,
                )?))
            }
            UpstreamKind::Fallback(o) => {
                let settings = FallbackSettings {
                    check_interval: o.check_interval(),
                    test_domain: o.test_domain.clone(),
                    probe_timeout: o.probe_timeout(),
                };
                Ok(Arc::new(FallbackUpstream::new(
                    tag,
                    self.member(tag, &o.main_upstream)?,
                    self.member(tag, &o.fallback_upstream)?,
                    settings,
                )))
            }
        }
    }

    #[cfg(feature = "dns-over-rustls")]
    fn build_tls(
        &self,
        tag: &str,
        o: &ferrous_forward_domain::TlsOptions,
    ) -> Result<Arc<dyn Upstream>, DomainError> {
        use crate::dns::transport::tls_config::{build_client_config, ALPN_DOT};

        let (endpoint, target) = self.target(tag, &o.common, EndpointScheme::Tls)?;
        let config = build_client_config(&o.tls, &[ALPN_DOT])?;
        let name = o
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| endpoint.server_name());
        let connector = StreamConnector::tls(target, config, &name)?;
        Ok(wrap(
            stream_upstream(tag, connector, &o.common, o.enable_pipeline, o.max_conns),
            &o.common,
        ))
    }

    #[cfg(not(feature = "dns-over-rustls"))]
    fn build_tls(
        &self,
        tag: &str,
        _o: &ferrous_forward_domain::TlsOptions,
    ) -> Result<Arc<dyn Upstream>, DomainError> {
        Err(feature_disabled(tag, "dns-over-rustls"))
    }

    #[cfg(feature = "dns-over-quic")]
    fn build_quic(
        &self,
        tag: &str,
        o: &ferrous_forward_domain::QuicOptions,
    ) -> Result<Arc<dyn Upstream>, DomainError> {
        use crate::dns::transport::quic::QuicUpstream;
        use crate::dns::transport::quic_conn::QuicConnector;
        use crate::dns::transport::tls_config::ALPN_DOQ;

        let (_, target) = self.target(tag, &o.common, EndpointScheme::Quic)?;
        let connector = QuicConnector::new(target, &o.tls, ALPN_DOQ, o.common.idle_timeout())?;
        Ok(wrap(QuicUpstream::new(tag, connector), &o.common))
    }

    #[cfg(not(feature = "dns-over-quic"))]
    fn build_quic(
        &self,
        tag: &str,
        _o: &ferrous_forward_domain::QuicOptions,
    ) -> Result<Arc<dyn Upstream>, DomainError> {
        Err(feature_disabled(tag, "dns-over-quic"))
    }

    fn build_https(
        &self,
        tag: &str,
        o: &ferrous_forward_domain::HttpsOptions,
    ) -> Result<Arc<dyn Upstream>, DomainError> {
        let scheme = if o.http3 || o.common.address.starts_with("h3://") {
            EndpointScheme::H3
        } else {
            EndpointScheme::Https
        };
        let (endpoint, target) = self.target(tag, &o.common, scheme)?;

        match scheme {
            EndpointScheme::H3 => self.build_h3(tag, o, &endpoint, target),
            _ => self.build_doh(tag, o, &endpoint, target),
        }
    }

    #[cfg(feature = "dns-over-https")]
    fn build_doh(
        &self,
        tag: &str,
        o: &ferrous_forward_domain::HttpsOptions,
        endpoint: &UpstreamEndpoint,
        target: Arc<ServerTarget>,
    ) -> Result<Arc<dyn Upstream>, DomainError> {
        use crate::dns::transport::https::{HttpsSettings, HttpsUpstream};
        use crate::dns::transport::tls_config::{build_client_config, ALPN_H2, ALPN_HTTP11};

        let tls = build_client_config(&o.tls, &[ALPN_H2, ALPN_HTTP11])?;
        let settings = HttpsSettings {
            host: o
                .tls
                .server_name
                .clone()
                .unwrap_or_else(|| endpoint.server_name()),
            path: endpoint.path.to_string(),
            use_post: o.use_post,
            idle_timeout: o.common.idle_timeout(),
            max_idle: o.common.max_idle_conns,
        };
        Ok(wrap(HttpsUpstream::new(tag, target, tls, settings), &o.common))
    }

    #[cfg(not(feature = "dns-over-https"))]
    fn build_doh(
        &self,
        tag: &str,
        _o: &ferrous_forward_domain::HttpsOptions,
        _endpoint: &UpstreamEndpoint,
        _target: Arc<ServerTarget>,
    ) -> Result<Arc<dyn Upstream>, DomainError> {
        Err(feature_disabled(tag, "dns-over-https"))
    }

    #[cfg(feature = "dns-over-h3")]
    fn build_h3(
        &self,
        tag: &str,
        o: &ferrous_forward_domain::HttpsOptions,
        endpoint: &UpstreamEndpoint,
        target: Arc<ServerTarget>,
    ) -> Result<Arc<dyn Upstream>, DomainError> {
        use crate::dns::transport::h3::H3Upstream;
        use crate::dns::transport::quic_conn::QuicConnector;
        use crate::dns::transport::tls_config::ALPN_H3;

        let connector = QuicConnector::new(target, &o.tls, ALPN_H3, o.common.idle_timeout())?;
        Ok(wrap(
            H3Upstream::new(tag, connector, &endpoint.path, o.use_post),
            &o.common,
        ))
    }

    #[cfg(not(feature = "dns-over-h3"))]
    fn build_h3(
        &self,
        tag: &str,
        _o: &ferrous_forward_domain::HttpsOptions,
        _endpoint: &UpstreamEndpoint,
        _target: Arc<ServerTarget>,
    ) -> Result<Arc<dyn Upstream>, DomainError> {
        Err(feature_disabled(tag, "dns-over-h3"))
    }

    /// Parses the address, checks its scheme against the upstream type and
    /// attaches the dialer and bootstrap resolver.
    fn target(
        &self,
        tag: &str,
        common: &CommonTransportOptions,
        scheme: EndpointScheme,
    ) -> Result<(UpstreamEndpoint, Arc<ServerTarget>), DomainError> {
        let endpoint = parse_endpoint(&common.address, scheme).map_err(|e| {
            DomainError::ConfigError(format!("Upstream '{}': {}", tag, e))
        })?;

        let dialer = Dialer::from_options(common)?;
        let bootstrap = match &common.bootstrap {
            Some(b) if endpoint.addr.is_domain() => Some(Arc::new(Bootstrap::new(
                self.member(tag, &b.upstream)?,
                b.strategy,
                b.cache_ttl(),
            ))),
            Some(b) => {
                debug!(tag, bootstrap = %b.upstream, "Server address is an IP, bootstrap unused");
                None
            }
            None => None,
        };

        let target = ServerTarget::new(endpoint.addr.clone(), dialer, bootstrap)?;
        Ok((endpoint, Arc::new(target)))
    }

    fn member(&self, owner: &str, tag: &str) -> Result<Arc<dyn Upstream>, DomainError> {
        self.built
            .get(tag)
            .cloned()
            .ok_or_else(|| DomainError::UnknownDependency {
                upstream: owner.to_string(),
                dependency: tag.to_string(),
            })
    }

    fn members(&self, owner: &str, tags: &[String]) -> Result<Vec<Arc<dyn Upstream>>, DomainError> {
        tags.iter().map(|t| self.member(owner, t)).collect()
    }
}

/// A bare `host:port` takes the scheme of the upstream type; an explicit
/// scheme must agree with it. HTTP/3 upstreams also accept `https://`.
fn parse_endpoint(address: &str, scheme: EndpointScheme) -> Result<UpstreamEndpoint, DomainError> {
    let endpoint: UpstreamEndpoint = if address.contains("://") {
        address.parse()?
    } else {
        format!("{}://{}", scheme.as_str(), address).parse()?
    };

    let compatible = endpoint.scheme == scheme
        || (scheme == EndpointScheme::H3 && endpoint.scheme == EndpointScheme::Https);
    if !compatible {
        return Err(DomainError::InvalidAddress(format!(
            "'{}' uses scheme {} but the upstream type expects {}",
            address,
            endpoint.scheme.as_str(),
            scheme.as_str()
        )));
    }
    Ok(endpoint)
}

fn stream_upstream(
    tag: &str,
    connector: StreamConnector,
    common: &CommonTransportOptions,
    pipeline: bool,
    max_conns: usize,
) -> StreamUpstream {
    if pipeline {
        StreamUpstream::pipelined(tag, connector, max_conns.max(1), common.idle_timeout())
    } else {
        StreamUpstream::exclusive(tag, connector, common.max_idle_conns, common.idle_timeout())
    }
}

fn wrap<U: Upstream + 'static>(upstream: U, common: &CommonTransportOptions) -> Arc<dyn Upstream> {
    Arc::new(GenericUpstream::new(
        Arc::new(upstream),
        common.query_timeout(),
        common.retry,
    ))
}

#[allow(dead_code)]
fn feature_disabled(tag: &str, feature: &str) -> DomainError {
    DomainError::ConfigError(format!(
        "Upstream '{}' needs the '{}' feature, which this build does not include",
        tag, feature
    ))
}
