//! DNS over TCP and DNS over TLS (RFC 7766, RFC 7858).
//!
//! Both run length-prefixed messages over a byte stream. By default each
//! exchange takes a stream out of an exclusive [`ConnPool`]; with
//! `enable-pipeline` they share a few [`PipelinedConn`]s instead.

use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream};
use ferrous_forward_domain::DomainError;
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::dialer::BoxedStream;
use super::framing::{read_framed, write_framed};
use super::pipeline::{PipelineConnector, PipelinePool, PipelinedConn};
use super::pool::{ConnPool, PoolManager};
use super::target::ServerTarget;
use super::tls_config::server_name;
use crate::dns::message::{decode, encode, wire_id};

#[derive(Clone)]
struct TlsHandshake {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Dials the server and, for TLS, completes the handshake.
#[derive(Clone)]
pub struct StreamConnector {
    target: Arc<ServerTarget>,
    tls: Option<TlsHandshake>,
}

impl StreamConnector {
    pub fn tcp(target: Arc<ServerTarget>) -> Self {
        Self { target, tls: None }
    }

    /// `name` is presented in SNI and checked against the certificate.
    pub fn tls(
        target: Arc<ServerTarget>,
        config: rustls::ClientConfig,
        name: &str,
    ) -> Result<Self, DomainError> {
        Ok(Self {
            target,
            tls: Some(TlsHandshake {
                connector: TlsConnector::from(Arc::new(config)),
                server_name: server_name(name)?,
            }),
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub async fn open_stream(&self, ctx: &ExchangeContext) -> Result<BoxedStream, DomainError> {
        let tcp = self.target.dial_tcp(ctx).await?;
        let Some(tls) = &self.tls else {
            return Ok(Box::new(tcp));
        };

        let server = self.target.addr().to_string();
        let timeout = self.target.dialer().connect_timeout();
        let stream = ctx
            .run(async {
                tokio::time::timeout(timeout, tls.connector.connect(tls.server_name.clone(), tcp))
                    .await
                    .map_err(|_| DomainError::TransportTimeout {
                        server: server.clone(),
                    })?
                    .map_err(|e| DomainError::from_io(server.clone(), e))
            })
            .await?;

        debug!(server = %server, "TLS connection established");
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl PoolManager for StreamConnector {
    type Item = BoxedStream;

    async fn create(&self, ctx: &ExchangeContext) -> Result<BoxedStream, DomainError> {
        self.open_stream(ctx).await
    }
}

#[async_trait]
impl PipelineConnector for StreamConnector {
    async fn connect(&self, ctx: &ExchangeContext) -> Result<PipelinedConn, DomainError> {
        let stream = self.open_stream(ctx).await?;
        Ok(PipelinedConn::new(stream, self.target.addr().to_string()))
    }
}

/// One framed exchange on an exclusively held stream. Replies carrying a
/// different ID are skipped.
pub async fn exchange_on_stream(
    ctx: &ExchangeContext,
    stream: &mut BoxedStream,
    query: &Message,
    server: &str,
) -> Result<Message, DomainError> {
    let bytes = encode(query)?;
    ctx.run(async {
        write_framed(stream, &bytes)
            .await
            .map_err(|e| DomainError::from_io(server, e))?;
        loop {
            let reply = read_framed(stream)
                .await
                .map_err(|e| DomainError::from_io(server, e))?;
            if wire_id(&reply) == Some(query.id()) {
                return decode(&reply);
            }
            trace!(server, "Skipping reply with foreign ID");
        }
    })
    .await
}

enum StreamMode {
    Exclusive(ConnPool<StreamConnector>),
    Pipeline(PipelinePool<StreamConnector>),
}

pub struct StreamUpstream {
    tag: String,
    kind: &'static str,
    target: Arc<ServerTarget>,
    mode: StreamMode,
}

impl StreamUpstream {
    /// Must be called inside a Tokio runtime; the pools spawn their sweepers.
    pub fn exclusive(
        tag: impl Into<String>,
        connector: StreamConnector,
        max_idle: usize,
        idle_timeout: Duration,
    ) -> Self {
        let kind = if connector.is_tls() { "tls" } else { "tcp" };
        let target = Arc::clone(&connector.target);
        Self {
            tag: tag.into(),
            kind,
            target,
            mode: StreamMode::Exclusive(ConnPool::new(connector, max_idle, idle_timeout)),
        }
    }

    pub fn pipelined(
        tag: impl Into<String>,
        connector: StreamConnector,
        max_conns: usize,
        idle_timeout: Duration,
    ) -> Self {
        let kind = if connector.is_tls() { "tls" } else { "tcp" };
        let target = Arc::clone(&connector.target);
        Self {
            tag: tag.into(),
            kind,
            target,
            mode: StreamMode::Pipeline(PipelinePool::new(connector, max_conns, idle_timeout)),
        }
    }

    pub fn is_pipelined(&self) -> bool {
        matches!(self.mode, StreamMode::Pipeline(_))
    }

    async fn exchange_exclusive(
        &self,
        pool: &ConnPool<StreamConnector>,
        ctx: &ExchangeContext,
        query: &Message,
    ) -> Result<Message, DomainError> {
        let server = self.target.addr().to_string();

        if let Some(mut stream) = pool.get_idle() {
            match exchange_on_stream(ctx, &mut stream, query, &server).await {
                Ok(response) => {
                    pool.put(stream);
                    return Ok(response);
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    debug!(server = %server, error = %e, "Pooled stream stale, reconnecting");
                }
            }
        }

        let mut stream = pool.create(ctx).await?;
        let response = exchange_on_stream(ctx, &mut stream, query, &server).await?;
        pool.put(stream);
        Ok(response)
    }
}

#[async_trait]
impl Upstream for StreamUpstream {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> &'static str {
        self.kind
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
        trace!(tag = %self.tag, log_id = ctx.log_id, "Stream exchange");
        match &self.mode {
            StreamMode::Exclusive(pool) => self.exchange_exclusive(pool, ctx, &query).await,
            StreamMode::Pipeline(pool) => pool.exchange(ctx, &query).await,
        }
    }

    async fn start(&self) -> Result<(), DomainError> {
        self.target.start();
        Ok(())
    }

    async fn close(&self) {
        match &self.mode {
            StreamMode::Exclusive(pool) => pool.close().await,
            StreamMode::Pipeline(pool) => pool.close().await,
        }
        self.target.close().await;
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("address".into(), json!(self.target.addr().to_string()));
        match &self.mode {
            StreamMode::Exclusive(pool) => {
                let stats = pool.stats();
                map.insert("idle".into(), json!(stats.idle));
                map.insert("created".into(), json!(stats.total_created));
                map.insert("reused".into(), json!(stats.total_reused));
            }
            StreamMode::Pipeline(pool) => {
                map.insert("connections".into(), json!(pool.connection_count()));
            }
        }
        map
    }
}
