//! DNS over UDP (RFC 1035 §4.2.1) with optional TCP fallback.

use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream};
use ferrous_forward_domain::DomainError;
use hickory_proto::op::{Message, ResponseCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::dialer::PacketConn;
use super::pool::{ConnPool, PoolManager};
use super::stream::StreamUpstream;
use super::target::ServerTarget;
use crate::dns::message::{
    decode, encode, response_to, set_message_id, set_wire_id, wire_id,
};

/// Largest query sent over UDP without EDNS negotiation.
pub const MAX_UDP_QUERY_SIZE: usize = 512;

pub struct PacketConnector {
    target: Arc<ServerTarget>,
}

#[async_trait]
impl PoolManager for PacketConnector {
    type Item = PacketConn;

    async fn create(&self, ctx: &ExchangeContext) -> Result<PacketConn, DomainError> {
        self.target.dial_udp(ctx).await
    }
}

pub struct UdpUpstream {
    tag: String,
    target: Arc<ServerTarget>,
    pool: ConnPool<PacketConnector>,
    tcp_fallback: Option<StreamUpstream>,
}

impl UdpUpstream {
    pub fn new(
        tag: impl Into<String>,
        target: Arc<ServerTarget>,
        max_idle: usize,
        idle_timeout: Duration,
        tcp_fallback: Option<StreamUpstream>,
    ) -> Self {
        let connector = PacketConnector {
            target: Arc::clone(&target),
        };
        Self {
            tag: tag.into(),
            target,
            pool: ConnPool::new(connector, max_idle, idle_timeout),
            tcp_fallback,
        }
    }

    pub fn has_tcp_fallback(&self) -> bool {
        self.tcp_fallback.is_some()
    }

    async fn exchange_udp(
        &self,
        ctx: &ExchangeContext,
        query: &Message,
        mut bytes: Vec<u8>,
    ) -> Result<Message, DomainError> {
        let conn = match self.pool.get_idle() {
            Some(conn) => conn,
            None => self.pool.create(ctx).await?,
        };

        let id = fastrand::u16(..);
        set_wire_id(&mut bytes, id);

        let result = ctx
            .run(async {
                conn.send(&bytes).await?;
                loop {
                    let reply = conn.recv().await?;
                    if wire_id(&reply.payload) != Some(id) {
                        trace!(tag = %self.tag, "Skipping datagram with foreign ID");
                        continue;
                    }
                    if reply.clipped {
                        debug!(tag = %self.tag, "UDP reply exceeded the receive buffer");
                        let mut response = response_to(query, ResponseCode::NoError);
                        response.set_truncated(true);
                        return Ok(response);
                    }
                    return decode(&reply.payload);
                }
            })
            .await;

        // A socket that failed mid-exchange may still deliver a late reply.
        let mut response = result?;
        self.pool.put(conn);
        set_message_id(&mut response, query.id());
        Ok(response)
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> &'static str {
        "udp"
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
        let bytes = encode(&query)?;
        if bytes.len() > MAX_UDP_QUERY_SIZE {
            return match &self.tcp_fallback {
                Some(tcp) => {
                    debug!(tag = %self.tag, size = bytes.len(), "Query too large for UDP, using TCP");
                    tcp.exchange(ctx, query).await
                }
                None => Err(DomainError::MessageTooLarge(bytes.len())),
            };
        }

        let response = self.exchange_udp(ctx, &query, bytes).await?;
        if response.truncated() {
            if let Some(tcp) = &self.tcp_fallback {
                debug!(tag = %self.tag, "Truncated UDP reply, retrying over TCP");
                return tcp.exchange(ctx, query).await;
            }
        }
        Ok(response)
    }

    async fn start(&self) -> Result<(), DomainError> {
        self.target.start();
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        if let Some(tcp) = &self.tcp_fallback {
            tcp.close().await;
        }
        self.target.close().await;
    }

    fn statistics(&self) -> Map<String, Value> {
        let stats = self.pool.stats();
        let mut map = Map::new();
        map.insert("address".into(), json!(self.target.addr().to_string()));
        map.insert("idle".into(), json!(stats.idle));
        map.insert("created".into(), json!(stats.total_created));
        map.insert("reused".into(), json!(stats.total_reused));
        map
    }
}
