//! DNS over QUIC (RFC 9250).

use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream};
use ferrous_forward_domain::DomainError;
use hickory_proto::op::Message;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::framing::{read_framed, write_framed};
use super::quic_conn::{stream_err, QuicConnector};
use crate::dns::message::{decode, encode, set_message_id};

pub struct QuicUpstream {
    tag: String,
    connector: QuicConnector,
}

impl QuicUpstream {
    pub fn new(tag: impl Into<String>, connector: QuicConnector) -> Self {
        Self {
            tag: tag.into(),
            connector,
        }
    }

    /// One query per bidirectional stream, sent with ID 0.
    async fn send_on_stream(
        conn: &quinn::Connection,
        query: &Message,
        server: &str,
    ) -> Result<Message, DomainError> {
        let mut wire = query.clone();
        set_message_id(&mut wire, 0);
        let bytes = encode(&wire)?;

        let (mut send, mut recv) = conn.open_bi().await.map_err(|e| stream_err(server, e))?;
        write_framed(&mut send, &bytes)
            .await
            .map_err(|e| DomainError::from_io(server, e))?;
        send.finish().map_err(|e| stream_err(server, e))?;

        let reply = read_framed(&mut recv)
            .await
            .map_err(|e| DomainError::from_io(server, e))?;
        let mut response = decode(&reply)?;
        set_message_id(&mut response, query.id());
        Ok(response)
    }
}

#[async_trait]
impl Upstream for QuicUpstream {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> &'static str {
        "quic"
    }

    fn dependencies(&self) -> Vec<String> {
        self.connector
            .target()
            .bootstrap()
            .map(|b| vec![b.upstream_tag().to_string()])
            .unwrap_or_default()
    }

    async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        let server = self.connector.target().addr().to_string();
        let (conn, fresh) = self.connector.connection(ctx).await?;

        match ctx.run(Self::send_on_stream(&conn, &query, &server)).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_cancellation() || fresh => return Err(e),
            Err(e) => {
                debug!(server = %server, error = %e, "QUIC connection stale, reconnecting");
                self.connector.discard(&conn).await;
            }
        }

        let (conn, _) = self.connector.connection(ctx).await?;
        ctx.run(Self::send_on_stream(&conn, &query, &server)).await
    }

    async fn start(&self) -> Result<(), DomainError> {
        self.connector.target().start();
        Ok(())
    }

    async fn close(&self) {
        self.connector.close().await;
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            "address".into(),
            json!(self.connector.target().addr().to_string()),
        );
        map.insert("server_name".into(), json!(self.connector.server_name()));
        map
    }
}
