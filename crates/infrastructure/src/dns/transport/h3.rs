//! DNS over HTTPS over HTTP/3.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use ferrous_forward_application::ports::{ExchangeContext, Upstream};
use ferrous_forward_domain::DomainError;
use hickory_proto::op::Message;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::doh::{
    endpoint_url, get_url, parse_reply, status_error, wire_query, DNS_MESSAGE_CONTENT_TYPE,
};
use super::quic_conn::{stream_err, QuicConnector};

type H3SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

struct H3Session {
    conn: quinn::Connection,
    send_request: H3SendRequest,
}

pub struct H3Upstream {
    tag: String,
    connector: QuicConnector,
    url: String,
    use_post: bool,
    session: tokio::sync::Mutex<Option<H3Session>>,
}

impl H3Upstream {
    /// `connector` must advertise ALPN `h3`.
    pub fn new(tag: impl Into<String>, connector: QuicConnector, path: &str, use_post: bool) -> Self {
        let url = endpoint_url(connector.server_name(), connector.target().addr(), path);
        Self {
            tag: tag.into(),
            connector,
            url,
            use_post,
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect_new(&self, ctx: &ExchangeContext) -> Result<H3Session, DomainError> {
        let conn = self.connector.dial(ctx).await?;
        let h3_conn = h3_quinn::Connection::new(conn.clone());
        let (mut driver, send_request) = ctx
            .run(async {
                h3::client::new(h3_conn).await.map_err(|e| {
                    DomainError::ProtocolError(format!(
                        "Failed to create H3 client for {}: {}",
                        self.url, e
                    ))
                })
            })
            .await?;

        tokio::spawn(async move {
            let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        debug!(tag = %self.tag, url = %self.url, "H3 session established");
        Ok(H3Session { conn, send_request })
    }

    /// Shared request handle; the flag is true when the session is new.
    async fn send_request(
        &self,
        ctx: &ExchangeContext,
    ) -> Result<(H3SendRequest, quinn::Connection, bool), DomainError> {
        let mut guard = ctx.run(async { Ok(self.session.lock().await) }).await?;
        if let Some(session) = guard.as_ref() {
            if session.conn.close_reason().is_none() {
                return Ok((session.send_request.clone(), session.conn.clone(), false));
            }
        }
        let session = self.connect_new(ctx).await?;
        let handle = (session.send_request.clone(), session.conn.clone(), true);
        *guard = Some(session);
        Ok(handle)
    }

    async fn discard(&self, stale: &quinn::Connection) {
        let mut guard = self.session.lock().await;
        if guard.as_ref().map(|s| s.conn.stable_id()) == Some(stale.stable_id()) {
            *guard = None;
        }
        stale.close(0u32.into(), b"");
    }

    async fn execute(
        &self,
        send_request: &mut H3SendRequest,
        query: &Message,
    ) -> Result<Message, DomainError> {
        let wire = wire_query(query)?;
        let (method, uri) = if self.use_post {
            ("POST", self.url.clone())
        } else {
            ("GET", get_url(&self.url, &wire))
        };

        let mut builder = http::Request::builder()
            .method(method)
            .uri(uri)
            .header("accept", DNS_MESSAGE_CONTENT_TYPE);
        if self.use_post {
            builder = builder.header("content-type", DNS_MESSAGE_CONTENT_TYPE);
        }
        let request = builder.body(()).map_err(|e| {
            DomainError::ProtocolError(format!("Failed to build H3 request: {}", e))
        })?;

        let mut stream = send_request
            .send_request(request)
            .await
            .map_err(|e| stream_err(&self.url, e))?;
        if self.use_post {
            stream
                .send_data(Bytes::from(wire))
                .await
                .map_err(|e| stream_err(&self.url, e))?;
        }
        stream.finish().await.map_err(|e| stream_err(&self.url, e))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|e| stream_err(&self.url, e))?;
        if !response.status().is_success() {
            return Err(status_error(&self.url, response.status().as_u16()));
        }

        let mut body = BytesMut::new();
        while let Some(mut chunk) = stream
            .recv_data()
            .await
            .map_err(|e| stream_err(&self.url, e))?
        {
            body.extend_from_slice(chunk.chunk());
            chunk.advance(chunk.remaining());
        }

        parse_reply(query, &body)
    }
}

#[async_trait]
impl Upstream for H3Upstream {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> &'static str {
        "h3"
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
        let (mut send_request, conn, fresh) = self.send_request(ctx).await?;
        match ctx.run(self.execute(&mut send_request, &query)).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_cancellation() || fresh => return Err(e),
            Err(e) => {
                debug!(url = %self.url, error = %e, "H3 connection stale, reconnecting");
                self.discard(&conn).await;
            }
        }

        let (mut send_request, _, _) = self.send_request(ctx).await?;
        ctx.run(self.execute(&mut send_request, &query)).await
    }

    async fn start(&self) -> Result<(), DomainError> {
        self.connector.target().start();
        Ok(())
    }

    async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.conn.close(0u32.into(), b"");
        }
        self.connector.close().await;
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("url".into(), json!(self.url));
        map
    }
}
