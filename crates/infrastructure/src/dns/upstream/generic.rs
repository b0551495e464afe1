use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream, UpstreamStatistics};
use ferrous_forward_domain::DomainError;
use hickory_proto::op::Message;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Bounded retries under one overall deadline, around a transport upstream.
pub struct GenericUpstream {
    inner: Arc<dyn Upstream>,
    query_timeout: Duration,
    retry: usize,
    stats: UpstreamStatistics,
}

impl GenericUpstream {
    pub fn new(inner: Arc<dyn Upstream>, query_timeout: Duration, retry: usize) -> Self {
        Self {
            inner,
            query_timeout,
            retry: retry.max(1),
            stats: UpstreamStatistics::new(),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Upstream> {
        &self.inner
    }

    async fn attempt(&self, ctx: &ExchangeContext, query: Message) -> Result<Message, DomainError> {
        let deadline = Instant::now() + self.query_timeout;
        let mut last_err = DomainError::QueryTimeout;

        for attempt in 1..=self.retry {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let exchange = ctx.run(self.inner.exchange(ctx, query.clone()));
            match tokio::time::timeout(remaining, exchange).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => {
                    debug!(
                        tag = self.inner.tag(),
                        log_id = ctx.log_id,
                        attempt,
                        error = %e,
                        "Exchange attempt failed"
                    );
                    last_err = e;
                }
                Err(_) => {
                    debug!(tag = self.inner.tag(), log_id = ctx.log_id, attempt, "Exchange timed out");
                    last_err = DomainError::QueryTimeout;
                }
            }
        }

        Err(last_err)
    }
}

#[async_trait]
impl Upstream for GenericUpstream {
    fn tag(&self) -> &str {
        self.inner.tag()
    }

    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn dependencies(&self) -> Vec<String> {
        self.inner.dependencies()
    }

    async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        let result = self.attempt(ctx, query).await;
        self.stats.record(result.is_ok());
        result
    }

    async fn start(&self) -> Result<(), DomainError> {
        self.inner.start().await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = self.inner.statistics();
        map.extend(self.stats.to_map());
        map
    }
}
