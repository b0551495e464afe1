use async_trait::async_trait;
use ferrous_forward_domain::DomainError;
use hickory_proto::op::Message;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ExchangeContext;

/// Anything that turns a DNS query into a reply.
///
/// Lifecycle hooks default to no-ops so callers can start and close every
/// upstream unconditionally.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn tag(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Tags that must be started before this upstream.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn exchange(&self, ctx: &ExchangeContext, query: Message)
        -> Result<Message, DomainError>;

    async fn start(&self) -> Result<(), DomainError> {
        Ok(())
    }

    async fn close(&self) {}

    fn statistics(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }
}

/// Total/success counters shared by upstreams that report statistics.
#[derive(Debug, Default)]
pub struct UpstreamStatistics {
    total: AtomicU64,
    success: AtomicU64,
}

impl UpstreamStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("total".into(), self.total().into());
        map.insert("success".into(), self.success().into());
        map
    }
}
