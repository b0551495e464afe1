use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream, UpstreamStatistics};
use ferrous_forward_domain::DomainError;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::trace;

use super::{member_tags, require_members};

/// Sends each query to one member picked uniformly at random.
pub struct RandomUpstream {
    tag: String,
    members: Vec<Arc<dyn Upstream>>,
    rng: Mutex<fastrand::Rng>,
    stats: UpstreamStatistics,
}

impl std::fmt::Debug for RandomUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomUpstream")
            .field("tag", &self.tag)
            .field("members", &self.members.len())
            .finish()
    }
}

impl RandomUpstream {
    pub fn new(tag: impl Into<String>, members: Vec<Arc<dyn Upstream>>) -> Result<Self, DomainError> {
        Self::with_rng(tag, members, fastrand::Rng::new())
    }

    pub fn with_seed(
        tag: impl Into<String>,
        members: Vec<Arc<dyn Upstream>>,
        seed: u64,
    ) -> Result<Self, DomainError> {
        Self::with_rng(tag, members, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(
        tag: impl Into<String>,
        members: Vec<Arc<dyn Upstream>>,
        rng: fastrand::Rng,
    ) -> Result<Self, DomainError> {
        let tag = tag.into();
        require_members(&tag, &members)?;
        Ok(Self {
            tag,
            members,
            rng: Mutex::new(rng),
            stats: UpstreamStatistics::new(),
        })
    }

    fn pick(&self) -> &Arc<dyn Upstream> {
        let index = self.rng.lock().usize(..self.members.len());
        &self.members[index]
    }
}

#[async_trait]
impl Upstream for RandomUpstream {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> &'static str {
        "random"
    }

    fn dependencies(&self) -> Vec<String> {
        member_tags(&self.members)
    }

    async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        let member = self.pick();
        trace!(tag = %self.tag, member = member.tag(), log_id = ctx.log_id, "Random pick");
        let result = member.exchange(ctx, query).await;
        self.stats.record(result.is_ok());
        result
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = self.stats.to_map();
        map.insert("members".into(), json!(member_tags(&self.members)));
        map
    }
}
