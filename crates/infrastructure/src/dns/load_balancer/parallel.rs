use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream, UpstreamStatistics};
use ferrous_forward_domain::DomainError;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use hickory_proto::op::Message;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::{member_tags, require_members};

/// Sends `query` to every member at once. The first success wins and the
/// rest are cancelled; when all fail the last error is returned.
pub async fn race_exchange(
    members: &[Arc<dyn Upstream>],
    ctx: &ExchangeContext,
    query: &Message,
) -> Result<Message, DomainError> {
    if members.is_empty() {
        return Err(DomainError::NoUpstreamAvailable(
            "no member upstreams".to_string(),
        ));
    }
    if members.len() == 1 {
        return members[0].exchange(ctx, query.clone()).await;
    }

    let race = ctx.child();
    let race = &race;
    let mut attempts: FuturesUnordered<_> = members
        .iter()
        .map(|member| {
            let query = query.clone();
            async move { (member.tag(), member.exchange(race, query).await) }
        })
        .collect();

    let mut last_err = None;
    let result = loop {
        match attempts.next().await {
            Some((_, Ok(response))) => break Ok(response),
            Some((tag, Err(e))) => {
                debug!(member = tag, error = %e, "Parallel member failed");
                last_err = Some(e);
            }
            None => break Err(last_err.unwrap_or(DomainError::AllUpstreamsFailed)),
        }
    };

    drop(attempts);
    race.cancel.cancel();
    result
}

pub struct ParallelUpstream {
    tag: String,
    members: Vec<Arc<dyn Upstream>>,
    stats: UpstreamStatistics,
}

impl std::fmt::Debug for ParallelUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelUpstream")
            .field("tag", &self.tag)
            .field("members", &self.members.len())
            .finish()
    }
}

impl ParallelUpstream {
    pub fn new(tag: impl Into<String>, members: Vec<Arc<dyn Upstream>>) -> Result<Self, DomainError> {
        let tag = tag.into();
        require_members(&tag, &members)?;
        Ok(Self {
            tag,
            members,
            stats: UpstreamStatistics::new(),
        })
    }
}

#[async_trait]
impl Upstream for ParallelUpstream {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> &'static str {
        "parallel"
    }

    fn dependencies(&self) -> Vec<String> {
        member_tags(&self.members)
    }

    async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        let result = race_exchange(&self.members, ctx, &query).await;
        self.stats.record(result.is_ok());
        result
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = self.stats.to_map();
        map.insert("members".into(), json!(member_tags(&self.members)));
        map
    }
}
