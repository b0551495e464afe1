//! Latency-based selection: probe every member periodically and route live
//! traffic to the fastest one, with a tolerance band against flapping.

use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream, UpstreamStatistics};
use ferrous_forward_domain::DomainError;
use futures::future::join_all;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{member_tags, require_members};
use crate::dns::message::build_query;

/// A candidate replaces the current selection only when it is faster by
/// more than `tolerance`.
pub fn should_switch(current: Duration, candidate: Duration, tolerance: Duration) -> bool {
    current > candidate + tolerance
}

pub struct QueryTestSettings {
    pub test_domain: String,
    pub interval: Duration,
    pub tolerance: Duration,
    pub probe_timeout: Duration,
}

struct QueryTestInner {
    tag: String,
    members: Vec<Arc<dyn Upstream>>,
    selected: AtomicUsize,
    settings: QueryTestSettings,
    latencies: Mutex<Vec<Option<Duration>>>,
}

impl QueryTestInner {
    async fn probe(&self, member: &Arc<dyn Upstream>) -> Option<Duration> {
        let query = build_query(&self.settings.test_domain, RecordType::A).ok()?;
        let ctx = ExchangeContext::new();
        let started = Instant::now();
        match tokio::time::timeout(self.settings.probe_timeout, member.exchange(&ctx, query)).await
        {
            Ok(Ok(_)) => Some(started.elapsed()),
            Ok(Err(e)) => {
                debug!(tag = %self.tag, member = member.tag(), error = %e, "Probe failed");
                None
            }
            Err(_) => {
                ctx.cancel.cancel();
                debug!(tag = %self.tag, member = member.tag(), "Probe timed out");
                None
            }
        }
    }

    async fn probe_round(&self) {
        let results: Vec<Option<Duration>> =
            join_all(self.members.iter().map(|m| self.probe(m))).await;
        self.apply(&results);
        *self.latencies.lock() = results;
    }

    fn apply(&self, results: &[Option<Duration>]) {
        let current = self.selected.load(Ordering::Acquire);
        let best = results
            .iter()
            .enumerate()
            .filter_map(|(i, latency)| latency.map(|l| (i, l)))
            .min_by_key(|(_, latency)| *latency);

        let Some((best, best_latency)) = best else {
            warn!(tag = %self.tag, "Every member failed its probe, keeping selection");
            return;
        };

        let switch = match results.get(current).copied().flatten() {
            None => true,
            Some(current_latency) => {
                best != current
                    && should_switch(current_latency, best_latency, self.settings.tolerance)
            }
        };

        if switch && best != current {
            self.selected.store(best, Ordering::Release);
            info!(
                tag = %self.tag,
                from = self.members[current].tag(),
                to = self.members[best].tag(),
                latency_ms = best_latency.as_millis() as u64,
                "Switched upstream"
            );
        }
    }
}

pub struct QueryTestUpstream {
    inner: Arc<QueryTestInner>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: UpstreamStatistics,
}

impl QueryTestUpstream {
    pub fn new(
        tag: impl Into<String>,
        members: Vec<Arc<dyn Upstream>>,
        settings: QueryTestSettings,
    ) -> Result<Self, DomainError> {
        let tag = tag.into();
        require_members(&tag, &members)?;
        let count = members.len();
        Ok(Self {
            inner: Arc::new(QueryTestInner {
                tag,
                members,
                selected: AtomicUsize::new(0),
                settings,
                latencies: Mutex::new(vec![None; count]),
            }),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            stats: UpstreamStatistics::new(),
        })
    }

    pub fn selected_tag(&self) -> &str {
        self.inner.members[self.inner.selected.load(Ordering::Acquire)].tag()
    }

    /// Runs one probe round and updates the selection.
    pub async fn probe_now(&self) {
        self.inner.probe_round().await;
    }
}

#[async_trait]
impl Upstream for QueryTestUpstream {
    fn tag(&self) -> &str {
        &self.inner.tag
    }

    fn kind(&self) -> &'static str {
        "querytest"
    }

    fn dependencies(&self) -> Vec<String> {
        member_tags(&self.inner.members)
    }

    async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        let member = &self.inner.members[self.inner.selected.load(Ordering::Acquire)];
        let result = member.exchange(ctx, query).await;
        self.stats.record(result.is_ok());
        result
    }

    async fn start(&self) -> Result<(), DomainError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => inner.probe_round().await,
                }
            }
        }));
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = self.stats.to_map();
        map.insert("selected".into(), json!(self.selected_tag()));
        let latencies: Map<String, Value> = self
            .inner
            .members
            .iter()
            .zip(self.inner.latencies.lock().iter())
            .map(|(m, l)| {
                let value = l.map_or(Value::Null, |l| json!(l.as_millis() as u64));
                (m.tag().to_string(), value)
            })
            .collect();
        map.insert("latency_ms".into(), Value::Object(latencies));
        map
    }
}
