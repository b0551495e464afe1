use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream, UpstreamStatistics};
use ferrous_forward_domain::DomainError;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dns::message::build_query;

pub struct FallbackSettings {
    pub check_interval: Duration,
    pub test_domain: String,
    pub probe_timeout: Duration,
}

struct FallbackInner {
    tag: String,
    main: Arc<dyn Upstream>,
    fallback: Arc<dyn Upstream>,
    healthy: AtomicBool,
    settings: FallbackSettings,
}

impl FallbackInner {
    async fn probe_main(&self) -> bool {
        let Ok(query) = build_query(&self.settings.test_domain, RecordType::A) else {
            return false;
        };
        let ctx = ExchangeContext::new();
        let result =
            tokio::time::timeout(self.settings.probe_timeout, self.main.exchange(&ctx, query))
                .await;
        ctx.cancel.cancel();
        matches!(result, Ok(Ok(_)))
    }

    /// Waits for an unhealthy signal, then probes the main upstream every
    /// `check_interval` until it answers.
    async fn health_loop(&self, mut signal: mpsc::Receiver<()>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                received = signal.recv() => if received.is_none() { return },
            }

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.settings.check_interval) => {}
                }
                if self.probe_main().await {
                    self.healthy.store(true, Ordering::Release);
                    info!(tag = %self.tag, main = self.main.tag(), "Main upstream recovered");
                    break;
                }
                debug!(tag = %self.tag, main = self.main.tag(), "Main upstream still failing");
            }
        }
    }
}

/// Serves from `main` while it is healthy. A failed main exchange is
/// answered by `fallback`, and traffic stays there until a health probe
/// of `main` succeeds.
pub struct FallbackUpstream {
    inner: Arc<FallbackInner>,
    signal_tx: mpsc::Sender<()>,
    signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: UpstreamStatistics,
}

impl FallbackUpstream {
    pub fn new(
        tag: impl Into<String>,
        main: Arc<dyn Upstream>,
        fallback: Arc<dyn Upstream>,
        settings: FallbackSettings,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(FallbackInner {
                tag: tag.into(),
                main,
                fallback,
                healthy: AtomicBool::new(true),
                settings,
            }),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            stats: UpstreamStatistics::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    async fn route(&self, ctx: &ExchangeContext, query: Message) -> Result<Message, DomainError> {
        let inner = &*self.inner;
        if inner.healthy.load(Ordering::Acquire) {
            match inner.main.exchange(ctx, query.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(
                        tag = %inner.tag,
                        main = inner.main.tag(),
                        fallback = inner.fallback.tag(),
                        error = %e,
                        "Main upstream failed, switching to fallback"
                    );
                    if inner.healthy.swap(false, Ordering::AcqRel) {
                        let _ = self.signal_tx.try_send(());
                    }
                }
            }
        }
        inner.fallback.exchange(ctx, query).await
    }
}

#[async_trait]
impl Upstream for FallbackUpstream {
    fn tag(&self) -> &str {
        &self.inner.tag
    }

    fn kind(&self) -> &'static str {
        "fallback"
    }

    fn dependencies(&self) -> Vec<String> {
        vec![
            self.inner.main.tag().to_string(),
            self.inner.fallback.tag().to_string(),
        ]
    }

    async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        let result = self.route(ctx, query).await;
        self.stats.record(result.is_ok());
        result
    }

    async fn start(&self) -> Result<(), DomainError> {
        let Some(signal) = self.signal_rx.lock().take() else {
            return Ok(());
        };
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move { inner.health_loop(signal, shutdown).await });
        *self.task.lock() = Some(handle);
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
        map.insert("healthy".into(), json!(self.is_healthy()));
        map
    }
}
