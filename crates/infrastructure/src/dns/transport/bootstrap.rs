use arc_swap::ArcSwapOption;
use ferrous_forward_application::ports::{ExchangeContext, Upstream};
use ferrous_forward_domain::{BootstrapStrategy, DomainError};
use hickory_proto::rr::RecordType;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dns::message::{answer_ips, build_query};

#[derive(Debug)]
struct CachedIps {
    domain: Arc<str>,
    ips: Arc<Vec<IpAddr>>,
    cached_at: Instant,
}

/// Resolves a domain-named server through another configured upstream.
///
/// The cache lives for `cache_ttl` regardless of record TTLs. Concurrent
/// refreshes collapse onto one query through `refresh_lock`.
pub struct Bootstrap {
    upstream: Arc<dyn Upstream>,
    strategy: BootstrapStrategy,
    cache_ttl: Duration,
    cache: Arc<ArcSwapOption<CachedIps>>,
    refresh_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    ticker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Bootstrap {
    pub fn new(upstream: Arc<dyn Upstream>, strategy: BootstrapStrategy, cache_ttl: Duration) -> Self {
        Self {
            upstream,
            strategy,
            cache_ttl,
            cache: Arc::new(ArcSwapOption::empty()),
            refresh_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            ticker: parking_lot::Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> BootstrapStrategy {
        self.strategy
    }

    pub fn upstream_tag(&self) -> &str {
        self.upstream.tag()
    }

    fn fresh(&self, domain: &str) -> Option<Arc<Vec<IpAddr>>> {
        let cached = self.cache.load_full()?;
        if &*cached.domain == domain && cached.cached_at.elapsed() < self.cache_ttl {
            return Some(Arc::clone(&cached.ips));
        }
        None
    }

    pub async fn lookup(
        &self,
        ctx: &ExchangeContext,
        domain: &str,
    ) -> Result<Arc<Vec<IpAddr>>, DomainError> {
        if let Some(ips) = self.fresh(domain) {
            return Ok(ips);
        }

        let _refresh = ctx.run(async { Ok(self.refresh_lock.lock().await) }).await?;
        if let Some(ips) = self.fresh(domain) {
            return Ok(ips);
        }

        let ips = self.resolve(ctx, domain).await.map_err(|e| {
            if e.is_cancellation() {
                e
            } else {
                DomainError::BootstrapFailed {
                    domain: domain.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        debug!(
            domain,
            upstream = self.upstream.tag(),
            addresses = ips.len(),
            "Bootstrap resolved server address"
        );
        let ips = Arc::new(ips);
        self.cache.store(Some(Arc::new(CachedIps {
            domain: domain.into(),
            ips: Arc::clone(&ips),
            cached_at: Instant::now(),
        })));
        Ok(ips)
    }

    async fn resolve(&self, ctx: &ExchangeContext, domain: &str) -> Result<Vec<IpAddr>, DomainError> {
        match self.strategy {
            BootstrapStrategy::Ipv4Only => self.query(ctx, domain, RecordType::A).await,
            BootstrapStrategy::Ipv6Only => self.query(ctx, domain, RecordType::AAAA).await,
            BootstrapStrategy::Ipv4Prefer => {
                race_families(ctx, |c| self.query_owned(c, domain, RecordType::A), |c| {
                    self.query_owned(c, domain, RecordType::AAAA)
                })
                .await
            }
            BootstrapStrategy::Ipv6Prefer => {
                race_families(ctx, |c| self.query_owned(c, domain, RecordType::AAAA), |c| {
                    self.query_owned(c, domain, RecordType::A)
                })
                .await
            }
        }
    }

    async fn query_owned(
        &self,
        ctx: ExchangeContext,
        domain: &str,
        record_type: RecordType,
    ) -> Result<Vec<IpAddr>, DomainError> {
        self.query(&ctx, domain, record_type).await
    }

    async fn query(
        &self,
        ctx: &ExchangeContext,
        domain: &str,
        record_type: RecordType,
    ) -> Result<Vec<IpAddr>, DomainError> {
        let query = build_query(domain, record_type)?;
        let response = self.upstream.exchange(ctx, query).await?;
        let want_v4 = record_type == RecordType::A;
        let ips: Vec<IpAddr> = answer_ips(&response)
            .into_iter()
            .filter(|ip| ip.is_ipv4() == want_v4)
            .collect();
        if ips.is_empty() {
            return Err(DomainError::InvalidDnsResponse(format!(
                "no {} records for {} (rcode {})",
                record_type,
                domain,
                response.response_code()
            )));
        }
        Ok(ips)
    }

    /// Spawns the ticker that drops an expired cache entry.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let ttl = self.cache_ttl;
        let shutdown = self.shutdown.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let stale = matches!(
                            &*cache.load(),
                            Some(c) if c.cached_at.elapsed() >= ttl
                        );
                        if stale {
                            cache.store(None);
                        }
                    }
                }
            }
        }));
        info!(upstream = self.upstream.tag(), strategy = self.strategy.as_str(), "Bootstrap started");
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.ticker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Resolves both families concurrently. The preferred family wins as soon
/// as it answers, picking up the other family's result if that already
/// arrived; the other family is used alone only when the preferred fails.
pub async fn race_families<P, O, PF, OF>(
    ctx: &ExchangeContext,
    preferred: P,
    other: O,
) -> Result<Vec<IpAddr>, DomainError>
where
    P: FnOnce(ExchangeContext) -> PF,
    O: FnOnce(ExchangeContext) -> OF,
    PF: std::future::Future<Output = Result<Vec<IpAddr>, DomainError>>,
    OF: std::future::Future<Output = Result<Vec<IpAddr>, DomainError>>,
{
    let race = ctx.child();
    let preferred = preferred(race.clone());
    let other = other(race.clone());
    tokio::pin!(preferred, other);

    let mut preferred_err: Option<DomainError> = None;
    let mut other_done: Option<Result<Vec<IpAddr>, DomainError>> = None;

    let result = loop {
        tokio::select! {
            result = &mut preferred, if preferred_err.is_none() => match result {
                Ok(mut ips) => {
                    if let Some(Ok(extra)) = other_done.take() {
                        ips.extend(extra);
                    }
                    break Ok(ips);
                }
                Err(e) => match other_done.take() {
                    Some(Ok(ips)) => break Ok(ips),
                    Some(Err(_)) => break Err(e),
                    None => preferred_err = Some(e),
                },
            },
            result = &mut other, if other_done.is_none() => {
                if preferred_err.is_some() {
                    break result;
                }
                other_done = Some(result);
            }
        }
    };

    race.cancel.cancel();
    result
}
