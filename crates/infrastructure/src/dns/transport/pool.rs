use async_trait::async_trait;
use ferrous_forward_application::ports::ExchangeContext;
use ferrous_forward_domain::DomainError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_POOL_CAPACITY: usize = 16;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Creates, validates and destroys the items a [`ConnPool`] caches.
#[async_trait]
pub trait PoolManager: Send + Sync + 'static {
    type Item: Send + 'static;

    async fn create(&self, ctx: &ExchangeContext) -> Result<Self::Item, DomainError>;

    fn is_valid(&self, _item: &Self::Item) -> bool {
        true
    }

    fn destroy(&self, item: Self::Item) {
        drop(item);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub total_created: u64,
    pub total_reused: u64,
    pub total_destroyed: u64,
}

struct Idle<T> {
    value: T,
    last_use: Instant,
}

struct PoolInner<M: PoolManager> {
    manager: M,
    idle: Mutex<Vec<Idle<M::Item>>>,
    capacity: usize,
    idle_timeout: Duration,
    closed: AtomicBool,
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_destroyed: AtomicU64,
}

impl<M: PoolManager> PoolInner<M> {
    fn destroy(&self, item: M::Item) {
        self.total_destroyed.fetch_add(1, Ordering::Relaxed);
        self.manager.destroy(item);
    }

    fn sweep(&self) {
        let expired: Vec<M::Item> = {
            let mut idle = self.idle.lock();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < idle.len() {
                if idle[i].last_use.elapsed() > self.idle_timeout {
                    expired.push(idle.swap_remove(i).value);
                } else {
                    i += 1;
                }
            }
            expired
        };

        if !expired.is_empty() {
            debug!(count = expired.len(), "Evicting idle pooled connections");
        }
        for item in expired {
            self.destroy(item);
        }
    }
}

/// Idle-timeout-bounded cache of exclusive connections.
///
/// Items move out of the pool on `get` and back in on `put`, so one item is
/// never shared. Must be created inside a Tokio runtime.
pub struct ConnPool<M: PoolManager> {
    inner: Arc<PoolInner<M>>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<M: PoolManager> ConnPool<M> {
    pub fn new(manager: M, capacity: usize, idle_timeout: Duration) -> Self {
        let inner = Arc::new(PoolInner {
            manager,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            idle_timeout,
            closed: AtomicBool::new(false),
            total_created: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
            total_destroyed: AtomicU64::new(0),
        });

        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn({
            let inner = Arc::clone(&inner);
            let shutdown = shutdown.clone();
            async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => inner.sweep(),
                    }
                }
            }
        });

        Self {
            inner,
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Pops the most recently used idle item that is still valid.
    pub fn get_idle(&self) -> Option<M::Item> {
        loop {
            let candidate = self.inner.idle.lock().pop()?;
            if candidate.last_use.elapsed() <= self.inner.idle_timeout
                && self.inner.manager.is_valid(&candidate.value)
            {
                self.inner.total_reused.fetch_add(1, Ordering::Relaxed);
                return Some(candidate.value);
            }
            self.inner.destroy(candidate.value);
        }
    }

    /// Always opens a new item, bypassing the idle list.
    pub async fn create(&self, ctx: &ExchangeContext) -> Result<M::Item, DomainError> {
        if self.is_closed() {
            return Err(DomainError::PoolClosed);
        }
        let item = self.inner.manager.create(ctx).await?;
        self.inner.total_created.fetch_add(1, Ordering::Relaxed);

        if self.is_closed() {
            self.inner.destroy(item);
            return Err(DomainError::PoolClosed);
        }
        Ok(item)
    }

    pub async fn get(&self, ctx: &ExchangeContext) -> Result<M::Item, DomainError> {
        if self.is_closed() {
            return Err(DomainError::PoolClosed);
        }
        match self.get_idle() {
            Some(item) => Ok(item),
            None => self.create(ctx).await,
        }
    }

    pub fn put(&self, item: M::Item) {
        if self.is_closed() {
            self.inner.destroy(item);
            return;
        }

        let overflow = {
            let mut idle = self.inner.idle.lock();
            // `close` sets the flag before it drains.
            if !self.is_closed() && idle.len() < self.inner.capacity {
                idle.push(Idle {
                    value: item,
                    last_use: Instant::now(),
                });
                None
            } else {
                Some(item)
            }
        };

        if let Some(item) = overflow {
            self.inner.destroy(item);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops the sweeper and destroys every idle item. Later calls are no-ops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }

        let drained: Vec<Idle<M::Item>> = std::mem::take(&mut *self.inner.idle.lock());
        for item in drained {
            self.inner.destroy(item.value);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.idle.lock().len(),
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_reused: self.inner.total_reused.load(Ordering::Relaxed),
            total_destroyed: self.inner.total_destroyed.load(Ordering::Relaxed),
        }
    }
}

impl<M: PoolManager> Drop for ConnPool<M> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
