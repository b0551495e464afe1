use ferrous_forward_domain::DomainError;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Per-exchange parameters carried down through every upstream.
///
/// Cancelling the token aborts the exchange and everything derived from it
/// via [`ExchangeContext::child`].
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    pub log_id: u64,
    pub cancel: CancellationToken,
}

impl ExchangeContext {
    pub fn new() -> Self {
        Self {
            log_id: fastrand::u64(..),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_log_id(log_id: u64) -> Self {
        Self {
            log_id,
            cancel: CancellationToken::new(),
        }
    }

    /// Same log id, token cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            log_id: self.log_id,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs `fut` unless the context is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, DomainError>
    where
        F: Future<Output = Result<T, DomainError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DomainError::Cancelled),
            result = fut => result,
        }
    }
}

impl Default for ExchangeContext {
    fn default() -> Self {
        Self::new()
    }
}
