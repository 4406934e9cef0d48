//! Back-pressure and retries at the backend boundary.
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{BackendError, Capacity};
use crate::config::BackendConfig;

/// Bounds the number of concurrent requests and the tokens they carry.
#[derive(Debug, Clone)]
pub struct Limiter {
    requests: Arc<Semaphore>,
    tokens: Arc<Semaphore>,
    token_budget: usize,
}

/// Held while a request is in flight.
#[derive(Debug)]
pub struct LimiterPermit {
    _request: OwnedSemaphorePermit,
    _tokens: Option<OwnedSemaphorePermit>,
}

impl Limiter {
    pub fn new(capacity: Capacity) -> Self {
        let token_budget = capacity.token_budget.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            requests: Arc::new(Semaphore::new(capacity.max_concurrent.max(1))),
            tokens: Arc::new(Semaphore::new(token_budget)),
            token_budget,
        }
    }

    /// Waits until a request carrying `tokens` tokens may be sent. Requests larger than
    /// the whole budget wait for the entire budget.
    pub async fn acquire(&self, tokens: usize) -> Result<LimiterPermit, BackendError> {
        let closed = |_| BackendError::Protocol("the limiter is closed".to_string());
        let request = self.requests.clone().acquire_owned().await.map_err(closed)?;
        let wanted = tokens.min(self.token_budget) as u32;
        let tokens = if wanted == 0 {
            None
        } else {
            Some(self.tokens.clone().acquire_many_owned(wanted).await.map_err(closed)?)
        };
        Ok(LimiterPermit {
            _request: request,
            _tokens: tokens,
        })
    }

    pub fn available_requests(&self) -> usize {
        self.requests.available_permits()
    }
}

/// Runs `f` with a per-attempt timeout, retrying timeouts and rate limits with
/// exponential backoff.
///
/// # Errors
///
/// Returns the last error once `max_retries` retries failed, or the first error that is
/// not transient.
pub async fn with_retries<T, F, Fut>(config: &BackendConfig, mut f: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(config.chunk_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        };
        match result {
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let backoff = config.initial_backoff * 2u32.saturating_pow(attempt);
                log::warn!(
                    "Backend request failed ({}), retrying in {:?} (attempt {} of {}).",
                    e,
                    backoff,
                    attempt + 1,
                    config.max_retries
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn config() -> BackendConfig {
        BackendConfig {
            chunk_timeout: Duration::from_millis(50),
            initial_backoff: Duration::from_millis(1),
            max_retries: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicUsize::new(0);
        let result = with_retries(&config(), || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(BackendError::RateLimit),
                _ => Ok(7),
            }
        })
        .await;
        assert!(matches!(result, Ok(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn protocol_errors_surface_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retries(&config(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Protocol("bad".into()))
        })
        .await;
        assert!(matches!(result, Err(BackendError::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_exhaust_retries() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retries(&config(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(BackendError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn limiter_bounds_concurrency() {
        let limiter = Limiter::new(Capacity {
            max_concurrent: 1,
            token_budget: 8,
        });
        let permit = limiter.acquire(100).await;
        assert!(permit.is_ok());
        assert_eq!(limiter.available_requests(), 0);
        drop(permit);
        assert_eq!(limiter.available_requests(), 1);
    }
}
