use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use atelier_core::{EngineError, RateLimits};

/// Snapshot of one limiter's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterMetrics {
    pub active: u32,
    pub queued: u32,
    pub limit: u32,
}

/// Bounded-concurrency gate for one provider class.
///
/// At most `limit` operations run at once; the rest queue FIFO (the tokio
/// semaphore admits waiters in arrival order). A queued call observing a
/// cancelled run fails fast with [`EngineError::Cancelled`] without running
/// its operation. Permits are released on completion, success or failure.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicU32>,
    queued: Arc<AtomicU32>,
    limit: u32,
}

impl RateLimiter {
    /// `limit` must be >= 1; this is enforced by config validation upstream.
    pub fn new(limit: u32) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit as usize)),
            active: Arc::new(AtomicU32::new(0)),
            queued: Arc::new(AtomicU32::new(0)),
            limit,
        }
    }

    pub fn metrics(&self) -> LimiterMetrics {
        LimiterMetrics {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            limit: self.limit,
        }
    }

    /// Run `op` under one of the `limit` permits.
    ///
    /// The cancel token is polled before queueing and while waiting for a
    /// permit; `op` itself is responsible for honoring the token at its own
    /// suspension points.
    pub async fn execute<F, T>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Cancelled);
            }
            permit = self.semaphore.clone().acquire_owned() => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                permit.map_err(|_| EngineError::provider("rate limiter closed"))?
            }
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let out = op.await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
        out
    }
}

/// The three limiter instances, keyed by provider class.
///
/// One bundle is shared by every run that uses it, so `metrics()` snapshots
/// reflect global load rather than per-run load.
#[derive(Debug, Clone)]
pub struct ProviderLimiters {
    pub text: RateLimiter,
    pub image: RateLimiter,
    pub vision: RateLimiter,
}

impl ProviderLimiters {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            text: RateLimiter::new(limits.text),
            image: RateLimiter::new(limits.image),
            vision: RateLimiter::new(limits.vision),
        }
    }

    /// The process-wide default bundle, created at first use and live for
    /// the rest of the process. Concurrent runs with default limits all
    /// share it.
    pub fn global() -> Arc<ProviderLimiters> {
        static GLOBAL: OnceLock<Arc<ProviderLimiters>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(ProviderLimiters::new(RateLimits::default())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn executes_immediately_under_limit() {
        let limiter = RateLimiter::new(2);
        let cancel = CancellationToken::new();
        let out = limiter
            .execute(&cancel, async { Ok::<_, EngineError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(
            limiter.metrics(),
            LimiterMetrics {
                active: 0,
                queued: 0,
                limit: 2
            }
        );
    }

    #[tokio::test]
    async fn cancelled_token_fails_fast_without_running_op() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_inner = ran.clone();
        let err = limiter
            .execute(&cancel, async move {
                ran_inner.store(true, Ordering::SeqCst);
                Ok::<_, EngineError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err, EngineError::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn queued_waiter_observes_cancellation() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();

        // Hold the only permit so the second call queues.
        let gate = Arc::new(tokio::sync::Notify::new());
        let holder = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                limiter
                    .execute(&cancel, async move {
                        gate.notified().await;
                        Ok::<_, EngineError>(())
                    })
                    .await
            })
        };

        // Wait until the holder is active.
        while limiter.metrics().active == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let queued = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                limiter
                    .execute(&cancel, async { Ok::<_, EngineError>(()) })
                    .await
            })
        };

        while limiter.metrics().queued == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        cancel.cancel();
        assert_eq!(queued.await.unwrap(), Err(EngineError::Cancelled));

        gate.notify_one();
        // The holder's op was already running when the token flipped; its
        // own result is whatever the op returned.
        let _ = holder.await.unwrap();
        assert_eq!(limiter.metrics().queued, 0);
    }

    #[tokio::test]
    async fn permit_released_on_failure() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();

        let err = limiter
            .execute(&cancel, async {
                Err::<(), _>(EngineError::provider("boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));

        // The permit must be available again.
        let out = limiter
            .execute(&cancel, async { Ok::<_, EngineError>(1) })
            .await
            .unwrap();
        assert_eq!(out, 1);
    }
}
