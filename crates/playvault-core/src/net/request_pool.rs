//! Request pool - bounded-concurrency executor for outbound provider calls
//!
//! Jobs are admitted through a semaphore, paced through the adaptive
//! limiter's current delay, and retried with exponential backoff until
//! the attempt ceiling. Pacing is a single critical section holding the
//! earliest-next-dispatch instant: a job reserves its slot and then
//! sleeps, so two jobs can never race past the gate together.

use crate::error::TransferError;
use crate::net::cache::ResponseCache;
use crate::net::rate_limiter::AdaptiveRateLimiter;
use playvault_types::RequestPoolStats;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

const BACKOFF_MULTIPLIER: f64 = 2.0;

#[derive(Default)]
struct Stats {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    queued: AtomicU64,
    executing: AtomicU64,
}

#[derive(Clone)]
pub struct RequestPool {
    semaphore: Arc<Semaphore>,
    limiter: AdaptiveRateLimiter,
    cache: ResponseCache,
    /// Earliest instant the next job may dispatch at
    gate: Arc<Mutex<Instant>>,
    retry_attempts: u32,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
    stats: Arc<Stats>,
}

impl RequestPool {
    pub fn new(
        max_concurrent: usize,
        retry_attempts: u32,
        initial_retry_delay: Duration,
        max_retry_delay: Duration,
        limiter: AdaptiveRateLimiter,
        cache: ResponseCache,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            limiter,
            cache,
            gate: Arc::new(Mutex::new(Instant::now())),
            retry_attempts,
            initial_retry_delay,
            max_retry_delay,
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Run `job` under the pool's concurrency cap and pacing, retrying
    /// failures. Fails with the job's last error once retries are
    /// exhausted.
    pub async fn execute<T, F, Fut>(&self, context: &str, job: F) -> Result<T, TransferError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        self.stats.total.fetch_add(1, Ordering::AcqRel);
        self.stats.queued.fetch_add(1, Ordering::AcqRel);
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TransferError::Unknown("request pool closed".into()))?;
        self.stats.queued.fetch_sub(1, Ordering::AcqRel);
        self.stats.executing.fetch_add(1, Ordering::AcqRel);

        let result = self.run_attempts(context, &job).await;

        self.stats.executing.fetch_sub(1, Ordering::AcqRel);
        drop(permit);

        match result {
            Ok(value) => {
                self.stats.success.fetch_add(1, Ordering::AcqRel);
                Ok(value)
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// JSON fetch with a cache consult before any dispatch; successful
    /// results are stored under `key`.
    pub async fn execute_cached<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        context: &str,
        job: F,
    ) -> Result<Value, TransferError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, TransferError>>,
    {
        if let Some(hit) = self.cache.get(key) {
            debug!("Cache hit for {} ({})", key, context);
            return Ok(hit);
        }
        let value = self.execute(context, job).await?;
        self.cache.set(key, value.clone(), ttl);
        Ok(value)
    }

    pub fn stats(&self) -> RequestPoolStats {
        RequestPoolStats {
            total: self.stats.total.load(Ordering::Acquire),
            success: self.stats.success.load(Ordering::Acquire),
            failed: self.stats.failed.load(Ordering::Acquire),
            retried: self.stats.retried.load(Ordering::Acquire),
            queue_length: self.stats.queued.load(Ordering::Acquire),
            executing: self.stats.executing.load(Ordering::Acquire),
        }
    }

    async fn run_attempts<T, F, Fut>(&self, context: &str, job: &F) -> Result<T, TransferError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.pace().await;

            match job().await {
                Ok(value) => {
                    self.limiter.record_success().await;
                    return Ok(value);
                }
                Err(e) => {
                    self.limiter.record_failure(e.status_code()).await;
                    if attempt >= self.retry_attempts {
                        warn!(
                            "Job '{}' failed after {} attempts: {}",
                            context,
                            attempt + 1,
                            e
                        );
                        return Err(e);
                    }
                    attempt += 1;
                    self.stats.retried.fetch_add(1, Ordering::AcqRel);
                    let backoff = Duration::from_secs_f64(
                        self.initial_retry_delay.as_secs_f64()
                            * BACKOFF_MULTIPLIER.powi(attempt as i32 - 1),
                    )
                    .min(self.max_retry_delay);
                    debug!(
                        "Job '{}' attempt {} failed ({}), backing off {:?}",
                        context, attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Reserve a dispatch slot. The check of the last dispatch time and
    /// its update happen under one lock, then the sleep runs outside it.
    async fn pace(&self) {
        let delay = self.limiter.current_delay().await;
        let dispatch_at = {
            let mut next = self.gate.lock().await;
            let at = (*next).max(Instant::now());
            *next = at + delay;
            at
        };
        tokio::time::sleep_until(dispatch_at).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    fn pool(max_concurrent: usize, retry_attempts: u32) -> RequestPool {
        RequestPool::new(
            max_concurrent,
            retry_attempts,
            Duration::from_millis(5),
            Duration::from_millis(50),
            AdaptiveRateLimiter::new(
                Duration::from_millis(1),
                2.0,
                Duration::from_millis(100),
                10,
            ),
            ResponseCache::new(Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_cap() {
        let pool = pool(5, 0);
        let current = Arc::new(AtomicI64::new(0));
        let peak = Arc::new(AtomicI64::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.execute("probe", || {
                    let current = current.clone();
                    let peak = peak.clone();
                    async move {
                        let now = current.fetch_add(1, Ordering::AcqRel) + 1;
                        peak.fetch_max(now, Ordering::AcqRel);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::AcqRel);
                        Ok::<_, TransferError>(())
                    }
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::Acquire) <= 5);
        let stats = pool.stats();
        assert_eq!(stats.total, 12);
        assert_eq!(stats.success, 12);
        assert_eq!(stats.executing, 0);
        assert_eq!(stats.queue_length, 0);
    }

    #[tokio::test]
    async fn rate_limited_job_recovers_within_the_retry_budget() {
        let pool = pool(5, 5);
        let failures = Arc::new(AtomicU64::new(0));

        let f = failures.clone();
        let result = pool
            .execute("flaky-metadata", move || {
                let f = f.clone();
                async move {
                    if f.fetch_add(1, Ordering::AcqRel) < 3 {
                        Err(TransferError::RateLimited { status: 429 })
                    } else {
                        Ok(7u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        let stats = pool.stats();
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 0);
        // Three 429s raised the limiter's level
        assert_eq!(pool.limiter().backoff_level().await, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let pool = pool(2, 2);
        let result: Result<(), _> = pool
            .execute("doomed", || async {
                Err(TransferError::ServerError {
                    status: 500,
                    message: "boom".into(),
                })
            })
            .await;

        match result {
            Err(TransferError::ServerError { status: 500, .. }) => {}
            other => panic!("unexpected {:?}", other.err()),
        }
        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 2);
    }

    #[tokio::test]
    async fn cached_execute_skips_dispatch_on_hit() {
        let pool = pool(2, 0);
        let calls = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value = pool
                .execute_cached("game:1", None, "metadata", move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::AcqRel);
                        Ok(serde_json::json!({"id": 1}))
                    }
                })
                .await
                .unwrap();
            assert_eq!(value["id"], 1);
        }
        assert_eq!(calls.load(Ordering::Acquire), 1);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn pacing_spaces_dispatches_by_the_limiter_delay() {
        let limiter =
            AdaptiveRateLimiter::new(Duration::from_millis(30), 2.0, Duration::from_secs(1), 10);
        let pool = RequestPool::new(
            4,
            0,
            Duration::from_millis(5),
            Duration::from_millis(50),
            limiter,
            ResponseCache::new(Duration::from_secs(60)),
        );

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.execute("paced", || async { Ok::<_, TransferError>(()) })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        // Four dispatches 30ms apart: the last cannot start before 90ms
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
