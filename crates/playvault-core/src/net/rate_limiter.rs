//! Adaptive rate limiter for quota-limited external dependencies
//!
//! Tracks consecutive success/failure streaks and derives the current
//! inter-request delay as `base * multiplier^level`, clamped to a
//! ceiling. Only rate-limit-class responses (429/503) move the backoff
//! level up; a sustained success streak moves it back down. Ordinary
//! failures are the pool's business and leave the level alone.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Cloneable handle shared by every job going to one dependency
#[derive(Clone)]
pub struct AdaptiveRateLimiter {
    state: Arc<Mutex<LimiterState>>,
}

struct LimiterState {
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    recovery_threshold: u32,
    level: u32,
    current_delay: Duration,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl LimiterState {
    fn recompute(&mut self) {
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(self.level as i32);
        self.current_delay = Duration::from_secs_f64(scaled).min(self.max_delay);
    }
}

impl AdaptiveRateLimiter {
    pub fn new(
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        recovery_threshold: u32,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                base_delay,
                multiplier,
                max_delay,
                recovery_threshold: recovery_threshold.max(1),
                level: 0,
                current_delay: base_delay,
                consecutive_successes: 0,
                consecutive_failures: 0,
            })),
        }
    }

    /// Delay a job should leave after the previous dispatch
    pub async fn current_delay(&self) -> Duration {
        self.state.lock().await.current_delay
    }

    pub async fn backoff_level(&self) -> u32 {
        self.state.lock().await.level
    }

    /// Failures since the last success, of any class
    pub async fn failure_streak(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    /// A success resets the failure streak; enough of them in a row
    /// step the backoff level down one notch.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
        state.consecutive_successes += 1;
        if state.level > 0 && state.consecutive_successes >= state.recovery_threshold {
            state.level -= 1;
            state.consecutive_successes = 0;
            state.recompute();
            debug!(
                "Rate limiter recovered to level {} (delay {:?})",
                state.level, state.current_delay
            );
        }
    }

    /// Only 429/503 raise the backoff level; other failures just break
    /// the success streak.
    pub async fn record_failure(&self, status: Option<u16>) {
        let mut state = self.state.lock().await;
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        if matches!(status, Some(429) | Some(503)) {
            state.level += 1;
            state.recompute();
            debug!(
                "Rate limiter backed off to level {} (delay {:?})",
                state.level, state.current_delay
            );
        }
    }

    /// Restore the original delay and zero every counter
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.level = 0;
        state.consecutive_successes = 0;
        state.consecutive_failures = 0;
        state.recompute();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(Duration::from_millis(100), 2.0, Duration::from_secs(60), 10)
    }

    #[tokio::test]
    async fn rate_limit_failures_raise_level_monotonically() {
        let l = limiter();
        for expected in 1..=3 {
            l.record_failure(Some(429)).await;
            assert_eq!(l.backoff_level().await, expected);
        }
        // base * multiplier^3
        assert_eq!(l.current_delay().await, Duration::from_millis(800));
    }

    #[tokio::test]
    async fn ordinary_failures_leave_the_level_alone() {
        let l = limiter();
        l.record_failure(Some(500)).await;
        l.record_failure(None).await;
        assert_eq!(l.backoff_level().await, 0);
        assert_eq!(l.current_delay().await, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn ten_successes_step_down_exactly_one_level() {
        let l = limiter();
        l.record_failure(Some(429)).await;
        l.record_failure(Some(429)).await;
        assert_eq!(l.backoff_level().await, 2);

        for _ in 0..9 {
            l.record_success().await;
        }
        assert_eq!(l.backoff_level().await, 2);
        l.record_success().await;
        assert_eq!(l.backoff_level().await, 1);
        assert_eq!(l.current_delay().await, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn failure_resets_the_success_streak() {
        let l = limiter();
        l.record_failure(Some(429)).await;
        for _ in 0..9 {
            l.record_success().await;
        }
        l.record_failure(Some(500)).await;
        // The streak starts over; nine more successes are not enough
        for _ in 0..9 {
            l.record_success().await;
        }
        assert_eq!(l.backoff_level().await, 1);
    }

    #[tokio::test]
    async fn failure_streak_counts_every_failure_class() {
        let l = limiter();
        l.record_failure(Some(500)).await;
        l.record_failure(None).await;
        l.record_failure(Some(429)).await;
        assert_eq!(l.failure_streak().await, 3);

        l.record_success().await;
        assert_eq!(l.failure_streak().await, 0);
    }

    #[tokio::test]
    async fn delay_is_clamped_to_the_ceiling() {
        let l = AdaptiveRateLimiter::new(
            Duration::from_millis(100),
            10.0,
            Duration::from_secs(2),
            10,
        );
        for _ in 0..6 {
            l.record_failure(Some(503)).await;
        }
        assert_eq!(l.current_delay().await, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn reset_restores_the_base_delay() {
        let l = limiter();
        l.record_failure(Some(429)).await;
        l.record_failure(Some(429)).await;
        l.reset().await;
        assert_eq!(l.backoff_level().await, 0);
        assert_eq!(l.current_delay().await, Duration::from_millis(100));
    }
}
