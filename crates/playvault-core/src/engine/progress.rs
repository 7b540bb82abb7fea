//! Progress tracking - speed and ETA from periodic byte-count samples
//!
//! Samples closer together than the minimum interval are rejected so a
//! near-zero delta-t can never blow up the speed figure. The reported
//! speed is a sliding-window average smoothed with an exponential
//! moving average, which keeps the ETA stable across bursty links.

use std::time::{Duration, Instant};

const WINDOW_SIZE: usize = 10;
const EMA_ALPHA: f64 = 0.15;

/// Speed/ETA figures derived from one accepted sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Smoothed bytes per second
    pub speed: u64,
    /// Seconds remaining, None while speed is zero
    pub eta: Option<u64>,
}

/// Derives throughput from (bytes, instant) observations
pub struct ProgressTracker {
    total_size: u64,
    min_interval: Duration,
    window: Vec<f64>,
    smoothed: f64,
    last: Option<(u64, Instant)>,
}

impl ProgressTracker {
    pub fn new(total_size: u64) -> Self {
        Self::with_min_interval(total_size, Duration::from_secs(1))
    }

    pub fn with_min_interval(total_size: u64, min_interval: Duration) -> Self {
        Self {
            total_size,
            min_interval,
            window: Vec::with_capacity(WINDOW_SIZE),
            smoothed: 0.0,
            last: None,
        }
    }

    /// Feed an observation. Returns None when the observation arrived
    /// sooner than the minimum sampling interval.
    pub fn sample(&mut self, downloaded: u64, now: Instant) -> Option<ProgressSample> {
        let (last_bytes, last_time) = match self.last {
            Some(prev) => prev,
            None => {
                self.last = Some((downloaded, now));
                return None;
            }
        };

        let elapsed = now.duration_since(last_time);
        if elapsed < self.min_interval {
            return None;
        }

        let instant_speed =
            downloaded.saturating_sub(last_bytes) as f64 / elapsed.as_secs_f64();

        self.window.push(instant_speed);
        if self.window.len() > WINDOW_SIZE {
            self.window.remove(0);
        }
        let window_avg = self.window.iter().sum::<f64>() / self.window.len() as f64;
        self.smoothed = EMA_ALPHA * window_avg + (1.0 - EMA_ALPHA) * self.smoothed;
        self.last = Some((downloaded, now));

        let speed = self.smoothed as u64;
        let eta = if speed > 0 {
            Some(self.total_size.saturating_sub(downloaded) / speed)
        } else {
            None
        };

        Some(ProgressSample { speed, eta })
    }

    /// Forget the sampling baseline, e.g. across a pause, so the idle
    /// interval does not register as zero throughput.
    pub fn reset(&mut self) {
        self.window.clear();
        self.smoothed = 0.0;
        self.last = None;
    }
}
