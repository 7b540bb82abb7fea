//! Core configuration
//!
//! One `CoreConfig` is built at process start and handed to `TransferCore`;
//! nothing in the crate reads ambient/global state.

use std::time::Duration;

/// Configuration for the transfer core and its request pool
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Fixed chunk size for range downloads
    pub chunk_size: u64,
    /// Concurrency ceiling for chunk workers per transfer
    pub max_threads: usize,
    /// Hard per-chunk retry ceiling for transient failures
    pub max_retries: u32,
    /// Base delay for chunk retry backoff; actual delay is proportional
    /// to the attempt number
    pub retry_delay: Duration,
    /// Per-chunk wait budget for rate-limit (429/503) responses
    pub rate_limit_budget: u32,
    /// HTTP connect timeout
    pub connect_timeout: Duration,
    /// Per-request timeout for chunk and pool attempts
    pub request_timeout: Duration,
    /// User agent sent on outbound requests
    pub user_agent: String,
    /// Request pool concurrency ceiling
    pub pool_max_concurrent: usize,
    /// Request pool retry ceiling
    pub pool_retry_attempts: u32,
    /// First pool retry delay; doubles per attempt up to the max
    pub pool_initial_retry_delay: Duration,
    pub pool_max_retry_delay: Duration,
    /// Adaptive limiter base inter-request delay
    pub limiter_base_delay: Duration,
    /// Delay multiplier applied per backoff level
    pub limiter_multiplier: f64,
    /// Ceiling on the limiter's derived delay
    pub limiter_max_delay: Duration,
    /// Consecutive successes required to step the backoff level down
    pub limiter_recovery_threshold: u32,
    /// Default TTL for cached provider responses
    pub cache_ttl: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50 * 1024 * 1024,
            max_threads: 4,
            max_retries: 5,
            retry_delay: Duration::from_secs(2),
            rate_limit_budget: 20,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            user_agent: "PlayVault/0.1.0".to_string(),
            pool_max_concurrent: 5,
            pool_retry_attempts: 5,
            pool_initial_retry_delay: Duration::from_millis(500),
            pool_max_retry_delay: Duration::from_secs(30),
            limiter_base_delay: Duration::from_millis(250),
            limiter_multiplier: 2.0,
            limiter_max_delay: Duration::from_secs(60),
            limiter_recovery_threshold: 10,
            cache_ttl: Duration::from_secs(300),
        }
    }
}
