//! Outbound request plumbing for quota-limited providers

pub mod cache;
pub mod rate_limiter;
pub mod request_pool;

pub use cache::ResponseCache;
pub use rate_limiter::AdaptiveRateLimiter;
pub use request_pool::RequestPool;
