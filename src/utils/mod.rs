//! Utility modules

pub mod retry;
pub mod rate_limiter;

pub use retry::{retry_with_policy, RetryPolicy, Retryable};
pub use rate_limiter::RateLimiter;
