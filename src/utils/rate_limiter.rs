//! Rate limiting protection
//! Enforces a minimum spacing between consecutive brokerage calls

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Rate limiter for API calls
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
    min_delay: Duration,
}

impl RateLimiter {
    /// Create new rate limiter
    pub fn new(min_delay_ms: u64) -> Self {
        Self {
            last_call: Mutex::new(None),
            min_delay: Duration::from_millis(min_delay_ms),
        }
    }

    /// Create default rate limiter (200ms delay)
    pub fn new_default() -> Self {
        Self::new(200)
    }

    /// Wait if needed before making API call
    pub async fn wait(&self) {
        if self.min_delay.is_zero() {
            return;
        }

        // Held across the sleep so concurrent callers queue up behind each other
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            sleep_until(previous + self.min_delay).await;
        }
        *last = Some(Instant::now());
    }

    /// Reset the rate limiter
    pub async fn reset(&self) {
        *self.last_call.lock().await = None;
    }
}
