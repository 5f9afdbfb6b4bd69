//! Strict average-rate pacing for calls to the external completion service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Paces callers to `max_rate` calls per second, measured from limiter
/// creation. The Nth call is released at `start + N / max_rate`; there is no
/// burst allowance. Safe to share across any number of tasks.
#[derive(Debug)]
pub struct RateLimiter {
    max_rate: f64,
    start: Instant,
    request_count: AtomicU64,
}

impl RateLimiter {
    /// `max_rate` is in calls per second and must be positive.
    pub fn new(max_rate: f64) -> Self {
        Self {
            max_rate: max_rate.max(f64::MIN_POSITIVE),
            start: Instant::now(),
            request_count: AtomicU64::new(0),
        }
    }

    /// Waits until the scheduled time for this call has arrived.
    pub async fn acquire(&self) {
        let n = self.request_count.fetch_add(1, Ordering::Relaxed) + 1;
        let expected = Duration::from_secs_f64(n as f64 / self.max_rate);
        let elapsed = self.start.elapsed();
        if elapsed < expected {
            let delay = expected - elapsed;
            trace!(call = n, delay_ms = delay.as_millis() as u64, "rate limiter pausing");
            tokio::time::sleep(delay).await;
        }
    }

    /// Calls admitted so far.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}
