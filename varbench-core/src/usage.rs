//! Token usage accounting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Accumulation sink the user function reports token usage into. The
/// executor reads deltas around each trial to attribute usage per call.
#[derive(Debug, Default)]
pub struct TokenMeter {
    total: AtomicU64,
}

impl TokenMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tokens: u64) {
        self.total.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
