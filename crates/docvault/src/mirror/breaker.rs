use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 1;

/// Write gate for the mirror.
///
/// Counts consecutive connection-level failures; once `threshold` is reached
/// the breaker latches open and stays that way until [`CircuitBreaker::reset`]
/// or process restart. Reads never consult it.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    failures: AtomicU32,
    tripped: AtomicBool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_write_allowed(&self) -> bool {
        !self.tripped.load(Ordering::SeqCst)
    }

    /// Returns true when this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let n = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        n >= self.threshold && !self.tripped.swap(true, Ordering::SeqCst)
    }

    /// Clears the consecutive-failure count. A tripped breaker stays tripped.
    pub fn record_success(&self) {
        if self.is_write_allowed() {
            self.failures.store(0, Ordering::SeqCst);
        }
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.tripped.store(false, Ordering::SeqCst);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}
