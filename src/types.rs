use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Log sequence number. Strictly monotonic, 1-based; 0 means "none".
pub type Lsn = i64;

/// Logical page identifier. Non-negative; `NO_PAGE` marks an absent link.
pub type PageId = i64;

/// Sentinel for "no page" in page links and non-page-scoped log records.
pub const NO_PAGE: PageId = -1;

/// Transaction identifier. Always a non-empty string; generated ids are
/// hyphenless UUID v4.
pub type TxId = String;

/// Microsecond timestamp used for transaction start/commit ordering.
pub type Timestamp = i64;

/// Current wall-clock time in microseconds since the Unix epoch.
#[must_use]
pub fn now_micros() -> Timestamp {
    Utc::now().timestamp_micros()
}

/// Generate a fresh transaction id.
#[must_use]
pub fn new_tx_id() -> TxId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Monotonic timestamp source. Wall-clock based, but never moves backwards
/// and never hands out the same value twice, so commit timestamps form a
/// strict order even under bursts.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicI64,
}

impl LogicalClock {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: AtomicI64::new(0) }
    }

    /// Next strictly-increasing timestamp.
    pub fn tick(&self) -> Timestamp {
        let now = now_micros();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = if now > prev { now } else { prev + 1 };
            match self.last.compare_exchange_weak(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }

    /// Last timestamp handed out (0 before the first `tick`).
    pub fn peek(&self) -> Timestamp {
        self.last.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = LogicalClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn tx_ids_are_unique_and_non_empty() {
        let a = new_tx_id();
        let b = new_tx_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
