//! Logical commit timestamps.
//!
//! Timestamps are a counter, not wall-clock time. A snapshot taken at `ts`
//! sees every transaction with commit timestamp `<= ts`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Tracks the newest published commit timestamp.
///
/// Commits are assigned `current().next()` and call `publish` once their
/// writes are visible. Callers serialize commits, so publication order is
/// timestamp order.
#[derive(Debug, Default)]
pub struct TimestampOracle {
    last_committed: AtomicU64,
}

impl TimestampOracle {
    /// Starts with no commits published.
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp of the newest visible commit; the read point of a new
    /// snapshot.
    pub fn current(&self) -> Timestamp {
        Timestamp::new(self.last_committed.load(Ordering::SeqCst))
    }

    /// Makes `ts` the newest visible commit. Never moves backwards.
    pub fn publish(&self, ts: Timestamp) {
        self.last_committed.fetch_max(ts.value(), Ordering::SeqCst);
    }
}
