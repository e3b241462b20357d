use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free per-subscription counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    delivered: AtomicU64,
    malformed: AtomicU64,
    reconnects: AtomicU64,
}

/// Counter values taken by [`SubscriptionStats::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub malformed: u64,
    pub reconnects: u64,
}

impl StatsSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl SubscriptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// An event was handed to the consumer queue.
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// An upstream message could not be decoded and was dropped.
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// The subscription was re-established after a failure.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.swap(0, Ordering::Relaxed),
            malformed: self.malformed.swap(0, Ordering::Relaxed),
            reconnects: self.reconnects.swap(0, Ordering::Relaxed),
        }
    }
}
