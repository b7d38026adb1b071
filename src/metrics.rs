use std::sync::atomic::{AtomicU64, Ordering};

/// In-process counters updated by the poller
#[derive(Debug, Default)]
pub struct PollerMetrics {
    pub messages_polled: AtomicU64,
    pub transitions_recorded: AtomicU64,
    pub unchanged: AtomicU64,
    pub invalid: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub conflicts: AtomicU64,
    pub notifications_published: AtomicU64,
    pub notification_failures: AtomicU64,
    pub batches_processed: AtomicU64,
}

impl PollerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_polled: self.messages_polled.load(Ordering::Relaxed),
            transitions_recorded: self.transitions_recorded.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            notifications_published: self.notifications_published.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_polled: u64,
    pub transitions_recorded: u64,
    pub unchanged: u64,
    pub invalid: u64,
    pub fetch_failures: u64,
    pub conflicts: u64,
    pub notifications_published: u64,
    pub notification_failures: u64,
    pub batches_processed: u64,
}
