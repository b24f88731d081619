use std::sync::atomic::{AtomicU64, Ordering};

/// Event counters of the completion engine. Updated from interrupt and
/// foreground context alike.
#[derive(Debug, Default)]
pub(crate) struct HcdStats {
    completed: AtomicU64,
    retries: AtomicU64,
    unmatched_done_bits: AtomicU64,
    stuck_transfers: AtomicU64,
}

/// A point-in-time copy of the driver's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Transfer phases that reached a final outcome.
    pub completed: u64,
    /// Resubmissions after the NAK counter ran out.
    pub retries: u64,
    /// Done bits that matched no active slot.
    pub unmatched_done_bits: u64,
    pub stuck_transfers: u64,
}

impl HcdStats {
    pub(crate) fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unmatched(&self, bits: u32) {
        self.unmatched_done_bits
            .fetch_add(u64::from(bits.count_ones()), Ordering::Relaxed);
    }

    pub(crate) fn stuck(&self) {
        self.stuck_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            unmatched_done_bits: self.unmatched_done_bits.load(Ordering::Relaxed),
            stuck_transfers: self.stuck_transfers.load(Ordering::Relaxed),
        }
    }
}
