//! Swapper statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of a [`TileSwapper`](super::TileSwapper).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapStats {
    /// Tiles currently waiting in the eviction queue
    pub queued: usize,

    /// Tiles written out and released from memory
    pub evictions: u64,

    /// Tiles read back from disk
    pub restores: u64,

    /// Restores that failed and produced a zeroed buffer
    pub restore_failures: u64,

    /// Orphaned tiles destroyed by the swapper instead of being evicted
    pub finalized: u64,

    /// Evictions served from a free-listed slot
    pub slots_reused: u64,

    /// Backing files created so far
    pub swap_files: usize,

    /// Bytes handed out across all backing files
    pub disk_bytes: u64,

    /// Reclaimed slots waiting for reuse
    pub free_slots: usize,

    /// Bytes held by resident tile buffers
    pub resident_bytes: usize,

    /// Whether swapping has been turned off permanently
    pub disabled: bool,
}

impl SwapStats {
    /// Fraction of evictions that reused a reclaimed slot (0.0 to 1.0)
    pub fn slot_reuse_rate(&self) -> f64 {
        if self.evictions == 0 {
            0.0
        } else {
            self.slots_reused as f64 / self.evictions as f64
        }
    }
}

/// Monotonic event counters updated by the swapper.
#[derive(Debug, Default)]
pub(crate) struct SwapCounters {
    pub(crate) evictions: AtomicU64,
    pub(crate) restores: AtomicU64,
    pub(crate) restore_failures: AtomicU64,
    pub(crate) finalized: AtomicU64,
    pub(crate) slots_reused: AtomicU64,
}

impl SwapCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fills the counter fields of `stats`.
    pub(crate) fn fill(&self, stats: &mut SwapStats) {
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.restores = self.restores.load(Ordering::Relaxed);
        stats.restore_failures = self.restore_failures.load(Ordering::Relaxed);
        stats.finalized = self.finalized.load(Ordering::Relaxed);
        stats.slots_reused = self.slots_reused.load(Ordering::Relaxed);
    }
}
