//! Resident tile memory accounting
//!
//! Every memory store reports buffer allocations and releases here. The
//! swapper consults the resulting pressure level to decide whether idle
//! time still matters or queued tiles should go to disk right away.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory pressure level of the resident tile set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Memory usage is low (< 50% utilization)
    Low,
    /// Memory usage is moderate (50-75% utilization)
    Moderate,
    /// Memory usage is high (75-90% utilization)
    High,
    /// Memory usage is critical (> 90% utilization)
    Critical,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// Returns true if memory pressure requires action (High or Critical)
    pub fn needs_eviction(&self) -> bool {
        matches!(self, MemoryPressure::High | MemoryPressure::Critical)
    }
}

/// Tracks bytes held by resident tile buffers.
///
/// Without a limit the budget only counts; pressure stays `Low`.
#[derive(Debug, Default)]
pub struct MemoryBudget {
    limit: Option<usize>,
    current_usage: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            current_usage: AtomicUsize::new(0),
        }
    }

    /// Current resident bytes
    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Current utilization ratio, 0.0 when unlimited
    pub fn utilization(&self) -> f64 {
        match self.limit {
            Some(0) | None => 0.0,
            Some(limit) => self.current_usage() as f64 / limit as f64,
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    pub fn needs_eviction(&self) -> bool {
        self.pressure().needs_eviction()
    }

    pub fn record_allocation(&self, bytes: usize) {
        self.current_usage.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_deallocation(&self, bytes: usize) {
        self.current_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
    }
}
