//! Automatic frame cache budget derived from system memory.

use sysinfo::System;
use tracing::trace;

/// Share of total memory an animated image may use, in percent.
pub const TOTAL_MEMORY_PERCENT: u64 = 20;

/// Share of currently available memory an animated image may use, in percent.
pub const AVAILABLE_MEMORY_PERCENT: u64 = 60;

/// Point-in-time view of system memory, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Total physical memory.
    pub total: u64,
    /// Memory available for new allocations.
    pub available: u64,
}

impl MemorySnapshot {
    /// Reads current memory figures from the OS.
    #[must_use]
    pub fn current() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let snapshot = Self {
            total: sys.total_memory(),
            available: sys.available_memory(),
        };
        trace!(
            total_mb = snapshot.total / 1024 / 1024,
            available_mb = snapshot.available / 1024 / 1024,
            "Read system memory"
        );
        snapshot
    }

    /// `min(20% of total, 60% of available)`.
    #[must_use]
    pub const fn frame_cache_budget(self) -> u64 {
        let from_total = self.total / 100 * TOTAL_MEMORY_PERCENT;
        let from_available = self.available / 100 * AVAILABLE_MEMORY_PERCENT;
        if from_total < from_available {
            from_total
        } else {
            from_available
        }
    }
}
