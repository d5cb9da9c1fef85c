//! Memory budget derived from the host's physical memory

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use sysinfo::System;

/// Used when the host memory cannot be determined
const FALLBACK_TOTAL_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Available memory below this share of total memory counts as pressure
const PRESSURE_AVAILABLE_RATIO: f64 = 0.10;

/// How often the available memory is re-read
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Bytes the storage caches may use in total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    pub total_bytes: u64,
    pub allowed_bytes: u64,
}

impl MemoryBudget {
    /// `allowed_percent` of the physical memory
    pub fn detect(allowed_percent: u8) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let total = match sys.total_memory() {
            0 => FALLBACK_TOTAL_BYTES,
            t => t,
        };
        Self::with_total(total, allowed_percent)
    }

    pub fn with_total(total_bytes: u64, allowed_percent: u8) -> Self {
        let pct = u64::from(allowed_percent.clamp(1, 100));
        Self {
            total_bytes,
            allowed_bytes: total_bytes / 100 * pct,
        }
    }

    /// Share of the allowed bytes, at least `min`
    pub fn share(&self, fraction: f64, min: usize) -> usize {
        ((self.allowed_bytes as f64 * fraction) as usize).max(min)
    }
}

/// Watches available memory so caches can shed entries before an OOM
pub struct MemoryMonitor {
    sys: Mutex<(System, Instant, bool)>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let pressure = Self::is_pressure(&sys);
        Self {
            sys: Mutex::new((sys, Instant::now(), pressure)),
        }
    }

    fn is_pressure(sys: &System) -> bool {
        let total = sys.total_memory();
        total > 0 && (sys.available_memory() as f64) < total as f64 * PRESSURE_AVAILABLE_RATIO
    }

    /// True when available memory is low; re-reads at most once a second
    pub fn under_pressure(&self) -> bool {
        let mut guard = self.sys.lock();
        let (sys, last, pressure) = &mut *guard;
        if last.elapsed() >= REFRESH_INTERVAL {
            sys.refresh_memory();
            *pressure = Self::is_pressure(sys);
            *last = Instant::now();
        }
        *pressure
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_share() {
        let b = MemoryBudget::with_total(1000 * 1024, 60);
        assert_eq!(b.allowed_bytes, 10 * 1024 * 60);
        assert_eq!(b.share(0.5, 0), 5 * 1024 * 60);
        assert_eq!(b.share(0.0, 4096), 4096);
    }

    #[test]
    fn test_detect_is_positive() {
        let b = MemoryBudget::detect(60);
        assert!(b.allowed_bytes > 0);
        assert!(b.allowed_bytes <= b.total_bytes);
    }
}
