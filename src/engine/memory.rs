//! Memory-pressure monitoring.
//!
//! Prefers the OS resident-size figure (`/proc/self/statm`) and falls
//! back to the state manager's deterministic estimate where that is
//! unavailable, so the pressure path stays testable off-Linux.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLevel {
    Ok,
    /// At or above 80% of the limit: proactive eviction.
    Soft,
    /// At or above 95%: aggressive eviction.
    Aggressive,
    /// At or above the limit: fatal.
    Exhausted { used_mb: u64, limit_mb: u64 },
}

#[derive(Debug, Clone)]
pub struct MemoryMonitor {
    limit_mb: u64,
}

impl MemoryMonitor {
    pub fn new(limit_mb: u64) -> Self {
        Self { limit_mb }
    }

    /// Classify current usage. `estimate_bytes` is the tracked-state
    /// estimate used when no OS figure is available.
    pub fn level(&self, estimate_bytes: usize) -> MemoryLevel {
        if self.limit_mb == 0 {
            return MemoryLevel::Ok;
        }
        let used_mb = resident_mb().unwrap_or((estimate_bytes / (1024 * 1024)) as u64);
        let pct = used_mb as f64 / self.limit_mb as f64;
        if pct >= 1.0 {
            MemoryLevel::Exhausted {
                used_mb,
                limit_mb: self.limit_mb,
            }
        } else if pct >= 0.95 {
            MemoryLevel::Aggressive
        } else if pct >= 0.80 {
            MemoryLevel::Soft
        } else {
            MemoryLevel::Ok
        }
    }
}

/// Resident set size in MiB, if the platform exposes it.
#[cfg(target_os = "linux")]
fn resident_mb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = 4096u64;
    Some(resident_pages * page_size / (1024 * 1024))
}

#[cfg(not(target_os = "linux"))]
fn resident_mb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limit_disables_checks() {
        let monitor = MemoryMonitor::new(0);
        assert_eq!(monitor.level(usize::MAX / 2), MemoryLevel::Ok);
    }

    #[test]
    fn test_levels_from_estimate() {
        // A limit high enough that the real process RSS (a few tens
        // of MiB under test) stays in the Ok band.
        let monitor = MemoryMonitor::new(1_000_000);
        assert_eq!(monitor.level(0), MemoryLevel::Ok);
    }
}
