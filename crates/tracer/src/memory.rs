//! Physical-memory pressure probe.
//!
//! Tracing degrades to plain forwarding when available memory drops below a
//! threshold fraction of total memory. The threshold is a tunable heuristic.

use std::sync::Arc;

/// Available-memory floor, as a percentage of total memory.
pub const LOW_MEMORY_THRESHOLD_PERCENT: u64 = 20;

type MemoryReader = Arc<dyn Fn() -> Option<(u64, u64)> + Send + Sync>;

/// Reports whether the system is under memory pressure.
///
/// The default probe reads `/proc/meminfo`; tests substitute fixed values.
#[derive(Clone)]
pub struct MemoryProbe {
    reader: MemoryReader,
}

impl Default for MemoryProbe {
    fn default() -> Self {
        MemoryProbe {
            reader: Arc::new(read_proc_meminfo),
        }
    }
}

impl MemoryProbe {
    /// Probe reading the host's `/proc/meminfo`.
    pub fn system() -> Self {
        MemoryProbe::default()
    }

    /// Probe reporting fixed `(available, total)` kilobyte figures.
    pub fn fixed(available_kib: u64, total_kib: u64) -> Self {
        MemoryProbe {
            reader: Arc::new(move || Some((available_kib, total_kib))),
        }
    }

    /// Probe that never reports pressure.
    pub fn disabled() -> Self {
        MemoryProbe {
            reader: Arc::new(|| None),
        }
    }

    /// True when available memory is below the threshold fraction of total.
    /// Unknown figures count as healthy.
    pub fn is_low(&self) -> bool {
        match (self.reader)() {
            Some((available, total)) if total > 0 => {
                available * 100 < total * LOW_MEMORY_THRESHOLD_PERCENT
            }
            _ => false,
        }
    }
}

fn read_proc_meminfo() -> Option<(u64, u64)> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut available = None;
    let mut total = None;

    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.trim().split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.trim().split_whitespace().next()?.parse().ok();
        }
    }

    Some((available?, total?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_probe_threshold() {
        assert!(MemoryProbe::fixed(19, 100).is_low());
        assert!(!MemoryProbe::fixed(20, 100).is_low());
        assert!(!MemoryProbe::fixed(80, 100).is_low());
    }

    #[test]
    fn test_disabled_probe_never_low() {
        assert!(!MemoryProbe::disabled().is_low());
    }

    #[test]
    fn test_zero_total_is_healthy() {
        assert!(!MemoryProbe::fixed(0, 0).is_low());
    }
}
