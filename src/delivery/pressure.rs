//! Memory pressure probing.
//!
//! The default probe reads process resident memory against total system
//! memory from `/proc`; other platforms report `Low`. The trait seam lets
//! deployments substitute cgroup-aware probes and lets tests pin a level.

use crate::config::MemoryPressureThresholds;

use super::types::MemoryPressure;

/// Source of the current memory pressure level. Callable from any stage.
pub trait MemoryProbe: Send + Sync {
    fn current_pressure(&self) -> MemoryPressure;
}

/// Map a used/total memory ratio to a pressure level.
pub fn classify_pressure(ratio: f64, thresholds: &MemoryPressureThresholds) -> MemoryPressure {
    if ratio > thresholds.critical {
        MemoryPressure::Critical
    } else if ratio > thresholds.high {
        MemoryPressure::High
    } else if ratio > thresholds.medium {
        MemoryPressure::Medium
    } else {
        MemoryPressure::Low
    }
}

/// Probe backed by `/proc/self/status` (VmRSS) and `/proc/meminfo`
/// (MemTotal). Reports `Low` when the numbers are unavailable.
pub struct ProcMemoryProbe {
    thresholds: MemoryPressureThresholds,
}

impl ProcMemoryProbe {
    pub fn new(thresholds: MemoryPressureThresholds) -> Self {
        Self { thresholds }
    }
}

impl Default for ProcMemoryProbe {
    fn default() -> Self {
        Self::new(MemoryPressureThresholds::default())
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn current_pressure(&self) -> MemoryPressure {
        match memory_ratio() {
            Some(ratio) => classify_pressure(ratio, &self.thresholds),
            None => MemoryPressure::Low,
        }
    }
}

#[cfg(target_os = "linux")]
fn memory_ratio() -> Option<f64> {
    let rss_kb = read_kb_field("/proc/self/status", "VmRSS:")?;
    let total_kb = read_kb_field("/proc/meminfo", "MemTotal:")?;
    if total_kb == 0 {
        return None;
    }
    Some(rss_kb as f64 / total_kb as f64)
}

#[cfg(not(target_os = "linux"))]
fn memory_ratio() -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn read_kb_field(path: &str, field: &str) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// Probe pinned to one level; used by tests and overload drills.
pub struct FixedProbe(pub MemoryPressure);

impl MemoryProbe for FixedProbe {
    fn current_pressure(&self) -> MemoryPressure {
        self.0
    }
}
