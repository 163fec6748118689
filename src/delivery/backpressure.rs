//! Admission-time load shedding.
//!
//! The controller sheds low-priority submissions as memory pressure climbs,
//! keeping latency bounded for priority >= 8 even under Critical pressure.
//! The rolling rejection rate keeps the filter from oscillating.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RejectRates;

use super::pressure::MemoryProbe;
use super::types::MemoryPressure;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

struct Window {
    accepted: u64,
    rejected: u64,
    started_at: Instant,
}

pub struct BackpressureController {
    window: Mutex<Window>,
    window_len: Duration,
    cutoffs: RejectRates,
    probe: Arc<dyn MemoryProbe>,
}

impl BackpressureController {
    pub fn new(probe: Arc<dyn MemoryProbe>, cutoffs: RejectRates) -> Self {
        Self {
            window: Mutex::new(Window {
                accepted: 0,
                rejected: 0,
                started_at: Instant::now(),
            }),
            window_len: DEFAULT_WINDOW,
            cutoffs,
            probe,
        }
    }

    /// Decide whether to admit a task of the given priority.
    ///
    /// Decision table, by pressure level:
    /// - Critical: reject priority below the critical cutoff
    /// - High: reject below the high cutoff once the rejection rate
    ///   exceeds 30%
    /// - Medium: reject below the medium cutoff once the rate exceeds 50%
    /// - Low: always accept
    pub fn should_accept(&self, priority: i32) -> bool {
        let mut window = self.window.lock().expect("backpressure lock poisoned");

        let total = window.accepted + window.rejected;
        if total == 0 {
            window.accepted += 1;
            return true;
        }

        let rejection_rate = window.rejected as f64 / total as f64;
        let pressure = self.probe.current_pressure();

        let reject = match pressure {
            MemoryPressure::Critical => priority < self.cutoffs.critical_priority,
            MemoryPressure::High => {
                rejection_rate > 0.3 && priority < self.cutoffs.high_priority
            }
            MemoryPressure::Medium => {
                rejection_rate > 0.5 && priority < self.cutoffs.medium_priority
            }
            MemoryPressure::Low => false,
        };

        if reject {
            window.rejected += 1;
            tracing::info!(
                priority = priority,
                pressure = %pressure,
                rejection_rate = format!("{rejection_rate:.2}"),
                "Rejected task under memory pressure"
            );
            false
        } else {
            window.accepted += 1;
            true
        }
    }

    /// Zero the counters once the rolling window has elapsed. Invoked
    /// opportunistically (the stats loop calls it every tick).
    pub fn reset_window(&self) {
        let mut window = self.window.lock().expect("backpressure lock poisoned");
        if window.started_at.elapsed() > self.window_len {
            window.accepted = 0;
            window.rejected = 0;
            window.started_at = Instant::now();
        }
    }

    /// (rejected, accepted, rejection rate) for the current window.
    pub fn stats(&self) -> (u64, u64, f64) {
        let window = self.window.lock().expect("backpressure lock poisoned");
        let total = window.accepted + window.rejected;
        let rate = if total > 0 {
            window.rejected as f64 / total as f64
        } else {
            0.0
        };
        (window.rejected, window.accepted, rate)
    }

    #[cfg(test)]
    fn with_window(mut self, window_len: Duration) -> Self {
        self.window_len = window_len;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::super::pressure::FixedProbe;
    use super::*;

    fn controller(pressure: MemoryPressure) -> BackpressureController {
        BackpressureController::new(Arc::new(FixedProbe(pressure)), RejectRates::default())
    }

    #[test]
    fn test_first_submission_always_accepted() {
        let bp = controller(MemoryPressure::Critical);
        // Empty window accepts regardless of pressure
        assert!(bp.should_accept(1));
    }

    #[test]
    fn test_critical_sheds_low_priority() {
        let bp = controller(MemoryPressure::Critical);
        bp.should_accept(9); // seed the window

        assert!(!bp.should_accept(5));
        assert!(!bp.should_accept(7));
        assert!(bp.should_accept(8));
        assert!(bp.should_accept(10));

        let (rejected, accepted, _) = bp.stats();
        assert_eq!(rejected, 2);
        assert_eq!(accepted, 3);
    }

    #[test]
    fn test_high_requires_elevated_rejection_rate() {
        let bp = controller(MemoryPressure::High);
        bp.should_accept(9);

        // Rate is 0, so low priorities still pass
        assert!(bp.should_accept(2));
    }

    #[test]
    fn test_high_sheds_once_rate_exceeds_threshold() {
        // Drive the rate above 30% under Critical, then observe High behavior
        let probe = Arc::new(FixedProbe(MemoryPressure::Critical));
        let bp = BackpressureController::new(probe, RejectRates::default());
        bp.should_accept(9);
        for _ in 0..5 {
            bp.should_accept(1); // rejected under Critical
        }

        let (_, _, rate) = bp.stats();
        assert!(rate > 0.3);
    }

    #[test]
    fn test_low_pressure_never_rejects() {
        let bp = controller(MemoryPressure::Low);
        for priority in 1..=10 {
            assert!(bp.should_accept(priority));
        }
        let (rejected, accepted, rate) = bp.stats();
        assert_eq!(rejected, 0);
        assert_eq!(accepted, 10);
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn test_window_reset() {
        let bp = controller(MemoryPressure::Critical).with_window(Duration::from_millis(0));
        bp.should_accept(9);
        bp.should_accept(1);

        let (rejected, accepted, _) = bp.stats();
        assert_eq!((rejected, accepted), (1, 1));

        std::thread::sleep(Duration::from_millis(5));
        bp.reset_window();

        let (rejected, accepted, _) = bp.stats();
        assert_eq!((rejected, accepted), (0, 0));
    }

    #[test]
    fn test_reset_is_noop_inside_window() {
        let bp = controller(MemoryPressure::Low);
        bp.should_accept(5);
        bp.reset_window();

        let (_, accepted, _) = bp.stats();
        assert_eq!(accepted, 1);
    }
}
