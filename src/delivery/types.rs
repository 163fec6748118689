use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{clamp_priority, now_millis, Message};

/// One fan-out unit: a message plus its recipients and scheduling metadata.
///
/// A task is owned by exactly one queue or inbox at a time; the bounded
/// channels between stages transfer ownership on every hop.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub id: String,
    pub channel_id: String,
    pub message: Message,
    /// Ordered recipient list; duplicates allowed. Empty means "deliver to
    /// the message's own user".
    pub target_users: Vec<String>,
    /// 1-10, higher is more important
    pub priority: i32,
    /// Attempts already made; starts at 0
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
}

impl DeliveryTask {
    /// Build a task from a message and its recipients, inheriting the
    /// message priority.
    pub fn from_message(message: Message, target_users: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel_id: message.channel_id.clone(),
            priority: clamp_priority(message.priority),
            message,
            target_users,
            retry_count: 0,
            created_at: now_millis(),
            timeout: Duration::ZERO,
        }
    }

    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age > chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX)
    }
}

/// A deferred delivery attempt held by the retry manager until due.
#[derive(Debug)]
pub struct RetryTask {
    pub task: DeliveryTask,
    /// The attempt number this retry represents
    pub retry_count: u32,
    pub next_fire_at: Instant,
    pub reason: String,
}

impl RetryTask {
    pub fn is_due(&self) -> bool {
        Instant::now() >= self.next_fire_at
    }
}

/// Memory pressure level reported by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemoryPressure::Low => "low",
            MemoryPressure::Medium => "medium",
            MemoryPressure::High => "high",
            MemoryPressure::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Live pipeline statistics.
///
/// Counters are plain atomics updated without a lock; the delivery-time
/// EWMA sits behind a read-write lock and is only touched on completed
/// deliveries.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub total_received: AtomicU64,
    pub total_delivered: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_retried: AtomicU64,
    /// Entry-buffer depth gauge
    pub queue_depth: AtomicUsize,
    /// Worker pool size gauge
    pub active_workers: AtomicUsize,
    avg_delivery: std::sync::RwLock<Option<Duration>>,
}

impl DeliveryStats {
    /// Record one completed delivery: bump the counter and fold the elapsed
    /// time into the EWMA (`avg = avg * 0.9 + elapsed * 0.1`; the first
    /// sample seeds the average).
    pub fn record_delivery(&self, elapsed: Duration) {
        self.total_delivered.fetch_add(1, Ordering::Relaxed);

        let mut avg = self.avg_delivery.write().expect("stats lock poisoned");
        *avg = Some(match *avg {
            Some(current) => current.mul_f64(0.9) + elapsed.mul_f64(0.1),
            None => elapsed,
        });
    }

    pub fn avg_delivery_time(&self) -> Duration {
        self.avg_delivery
            .read()
            .expect("stats lock poisoned")
            .unwrap_or(Duration::ZERO)
    }

    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            total_received: self.total_received.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            avg_delivery_time_ms: self.avg_delivery_time().as_secs_f64() * 1000.0,
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            last_update: Utc::now(),
        }
    }
}

/// Point-in-time view of [`DeliveryStats`].
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStatsSnapshot {
    pub total_received: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub avg_delivery_time_ms: f64,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub last_update: DateTime<Utc>,
}
