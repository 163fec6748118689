//! Multi-stage task queues: priority buckets and worker inbox routing.
//!
//! Three bounded buckets partition tasks by priority (higher numeric value
//! is more important: high >= 8, normal 4-7, low <= 3). Dequeue is strict
//! priority; hand-off to workers is round-robin with bounded waits so a
//! stuck inbox never blocks the drain loop.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex, RwLock};

use crate::config::QueueConfig;

use super::types::DeliveryTask;

/// Bounded wait when enqueueing into a priority bucket.
const DISPATCH_TIMEOUT: Duration = Duration::from_millis(100);

/// Bounded wait when handing a task to its round-robin worker.
const DISTRIBUTE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityBucket {
    High,
    Normal,
    Low,
}

/// Bucket selection: higher numeric priority routes to a hotter bucket.
pub fn bucket_for(priority: i32) -> PriorityBucket {
    match priority {
        p if p >= 8 => PriorityBucket::High,
        p if p >= 4 => PriorityBucket::Normal,
        _ => PriorityBucket::Low,
    }
}

struct Bucket {
    tx: mpsc::Sender<DeliveryTask>,
    rx: Mutex<mpsc::Receiver<DeliveryTask>>,
}

impl Bucket {
    fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Depths of each bucket plus the routing-table size.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub high_depth: usize,
    pub normal_depth: usize,
    pub low_depth: usize,
    pub worker_count: usize,
}

pub struct QueueManager {
    high: Bucket,
    normal: Bucket,
    low: Bucket,
    /// Worker inbox senders; the manager only routes, it never spawns.
    workers: RwLock<Vec<mpsc::Sender<DeliveryTask>>>,
}

impl QueueManager {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            high: Bucket::new(config.priority_size),
            normal: Bucket::new(config.priority_size),
            low: Bucket::new(config.priority_size),
            workers: RwLock::new(Vec::new()),
        }
    }

    /// Enqueue a task into its priority bucket, waiting at most 100 ms.
    /// The task is handed back on failure so the caller keeps ownership.
    pub async fn dispatch(&self, task: DeliveryTask) -> Result<(), DeliveryTask> {
        let bucket = match bucket_for(task.priority) {
            PriorityBucket::High => &self.high,
            PriorityBucket::Normal => &self.normal,
            PriorityBucket::Low => &self.low,
        };

        match bucket.tx.send_timeout(task, DISPATCH_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(task)) | Err(SendTimeoutError::Closed(task)) => {
                Err(task)
            }
        }
    }

    /// Strict-priority non-blocking dequeue: high, then normal, then low.
    pub async fn next_task(&self) -> Option<DeliveryTask> {
        if let Ok(task) = self.high.rx.lock().await.try_recv() {
            return Some(task);
        }
        if let Ok(task) = self.normal.rx.lock().await.try_recv() {
            return Some(task);
        }
        if let Ok(task) = self.low.rx.lock().await.try_recv() {
            return Some(task);
        }
        None
    }

    /// Hand a task to a worker inbox.
    ///
    /// Picks a round-robin index from the wall clock, waits up to 50 ms on
    /// that inbox, then tries every other inbox once without waiting. The
    /// task is handed back when every inbox is saturated.
    pub async fn distribute(&self, task: DeliveryTask) -> Result<(), DeliveryTask> {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return Err(task);
        }

        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as usize
            % workers.len();

        let mut task = match workers[start].send_timeout(task, DISTRIBUTE_TIMEOUT).await {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(task)) | Err(SendTimeoutError::Closed(task)) => task,
        };

        for (i, worker) in workers.iter().enumerate() {
            if i == start {
                continue;
            }
            task = match worker.try_send(task) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => task,
            };
        }

        Err(task)
    }

    /// Register a worker inbox with the routing table.
    pub async fn add_worker(&self, inbox: mpsc::Sender<DeliveryTask>) {
        self.workers.write().await.push(inbox);
    }

    /// Remove a worker inbox from the routing table.
    pub async fn remove_worker(&self, inbox: &mpsc::Sender<DeliveryTask>) {
        self.workers
            .write()
            .await
            .retain(|w| !w.same_channel(inbox));
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            high_depth: self.high.depth(),
            normal_depth: self.normal.depth(),
            low_depth: self.low.depth(),
            worker_count: self.workers.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn test_task(priority: i32) -> DeliveryTask {
        let message = Message::builder("user-1", "default")
            .title("t")
            .content("c")
            .priority(priority)
            .build();
        DeliveryTask::from_message(message, vec!["user-1".to_string()])
    }

    fn small_config() -> QueueConfig {
        QueueConfig {
            entry_size: 16,
            priority_size: 4,
            worker_size: 2,
        }
    }

    #[test]
    fn test_bucket_mapping() {
        assert_eq!(bucket_for(10), PriorityBucket::High);
        assert_eq!(bucket_for(8), PriorityBucket::High);
        assert_eq!(bucket_for(7), PriorityBucket::Normal);
        assert_eq!(bucket_for(4), PriorityBucket::Normal);
        assert_eq!(bucket_for(3), PriorityBucket::Low);
        assert_eq!(bucket_for(1), PriorityBucket::Low);
    }

    #[tokio::test]
    async fn test_strict_priority_order() {
        let qm = QueueManager::new(&small_config());

        // Submit in low, high, normal order
        qm.dispatch(test_task(2)).await.unwrap();
        qm.dispatch(test_task(9)).await.unwrap();
        qm.dispatch(test_task(5)).await.unwrap();

        // Dequeue order follows bucket priority: high, normal, low
        assert_eq!(qm.next_task().await.unwrap().priority, 9);
        assert_eq!(qm.next_task().await.unwrap().priority, 5);
        assert_eq!(qm.next_task().await.unwrap().priority, 2);
        assert!(qm.next_task().await.is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_bucket() {
        let qm = QueueManager::new(&small_config());

        for i in 0..3 {
            let mut task = test_task(5);
            task.id = format!("task-{i}");
            qm.dispatch(task).await.unwrap();
        }

        for i in 0..3 {
            assert_eq!(qm.next_task().await.unwrap().id, format!("task-{i}"));
        }
    }

    #[tokio::test]
    async fn test_dispatch_returns_task_when_bucket_full() {
        let qm = QueueManager::new(&QueueConfig {
            entry_size: 16,
            priority_size: 1,
            worker_size: 2,
        });

        qm.dispatch(test_task(9)).await.unwrap();
        let rejected = qm.dispatch(test_task(9)).await;
        assert!(rejected.is_err());
        assert_eq!(rejected.unwrap_err().priority, 9);
    }

    #[tokio::test]
    async fn test_distribute_without_workers_fails() {
        let qm = QueueManager::new(&small_config());
        assert!(qm.distribute(test_task(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_distribute_reaches_a_worker() {
        let qm = QueueManager::new(&small_config());
        let (tx, mut rx) = mpsc::channel(2);
        qm.add_worker(tx).await;

        qm.distribute(test_task(5)).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_distribute_falls_over_to_free_worker() {
        let qm = QueueManager::new(&small_config());

        // One saturated inbox, one with room
        let (busy_tx, _busy_rx) = mpsc::channel(1);
        busy_tx.try_send(test_task(5)).unwrap();
        let (free_tx, mut free_rx) = mpsc::channel(1);

        qm.add_worker(busy_tx).await;
        qm.add_worker(free_tx).await;

        qm.distribute(test_task(5)).await.unwrap();

        // The saturated inbox had no room, so the task is in the free one
        assert!(free_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_distribute_returns_task_when_all_busy() {
        let qm = QueueManager::new(&small_config());

        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(test_task(5)).unwrap();
        qm.add_worker(tx).await;

        let result = qm.distribute(test_task(7)).await;
        assert_eq!(result.unwrap_err().priority, 7);
    }

    #[tokio::test]
    async fn test_add_remove_worker() {
        let qm = QueueManager::new(&small_config());
        let (tx1, _rx1) = mpsc::channel(2);
        let (tx2, _rx2) = mpsc::channel(2);

        qm.add_worker(tx1.clone()).await;
        qm.add_worker(tx2).await;
        assert_eq!(qm.worker_count().await, 2);

        qm.remove_worker(&tx1).await;
        assert_eq!(qm.worker_count().await, 1);
    }

    #[tokio::test]
    async fn test_stats_reports_depths() {
        let qm = QueueManager::new(&small_config());
        qm.dispatch(test_task(9)).await.unwrap();
        qm.dispatch(test_task(5)).await.unwrap();
        qm.dispatch(test_task(5)).await.unwrap();

        let stats = qm.stats().await;
        assert_eq!(stats.high_depth, 1);
        assert_eq!(stats.normal_depth, 2);
        assert_eq!(stats.low_depth, 0);
        assert_eq!(stats.worker_count, 0);
    }
}
