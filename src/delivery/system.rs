//! Delivery system orchestration and lifecycle.
//!
//! Owns the admission path and four long-lived loops: the main loop moves
//! admitted tasks from the entry buffer into priority buckets, the
//! queue-manager loop drains buckets into worker inboxes, the retry loop
//! re-injects due retries, and the stats loop publishes periodic snapshots.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::DeliveryError;
use crate::models::Message;
use crate::push::PushBroadcaster;
use crate::workspace::WorkspaceManager;

use super::backpressure::BackpressureController;
use super::pressure::{MemoryProbe, ProcMemoryProbe};
use super::queue::QueueManager;
use super::retry::RetryManager;
use super::types::{DeliveryStats, DeliveryStatsSnapshot, DeliveryTask};
use super::worker::{DeliveryContext, DeliveryWorker};

/// Bounded wait when admitting a task into the entry buffer.
const SUBMIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause before re-enqueueing a task that found every worker inbox busy.
const REDISPATCH_DELAY: Duration = Duration::from_millis(50);

const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for all loops and workers to finish on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DeliverySystem {
    entry_tx: mpsc::Sender<DeliveryTask>,
    entry_rx: std::sync::Mutex<Option<mpsc::Receiver<DeliveryTask>>>,
    queue: Arc<QueueManager>,
    backpressure: Arc<BackpressureController>,
    ctx: Arc<DeliveryContext>,
    stats: Arc<DeliveryStats>,
    shutdown_tx: broadcast::Sender<()>,
    workers: std::sync::Mutex<Vec<(mpsc::Sender<DeliveryTask>, DeliveryWorker)>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    scale_up_hints: Arc<AtomicU64>,
    scale_down_hints: Arc<AtomicU64>,
    worker_count: usize,
    entry_size: usize,
    min_workers: usize,
    max_workers: usize,
    task_timeout: Duration,
}

impl DeliverySystem {
    /// Build the system with the default memory probe.
    pub fn new(
        settings: &Settings,
        workspaces: Arc<WorkspaceManager>,
        broadcaster: Arc<dyn PushBroadcaster>,
    ) -> Self {
        let probe = Arc::new(ProcMemoryProbe::new(
            settings.performance.backpressure.memory_pressure_thresholds,
        ));
        Self::with_probe(settings, workspaces, broadcaster, probe)
    }

    /// Build the system with an explicit memory probe.
    pub fn with_probe(
        settings: &Settings,
        workspaces: Arc<WorkspaceManager>,
        broadcaster: Arc<dyn PushBroadcaster>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let workers_cfg = &settings.delivery.workers;
        let queue_cfg = &settings.delivery.queue;
        let task_cfg = &settings.delivery.task;

        let worker_count = workers_cfg.resolve_count();
        let (entry_tx, entry_rx) = mpsc::channel(queue_cfg.entry_size.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        let stats = Arc::new(DeliveryStats::default());
        let queue = Arc::new(QueueManager::new(queue_cfg));
        let retry = Arc::new(RetryManager::new(
            task_cfg.max_retries,
            task_cfg.retry_backoff_base(),
            task_cfg.retry_backoff_max(),
        ));
        let backpressure = Arc::new(BackpressureController::new(
            probe,
            settings.performance.backpressure.reject_rates,
        ));

        let ctx = Arc::new(DeliveryContext {
            stats: stats.clone(),
            retry,
            workspaces,
            broadcaster,
        });

        let workers = (0..worker_count)
            .map(|id| {
                let (tx, rx) = mpsc::channel(queue_cfg.worker_size.max(1));
                (tx.clone(), DeliveryWorker::new(id, rx, ctx.clone()))
            })
            .collect();

        Self {
            entry_tx,
            entry_rx: std::sync::Mutex::new(Some(entry_rx)),
            queue,
            backpressure,
            ctx,
            stats,
            shutdown_tx,
            workers: std::sync::Mutex::new(workers),
            handles: std::sync::Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            scale_up_hints: Arc::new(AtomicU64::new(0)),
            scale_down_hints: Arc::new(AtomicU64::new(0)),
            worker_count,
            entry_size: queue_cfg.entry_size.max(1),
            min_workers: workers_cfg.min_count,
            max_workers: workers_cfg.max_count,
            task_timeout: task_cfg.timeout(),
        }
    }

    /// Spawn the worker pool and the four pipeline loops.
    pub async fn start(&self) -> Result<(), DeliveryError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let entry_rx = match self.entry_rx.lock().expect("entry lock poisoned").take() {
            Some(rx) => rx,
            None => {
                // The pipeline cannot be restarted once stopped
                self.running.store(false, Ordering::SeqCst);
                return Err(DeliveryError::NotRunning);
            }
        };

        let workers: Vec<_> = self
            .workers
            .lock()
            .expect("workers lock poisoned")
            .drain(..)
            .collect();

        let mut handles = Vec::new();

        for (inbox_tx, worker) in workers {
            self.queue.add_worker(inbox_tx).await;
            handles.push(tokio::spawn(worker.run(self.shutdown_tx.subscribe())));
        }
        self.stats
            .active_workers
            .store(self.worker_count, Ordering::Relaxed);

        handles.push(tokio::spawn(Self::run_main_loop(
            entry_rx,
            self.queue.clone(),
            self.stats.clone(),
            self.shutdown_tx.subscribe(),
        )));

        handles.push(self.spawn_queue_loop());
        handles.push(tokio::spawn(Self::run_retry_loop(
            self.queue.clone(),
            self.ctx.clone(),
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(Self::run_stats_loop(
            self.queue.clone(),
            self.stats.clone(),
            self.backpressure.clone(),
            self.shutdown_tx.subscribe(),
        )));

        *self.handles.lock().expect("handles lock poisoned") = handles;

        tracing::info!(workers = self.worker_count, "Delivery system started");
        Ok(())
    }

    /// Signal cancellation, join every loop within the deadline, then close
    /// the workspace cache last.
    pub async fn stop(&self) -> Result<(), DeliveryError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Stopping delivery system");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("handles lock poisoned")
            .drain(..)
            .collect();

        let joined = tokio::time::timeout(STOP_TIMEOUT, futures::future::join_all(handles)).await;

        match joined {
            Ok(_) => {
                self.ctx.workspaces.close().await;
                tracing::info!("Delivery system stopped gracefully");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(deadline_secs = STOP_TIMEOUT.as_secs(), "Delivery system stop timed out");
                Err(DeliveryError::StopTimeout(STOP_TIMEOUT))
            }
        }
    }

    /// Admit a task into the pipeline.
    ///
    /// Synchronous acknowledgement only: `Ok` means "accepted for
    /// delivery", the delivery itself is asynchronous.
    pub async fn submit(&self, mut task: DeliveryTask) -> Result<(), DeliveryError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(DeliveryError::NotRunning);
        }

        if !self.backpressure.should_accept(task.priority) {
            return Err(DeliveryError::RejectedOverload {
                priority: task.priority,
            });
        }

        if task.id.is_empty() {
            task.id = Uuid::new_v4().to_string();
        }
        if task.timeout.is_zero() {
            task.timeout = self.task_timeout;
        }

        match self.entry_tx.send_timeout(task, SUBMIT_TIMEOUT).await {
            Ok(()) => {
                self.stats.total_received.fetch_add(1, Ordering::Relaxed);
                self.stats.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => Err(DeliveryError::QueueFull),
        }
    }

    /// Convenience wrapper: fan one message out to `target_users`.
    pub async fn submit_message(
        &self,
        message: Message,
        target_users: Vec<String>,
    ) -> Result<(), DeliveryError> {
        self.submit(DeliveryTask::from_message(message, target_users))
            .await
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    /// (scale-up, scale-down) hints recorded by the queue loop. Advisory
    /// only; the pool itself stays fixed.
    pub fn scale_hints(&self) -> (u64, u64) {
        (
            self.scale_up_hints.load(Ordering::Relaxed),
            self.scale_down_hints.load(Ordering::Relaxed),
        )
    }

    async fn run_main_loop(
        mut entry_rx: mpsc::Receiver<DeliveryTask>,
        queue: Arc<QueueManager>,
        stats: Arc<DeliveryStats>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!("Delivery main loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                maybe_task = entry_rx.recv() => {
                    let Some(task) = maybe_task else { break };
                    stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    if let Err(task) = queue.dispatch(task).await {
                        stats.total_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(task_id = %task.id, "Failed to dispatch task to priority queue");
                    }
                }
            }
        }

        tracing::info!("Delivery main loop stopped");
    }

    fn spawn_queue_loop(&self) -> JoinHandle<()> {
        tokio::spawn(Self::run_queue_loop(
            self.queue.clone(),
            self.stats.clone(),
            self.shutdown_tx.subscribe(),
            HintCounters {
                up: self.scale_up_hints.clone(),
                down: self.scale_down_hints.clone(),
            },
            self.entry_size,
            self.worker_count,
            self.min_workers,
            self.max_workers,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_queue_loop(
        queue: Arc<QueueManager>,
        stats: Arc<DeliveryStats>,
        mut shutdown: broadcast::Receiver<()>,
        hints: HintCounters,
        entry_size: usize,
        worker_count: usize,
        min_workers: usize,
        max_workers: usize,
    ) {
        tracing::info!("Queue manager loop started");

        let mut timer = tokio::time::interval(QUEUE_DRAIN_INTERVAL);
        timer.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = timer.tick() => {
                    Self::drain_priority_queues(&queue, &stats).await;

                    let depth = stats.queue_depth.load(Ordering::Relaxed);
                    if depth > entry_size / 2 && worker_count < max_workers {
                        hints.up.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            queue_depth = depth,
                            workers = worker_count,
                            "Queue backlog high, scale-up suggested"
                        );
                    } else if depth < entry_size / 10 && worker_count > min_workers {
                        hints.down.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        tracing::info!("Queue manager loop stopped");
    }

    /// Move tasks from the priority buckets into worker inboxes. On inbox
    /// contention the task goes back to its bucket after a short pause and
    /// the drain stops for this tick, so an already-scheduled burst is
    /// never starved by the fast path.
    async fn drain_priority_queues(queue: &QueueManager, stats: &DeliveryStats) {
        while let Some(task) = queue.next_task().await {
            if let Err(task) = queue.distribute(task).await {
                tokio::time::sleep(REDISPATCH_DELAY).await;
                if let Err(task) = queue.dispatch(task).await {
                    stats.total_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(task_id = %task.id, "Dropped task, priority queue full on re-enqueue");
                }
                break;
            }
        }
    }

    async fn run_retry_loop(
        queue: Arc<QueueManager>,
        ctx: Arc<DeliveryContext>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!("Retry loop started");

        let mut timer = tokio::time::interval(RETRY_INTERVAL);
        timer.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = timer.tick() => {
                    while let Some(retry) = ctx.retry.next_due().await {
                        let mut task = retry.task;
                        task.retry_count = retry.retry_count;

                        tracing::info!(
                            task_id = %task.id,
                            attempt = retry.retry_count,
                            reason = %retry.reason,
                            "Retrying task"
                        );

                        if let Err(task) = queue.distribute(task).await {
                            // All inboxes busy; push the retry back out
                            if !ctx.retry.schedule_retry(task, "worker_queue_full") {
                                ctx.stats.total_failed.fetch_add(1, Ordering::Relaxed);
                            }
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Retry loop stopped");
    }

    async fn run_stats_loop(
        queue: Arc<QueueManager>,
        stats: Arc<DeliveryStats>,
        backpressure: Arc<BackpressureController>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!("Stats loop started");

        let mut timer = tokio::time::interval(STATS_INTERVAL);
        timer.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = timer.tick() => {
                    backpressure.reset_window();

                    let snapshot = stats.snapshot();
                    let queue_stats = queue.stats().await;
                    let (rejected, accepted, rate) = backpressure.stats();

                    tracing::info!(
                        received = snapshot.total_received,
                        delivered = snapshot.total_delivered,
                        failed = snapshot.total_failed,
                        retried = snapshot.total_retried,
                        avg_delivery_ms = format!("{:.1}", snapshot.avg_delivery_time_ms),
                        queue_depth = snapshot.queue_depth,
                        active_workers = snapshot.active_workers,
                        high_depth = queue_stats.high_depth,
                        normal_depth = queue_stats.normal_depth,
                        low_depth = queue_stats.low_depth,
                        bp_accepted = accepted,
                        bp_rejected = rejected,
                        bp_rate = format!("{rate:.2}"),
                        "Delivery system stats"
                    );
                }
            }
        }

        tracing::info!("Stats loop stopped");
    }
}

struct HintCounters {
    up: Arc<AtomicU64>,
    down: Arc<AtomicU64>,
}
