//! Long-lived delivery workers.
//!
//! Each worker owns a bounded inbox and drains it until shutdown. A task is
//! delivered recipient by recipient: resolve the workspace, probe the
//! database, insert the message, hand it to the push broadcaster. One
//! failed recipient never fails the task; only a task with zero successful
//! recipients goes back through the retry manager.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use crate::error::StorageError;
use crate::push::PushBroadcaster;
use crate::storage::UserStorage;
use crate::workspace::{Workspace, WorkspaceManager};

use super::retry::RetryManager;
use super::types::{DeliveryStats, DeliveryTask};

/// Attempts when probing a workspace database before writing.
const AVAILABILITY_ATTEMPTS: u32 = 3;

/// Base pause between availability probes; grows linearly per attempt.
const AVAILABILITY_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Shared collaborators handed to every worker.
pub struct DeliveryContext {
    pub stats: Arc<DeliveryStats>,
    pub retry: Arc<RetryManager>,
    pub workspaces: Arc<WorkspaceManager>,
    pub broadcaster: Arc<dyn PushBroadcaster>,
}

pub struct DeliveryWorker {
    id: usize,
    inbox: mpsc::Receiver<DeliveryTask>,
    ctx: Arc<DeliveryContext>,
    /// Task id -> pickup time, for diagnostics
    active_jobs: DashMap<String, Instant>,
}

impl DeliveryWorker {
    pub fn new(id: usize, inbox: mpsc::Receiver<DeliveryTask>, ctx: Arc<DeliveryContext>) -> Self {
        Self {
            id,
            inbox,
            ctx,
            active_jobs: DashMap::new(),
        }
    }

    /// Drain the inbox until shutdown. The in-flight task is finished, but
    /// no new inbox reads happen once the shutdown signal is observed.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(worker_id = self.id, "Delivery worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                maybe_task = self.inbox.recv() => {
                    match maybe_task {
                        Some(task) => self.process_task(task).await,
                        None => break,
                    }
                }
            }
        }

        tracing::info!(worker_id = self.id, "Delivery worker stopped");
    }

    async fn process_task(&self, task: DeliveryTask) {
        let start = Instant::now();
        let task_id = task.id.clone();
        self.active_jobs.insert(task_id.clone(), start);

        self.handle_task(task, start).await;

        self.active_jobs.remove(&task_id);
    }

    async fn handle_task(&self, task: DeliveryTask, start: Instant) {
        if task.is_expired() {
            tracing::info!(
                worker_id = self.id,
                task_id = %task.id,
                "Task expired before pickup"
            );
            self.schedule_retry(task, "task_expired");
            return;
        }

        let recipients: Vec<String> = if !task.target_users.is_empty() {
            task.target_users.clone()
        } else if !task.message.user_id.is_empty() {
            vec![task.message.user_id.clone()]
        } else {
            // Permanent malformation: nothing to deliver to, never retried.
            // Still counted as failed so admitted tasks always settle.
            self.ctx.stats.total_failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                worker_id = self.id,
                task_id = %task.id,
                "Task has no target users, dropping"
            );
            return;
        };

        let mut success_count = 0usize;
        for user_id in &recipients {
            match self.deliver_to_user(user_id, &task).await {
                Ok(()) => success_count += 1,
                Err(e) => {
                    tracing::warn!(
                        worker_id = self.id,
                        task_id = %task.id,
                        user_id = %user_id,
                        error = %e,
                        "Failed to deliver to user"
                    );
                }
            }
        }

        if success_count > 0 {
            self.ctx.stats.record_delivery(start.elapsed());
        }

        if success_count == 0 && !recipients.is_empty() {
            self.schedule_retry(task, "all_users_failed");
        }
    }

    async fn deliver_to_user(&self, user_id: &str, task: &DeliveryTask) -> Result<(), StorageError> {
        let workspace = self.ctx.workspaces.get_workspace(user_id).await?;

        self.ensure_available(&workspace).await?;

        let mut message = task.message.clone();
        message.user_id = user_id.to_string();

        let storage = UserStorage::new(workspace);
        let inserted = storage.create_message(&message).await?;
        if !inserted {
            // Already delivered on an earlier attempt of this task
            tracing::debug!(
                worker_id = self.id,
                message_id = %message.id,
                user_id = %user_id,
                "Message already present, skipping insert"
            );
        }

        self.ctx.broadcaster.publish(user_id, &message).await;

        tracing::debug!(
            worker_id = self.id,
            message_id = %message.id,
            user_id = %user_id,
            "Message delivered"
        );

        Ok(())
    }

    /// Probe the messages database with `SELECT 1`, backing off linearly,
    /// so a write never queues behind a wedged handle.
    async fn ensure_available(&self, workspace: &Workspace) -> Result<(), StorageError> {
        for attempt in 1..=AVAILABILITY_ATTEMPTS {
            match sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&workspace.messages_db)
                .await
            {
                Ok(1) => return Ok(()),
                Ok(_) | Err(_) if attempt < AVAILABILITY_ATTEMPTS => {
                    tokio::time::sleep(AVAILABILITY_RETRY_DELAY * attempt).await;
                }
                Ok(_) | Err(_) => {}
            }
        }

        Err(StorageError::Unavailable(format!(
            "messages database for user {} not responding",
            workspace.user_id
        )))
    }

    fn schedule_retry(&self, task: DeliveryTask, reason: &str) {
        let task_id = task.id.clone();
        if self.ctx.retry.schedule_retry(task, reason) {
            self.ctx.stats.total_retried.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ctx.stats.total_failed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(task_id = %task_id, reason = reason, "Task abandoned, retries exhausted");
        }
    }

    /// Tasks currently being processed by this worker.
    pub fn active_task_count(&self) -> usize {
        self.active_jobs.len()
    }
}
