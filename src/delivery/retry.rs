//! Deferred redelivery with exponential backoff.
//!
//! Retries live in a bounded in-memory queue and are lost on restart;
//! delivery is at-least-once only within the retry bounds. Backoff doubles
//! per attempt up to a cap, with uniform +/-10% jitter so retried bursts
//! decorrelate instead of thundering back together.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use super::types::{DeliveryTask, RetryTask};

/// Queue capacity per allowed attempt.
const QUEUE_SLOTS_PER_RETRY: usize = 100;

pub struct RetryManager {
    tx: mpsc::Sender<RetryTask>,
    rx: Mutex<mpsc::Receiver<RetryTask>>,
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl RetryManager {
    pub fn new(max_retries: u32, backoff_base: Duration, backoff_max: Duration) -> Self {
        let capacity = (max_retries as usize * QUEUE_SLOTS_PER_RETRY).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            max_retries,
            backoff_base,
            backoff_max,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Capped exponential delay for a task that has already made
    /// `retry_count` attempts, before jitter.
    fn backoff_delay(&self, retry_count: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry_count))
            .min(self.backoff_max)
    }

    /// Defer a failed task for another attempt.
    ///
    /// Returns `false` when the task has exhausted its attempts or the
    /// retry queue is full; the caller marks the task failed either way.
    pub fn schedule_retry(&self, task: DeliveryTask, reason: &str) -> bool {
        if task.retry_count >= self.max_retries {
            return false;
        }

        let delay = self.backoff_delay(task.retry_count);
        let jittered = delay.mul_f64(1.0 + rand::thread_rng().gen_range(-0.1..0.1));

        let retry = RetryTask {
            retry_count: task.retry_count + 1,
            next_fire_at: Instant::now() + jittered,
            reason: reason.to_string(),
            task,
        };
        let attempt = retry.retry_count;
        let task_id = retry.task.id.clone();

        match self.tx.try_send(retry) {
            Ok(()) => {
                tracing::info!(
                    task_id = %task_id,
                    attempt = attempt,
                    delay_ms = jittered.as_millis() as u64,
                    reason = reason,
                    "Task scheduled for retry"
                );
                true
            }
            Err(_) => {
                tracing::warn!(task_id = %task_id, "Retry queue full, task abandoned");
                false
            }
        }
    }

    /// Pop the next due retry, if any. Non-blocking.
    ///
    /// Examines each currently queued entry at most once: not-yet-due
    /// entries are re-enqueued in their original order.
    pub async fn next_due(&self) -> Option<RetryTask> {
        let mut rx = self.rx.lock().await;

        let mut found = None;
        let mut not_due = Vec::new();

        for _ in 0..self.tx.max_capacity() {
            let Ok(retry) = rx.try_recv() else { break };
            if retry.is_due() {
                found = Some(retry);
                break;
            }
            not_due.push(retry);
        }

        for retry in not_due {
            if self.tx.try_send(retry).is_err() {
                tracing::warn!("Retry queue full, pending retry lost");
            }
        }

        found
    }

    /// Number of queued retries.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}
