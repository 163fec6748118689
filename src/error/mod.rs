use thiserror::Error;

/// Errors surfaced by the delivery pipeline to callers.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Backpressure shed the task; callers should surface a 503-class
    /// response. Not retried internally.
    #[error("task rejected due to overload (priority {priority})")]
    RejectedOverload { priority: i32 },

    /// The entry buffer is saturated. Not retried internally.
    #[error("entry queue full, task rejected")]
    QueueFull,

    /// The system is not running (submitted before start or after stop).
    #[error("delivery system is not running")]
    NotRunning,

    /// Graceful shutdown exceeded its deadline.
    #[error("delivery system stop timed out after {0:?}")]
    StopTimeout(std::time::Duration),
}

/// Errors from per-user workspace storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient; eligible for retry inside the delivery pipeline.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether a retry may succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Sqlx(_))
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;
