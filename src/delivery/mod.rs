//! Asynchronous delivery pipeline.
//!
//! Submissions pass an admission filter (backpressure keyed on memory
//! pressure), flow through an entry buffer into priority buckets, and are
//! distributed round-robin to worker inboxes. Workers persist each message
//! into every recipient's workspace and hand it to the push broadcaster;
//! transient failures go through the retry manager with exponential
//! backoff. Priority is numeric 1-10, higher is more important.

mod backpressure;
mod pressure;
mod queue;
mod retry;
mod system;
mod types;
mod worker;

pub use backpressure::BackpressureController;
pub use pressure::{classify_pressure, FixedProbe, MemoryProbe, ProcMemoryProbe};
pub use queue::{QueueManager, QueueStats};
pub use retry::RetryManager;
pub use system::DeliverySystem;
pub use types::{DeliveryStats, DeliveryStatsSnapshot, DeliveryTask, MemoryPressure, RetryTask};
pub use worker::{DeliveryContext, DeliveryWorker};
