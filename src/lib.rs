// Configuration and shared infrastructure
pub mod config;
pub mod error;

// Domain types
pub mod models;

// Per-user storage layer
pub mod storage;
pub mod workspace;

// Live push fan-out contract
pub mod push;

// Asynchronous delivery pipeline
pub mod delivery;

pub use delivery::{DeliveryStatsSnapshot, DeliverySystem, DeliveryTask};
pub use error::{DeliveryError, StorageError};
pub use models::{Channel, Message, MessageBuilder, ReadStatus};
pub use push::{LocalBroadcaster, NoopBroadcaster, PushBroadcaster};
pub use workspace::{Workspace, WorkspaceManager};
