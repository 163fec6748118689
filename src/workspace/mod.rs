//! Per-user isolated storage workspaces.
//!
//! Each user owns a directory under the service storage root containing two
//! SQLite databases: `messages.db` (messages and channels) and
//! `read_status.db` (read-state tables). Workspaces are created lazily on
//! first access and cached; the cache is the sole owner of handle lifetime.

mod cache;
mod manager;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, SqlitePool};

use crate::error::StorageError;
use crate::models::Channel;

pub use cache::{CacheStats, WorkspaceCache};
pub use manager::WorkspaceManager;

/// Pool size per workspace database. WAL mode serializes writers, so a
/// handful of connections covers one writer plus concurrent readers.
const POOL_MAX_CONNECTIONS: u32 = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A user's on-disk workspace: two open SQLite pools and the directory
/// holding them.
pub struct Workspace {
    pub user_id: String,
    pub base_path: PathBuf,
    /// Messages and channels database
    pub messages_db: SqlitePool,
    /// Read-status database
    pub read_db: SqlitePool,
}

impl Workspace {
    /// Open (creating if necessary) the workspace for `user_id` under
    /// `storage_root`. Configures WAL journaling with fsync-on-commit-only
    /// durability, initializes the schema, and guarantees the default
    /// channel exists.
    pub async fn open(storage_root: &Path, user_id: &str) -> Result<Self, StorageError> {
        let base_path = storage_root.join(user_id);
        std::fs::create_dir_all(&base_path)?;
        // Reserved directories for sync state and backups
        std::fs::create_dir_all(base_path.join(".sync"))?;
        std::fs::create_dir_all(base_path.join("backups"))?;

        let messages_db = open_database(&base_path.join("messages.db"), "10000").await?;
        let read_db = match open_database(&base_path.join("read_status.db"), "5000").await {
            Ok(pool) => pool,
            Err(e) => {
                messages_db.close().await;
                return Err(e);
            }
        };

        let ws = Self {
            user_id: user_id.to_string(),
            base_path,
            messages_db,
            read_db,
        };

        if let Err(e) = ws.init_schema().await {
            ws.close().await;
            return Err(e);
        }

        Ok(ws)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        // Raw execute: the schema strings contain multiple statements
        self.messages_db.execute(MESSAGES_SCHEMA).await?;
        self.read_db.execute(READ_STATUS_SCHEMA).await?;
        self.ensure_default_channel().await?;
        Ok(())
    }

    async fn ensure_default_channel(&self) -> Result<(), StorageError> {
        let channel = Channel::default_channel();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO channels (id, name, description, created_by, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(&channel.description)
        .bind(&channel.created_by)
        .bind(channel.created_at)
        .execute(&self.messages_db)
        .await?;
        Ok(())
    }

    /// Whether both pools have been closed.
    pub fn is_closed(&self) -> bool {
        self.messages_db.is_closed() && self.read_db.is_closed()
    }

    /// Close both database pools. Safe to call more than once.
    pub async fn close(&self) {
        self.messages_db.close().await;
        self.read_db.close().await;
        tracing::debug!(user_id = %self.user_id, "Workspace closed");
    }
}

async fn open_database(path: &Path, cache_size: &str) -> Result<SqlitePool, StorageError> {
    let url = format!("sqlite://{}", path.to_string_lossy());
    let options = SqliteConnectOptions::from_str(&url)
        .map_err(StorageError::Sqlx)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .pragma("cache_size", cache_size.to_string());

    let pool = SqlitePoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    Ok(pool)
}

const MESSAGES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    message_type TEXT DEFAULT 'text',
    priority INTEGER DEFAULT 5,
    sender TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_channel_created ON messages(channel_id, created_at);
CREATE INDEX IF NOT EXISTS idx_created ON messages(created_at);
CREATE INDEX IF NOT EXISTS idx_priority ON messages(priority);

CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    created_by TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    last_message_at DATETIME
);

CREATE TABLE IF NOT EXISTS user_channels (
    channel_id TEXT,
    user_id TEXT,
    joined_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    is_muted BOOLEAN DEFAULT FALSE,
    PRIMARY KEY (channel_id, user_id)
);
"#;

const READ_STATUS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS read_status (
    message_id TEXT PRIMARY KEY,
    read_at DATETIME NOT NULL,
    read_device TEXT,
    archived_at DATETIME,
    starred_at DATETIME,
    metadata TEXT
);

CREATE TABLE IF NOT EXISTS read_stats (
    date TEXT PRIMARY KEY,
    total_read INTEGER DEFAULT 0,
    channel_stats TEXT,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS reading_position (
    channel_id TEXT PRIMARY KEY,
    last_read_message_id TEXT,
    last_read_at DATETIME,
    position INTEGER DEFAULT 0
);
"#;
