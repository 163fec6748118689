//! Per-user message and read-status storage.
//!
//! All operations run against one user's workspace: messages and channels
//! live in `messages.db`, read state in `read_status.db`. Inserts are
//! idempotent on the message id, so a whole-task redelivery cannot produce
//! duplicate rows for recipients that already succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::StorageError;
use crate::models::{now_millis, Channel, Message, ReadStatus};
use crate::workspace::Workspace;

/// Page size for the chunked unread-count computation.
const UNREAD_CHUNK_SIZE: usize = 512;

const MESSAGE_LIMIT_MAX: i64 = 100;

/// Aggregate statistics for one user workspace.
#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub total_messages: i64,
    pub total_channels: i64,
    pub unread_messages: i64,
    pub channel_stats: HashMap<String, i64>,
}

/// Storage operations bound to a single user's workspace.
pub struct UserStorage {
    workspace: Arc<Workspace>,
}

impl UserStorage {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    /// Insert a message, then bump the parent channel's `last_message_at`.
    ///
    /// Idempotent on the message id: returns `true` if a row was inserted,
    /// `false` if the id already existed.
    pub async fn create_message(&self, message: &Message) -> Result<bool, StorageError> {
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages
                (id, channel_id, title, content, message_type, priority, sender,
                 created_at, updated_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&message.id)
        .bind(&message.channel_id)
        .bind(&message.title)
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(message.priority)
        .bind(&message.sender)
        .bind(message.created_at)
        .bind(message.updated_at)
        .bind(metadata)
        .execute(&self.workspace.messages_db)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            sqlx::query("UPDATE channels SET last_message_at = ?1 WHERE id = ?2")
                .bind(message.created_at)
                .bind(&message.channel_id)
                .execute(&self.workspace.messages_db)
                .await?;
        }

        Ok(inserted)
    }

    /// Messages in a channel, newest first. `limit` is clamped to [1, 100].
    pub async fn get_messages(
        &self,
        channel_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, StorageError> {
        let limit = limit.clamp(1, MESSAGE_LIMIT_MAX);
        let offset = offset.max(0);

        let rows = sqlx::query(
            r#"
            SELECT id, channel_id, title, content, message_type, priority, sender,
                   created_at, updated_at, metadata
            FROM messages
            WHERE channel_id = ?1
            ORDER BY created_at DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(channel_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.workspace.messages_db)
        .await?;

        rows.iter().map(|row| self.row_to_message(row)).collect()
    }

    pub async fn get_message(&self, id: &str) -> Result<Message, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, channel_id, title, content, message_type, priority, sender,
                   created_at, updated_at, metadata
            FROM messages
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.workspace.messages_db)
        .await?;

        match row {
            Some(row) => self.row_to_message(&row),
            None => Err(StorageError::NotFound(format!("message {id}"))),
        }
    }

    pub async fn create_channel(&self, channel: &Channel) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, name, description, created_by, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(&channel.description)
        .bind(&channel.created_by)
        .bind(channel.created_at)
        .execute(&self.workspace.messages_db)
        .await?;

        Ok(())
    }

    pub async fn get_channel(&self, id: &str) -> Result<Channel, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, created_by, created_at, last_message_at
            FROM channels
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.workspace.messages_db)
        .await?;

        match row {
            Some(row) => row_to_channel(&row),
            None => Err(StorageError::NotFound(format!("channel {id}"))),
        }
    }

    pub async fn get_all_channels(&self) -> Result<Vec<Channel>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, description, created_by, created_at, last_message_at
            FROM channels
            ORDER BY last_message_at DESC, created_at DESC
            "#,
        )
        .fetch_all(&self.workspace.messages_db)
        .await?;

        rows.iter().map(row_to_channel).collect()
    }

    /// Upsert the read mark for one message.
    pub async fn mark_as_read(&self, message_id: &str, device: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO read_status (message_id, read_at, read_device)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(message_id)
        .bind(now_millis())
        .bind(device)
        .execute(&self.workspace.read_db)
        .await?;

        Ok(())
    }

    /// Upsert read marks for many messages inside one transaction.
    pub async fn mark_multiple_as_read(
        &self,
        message_ids: &[String],
        device: &str,
    ) -> Result<(), StorageError> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let read_at = now_millis();
        let mut tx = self.workspace.read_db.begin().await?;

        for message_id in message_ids {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO read_status (message_id, read_at, read_device)
                VALUES (?1, ?2, ?3)
                "#,
            )
            .bind(message_id)
            .bind(read_at)
            .bind(device)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn is_message_read(&self, message_id: &str) -> Result<bool, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM read_status WHERE message_id = ?1")
                .bind(message_id)
                .fetch_one(&self.workspace.read_db)
                .await?;
        Ok(count > 0)
    }

    pub async fn get_read_status(
        &self,
        message_id: &str,
    ) -> Result<Option<ReadStatus>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT message_id, read_at, read_device, archived_at, starred_at, metadata
            FROM read_status
            WHERE message_id = ?1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.workspace.read_db)
        .await?;

        match row {
            Some(row) => {
                let metadata: Option<String> = row.try_get("metadata")?;
                Ok(Some(ReadStatus {
                    message_id: row.try_get("message_id")?,
                    read_at: row.try_get("read_at")?,
                    read_device: row.try_get::<Option<String>, _>("read_device")?.unwrap_or_default(),
                    archived_at: row.try_get("archived_at")?,
                    starred_at: row.try_get("starred_at")?,
                    metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Unread count for one channel, or the whole workspace when
    /// `channel_id` is `None`.
    ///
    /// Messages and read marks live in separate databases, so the read side
    /// is computed in bounded id-chunks rather than loading every id into
    /// memory at once.
    pub async fn get_unread_count(&self, channel_id: Option<&str>) -> Result<i64, StorageError> {
        let total: i64 = match channel_id {
            Some(channel) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE channel_id = ?1")
                    .bind(channel)
                    .fetch_one(&self.workspace.messages_db)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM messages")
                    .fetch_one(&self.workspace.messages_db)
                    .await?
            }
        };

        if total == 0 {
            return Ok(0);
        }

        let mut read: i64 = 0;
        let mut last_id = String::new();

        loop {
            let ids: Vec<String> = match channel_id {
                Some(channel) => {
                    sqlx::query_scalar(
                        "SELECT id FROM messages WHERE channel_id = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
                    )
                    .bind(channel)
                    .bind(&last_id)
                    .bind(UNREAD_CHUNK_SIZE as i64)
                    .fetch_all(&self.workspace.messages_db)
                    .await?
                }
                None => {
                    sqlx::query_scalar("SELECT id FROM messages WHERE id > ?1 ORDER BY id LIMIT ?2")
                        .bind(&last_id)
                        .bind(UNREAD_CHUNK_SIZE as i64)
                        .fetch_all(&self.workspace.messages_db)
                        .await?
                }
            };

            let Some(last) = ids.last() else { break };
            last_id = last.clone();

            let placeholders = (1..=ids.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT COUNT(*) FROM read_status WHERE message_id IN ({placeholders})"
            );
            let mut query = sqlx::query_scalar::<_, i64>(&sql);
            for id in &ids {
                query = query.bind(id);
            }
            read += query.fetch_one(&self.workspace.read_db).await?;

            if ids.len() < UNREAD_CHUNK_SIZE {
                break;
            }
        }

        Ok(total - read)
    }

    /// Workspace-wide totals and per-channel message counts.
    pub async fn get_user_stats(&self) -> Result<UserStats, StorageError> {
        let total_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.workspace.messages_db)
            .await?;

        let total_channels: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM channels")
            .fetch_one(&self.workspace.messages_db)
            .await?;

        let unread_messages = self.get_unread_count(None).await?;

        let rows =
            sqlx::query("SELECT channel_id, COUNT(*) AS count FROM messages GROUP BY channel_id")
                .fetch_all(&self.workspace.messages_db)
                .await?;

        let mut channel_stats = HashMap::new();
        for row in rows {
            let channel: String = row.try_get("channel_id")?;
            let count: i64 = row.try_get("count")?;
            channel_stats.insert(channel, count);
        }

        Ok(UserStats {
            total_messages,
            total_channels,
            unread_messages,
            channel_stats,
        })
    }

    fn row_to_message(&self, row: &SqliteRow) -> Result<Message, StorageError> {
        let metadata: Option<String> = row.try_get("metadata")?;
        Ok(Message {
            id: row.try_get("id")?,
            // The column set is per-workspace; the owner is implicit
            user_id: self.workspace.user_id.clone(),
            channel_id: row.try_get("channel_id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            message_type: row.try_get("message_type")?,
            priority: row.try_get("priority")?,
            sender: row.try_get::<Option<String>, _>("sender")?.unwrap_or_default(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

fn row_to_channel(row: &SqliteRow) -> Result<Channel, StorageError> {
    Ok(Channel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row
            .try_get::<Option<String>, _>("description")?
            .unwrap_or_default(),
        created_by: row
            .try_get::<Option<String>, _>("created_by")?
            .unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        last_message_at: row.try_get("last_message_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_storage() -> (tempfile::TempDir, UserStorage) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Arc::new(Workspace::open(dir.path(), "user-1").await.unwrap());
        (dir, UserStorage::new(ws))
    }

    fn test_message(channel: &str) -> Message {
        Message::builder("user-1", channel)
            .title("title")
            .content("content")
            .sender("svc")
            .metadata(json!({"source": "test"}))
            .build()
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (_dir, storage) = test_storage().await;

        let msg = test_message("default");
        assert!(storage.create_message(&msg).await.unwrap());

        let fetched = storage.get_message(&msg.id).await.unwrap();
        assert_eq!(fetched, msg);
    }

    #[tokio::test]
    async fn test_create_message_is_idempotent() {
        let (_dir, storage) = test_storage().await;

        let msg = test_message("default");
        assert!(storage.create_message(&msg).await.unwrap());
        // Second insert with the same id is a no-op
        assert!(!storage.create_message(&msg).await.unwrap());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&storage.workspace.messages_db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_create_message_updates_channel() {
        let (_dir, storage) = test_storage().await;

        let msg = test_message("default");
        storage.create_message(&msg).await.unwrap();

        let channel = storage.get_channel("default").await.unwrap();
        assert_eq!(channel.last_message_at, Some(msg.created_at));
    }

    #[tokio::test]
    async fn test_get_message_not_found() {
        let (_dir, storage) = test_storage().await;
        let err = storage.get_message("missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_messages_ordering_and_limit() {
        let (_dir, storage) = test_storage().await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut msg = test_message("default");
            msg.created_at = msg.created_at + chrono::Duration::milliseconds(i);
            storage.create_message(&msg).await.unwrap();
            ids.push(msg.id.clone());
        }

        let messages = storage.get_messages("default", 3, 0).await.unwrap();
        assert_eq!(messages.len(), 3);
        // Newest first
        assert_eq!(messages[0].id, ids[4]);
        assert_eq!(messages[1].id, ids[3]);

        // Limit is clamped up from zero
        let clamped = storage.get_messages("default", 0, 0).await.unwrap();
        assert_eq!(clamped.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_crud() {
        let (_dir, storage) = test_storage().await;

        let channel = Channel::new("alerts", "Alerts", "alerting", "svc");
        storage.create_channel(&channel).await.unwrap();

        let fetched = storage.get_channel("alerts").await.unwrap();
        assert_eq!(fetched.name, "Alerts");

        let all = storage.get_all_channels().await.unwrap();
        assert_eq!(all.len(), 2); // default + alerts

        let err = storage.get_channel("missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_as_read_idempotent() {
        let (_dir, storage) = test_storage().await;

        let msg = test_message("default");
        storage.create_message(&msg).await.unwrap();

        storage.mark_as_read(&msg.id, "phone").await.unwrap();
        storage.mark_as_read(&msg.id, "laptop").await.unwrap();

        assert!(storage.is_message_read(&msg.id).await.unwrap());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM read_status")
            .fetch_one(&storage.workspace.read_db)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let status = storage.get_read_status(&msg.id).await.unwrap().unwrap();
        assert_eq!(status.read_device, "laptop");
    }

    #[tokio::test]
    async fn test_read_status_absent() {
        let (_dir, storage) = test_storage().await;
        assert!(!storage.is_message_read("nope").await.unwrap());
        assert!(storage.get_read_status("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_multiple_as_read() {
        let (_dir, storage) = test_storage().await;

        let mut ids = Vec::new();
        for _ in 0..4 {
            let msg = test_message("default");
            storage.create_message(&msg).await.unwrap();
            ids.push(msg.id.clone());
        }

        storage.mark_multiple_as_read(&ids[..3], "tablet").await.unwrap();

        assert_eq!(storage.get_unread_count(None).await.unwrap(), 1);
        assert!(storage.is_message_read(&ids[0]).await.unwrap());
        assert!(!storage.is_message_read(&ids[3]).await.unwrap());
    }

    #[tokio::test]
    async fn test_unread_count_per_channel() {
        let (_dir, storage) = test_storage().await;
        storage
            .create_channel(&Channel::new("alerts", "Alerts", "", "svc"))
            .await
            .unwrap();

        let in_default = test_message("default");
        let in_alerts = test_message("alerts");
        storage.create_message(&in_default).await.unwrap();
        storage.create_message(&in_alerts).await.unwrap();

        assert_eq!(storage.get_unread_count(Some("default")).await.unwrap(), 1);
        assert_eq!(storage.get_unread_count(Some("alerts")).await.unwrap(), 1);
        assert_eq!(storage.get_unread_count(None).await.unwrap(), 2);

        storage.mark_as_read(&in_alerts.id, "phone").await.unwrap();
        assert_eq!(storage.get_unread_count(Some("alerts")).await.unwrap(), 0);
        assert_eq!(storage.get_unread_count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_user_stats() {
        let (_dir, storage) = test_storage().await;

        for _ in 0..3 {
            storage.create_message(&test_message("default")).await.unwrap();
        }

        let stats = storage.get_user_stats().await.unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.total_channels, 1);
        assert_eq!(stats.unread_messages, 3);
        assert_eq!(stats.channel_stats.get("default"), Some(&3));
    }
}
