use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowest numeric priority a message may carry.
pub const PRIORITY_MIN: i32 = 1;
/// Highest numeric priority a message may carry.
pub const PRIORITY_MAX: i32 = 10;
/// Priority assigned when a submission does not specify one.
pub const PRIORITY_DEFAULT: i32 = 5;

/// Clamp a priority into the valid [1, 10] range.
///
/// Higher numeric value means more important, everywhere in this crate.
pub fn clamp_priority(priority: i32) -> i32 {
    priority.clamp(PRIORITY_MIN, PRIORITY_MAX)
}

/// Wall-clock UTC timestamp truncated to millisecond precision.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A message delivered into a recipient's workspace.
///
/// Immutable once inserted into storage; `user_id` is rewritten per
/// recipient during fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique within a user workspace
    pub id: String,
    /// Owning recipient for storage rows
    pub user_id: String,
    pub channel_id: String,
    pub title: String,
    pub content: String,
    /// Defaults to "text"
    pub message_type: String,
    /// 1-10, higher is more important
    pub priority: i32,
    pub sender: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Free-form map, persisted as JSON text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    /// Create a builder for a message addressed to `user_id` in `channel_id`.
    pub fn builder(user_id: impl Into<String>, channel_id: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(user_id, channel_id)
    }
}

/// Builder for creating messages
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    user_id: String,
    channel_id: String,
    title: String,
    content: String,
    message_type: String,
    priority: i32,
    sender: String,
    metadata: Option<serde_json::Value>,
}

impl MessageBuilder {
    pub fn new(user_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            title: String::new(),
            content: String::new(),
            message_type: "text".to_string(),
            priority: PRIORITY_DEFAULT,
            sender: String::new(),
            metadata: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    /// Set the priority; values outside [1, 10] are clamped.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn build(self) -> Message {
        let now = now_millis();
        Message {
            id: Uuid::new_v4().to_string(),
            user_id: self.user_id,
            channel_id: self.channel_id,
            title: self.title,
            content: self.content,
            message_type: self.message_type,
            priority: self.priority,
            sender: self.sender,
            created_at: now,
            updated_at: now,
            metadata: self.metadata,
        }
    }
}

/// A channel inside a user workspace.
///
/// Every workspace owns its own channel set and always contains a channel
/// with id `"default"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            created_by: created_by.into(),
            created_at: now_millis(),
            last_message_at: None,
        }
    }

    /// The channel guaranteed to exist in every workspace.
    pub fn default_channel() -> Self {
        Self::new("default", "Default", "Default message channel", "system")
    }
}

/// Read-status row for a message; insert-or-replace on mark-read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadStatus {
    pub message_id: String,
    pub read_at: DateTime<Utc>,
    pub read_device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starred_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_builder() {
        let msg = Message::builder("user-1", "default")
            .title("greetings")
            .content("hi")
            .priority(7)
            .sender("svc-a")
            .metadata(json!({"k": "v"}))
            .build();

        assert_eq!(msg.user_id, "user-1");
        assert_eq!(msg.channel_id, "default");
        assert_eq!(msg.message_type, "text");
        assert_eq!(msg.priority, 7);
        assert_eq!(msg.created_at, msg.updated_at);
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_priority_clamped() {
        let high = Message::builder("u", "c").priority(42).build();
        assert_eq!(high.priority, PRIORITY_MAX);

        let low = Message::builder("u", "c").priority(-3).build();
        assert_eq!(low.priority, PRIORITY_MIN);
    }

    #[test]
    fn test_default_priority() {
        let msg = Message::builder("u", "c").build();
        assert_eq!(msg.priority, PRIORITY_DEFAULT);
    }

    #[test]
    fn test_timestamps_millisecond_precision() {
        let ts = now_millis();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_default_channel() {
        let channel = Channel::default_channel();
        assert_eq!(channel.id, "default");
        assert_eq!(channel.created_by, "system");
        assert!(channel.last_message_at.is_none());
    }
}
