use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch. Message timestamps double as message
/// identity inside one conversation, so they are kept as raw integers.
pub type Timestamp = i64;

pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

pub fn format_timestamp(ts: Timestamp) -> String {
    Utc.timestamp_millis_opt(ts)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Who blocked whom, and where the reconciliation flow currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BlockStatus {
    BlockedByUser {
        since: Timestamp,
    },
    PendingSystemReflection {
        since: Timestamp,
    },
    PendingUserApproval {
        reason: String,
        requested_at: Timestamp,
    },
}

impl BlockStatus {
    pub fn label(&self) -> &'static str {
        match self {
            BlockStatus::BlockedByUser { .. } => "blocked_by_user",
            BlockStatus::PendingSystemReflection { .. } => "pending_system_reflection",
            BlockStatus::PendingUserApproval { .. } => "pending_user_approval",
        }
    }
}

/// A simulated character and the bookkeeping the background core owns for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub persona: String,
    pub block_status: Option<BlockStatus>,
    /// Visible exchanges so far. Written by the chat collaborator only.
    pub action_count: u64,
    pub last_summary_action_count: u64,
    pub pending_summary: Option<PendingSummary>,
    pub created_at: Timestamp,
}

impl Agent {
    pub fn summary_gap(&self) -> u64 {
        self.action_count
            .saturating_sub(self.last_summary_action_count)
    }

    pub fn has_pending_summary(&self) -> bool {
        self.pending_summary
            .as_ref()
            .map(|pending| !pending.threads.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub enable_offline_sim: bool,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Sticker,
    System,
}

impl MessageKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Sticker => "sticker",
            MessageKind::System => "system",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sticker" => MessageKind::Sticker,
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        }
    }
}

pub const USER_SENDER_ID: &str = "user";
pub const SYSTEM_SENDER_ID: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    /// Agent id for private chats, group id for group chats.
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub hidden: bool,
    /// System events that should make the agent react on the next tick.
    pub reactive: bool,
    pub timestamp: Timestamp,
}

impl ChatMessage {
    pub fn is_summarizable(&self) -> bool {
        !self.hidden && self.kind != MessageKind::System
    }

    pub fn is_reactive_event(&self) -> bool {
        self.kind == MessageKind::System && self.reactive
    }
}

/// One topical segment of conversation as returned by the summarization call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub topic_summary: String,
    pub keywords: Vec<String>,
    pub message_timestamps: Vec<Timestamp>,
    #[serde(default)]
    pub ongoing: bool,
    #[serde(default)]
    pub priority: i64,
}

impl Thread {
    pub fn time_range(&self) -> Option<(Timestamp, Timestamp)> {
        let start = self.message_timestamps.iter().min()?;
        let end = self.message_timestamps.iter().max()?;
        Some((*start, *end))
    }
}

/// Threads not yet resolved into a [`SummaryRecord`], carried to the next pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSummary {
    pub threads: Vec<Thread>,
    pub analyzed_up_to: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub keywords: Vec<String>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub priority: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub agent_id: String,
    pub other_id: String,
    pub score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedComment {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPost {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: Timestamp,
    pub likes: Vec<String>,
    pub comments: Vec<FeedComment>,
}

/// An expressive resource (sticker) an agent may send instead of text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sticker {
    pub id: String,
    pub name: String,
    pub description: String,
}
