//! Shared domain types for conversations and the message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Kind of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
}

/// One record in the rolled conversation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Conversation flavor: guided problem tutoring or open teacher chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Tutoring,
    Chat,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Tutoring => "tutoring",
            ConversationKind::Chat => "chat",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "tutoring" | "solving" => ConversationKind::Tutoring,
            _ => ConversationKind::Chat,
        }
    }
}

/// Live session FSM state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Listening => "listening",
            ConversationState::Processing => "processing",
            ConversationState::Speaking => "speaking",
        }
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

/// Session metadata mirrored in the shared keyed store under `conv:session:{id}`.
///
/// Seeded by the conversation-create endpoint before the live connection
/// opens; mutated by the orchestrator for the rest of the session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub user_id: i64,
    pub kind: ConversationKind,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub state: ConversationState,
    pub tts_playing: bool,
    pub ws_connected: bool,
    pub initial_user_message: Option<String>,
}

impl SessionMeta {
    /// New active session seeded at `now`.
    pub fn new(user_id: i64, kind: ConversationKind) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            kind,
            status: SessionStatus::Active,
            started_at: now,
            last_active_at: now,
            state: ConversationState::Idle,
            tts_playing: false,
            ws_connected: false,
            initial_user_message: None,
        }
    }

    /// Flatten into the string fields of the store hash.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("user_id".to_string(), self.user_id.to_string()),
            ("type".to_string(), self.kind.as_str().to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("started_at".to_string(), self.started_at.to_rfc3339()),
            ("last_active_at".to_string(), self.last_active_at.to_rfc3339()),
            ("state".to_string(), self.state.as_str().to_string()),
            ("tts_playing".to_string(), self.tts_playing.to_string()),
            ("ws_connected".to_string(), self.ws_connected.to_string()),
        ];
        if let Some(msg) = &self.initial_user_message {
            fields.push(("initial_user_message".to_string(), msg.clone()));
        }
        fields
    }

    /// Rebuild from the store hash. Returns `None` for an empty hash.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let now = Utc::now();
        let parse_ts = |key: &str| {
            fields
                .get(key)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(now)
        };
        Some(Self {
            user_id: fields.get("user_id").and_then(|v| v.parse().ok()).unwrap_or(0),
            kind: ConversationKind::parse(fields.get("type").map(String::as_str).unwrap_or("chat")),
            status: match fields.get("status").map(String::as_str) {
                Some("active") => SessionStatus::Active,
                _ => SessionStatus::Ended,
            },
            started_at: parse_ts("started_at"),
            last_active_at: parse_ts("last_active_at"),
            state: match fields.get("state").map(String::as_str) {
                Some("listening") => ConversationState::Listening,
                Some("processing") => ConversationState::Processing,
                Some("speaking") => ConversationState::Speaking,
                _ => ConversationState::Idle,
            },
            tts_playing: fields.get("tts_playing").map(|v| v == "true").unwrap_or(false),
            ws_connected: fields.get("ws_connected").map(|v| v == "true").unwrap_or(false),
            initial_user_message: fields.get("initial_user_message").cloned(),
        })
    }
}
