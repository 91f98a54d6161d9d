//! Document and table definitions for conversation sessions
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// One conversation, stored as a single logical document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub analytics: SessionAnalytics,
    /// Bumped by every committed update; a higher revision is a newer snapshot.
    #[serde(default)]
    pub revision: u64,
}

impl Session {
    /// Fresh session: counters at zero, `active`, lead score 1.
    pub fn new(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            last_active_at: now,
            messages: Vec::new(),
            metadata: SessionMetadata::default(),
            analytics: SessionAnalytics::default(),
            revision: 0,
        }
    }

    pub fn user_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role == Role::User)
    }

    pub fn has_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default = "default_lead_score")]
    pub lead_score: u8,
    #[serde(default)]
    pub service_interest: BTreeSet<String>,
    #[serde(default)]
    pub consultation_requested: bool,
    #[serde(default)]
    pub status: SessionStatus,
}

fn default_lead_score() -> u8 {
    1
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            message_count: 0,
            email: None,
            phone: None,
            lead_score: default_lead_score(),
            service_interest: BTreeSet::new(),
            consultation_requested: false,
            status: SessionStatus::Active,
        }
    }
}

impl SessionMetadata {
    pub fn has_email(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionAnalytics {
    #[serde(default)]
    pub user_message_count: u64,
    #[serde(default)]
    pub assistant_message_count: u64,
    #[serde(default)]
    pub response_times_ms: Vec<u64>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub email_collected: bool,
    #[serde(default)]
    pub phone_collected: bool,
    #[serde(default)]
    pub notification_sent: bool,
    #[serde(default)]
    pub conversion_events: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Caller-supplied message; the service stamps id (when missing) and time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Qualified,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Qualified => "qualified",
            SessionStatus::Closed => "closed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "qualified" => Ok(SessionStatus::Qualified),
            "closed" => Ok(SessionStatus::Closed),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// Scan parameters for analytics queries over the sessions collection.
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
    pub order: QueryOrder,
    pub limit: Option<usize>,
}

impl SessionQuery {
    pub fn created_between(from: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        Self {
            created_from: Some(from),
            created_before: Some(before),
            ..Default::default()
        }
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.created_from.map_or(true, |from| session.created_at >= from)
            && self.created_before.map_or(true, |before| session.created_at < before)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryOrder {
    #[default]
    CreatedAsc,
    CreatedDesc,
}

/// Database statistics
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub total_messages: i64,
    pub schema_version: i32,
}

pub const SCHEMA_SQL: &str = "
-- Sessions table: one row per conversation document
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    metadata TEXT NOT NULL,
    analytics TEXT NOT NULL
);
-- Messages table: append-only, position gives chronological order
CREATE TABLE IF NOT EXISTS messages (
    session_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    message_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (session_id, position),
    UNIQUE (session_id, message_id),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions (created_at);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id);
";
