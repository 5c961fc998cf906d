use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Model;

/// Stable id of a conversation: one per chat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ConversationId {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|e| anyhow::anyhow!("invalid conversation id {s:?}: {e}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No turn in flight. A process may or may not be alive.
    Idle,
    Spawning,
    Running,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Spawning => write!(f, "spawning"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Persisted per-conversation settings and spend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: ConversationId,
    pub model: Model,
    pub workspace_root: PathBuf,
    pub cumulative_spend_usd: f64,
    pub agent_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time view of a session for `/stats` and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub conversation_id: ConversationId,
    pub model: Model,
    pub workspace: PathBuf,
    pub cumulative_spend_usd: f64,
    pub spend_cap_usd: f64,
    pub state: SessionState,
    pub process_alive: bool,
    pub agent_session_id: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub turn_count: u64,
}

impl SessionStatus {
    pub fn over_cap(&self) -> bool {
        self.cumulative_spend_usd >= self.spend_cap_usd
    }
}
