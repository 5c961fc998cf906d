//! Wire types for the agent CLI's stream-json protocol.
//!
//! Input: one `{"type":"user",...}` object per turn on stdin.
//! Output: one JSON object per line on stdout, discriminated by `type`.
//! `AgentEvent` is the typed view the gateway works with.

use serde::{Deserialize, Serialize};

use crate::usage::Usage;

// ─── Gateway → Agent ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentInput {
    User { message: UserMessage },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl AgentInput {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self::User {
            message: UserMessage {
                role: "user".to_string(),
                content: vec![ContentBlock::Text { text: prompt.into() }],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Thinking, tool results and anything newer than this client.
    #[serde(other)]
    Other,
}

// ─── Agent → Gateway ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentOutput {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    /// Tool results echoed back as user turns.
    User {
        #[serde(default)]
        message: Option<serde_json::Value>,
    },
    StreamEvent {
        #[serde(default)]
        event: Option<serde_json::Value>,
    },
    Result(ResultMessage),
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<serde_json::Value>,
    },
}

impl AgentOutput {
    /// Every `type` value this client understands.
    pub const KINDS: [&'static str; 6] =
        ["system", "assistant", "user", "stream_event", "result", "error"];
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub usage: Usage,
}

// ─── Typed events ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TextDelta {
        text: String,
    },
    ToolNotice {
        name: String,
        summary: String,
    },
    Result {
        text: String,
        usage: Usage,
        cost_usd: f64,
        is_error: bool,
        /// `success`, or the `error_*` reason the agent gave.
        subtype: String,
        agent_session_id: Option<String>,
    },
    StreamError {
        message: String,
    },
}

impl AgentEvent {
    /// Whether the agent stopped because it hit its own spend cap.
    pub fn is_budget_stop(&self) -> bool {
        matches!(self, Self::Result { subtype, .. } if subtype.contains("budget"))
    }
}
