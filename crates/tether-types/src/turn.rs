use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::ConversationId;
use crate::usage::Usage;

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    /// Fully assembled prompt text.
    pub prompt: String,
    /// Overrides the configured turn timeout.
    pub timeout: Option<Duration>,
}

impl TurnRequest {
    pub fn new(conversation_id: ConversationId, prompt: impl Into<String>) -> Self {
        Self {
            conversation_id,
            prompt: prompt.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Completed,
    TimedOut,
    Interrupted,
    Errored,
    BudgetExceeded,
}

impl CompletionReason {
    /// Text shown to the user when the turn produced no usable answer.
    pub fn user_notice(&self) -> Option<&'static str> {
        match self {
            Self::Completed => None,
            Self::TimedOut => Some("The response timed out and was aborted. Please try again."),
            Self::Interrupted => Some("(stopped)"),
            Self::Errored => Some("The agent process failed. Please try again."),
            Self::BudgetExceeded => {
                Some("This session hit its spending cap. Use /new to start a new session.")
            }
        }
    }
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Errored => write!(f, "errored"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
        }
    }
}

impl std::str::FromStr for CompletionReason {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "timed_out" => Ok(Self::TimedOut),
            "interrupted" => Ok(Self::Interrupted),
            "errored" => Ok(Self::Errored),
            "budget_exceeded" => Ok(Self::BudgetExceeded),
            _ => Err(anyhow::anyhow!("unknown completion reason: {}", s)),
        }
    }
}

/// Final outcome of one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub turn_id: Uuid,
    pub conversation_id: ConversationId,
    pub text: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub duration: Duration,
    pub completion: CompletionReason,
    pub agent_session_id: Option<String>,
    /// Exit status, stderr tail or agent error text for failed turns.
    pub diagnostic: Option<String>,
}
