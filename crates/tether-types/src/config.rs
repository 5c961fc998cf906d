use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Model;

/// Every section and field falls back to its default, so a config file only
/// needs the values it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub agent: AgentConfig,
    pub workspace: WorkspaceConfig,
    pub telegram: TelegramConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI executable. Bare names are looked up on `PATH`.
    pub executable: PathBuf,
    /// Arguments placed before the protocol flags, for wrappers such as
    /// `npx @anthropic-ai/claude-code`.
    pub leading_args: Vec<String>,
    pub default_model: Model,
    /// Passed to the agent as its own spend cap; this side only reports it.
    pub max_budget_usd: f64,
    /// Wall-clock limit for a single turn.
    pub timeout_secs: u64,
    /// How long an interrupted agent gets to wind down before it is killed.
    pub interrupt_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Default working directory for new conversations.
    pub home: PathBuf,
    /// Directory that named workspaces resolve under. When unset, only the
    /// home workspace is available.
    pub base: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Telegram user ids allowed to talk to the bot. Empty means nobody.
    pub allowed_user_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub log_level: String,
    pub busy_policy: BusyPolicy,
    /// Minimum spacing between live-message edits.
    pub edit_interval_ms: u64,
}

/// What happens to an ordinary message that arrives while a turn is running.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Refuse with a "still working" reply until the user stops the turn.
    #[default]
    Reject,
    /// Wait behind the running turn, first come first served.
    Queue,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("turn timeout must be greater than zero")]
    ZeroTimeout,
    #[error("interrupt grace period must be greater than zero")]
    ZeroGrace,
    #[error("budget cap must be a positive amount, got {0}")]
    InvalidBudget(f64),
    #[error("workspace base is not an existing directory: {0}")]
    InvalidBase(PathBuf),
}

impl TetherConfig {
    /// Check the values that would otherwise only fail at turn time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.agent.interrupt_grace_ms == 0 {
            return Err(ConfigError::ZeroGrace);
        }
        let budget = self.agent.max_budget_usd;
        if !budget.is_finite() || budget <= 0.0 {
            return Err(ConfigError::InvalidBudget(budget));
        }
        if let Some(base) = &self.workspace.base {
            if !base.is_dir() {
                return Err(ConfigError::InvalidBase(base.clone()));
            }
        }
        Ok(())
    }
}

impl AgentConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

impl GatewayConfig {
    pub fn edit_interval(&self) -> Duration {
        Duration::from_millis(self.edit_interval_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("claude"),
            leading_args: vec![],
            default_model: Model::Sonnet,
            max_budget_usd: 10.0,
            timeout_secs: 360,
            interrupt_grace_ms: 5_000,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("workspace"),
            base: None,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            busy_policy: BusyPolicy::Reject,
            edit_interval_ms: 2_000,
        }
    }
}
