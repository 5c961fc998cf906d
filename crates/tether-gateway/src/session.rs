//! Conversation session — owns at most one agent process and runs one turn
//! at a time through it.
//!
//! The gate is a fair async mutex over the process slot: whoever holds it is
//! the only one touching the process. A small synchronous control block next
//! to it carries what other callers may read or signal while a turn runs:
//! state, the current cancel token, settings and spend.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use tether_types::config::{BusyPolicy, ConfigError};
use tether_types::model::Model;
use tether_types::protocol::AgentEvent;
use tether_types::session::{ConversationId, ConversationRecord, SessionState, SessionStatus};
use tether_types::turn::TurnResult;

use crate::db::Database;
use crate::ledger::Ledger;
use crate::process::{AgentProcess, LaunchSpec, ProcessError, ProcessLauncher};
use crate::runner::{RunError, TurnRunner};
use crate::workspace::WorkspaceError;

type Slot = Option<Box<dyn AgentProcess>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start the agent: {0}")]
    Spawn(#[source] ProcessError),
    #[error("agent process failed: {0}")]
    Process(#[source] ProcessError),
    #[error("a turn is already running for this conversation")]
    Busy,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl SessionError {
    /// Reply text for the chat user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Spawn(_) => {
                "Couldn't start the agent. Check the gateway logs and try again.".to_string()
            }
            Self::Process(_) => {
                "The agent process failed and the response was aborted. Please try again."
                    .to_string()
            }
            Self::Busy => {
                "Still working on your last message. Send /stop to cancel it first.".to_string()
            }
            Self::Config(e) => format!("Configuration error: {e}"),
            Self::Workspace(e) => e.to_string(),
            Self::Storage(_) => "Internal storage error. Please try again.".to_string(),
        }
    }
}

/// Settings every session shares.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub spend_cap_usd: f64,
    pub turn_timeout: Duration,
    pub busy_policy: BusyPolicy,
}

/// Collaborators a session needs; cloned into each new session.
#[derive(Clone)]
pub struct SessionDeps {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub runner: TurnRunner,
    pub ledger: Ledger,
    pub db: Arc<Database>,
    pub settings: SessionSettings,
}

struct Control {
    state: SessionState,
    cancel: Option<CancellationToken>,
    model: Model,
    workspace: PathBuf,
    cumulative_spend_usd: f64,
    agent_session_id: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: Option<DateTime<Utc>>,
    /// Mirrors the slot while the gate is held by a turn.
    process_alive: bool,
}

pub struct ConversationSession {
    id: ConversationId,
    deps: SessionDeps,
    slot: tokio::sync::Mutex<Slot>,
    control: Mutex<Control>,
}

/// Puts the session back to idle if a turn is abandoned mid-flight. Dropping
/// the handle kills the process, so stale output never leaks into the next turn.
struct TurnGuard<'a> {
    slot: MutexGuard<'a, Slot>,
    control: &'a Mutex<Control>,
    armed: bool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Turn abandoned before completion, dropping agent process");
        self.slot.take();
        let mut control = self.control.lock().unwrap();
        control.state = SessionState::Idle;
        control.cancel = None;
        control.process_alive = false;
    }
}

impl ConversationSession {
    pub fn new(record: ConversationRecord, deps: SessionDeps) -> Self {
        let control = Control {
            state: SessionState::Idle,
            cancel: None,
            model: record.model,
            workspace: record.workspace_root,
            cumulative_spend_usd: record.cumulative_spend_usd,
            agent_session_id: record.agent_session_id,
            created_at: record.created_at,
            last_activity_at: None,
            process_alive: false,
        };
        Self {
            id: record.conversation_id,
            deps,
            slot: tokio::sync::Mutex::new(None),
            control: Mutex::new(control),
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.control.lock().unwrap().state
    }

    pub fn model(&self) -> Model {
        self.control.lock().unwrap().model
    }

    pub fn workspace(&self) -> PathBuf {
        self.control.lock().unwrap().workspace.clone()
    }

    /// Run one turn, spawning the agent first if none is alive.
    ///
    /// Under [`BusyPolicy::Reject`] a second turn while one is in flight fails
    /// with [`SessionError::Busy`]; under [`BusyPolicy::Queue`] it waits its
    /// turn behind the gate.
    pub async fn run_turn(
        &self,
        prompt: &str,
        timeout: Option<Duration>,
        on_event: &mut (dyn FnMut(&AgentEvent) + Send),
    ) -> Result<TurnResult, SessionError> {
        let timeout = timeout.unwrap_or(self.deps.settings.turn_timeout);
        if timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout.into());
        }

        let slot = match self.deps.settings.busy_policy {
            BusyPolicy::Reject => self.slot.try_lock().map_err(|_| SessionError::Busy)?,
            BusyPolicy::Queue => self.slot.lock().await,
        };
        let mut guard = TurnGuard {
            slot,
            control: &self.control,
            armed: true,
        };

        let turn_id = Uuid::new_v4();
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let spec = {
            let mut control = self.control.lock().unwrap();
            control.cancel = Some(cancel.clone());
            LaunchSpec {
                model: control.model,
                workspace: control.workspace.clone(),
                budget_cap_usd: self.deps.settings.spend_cap_usd,
            }
        };

        if let Err(e) = self.ensure_process(&mut guard.slot, &spec).await {
            guard.armed = false;
            let mut control = self.control.lock().unwrap();
            control.state = SessionState::Idle;
            control.cancel = None;
            control.process_alive = false;
            return Err(SessionError::Spawn(e));
        }
        self.set_state(SessionState::Running);

        self.deps.ledger.mark_started(self.id, turn_id);
        let outcome = match guard.slot.as_mut() {
            Some(process) => {
                self.deps
                    .runner
                    .run(process.as_mut(), prompt, on_event, &cancel, timeout)
                    .await
            }
            None => Err(RunError::Process(ProcessError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "agent process missing after spawn",
            )))),
        };
        self.deps.ledger.mark_cleared(self.id);

        // A pipe failure means the agent is unusable even if it is still running.
        let broken = matches!(outcome, Err(RunError::Process(_)));
        let alive = !broken && guard.slot.as_mut().is_some_and(|p| p.is_alive());
        if !alive {
            Self::terminate_slot(&mut guard.slot).await;
        }
        guard.armed = false;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut control = self.control.lock().unwrap();
                control.state = SessionState::Idle;
                control.cancel = None;
                control.process_alive = alive;
                return Err(match e {
                    RunError::Config(e) => SessionError::Config(e),
                    RunError::Process(e) => {
                        error!("Turn {} for {} failed: {}", turn_id, self.id, e);
                        SessionError::Process(e)
                    }
                });
            }
        };

        let result = TurnResult {
            turn_id,
            conversation_id: self.id,
            text: outcome.text,
            usage: outcome.usage,
            cost_usd: outcome.cost_usd,
            duration: started.elapsed(),
            completion: outcome.completion,
            agent_session_id: outcome.agent_session_id,
            diagnostic: outcome.diagnostic,
        };

        let (model, spend) = {
            let mut control = self.control.lock().unwrap();
            control.state = SessionState::Idle;
            control.cancel = None;
            control.process_alive = alive;
            control.cumulative_spend_usd += result.cost_usd;
            control.last_activity_at = Some(Utc::now());
            if result.agent_session_id.is_some() {
                control.agent_session_id = result.agent_session_id.clone();
            }
            (control.model, control.cumulative_spend_usd)
        };
        drop(guard);

        info!(
            "Turn {} for {} finished: {} (model: {}, cost: ${:.4}, total: ${:.4}, duration: {:?})",
            turn_id, self.id, result.completion, model, result.cost_usd, spend, result.duration
        );
        if let Some(diagnostic) = &result.diagnostic {
            warn!("Turn {} diagnostic: {}", turn_id, diagnostic);
        }
        self.persist();
        if let Err(e) = self.deps.db.record_turn(&result) {
            error!("Failed to log turn {}: {:#}", turn_id, e);
        }
        Ok(result)
    }

    /// Signal the running turn to stop. Returns whether there was one.
    pub fn interrupt_current(&self) -> bool {
        let control = self.control.lock().unwrap();
        match (&control.state, &control.cancel) {
            (SessionState::Idle, _) | (_, None) => false,
            (_, Some(cancel)) => {
                info!("Interrupt requested for {}", self.id);
                cancel.cancel();
                true
            }
        }
    }

    /// Whether a turn or another operation currently holds the agent.
    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Change the model. The next turn starts a fresh agent with it.
    pub async fn switch_model(&self, model: Model) -> Result<(), SessionError> {
        let mut slot = self.slot.try_lock().map_err(|_| SessionError::Busy)?;
        Self::terminate_slot(&mut slot).await;
        {
            let mut control = self.control.lock().unwrap();
            control.model = model;
            control.agent_session_id = None;
            control.process_alive = false;
        }
        info!("Conversation {} switched to model {}", self.id, model);
        self.persist();
        Ok(())
    }

    /// Move to another working directory. The path must already be validated
    /// by the caller's workspace rules; it only has to exist here.
    pub async fn switch_workspace(&self, workspace: &Path) -> Result<(), SessionError> {
        if !workspace.is_dir() {
            return Err(WorkspaceError::NotADirectory(workspace.to_path_buf()).into());
        }
        let mut slot = self.slot.try_lock().map_err(|_| SessionError::Busy)?;
        Self::terminate_slot(&mut slot).await;
        {
            let mut control = self.control.lock().unwrap();
            control.workspace = workspace.to_path_buf();
            control.agent_session_id = None;
            control.process_alive = false;
        }
        info!("Conversation {} switched to workspace {}", self.id, workspace.display());
        self.persist();
        Ok(())
    }

    /// Start over with a fresh agent. Model, workspace and spend are kept.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let mut slot = self.slot.try_lock().map_err(|_| SessionError::Busy)?;
        Self::terminate_slot(&mut slot).await;
        {
            let mut control = self.control.lock().unwrap();
            control.agent_session_id = None;
            control.process_alive = false;
        }
        info!("Conversation {} reset", self.id);
        self.persist();
        Ok(())
    }

    /// Stop any running turn and terminate the agent.
    pub async fn shutdown(&self) {
        self.interrupt_current();
        let mut slot = self.slot.lock().await;
        Self::terminate_slot(&mut slot).await;
        self.control.lock().unwrap().process_alive = false;
    }

    pub fn status(&self) -> SessionStatus {
        let live = self
            .slot
            .try_lock()
            .ok()
            .map(|mut slot| slot.as_mut().is_some_and(|p| p.is_alive()));
        let turn_count = self.deps.db.turn_count(self.id).unwrap_or_else(|e| {
            warn!("Failed to count turns for {}: {:#}", self.id, e);
            0
        });
        let control = self.control.lock().unwrap();
        SessionStatus {
            conversation_id: self.id,
            model: control.model,
            workspace: control.workspace.clone(),
            cumulative_spend_usd: control.cumulative_spend_usd,
            spend_cap_usd: self.deps.settings.spend_cap_usd,
            state: control.state,
            process_alive: live.unwrap_or(control.process_alive),
            agent_session_id: control.agent_session_id.clone(),
            last_activity_at: control.last_activity_at,
            turn_count,
        }
    }

    pub fn record(&self) -> ConversationRecord {
        let control = self.control.lock().unwrap();
        ConversationRecord {
            conversation_id: self.id,
            model: control.model,
            workspace_root: control.workspace.clone(),
            cumulative_spend_usd: control.cumulative_spend_usd,
            agent_session_id: control.agent_session_id.clone(),
            created_at: control.created_at,
            updated_at: Utc::now(),
        }
    }

    async fn ensure_process(&self, slot: &mut Slot, spec: &LaunchSpec) -> Result<(), ProcessError> {
        if slot.as_mut().is_some_and(|p| p.is_alive()) {
            return Ok(());
        }
        Self::terminate_slot(slot).await;
        self.set_state(SessionState::Spawning);
        let process = self.deps.launcher.launch(spec).await?;
        *slot = Some(process);
        self.control.lock().unwrap().process_alive = true;
        Ok(())
    }

    async fn terminate_slot(slot: &mut Slot) {
        if let Some(mut process) = slot.take() {
            process.terminate().await;
        }
    }

    fn set_state(&self, state: SessionState) {
        self.control.lock().unwrap().state = state;
    }

    fn persist(&self) {
        if let Err(e) = self.deps.db.upsert_conversation(&self.record()) {
            error!("Failed to save conversation {}: {:#}", self.id, e);
        }
    }
}
