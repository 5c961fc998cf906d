pub mod channels;
pub mod codec;
pub mod config;
pub mod db;
pub mod ledger;
pub mod process;
pub mod registry;
pub mod runner;
pub mod session;
pub mod workspace;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use tether_types::config::{ConfigError, TetherConfig};
use tether_types::model::Model;
use tether_types::protocol::AgentEvent;
use tether_types::session::{ConversationId, SessionStatus};
use tether_types::turn::{TurnRequest, TurnResult};

use channels::ChatNotifier;
use db::Database;
use ledger::Ledger;
use process::{ClaudeLauncher, ProcessLauncher};
use registry::SessionRegistry;
use runner::TurnRunner;
use session::{SessionDeps, SessionError, SessionSettings};
use workspace::WorkspaceResolver;

/// The central gateway: owns the session registry, the ledger and the
/// database. Channels hold an `Arc<Gateway>` and call into it per message.
pub struct Gateway {
    registry: SessionRegistry,
    ledger: Ledger,
    db: Arc<Database>,
    config: TetherConfig,
}

/// How many entries `/workspaces` shows.
pub const RECENT_WORKSPACES: usize = 10;

impl Gateway {
    /// Create a gateway that launches the configured agent executable. No
    /// process is started until the first turn.
    pub fn new(config: TetherConfig, db: Arc<Database>) -> Result<Self, ConfigError> {
        let launcher = ClaudeLauncher::new(
            config.agent.executable.clone(),
            config.agent.leading_args.clone(),
        );
        Self::with_launcher(config, db, Arc::new(launcher))
    }

    pub fn with_launcher(
        config: TetherConfig,
        db: Arc<Database>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ledger = Ledger::new(Arc::clone(&db));
        let deps = SessionDeps {
            launcher,
            runner: TurnRunner::new(config.agent.interrupt_grace())?,
            ledger: ledger.clone(),
            db: Arc::clone(&db),
            settings: SessionSettings {
                spend_cap_usd: config.agent.max_budget_usd,
                turn_timeout: config.agent.turn_timeout(),
                busy_policy: config.gateway.busy_policy,
            },
        };
        let resolver = WorkspaceResolver::new(
            config.workspace.home.clone(),
            config.workspace.base.clone(),
        );
        let registry = SessionRegistry::new(deps, resolver, config.agent.default_model);
        Ok(Self {
            registry,
            ledger,
            db,
            config,
        })
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    // ─── Turns ────────────────────────────────────────────────────────────────

    /// Run one turn for `id` with the configured timeout.
    pub async fn invoke(
        &self,
        id: ConversationId,
        prompt: &str,
        on_event: &mut (dyn FnMut(&AgentEvent) + Send),
    ) -> Result<TurnResult, SessionError> {
        let session = self.registry.get(id)?;
        session.run_turn(prompt, None, on_event).await
    }

    pub async fn invoke_request(
        &self,
        request: TurnRequest,
        on_event: &mut (dyn FnMut(&AgentEvent) + Send),
    ) -> Result<TurnResult, SessionError> {
        let session = self.registry.get(request.conversation_id)?;
        session
            .run_turn(&request.prompt, request.timeout, on_event)
            .await
    }

    /// Stop the running turn for `id`. Returns false when nothing was running.
    pub fn interrupt(&self, id: ConversationId) -> bool {
        self.registry
            .peek(id)
            .is_some_and(|session| session.interrupt_current())
    }

    // ─── Administration ───────────────────────────────────────────────────────

    pub async fn switch_model(&self, id: ConversationId, model: Model) -> Result<(), SessionError> {
        self.registry.get(id)?.switch_model(model).await
    }

    /// Switch to the workspace named by `target` (`home` or a name under the
    /// base directory) and return its path.
    pub async fn switch_workspace(
        &self,
        id: ConversationId,
        target: &str,
    ) -> Result<PathBuf, SessionError> {
        let path = self.registry.resolver().resolve(target)?;
        self.registry.get(id)?.switch_workspace(&path).await?;
        self.remember_workspace(id, &path);
        Ok(path)
    }

    /// Create a workspace under the base directory and switch to it. Nothing
    /// is left on disk if the switch cannot happen.
    pub async fn create_workspace(
        &self,
        id: ConversationId,
        name: &str,
    ) -> Result<PathBuf, SessionError> {
        let session = self.registry.get(id)?;
        if session.is_busy() {
            return Err(SessionError::Busy);
        }
        let path = self.registry.resolver().create(name).await?;
        if let Err(e) = session.switch_workspace(&path).await {
            if let Err(rm) = tokio::fs::remove_dir_all(&path).await {
                warn!("Failed to remove unused workspace {}: {}", path.display(), rm);
            }
            return Err(e);
        }
        self.remember_workspace(id, &path);
        Ok(path)
    }

    /// Workspaces `id` has used recently, newest first. Entries whose
    /// directory is gone or no longer allowed are dropped from the history.
    pub fn recent_workspaces(&self, id: ConversationId) -> Result<Vec<PathBuf>, SessionError> {
        let visits = self
            .db
            .recent_workspaces(id, RECENT_WORKSPACES)
            .map_err(SessionError::Storage)?;
        let resolver = self.registry.resolver();
        let mut paths = Vec::with_capacity(visits.len());
        for visit in visits {
            if resolver.validate(&visit.path) {
                paths.push(visit.path);
            } else if let Err(e) = self.db.forget_workspace(id, &visit.path) {
                warn!("Failed to drop stale workspace {}: {:#}", visit.path.display(), e);
            }
        }
        Ok(paths)
    }

    fn remember_workspace(&self, id: ConversationId, path: &Path) {
        if path == self.registry.resolver().home() {
            return;
        }
        if let Err(e) = self.db.record_workspace_visit(id, path) {
            warn!("Failed to record workspace {} for {}: {:#}", path.display(), id, e);
        }
    }

    pub async fn reset(&self, id: ConversationId) -> Result<(), SessionError> {
        self.registry.get(id)?.reset().await
    }

    pub fn status(&self, id: ConversationId) -> Result<SessionStatus, SessionError> {
        Ok(self.registry.get(id)?.status())
    }

    pub fn list_active(&self) -> Vec<ConversationId> {
        self.registry.list_active()
    }

    pub fn workspace_label(&self, path: &Path) -> String {
        self.registry.resolver().label(path)
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Notify conversations whose turn was cut short by the last shutdown.
    pub async fn recover_interrupted(&self, notifier: &dyn ChatNotifier) -> usize {
        let recovered = self.ledger.recover(notifier).await;
        if recovered > 0 {
            info!("Notified {} conversation(s) about interrupted turns", recovered);
        }
        recovered
    }

    /// Stop every running turn and terminate every agent process.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}
