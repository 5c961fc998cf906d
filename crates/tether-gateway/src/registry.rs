//! Session registry — one [`ConversationSession`] per conversation id, created
//! on first use from the saved conversation row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use tether_types::model::Model;
use tether_types::session::{ConversationId, ConversationRecord};

use crate::session::{ConversationSession, SessionDeps, SessionError};
use crate::workspace::WorkspaceResolver;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConversationId, Arc<ConversationSession>>>,
    deps: SessionDeps,
    resolver: WorkspaceResolver,
    default_model: Model,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps, resolver: WorkspaceResolver, default_model: Model) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            deps,
            resolver,
            default_model,
        }
    }

    pub fn resolver(&self) -> &WorkspaceResolver {
        &self.resolver
    }

    /// Look up a session, restoring it from storage on first use.
    pub fn get(&self, id: ConversationId) -> Result<Arc<ConversationSession>, SessionError> {
        if let Some(session) = self.sessions.lock().unwrap().get(&id) {
            return Ok(Arc::clone(session));
        }

        let record = self.load_record(id)?;
        let session = Arc::new(ConversationSession::new(record, self.deps.clone()));

        // Another caller may have raced us here; the first insert wins.
        let mut sessions = self.sessions.lock().unwrap();
        Ok(Arc::clone(sessions.entry(id).or_insert(session)))
    }

    /// The in-memory session, without restoring one from storage.
    pub fn peek(&self, id: ConversationId) -> Option<Arc<ConversationSession>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Conversations with a session in memory, in id order.
    pub fn list_active(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.sessions.lock().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Reset the session and drop it from memory. The saved row stays, so a
    /// later `get` restores its settings and spend.
    pub async fn forget(&self, id: ConversationId) -> Result<bool, SessionError> {
        let Some(session) = self.peek(id) else {
            return Ok(false);
        };
        session.reset().await?;
        self.sessions.lock().unwrap().remove(&id);
        info!("Forgot session {}", id);
        Ok(true)
    }

    /// Stop every session's agent. Used on gateway shutdown.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        info!("Shutting down {} session(s)", sessions.len());
        let mut tasks = JoinSet::new();
        for session in sessions {
            tasks.spawn(async move { session.shutdown().await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Session shutdown task failed: {}", e);
            }
        }
    }

    fn load_record(&self, id: ConversationId) -> Result<ConversationRecord, SessionError> {
        let saved = self
            .deps
            .db
            .get_conversation(id)
            .map_err(SessionError::Storage)?;

        match saved {
            Some(mut record) => {
                if !self.resolver.validate(&record.workspace_root) {
                    warn!(
                        "Saved workspace {} for {} is no longer valid, using home",
                        record.workspace_root.display(),
                        id
                    );
                    record.workspace_root = self.resolver.home().to_path_buf();
                    record.agent_session_id = None;
                }
                info!("Restored session {} (model: {}, workspace: {})", id, record.model, record.workspace_root.display());
                Ok(record)
            }
            None => {
                let now = Utc::now();
                let record = ConversationRecord {
                    conversation_id: id,
                    model: self.default_model,
                    workspace_root: self.resolver.home().to_path_buf(),
                    cumulative_spend_usd: 0.0,
                    agent_session_id: None,
                    created_at: now,
                    updated_at: now,
                };
                self.deps
                    .db
                    .upsert_conversation(&record)
                    .map_err(SessionError::Storage)?;
                info!("New session {} (model: {})", id, record.model);
                Ok(record)
            }
        }
    }
}
