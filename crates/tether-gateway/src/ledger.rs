//! Crash-recovery ledger — a durable "turn in flight" marker per conversation.
//!
//! Entries are written just before a prompt reaches the agent and removed as
//! soon as the turn has an outcome. Anything still present at startup belongs
//! to a turn the previous run never finished.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use tether_types::session::ConversationId;

use crate::channels::ChatNotifier;
use crate::db::Database;

pub const INTERRUPTED_NOTICE: &str =
    "Sorry, my previous response was interrupted. Please resend your last message.";

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub conversation_id: ConversationId,
    pub turn_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
}

impl Ledger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Best effort: a failed write is logged and the turn goes ahead.
    pub fn mark_started(&self, id: ConversationId, turn_id: Uuid) {
        let entry = LedgerEntry {
            conversation_id: id,
            turn_id,
            started_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_ledger_entry(&entry) {
            error!("Failed to mark turn {} in flight for {}: {:#}", turn_id, id, e);
        }
    }

    pub fn mark_cleared(&self, id: ConversationId) {
        if let Err(e) = self.db.delete_ledger_entry(id) {
            error!("Failed to clear in-flight marker for {}: {:#}", id, e);
        }
    }

    pub fn read_dirty(&self) -> Result<Vec<LedgerEntry>> {
        self.db.ledger_entries()
    }

    /// Tell every conversation with an unfinished turn to resend, then clear
    /// its marker. Returns how many were found.
    pub async fn recover(&self, notifier: &dyn ChatNotifier) -> usize {
        let dirty = match self.read_dirty() {
            Ok(dirty) => dirty,
            Err(e) => {
                error!("Failed to read the turn ledger: {:#}", e);
                return 0;
            }
        };
        for entry in &dirty {
            info!(
                "Conversation {} had turn {} in flight since {}",
                entry.conversation_id, entry.turn_id, entry.started_at
            );
            if let Err(e) = notifier.notify(entry.conversation_id, INTERRUPTED_NOTICE).await {
                warn!("Failed to notify {} about interrupted turn: {:#}", entry.conversation_id, e);
            }
            self.mark_cleared(entry.conversation_id);
        }
        dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(ConversationId, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ChatNotifier for Recorder {
        async fn notify(&self, id: ConversationId, text: &str) -> Result<()> {
            if self.fail {
                anyhow::bail!("telegram is down");
            }
            self.sent.lock().unwrap().push((id, text.to_string()));
            Ok(())
        }
    }

    #[test]
    fn started_then_cleared_leaves_nothing() {
        let ledger = Ledger::new(Arc::new(Database::open_in_memory().unwrap()));
        ledger.mark_started(ConversationId(1), Uuid::new_v4());
        assert_eq!(ledger.read_dirty().unwrap().len(), 1);
        ledger.mark_cleared(ConversationId(1));
        assert!(ledger.read_dirty().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dirty_entries_survive_restart_and_are_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.db");
        let turn_id = Uuid::new_v4();
        {
            let ledger = Ledger::new(Arc::new(Database::open(&path).unwrap()));
            ledger.mark_started(ConversationId(42), turn_id);
            ledger.mark_started(ConversationId(43), Uuid::new_v4());
            ledger.mark_cleared(ConversationId(43));
        }

        let ledger = Ledger::new(Arc::new(Database::open(&path).unwrap()));
        let dirty = ledger.read_dirty().unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].turn_id, turn_id);

        let recorder = Recorder::default();
        assert_eq!(ledger.recover(&recorder).await, 1);
        assert_eq!(
            *recorder.sent.lock().unwrap(),
            vec![(ConversationId(42), INTERRUPTED_NOTICE.to_string())]
        );

        assert_eq!(ledger.recover(&recorder).await, 0);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_notification_still_clears() {
        let ledger = Ledger::new(Arc::new(Database::open_in_memory().unwrap()));
        ledger.mark_started(ConversationId(5), Uuid::new_v4());
        let recorder = Recorder { fail: true, ..Default::default() };
        assert_eq!(ledger.recover(&recorder).await, 1);
        assert!(ledger.read_dirty().unwrap().is_empty());
    }
}
