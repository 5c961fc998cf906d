use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tether_types::session::{ConversationId, ConversationRecord};
use tether_types::turn::TurnResult;

use crate::ledger::LedgerEntry;

/// A workspace a conversation has used, newest first in listings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceVisit {
    pub path: PathBuf,
    pub last_used_at: DateTime<Utc>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_tables()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_tables()?;
        Ok(db)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                conversation_id      INTEGER PRIMARY KEY,
                model                TEXT NOT NULL,
                workspace_root       TEXT NOT NULL,
                cumulative_spend_usd REAL NOT NULL DEFAULT 0,
                agent_session_id     TEXT,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS turn_ledger (
                conversation_id INTEGER PRIMARY KEY,
                turn_id         TEXT NOT NULL,
                started_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS turns (
                turn_id         TEXT PRIMARY KEY,
                conversation_id INTEGER NOT NULL,
                completion      TEXT NOT NULL,
                cost_usd        REAL NOT NULL DEFAULT 0,
                duration_ms     INTEGER NOT NULL,
                input_tokens    INTEGER NOT NULL DEFAULT 0,
                output_tokens   INTEGER NOT NULL DEFAULT 0,
                finished_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id, finished_at);

            CREATE TABLE IF NOT EXISTS workspace_history (
                conversation_id INTEGER NOT NULL,
                path            TEXT NOT NULL,
                last_used_at    TEXT NOT NULL,
                PRIMARY KEY (conversation_id, path)
            );",
        )?;
        Ok(())
    }

    // --- Conversations ---

    pub fn get_conversation(&self, id: ConversationId) -> Result<Option<ConversationRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, model, workspace_root, cumulative_spend_usd, agent_session_id, created_at, updated_at
             FROM conversations WHERE conversation_id = ?1",
        )?;
        let mut rows = stmt.query(params![id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_conversation(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_conversations(&self) -> Result<Vec<ConversationRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, model, workspace_root, cumulative_spend_usd, agent_session_id, created_at, updated_at
             FROM conversations ORDER BY conversation_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_conversation(row)?);
        }
        Ok(records)
    }

    /// Insert or replace the row; `created_at` survives replacement.
    pub fn upsert_conversation(&self, record: &ConversationRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversations (conversation_id, model, workspace_root, cumulative_spend_usd, agent_session_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(conversation_id) DO UPDATE SET
                model = excluded.model,
                workspace_root = excluded.workspace_root,
                cumulative_spend_usd = excluded.cumulative_spend_usd,
                agent_session_id = excluded.agent_session_id,
                updated_at = excluded.updated_at",
            params![
                record.conversation_id.0,
                record.model.as_str(),
                record.workspace_root.to_string_lossy().to_string(),
                record.cumulative_spend_usd,
                record.agent_session_id,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // --- Turn ledger ---

    pub fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO turn_ledger (conversation_id, turn_id, started_at)
             VALUES (?1, ?2, ?3)",
            params![
                entry.conversation_id.0,
                entry.turn_id.to_string(),
                entry.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_ledger_entry(&self, id: ConversationId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM turn_ledger WHERE conversation_id = ?1",
            params![id.0],
        )?;
        Ok(())
    }

    pub fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, turn_id, started_at FROM turn_ledger ORDER BY conversation_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, turn_id, started_at) = row?;
            entries.push(LedgerEntry {
                conversation_id: ConversationId(id),
                turn_id: turn_id.parse().context("invalid turn id")?,
                started_at: parse_time(&started_at)?,
            });
        }
        Ok(entries)
    }

    // --- Turn log ---

    pub fn record_turn(&self, result: &TurnResult) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO turns (turn_id, conversation_id, completion, cost_usd, duration_ms, input_tokens, output_tokens, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                result.turn_id.to_string(),
                result.conversation_id.0,
                result.completion.to_string(),
                result.cost_usd,
                result.duration.as_millis() as i64,
                result.usage.input_tokens as i64,
                result.usage.output_tokens as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn turn_count(&self, id: ConversationId) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM turns WHERE conversation_id = ?1",
            params![id.0],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// --- Workspace history ---

impl Database {
    /// Mark `path` as just used by `id`.
    pub fn record_workspace_visit(&self, id: ConversationId, path: &Path) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // REPLACE re-inserts the row, so the newest visit has the highest rowid.
        conn.execute(
            "INSERT OR REPLACE INTO workspace_history (conversation_id, path, last_used_at)
             VALUES (?1, ?2, ?3)",
            params![id.0, path.to_string_lossy().to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn recent_workspaces(&self, id: ConversationId, limit: usize) -> Result<Vec<WorkspaceVisit>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT path, last_used_at FROM workspace_history
             WHERE conversation_id = ?1
             ORDER BY rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id.0, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut visits = Vec::new();
        for row in rows {
            let (path, last_used_at) = row?;
            visits.push(WorkspaceVisit {
                path: path.into(),
                last_used_at: parse_time(&last_used_at)?,
            });
        }
        Ok(visits)
    }

    pub fn forget_workspace(&self, id: ConversationId, path: &Path) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM workspace_history WHERE conversation_id = ?1 AND path = ?2",
            params![id.0, path.to_string_lossy().to_string()],
        )?;
        Ok(())
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp {s:?}"))?
        .with_timezone(&Utc))
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRecord> {
    let model_str: String = row.get(1)?;
    let workspace: String = row.get(2)?;
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;
    Ok(ConversationRecord {
        conversation_id: ConversationId(row.get(0)?),
        model: model_str.parse().context("invalid model")?,
        workspace_root: workspace.into(),
        cumulative_spend_usd: row.get(3)?,
        agent_session_id: row.get(4)?,
        created_at: parse_time(&created_str)?,
        updated_at: parse_time(&updated_str)?,
    })
}
