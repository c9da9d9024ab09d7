//! Durable per-actor covenant store.
//!
//! Each actor owns exactly one SQLite file; no other actor ever touches it.
//! The store exposes two primitives: a typed key/value slot holding the
//! actor's current head, and an append-only relational surface (`covenants`,
//! `messages`, `metrics`, plus an `evaluations` post-mortem table).  The
//! schema is created idempotently on open, and every mutation has completed
//! before its async call returns, so acknowledgements always sit behind the
//! persisted write.
//!
//! Database work runs on the blocking pool; connections are opened per
//! operation, which SQLite handles cheaply for stores of this size.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::task;

use crate::swarmllm::client_wrapper::Role;
use crate::swarmllm::covenant::{Covenant, PerformanceCounters, StoredMessage};

/// Errors raised by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite failure.
    Sqlite(String),
    /// JSON (de)serialization failure for a persisted blob.
    Serde(String),
    /// The blocking-pool task was cancelled or panicked.
    Join(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {}", e),
            StoreError::Serde(e) => write!(f, "serialization error: {}", e),
            StoreError::Join(e) => write!(f, "store task failed: {}", e),
        }
    }
}

impl Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS covenants (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    intent TEXT NOT NULL,
    constraints_json TEXT NOT NULL,
    state TEXT NOT NULL,
    decision TEXT NOT NULL,
    plan TEXT,
    results_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    covenant_id TEXT,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    ts TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    covenant_id TEXT,
    latency_ms INTEGER NOT NULL,
    cost_usd REAL NOT NULL,
    success INTEGER NOT NULL,
    ts TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS evaluations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    covenant_id TEXT,
    kind TEXT NOT NULL,
    detail TEXT NOT NULL,
    ts TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts);
CREATE INDEX IF NOT EXISTS idx_covenants_state ON covenants(state);
"#;

/// Per-actor durable store.  Cloning shares the same database file.
#[derive(Clone)]
pub struct CovenantStore {
    db_path: PathBuf,
}

impl CovenantStore {
    /// Open (or create) the store at `path`, applying the schema idempotently.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Sqlite(format!("cannot create {:?}: {}", parent, e)))?;
            }
        }
        let store = Self { db_path };
        store
            .run(|conn| conn.execute_batch(SCHEMA).map(|_| ()))
            .await?;
        Ok(store)
    }

    /// The backing database path.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
        .map_err(StoreError::from)
    }

    /// Persist the actor's head snapshot under the `head` key.
    pub async fn put_head<T: Serialize>(&self, head: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(head)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES ('head', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![json],
            )
            .map(|_| ())
        })
        .await
    }

    /// Load the actor's head snapshot, if one was ever persisted.
    pub async fn get_head<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let json: Option<String> = self
            .run(|conn| {
                conn.query_row("SELECT value FROM kv WHERE key = 'head'", [], |row| {
                    row.get(0)
                })
                .optional()
            })
            .await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    /// Insert or update a covenant row.
    pub async fn upsert_covenant(&self, covenant: &Covenant) -> Result<(), StoreError> {
        let id = covenant.id.clone();
        let user_id = covenant.user_id.clone();
        let intent = covenant.intent.clone();
        let constraints_json = serde_json::to_string(&covenant.constraints)?;
        let state = covenant.state.to_string();
        let decision = covenant.mediator_decision.join("\n");
        let plan = covenant.orchestration_plan.clone();
        let results_json = match &covenant.results {
            Some(r) => Some(serde_json::to_string(r)?),
            None => None,
        };
        let created_at = covenant.created_at.to_rfc3339();
        let updated_at = covenant.updated_at.to_rfc3339();

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO covenants
                 (id, user_id, intent, constraints_json, state, decision, plan, results_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    decision = excluded.decision,
                    plan = excluded.plan,
                    results_json = excluded.results_json,
                    updated_at = excluded.updated_at",
                params![
                    id,
                    user_id,
                    intent,
                    constraints_json,
                    state,
                    decision,
                    plan,
                    results_json,
                    created_at,
                    updated_at
                ],
            )
            .map(|_| ())
        })
        .await
    }

    /// The persisted state of a covenant, if the row exists.
    pub async fn covenant_state(&self, covenant_id: &str) -> Result<Option<String>, StoreError> {
        let id = covenant_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT state FROM covenants WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    /// Append one conversation turn.
    pub async fn append_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let id = message.id.clone();
        let covenant_id = message.covenant_id.clone();
        let role = message.role.to_string();
        let content = message.content.clone();
        let ts = message.ts.to_rfc3339();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, covenant_id, role, content, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, covenant_id, role, content, ts],
            )
            .map(|_| ())
        })
        .await
    }

    /// The trailing `limit` conversation turns, oldest first.
    pub async fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let mut rows: Vec<StoredMessage> = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, covenant_id, role, content, ts FROM messages
                     ORDER BY ts DESC, id DESC LIMIT ?1",
                )?;
                let mapped = stmt.query_map(params![limit as i64], |row| {
                    let role_tag: String = row.get(2)?;
                    let ts_text: String = row.get(4)?;
                    Ok(StoredMessage {
                        id: row.get(0)?,
                        covenant_id: row.get(1)?,
                        role: parse_role(&role_tag),
                        content: row.get(3)?,
                        ts: parse_ts(&ts_text),
                    })
                })?;
                mapped.collect::<Result<Vec<_>, _>>()
            })
            .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Count of assistant turns attached to a covenant.
    pub async fn assistant_message_count(&self, covenant_id: &str) -> Result<u64, StoreError> {
        let id = covenant_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE covenant_id = ?1 AND role = 'assistant'",
                params![id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
        .await
    }

    /// Append one call-metric row.
    pub async fn record_metric(
        &self,
        covenant_id: Option<&str>,
        latency_ms: u64,
        cost_usd: f64,
        success: bool,
    ) -> Result<(), StoreError> {
        let covenant_id = covenant_id.map(|s| s.to_string());
        let ts = Utc::now().to_rfc3339();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO metrics (covenant_id, latency_ms, cost_usd, success, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![covenant_id, latency_ms as i64, cost_usd, success as i64, ts],
            )
            .map(|_| ())
        })
        .await
    }

    /// Append one post-mortem evaluation row.
    pub async fn record_evaluation(
        &self,
        covenant_id: &str,
        kind: &str,
        detail: &str,
    ) -> Result<(), StoreError> {
        let covenant_id = covenant_id.to_string();
        let kind = kind.to_string();
        let detail = detail.to_string();
        let ts = Utc::now().to_rfc3339();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO evaluations (covenant_id, kind, detail, ts) VALUES (?1, ?2, ?3, ?4)",
                params![covenant_id, kind, detail, ts],
            )
            .map(|_| ())
        })
        .await
    }

    /// Rolling performance counters over this actor's history.
    ///
    /// A covenant counts as delegated when an orchestration plan was recorded
    /// for it; the plan column is only ever written on delegation.
    pub async fn performance(&self) -> Result<PerformanceCounters, StoreError> {
        self.run(|conn| {
            let total_covenants: i64 =
                conn.query_row("SELECT COUNT(*) FROM covenants", [], |r| r.get(0))?;
            let delegated_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM covenants WHERE plan IS NOT NULL",
                [],
                |r| r.get(0),
            )?;
            let completed_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM covenants WHERE state = 'completed'",
                [],
                |r| r.get(0),
            )?;
            let rejected_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM covenants WHERE state = 'rejected'",
                [],
                |r| r.get(0),
            )?;
            let avg_latency_ms: f64 = conn
                .query_row("SELECT AVG(latency_ms) FROM metrics", [], |r| {
                    r.get::<_, Option<f64>>(0)
                })?
                .unwrap_or(0.0);
            let total_cost_usd: f64 = conn
                .query_row("SELECT SUM(cost_usd) FROM metrics", [], |r| {
                    r.get::<_, Option<f64>>(0)
                })?
                .unwrap_or(0.0);
            Ok(PerformanceCounters {
                total_covenants: total_covenants as u64,
                delegated_count: delegated_count as u64,
                completed_count: completed_count as u64,
                rejected_count: rejected_count as u64,
                avg_latency_ms,
                total_cost_usd,
            })
        })
        .await
    }
}

fn parse_role(tag: &str) -> Role {
    match tag {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        _ => Role::User,
    }
}

fn parse_ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
