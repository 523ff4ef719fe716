use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use weave_core::ids::{InvocationId, ThreadId, TurnId};

/// A structural anomaly observed while assembling or repairing a
/// conversation: an orphaned tool turn, a turn dropped by the
/// compatibility filter, or a filter pass that had to fall back to the
/// unfiltered sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: i64,
    pub timestamp: String,
    pub thread_id: String,
    pub kind: AnomalyKind,
    pub turn_id: Option<String>,
    pub invocation_id: Option<String>,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// A tool turn was appended without a resolvable link target.
    UnlinkedToolTurn,
    /// The filter removed a turn that broke the pairing contract.
    TurnDropped,
    /// A kept turn looked like a tool result but could not be verified.
    TurnFlagged,
    /// Filtering would have emptied the sequence; the unfiltered
    /// sequence was sent instead.
    FilterDegraded,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnlinkedToolTurn => "unlinked_tool_turn",
            Self::TurnDropped => "turn_dropped",
            Self::TurnFlagged => "turn_flagged",
            Self::FilterDegraded => "filter_degraded",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "unlinked_tool_turn" => Some(Self::UnlinkedToolTurn),
            "turn_dropped" => Some(Self::TurnDropped),
            "turn_flagged" => Some(Self::TurnFlagged),
            "filter_degraded" => Some(Self::FilterDegraded),
            _ => None,
        }
    }
}

/// Query parameters for searching recorded anomalies.
#[derive(Clone, Debug, Default)]
pub struct AnomalyQuery {
    pub thread_id: Option<ThreadId>,
    pub kind: Option<AnomalyKind>,
    pub limit: Option<u32>,
}

/// SQLite-backed sink for structural anomalies, so drops stay observable
/// after the request that caused them is gone.
pub struct AnomalyRecorder {
    conn: Mutex<Connection>,
}

impl AnomalyRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS anomalies (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 thread_id TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 turn_id TEXT,
                 invocation_id TEXT,
                 detail TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_anomalies_thread ON anomalies(thread_id);
             CREATE INDEX IF NOT EXISTS idx_anomalies_kind ON anomalies(kind);",
        )
    }

    pub fn record(
        &self,
        thread_id: &ThreadId,
        kind: AnomalyKind,
        turn_id: Option<&TurnId>,
        invocation_id: Option<&InvocationId>,
        detail: &str,
    ) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO anomalies (timestamp, thread_id, kind, turn_id, invocation_id, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                thread_id.as_str(),
                kind.as_str(),
                turn_id.map(|t| t.as_str()),
                invocation_id.map(|i| i.as_str()),
                detail,
            ],
        );
    }

    pub fn query(&self, q: &AnomalyQuery) -> Result<Vec<Anomaly>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, thread_id, kind, turn_id, invocation_id, detail
             FROM anomalies WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(thread_id) = &q.thread_id {
            sql.push_str(&format!(" AND thread_id = ?{}", params.len() + 1));
            params.push(Box::new(thread_id.as_str().to_owned()));
        }
        if let Some(kind) = &q.kind {
            sql.push_str(&format!(" AND kind = ?{}", params.len() + 1));
            params.push(Box::new(kind.as_str().to_owned()));
        }

        sql.push_str(" ORDER BY id DESC");
        let limit = q.limit.unwrap_or(100);
        sql.push_str(&format!(" LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let kind_str: String = row.get(3)?;
            Ok(Anomaly {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                thread_id: row.get(2)?,
                kind: AnomalyKind::parse(&kind_str).unwrap_or(AnomalyKind::TurnDropped),
                turn_id: row.get(4)?,
                invocation_id: row.get(5)?,
                detail: row.get(6)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self, kind: AnomalyKind) -> Result<u64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM anomalies WHERE kind = ?1",
            [kind.as_str()],
            |row| row.get(0),
        )
    }
}
