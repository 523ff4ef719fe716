use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Row;
use tracing::{instrument, warn};

use weave_core::ids::{InvocationId, ThreadId, TurnId};
use weave_core::turns::{Invocation, Role, Turn, TurnContent, TurnMetadata};

use crate::database::Database;
use crate::error::StoreError;

/// Per-thread append lock. All appends to one thread are serialized
/// through a single writer path; sequence assignment is atomic under it.
struct ThreadLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl ThreadLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, thread_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct TurnRepo {
    db: Database,
    thread_locks: Mutex<ThreadLocks>,
}

impl TurnRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            thread_locks: Mutex::new(ThreadLocks::new()),
        }
    }

    /// Append a turn to a thread. Atomically, under the per-thread lock:
    /// assigns the next sequence number, inserts the row, and bumps the
    /// thread's turn count. Returns the assigned sequence.
    #[instrument(skip(self, turn), fields(thread_id = %thread_id, role = turn.role.as_str()))]
    pub fn append(&self, thread_id: &ThreadId, turn: &Turn) -> Result<i64, StoreError> {
        let lock = self.thread_locks.lock().get(thread_id.as_str());
        let _guard = lock.lock();

        self.db.with_conn(|conn| {
            let max_seq: i64 = conn
                .query_row(
                    "SELECT COALESCE((SELECT MAX(sequence) FROM turns WHERE thread_id = ?1), -1)
                     FROM threads WHERE id = ?1",
                    [thread_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("thread {thread_id}")))?;

            let sequence = max_seq + 1;
            let now = Utc::now().to_rfc3339();

            let invocations_json = if turn.invocations.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&turn.invocations)?)
            };
            let metadata_json = if turn.metadata.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&turn.metadata)?)
            };

            conn.execute(
                "INSERT INTO turns
                 (id, thread_id, sequence, role, content, invocations, invocation_id, linked_turn_id, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    turn.id.as_str(),
                    thread_id.as_str(),
                    sequence,
                    turn.role.as_str(),
                    serde_json::to_string(&turn.content)?,
                    invocations_json,
                    turn.invocation_id.as_ref().map(|i| i.as_str()),
                    turn.linked_turn_id.as_ref().map(|t| t.as_str()),
                    metadata_json,
                    turn.created_at.to_rfc3339(),
                ],
            )?;

            conn.execute(
                "UPDATE threads SET turn_count = turn_count + 1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, thread_id.as_str()],
            )?;

            Ok(sequence)
        })
    }

    /// Append a tool turn, resolving its link target first. If no
    /// assistant turn owns the invocation, the turn is still appended —
    /// that inconsistency is a structural anomaly for the filter stage to
    /// repair, not a write-time rejection. Returns the stored turn and
    /// whether the link was resolved.
    #[instrument(skip(self, turn), fields(thread_id = %thread_id))]
    pub fn append_tool_turn(
        &self,
        thread_id: &ThreadId,
        mut turn: Turn,
    ) -> Result<(Turn, bool), StoreError> {
        debug_assert_eq!(turn.role, Role::Tool);

        let mut resolved = turn.linked_turn_id.is_some();
        if !resolved {
            if let Some(invocation_id) = turn.invocation_id.clone() {
                match self.resolve_link(thread_id, &invocation_id)? {
                    Some(owner) => {
                        turn.linked_turn_id = Some(owner);
                        resolved = true;
                    }
                    None => {
                        warn!(
                            invocation_id = invocation_id.as_str(),
                            "tool turn has no owning assistant turn"
                        );
                    }
                }
            } else {
                warn!("tool turn appended without an invocation id");
            }
        }

        self.append(thread_id, &turn)?;
        Ok((turn, resolved))
    }

    /// Find the most recent assistant turn containing an invocation with
    /// the given id.
    pub fn resolve_link(
        &self,
        thread_id: &ThreadId,
        invocation_id: &InvocationId,
    ) -> Result<Option<TurnId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, invocations FROM turns
                 WHERE thread_id = ?1 AND role = 'assistant' AND invocations IS NOT NULL
                 ORDER BY sequence DESC",
            )?;
            let mut rows = stmt.query([thread_id.as_str()])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let invocations_json: String = row.get(1)?;
                let invocations: Vec<Invocation> = serde_json::from_str(&invocations_json)?;
                if invocations.iter().any(|inv| &inv.id == invocation_id) {
                    return Ok(Some(TurnId::from_raw(id)));
                }
            }
            Ok(None)
        })
    }

    /// Attach link metadata that was not known at append time. The only
    /// permitted mutation of a stored turn.
    pub fn attach_link(&self, turn_id: &TurnId, linked: &TurnId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE turns SET linked_turn_id = ?1 WHERE id = ?2 AND linked_turn_id IS NULL",
                rusqlite::params![linked.as_str(), turn_id.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "turn {turn_id} missing or already linked"
                )));
            }
            Ok(())
        })
    }

    /// List all turns for a thread, ordered by sequence.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn list(&self, thread_id: &ThreadId) -> Result<Vec<Turn>, StoreError> {
        self.list_range(thread_id, None, None)
    }

    pub fn list_range(
        &self,
        thread_id: &ThreadId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<Turn>, StoreError> {
        self.db.with_conn(|conn| {
            let limit = limit.unwrap_or(10_000);
            let offset = offset.unwrap_or(0);
            let mut stmt = conn.prepare(
                "SELECT id, role, content, invocations, invocation_id, linked_turn_id, metadata, created_at
                 FROM turns WHERE thread_id = ?1
                 ORDER BY sequence ASC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![thread_id.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_turn(row)?);
            }
            Ok(results)
        })
    }

    /// Fetch a single turn by id.
    pub fn get(&self, turn_id: &TurnId) -> Result<Turn, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, role, content, invocations, invocation_id, linked_turn_id, metadata, created_at
                 FROM turns WHERE id = ?1",
            )?;
            let mut rows = stmt.query([turn_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_turn(row),
                None => Err(StoreError::NotFound(format!("turn {turn_id}"))),
            }
        })
    }
}

fn row_to_turn(row: &Row<'_>) -> Result<Turn, StoreError> {
    let id: String = row.get(0)?;
    let role_str: String = row.get(1)?;
    let content_json: String = row.get(2)?;
    let invocations_json: Option<String> = row.get(3)?;
    let invocation_id: Option<String> = row.get(4)?;
    let linked_turn_id: Option<String> = row.get(5)?;
    let metadata_json: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;

    let role: Role = role_str
        .parse()
        .map_err(|e: String| StoreError::Serialization(e))?;
    let content: TurnContent = serde_json::from_str(&content_json)?;
    let invocations: Vec<Invocation> = match invocations_json {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    let metadata: TurnMetadata = match metadata_json {
        Some(json) => serde_json::from_str(&json)?,
        None => TurnMetadata::default(),
    };
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Serialization(format!("created_at: {e}")))?
        .with_timezone(&Utc);

    Ok(Turn {
        id: TurnId::from_raw(id),
        role,
        content,
        invocations,
        invocation_id: invocation_id.map(InvocationId::from_raw),
        linked_turn_id: linked_turn_id.map(TurnId::from_raw),
        metadata,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weave_core::turns::ToolOutcome;

    use crate::threads::ThreadRepo;

    fn setup() -> (TurnRepo, ThreadId) {
        let db = Database::in_memory().unwrap();
        let threads = ThreadRepo::new(db.clone());
        let thread = threads.create(None).unwrap();
        (TurnRepo::new(db), thread.id)
    }

    fn invocation(id: &str) -> Invocation {
        Invocation {
            id: InvocationId::from_raw(id),
            tool_name: "web_search".into(),
            arguments: json!({"query": "weather"}),
        }
    }

    #[test]
    fn append_assigns_sequences() {
        let (repo, thread_id) = setup();
        let seq0 = repo.append(&thread_id, &Turn::user_text("one")).unwrap();
        let seq1 = repo.append(&thread_id, &Turn::user_text("two")).unwrap();
        assert_eq!(seq0, 0);
        assert_eq!(seq1, 1);

        let turns = repo.list(&thread_id).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text_content(), "one");
        assert_eq!(turns[1].text_content(), "two");
    }

    #[test]
    fn append_to_missing_thread_fails() {
        let db = Database::in_memory().unwrap();
        let repo = TurnRepo::new(db);
        let result = repo.append(&ThreadId::new(), &Turn::user_text("x"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn roundtrip_preserves_everything() {
        let (repo, thread_id) = setup();

        let assistant = Turn::assistant("let me check", vec![invocation("call_1")]);
        repo.append(&thread_id, &assistant).unwrap();

        let mut tool = Turn::tool_outcome(&ToolOutcome::ok(
            InvocationId::from_raw("call_1"),
            json!({"temp": 21}),
        ));
        tool.linked_turn_id = Some(assistant.id.clone());
        repo.append(&thread_id, &tool).unwrap();

        let turns = repo.list(&thread_id).unwrap();
        assert_eq!(turns[0], assistant);
        assert_eq!(turns[1], tool);
    }

    #[test]
    fn metadata_roundtrips_losslessly() {
        let (repo, thread_id) = setup();

        let mut turn = Turn::user_text("[packed history]");
        turn.metadata.packed = true;
        turn.metadata.compressed = true;
        turn.metadata.carried_invocations =
            vec![InvocationId::from_raw("call_a"), InvocationId::from_raw("call_b")];
        repo.append(&thread_id, &turn).unwrap();

        let stored = repo.get(&turn.id).unwrap();
        assert_eq!(stored.metadata, turn.metadata);
        assert!(stored.is_packed());
    }

    #[test]
    fn resolve_link_finds_most_recent_owner() {
        let (repo, thread_id) = setup();

        let first = Turn::assistant("a", vec![invocation("call_1")]);
        let second = Turn::assistant("b", vec![invocation("call_1")]);
        repo.append(&thread_id, &first).unwrap();
        repo.append(&thread_id, &second).unwrap();

        let owner = repo
            .resolve_link(&thread_id, &InvocationId::from_raw("call_1"))
            .unwrap();
        assert_eq!(owner, Some(second.id));
    }

    #[test]
    fn append_tool_turn_resolves_link() {
        let (repo, thread_id) = setup();

        let assistant = Turn::assistant("checking", vec![invocation("call_1")]);
        repo.append(&thread_id, &assistant).unwrap();

        let tool = Turn::tool_outcome(&ToolOutcome::ok(
            InvocationId::from_raw("call_1"),
            json!("sunny"),
        ));
        let (stored, resolved) = repo.append_tool_turn(&thread_id, tool).unwrap();
        assert!(resolved);
        assert_eq!(stored.linked_turn_id, Some(assistant.id));
    }

    #[test]
    fn orphaned_tool_turn_still_appended() {
        let (repo, thread_id) = setup();

        let tool = Turn::tool_outcome(&ToolOutcome::ok(
            InvocationId::from_raw("call_ghost"),
            json!("?"),
        ));
        let (stored, resolved) = repo.append_tool_turn(&thread_id, tool).unwrap();
        assert!(!resolved);
        assert!(stored.linked_turn_id.is_none());

        // The anomalous turn is durably present.
        let turns = repo.list(&thread_id).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::Tool);
    }

    #[test]
    fn attach_link_is_one_shot() {
        let (repo, thread_id) = setup();

        let assistant = Turn::assistant("a", vec![invocation("call_1")]);
        let tool = Turn::tool_outcome(&ToolOutcome::ok(
            InvocationId::from_raw("call_1"),
            json!(1),
        ));
        repo.append(&thread_id, &assistant).unwrap();
        repo.append(&thread_id, &tool).unwrap();

        repo.attach_link(&tool.id, &assistant.id).unwrap();
        let stored = repo.get(&tool.id).unwrap();
        assert_eq!(stored.linked_turn_id, Some(assistant.id.clone()));

        // Second attach conflicts — turns are immutable once linked.
        let result = repo.attach_link(&tool.id, &assistant.id);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn list_range_paginates() {
        let (repo, thread_id) = setup();
        for i in 0..5 {
            repo.append(&thread_id, &Turn::user_text(format!("m{i}"))).unwrap();
        }

        let page = repo.list_range(&thread_id, Some(2), Some(1)).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].text_content(), "m1");
        assert_eq!(page[1].text_content(), "m2");
    }
}
