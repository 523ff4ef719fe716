use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use weave_core::ids::ThreadId;

use crate::database::Database;
use crate::error::StoreError;

/// A stored thread row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadRow {
    pub id: ThreadId,
    pub title: Option<String>,
    pub turn_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ThreadRepo {
    db: Database,
}

impl ThreadRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create(&self, title: Option<&str>) -> Result<ThreadRow, StoreError> {
        let id = ThreadId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (id, title, turn_count, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?3)",
                rusqlite::params![id.as_str(), title, now],
            )?;
            Ok(ThreadRow {
                id: id.clone(),
                title: title.map(String::from),
                turn_count: 0,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
        })
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn get(&self, thread_id: &ThreadId) -> Result<ThreadRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, turn_count, created_at, updated_at
                 FROM threads WHERE id = ?1",
            )?;
            let mut rows = stmt.query([thread_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(ThreadRow {
                    id: ThreadId::from_raw(row.get::<_, String>(0)?),
                    title: row.get(1)?,
                    turn_count: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                }),
                None => Err(StoreError::NotFound(format!("thread {thread_id}"))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get() {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db);

        let thread = repo.create(Some("research session")).unwrap();
        assert!(thread.id.as_str().starts_with("thread_"));
        assert_eq!(thread.turn_count, 0);

        let fetched = repo.get(&thread.id).unwrap();
        assert_eq!(fetched.title.as_deref(), Some("research session"));
    }

    #[test]
    fn get_missing_thread() {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db);
        let result = repo.get(&ThreadId::new());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
