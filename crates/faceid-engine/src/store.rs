//! Identity persistence: one row per registration event.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid timestamp {value:?} for identity {person_id}")]
    Timestamp { person_id: String, value: String },
    #[error("store lock poisoned")]
    Poisoned,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub person_id: String,
    pub display_name: String,
    pub registered_at: DateTime<Utc>,
}

/// Persistence collaborator for identity rows.
pub trait IdentityStore: Send + Sync {
    /// Insert a new row with a fresh id.
    fn create_identity(&self, name: &str) -> Result<Identity, StoreError>;

    /// All rows, oldest first.
    fn list_identities(&self) -> Result<Vec<Identity>, StoreError>;

    fn get(&self, person_id: &str) -> Result<Option<Identity>, StoreError>;

    /// Earliest registration row carrying `name`.
    fn find_by_name(&self, name: &str) -> Result<Option<Identity>, StoreError>;

    /// Remove a row; returns it if it existed.
    fn delete_identity(&self, person_id: &str) -> Result<Option<Identity>, StoreError>;

    /// Number of registration rows left for `name`.
    fn count_by_name(&self, name: &str) -> Result<usize, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS faces (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    registered_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_faces_name ON faces(name);
";

/// SQLite-backed identity store.
pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::info!(path = %path.display(), journal_mode = %mode, "identity store opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

type Row = (String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn into_identity((person_id, display_name, ts): Row) -> Result<Identity, StoreError> {
    let registered_at = DateTime::parse_from_rfc3339(&ts)
        .map_err(|_| StoreError::Timestamp {
            person_id: person_id.clone(),
            value: ts.clone(),
        })?
        .with_timezone(&Utc);
    Ok(Identity {
        person_id,
        display_name,
        registered_at,
    })
}

impl IdentityStore for SqliteIdentityStore {
    fn create_identity(&self, name: &str) -> Result<Identity, StoreError> {
        let identity = Identity {
            person_id: uuid::Uuid::new_v4().to_string(),
            display_name: name.to_string(),
            registered_at: Utc::now(),
        };
        self.lock()?.execute(
            "INSERT INTO faces (id, name, registered_at) VALUES (?1, ?2, ?3)",
            params![
                identity.person_id,
                identity.display_name,
                identity.registered_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
            ],
        )?;
        tracing::debug!(person_id = %identity.person_id, name, "identity created");
        Ok(identity)
    }

    fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, name, registered_at FROM faces ORDER BY registered_at, id")?;
        let rows = stmt.query_map([], read_row)?.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_identity).collect()
    }

    fn get(&self, person_id: &str) -> Result<Option<Identity>, StoreError> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, name, registered_at FROM faces WHERE id = ?1",
                params![person_id],
                read_row,
            )
            .optional()?;
        row.map(into_identity).transpose()
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Identity>, StoreError> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, name, registered_at FROM faces WHERE name = ?1
                 ORDER BY registered_at, id LIMIT 1",
                params![name],
                read_row,
            )
            .optional()?;
        row.map(into_identity).transpose()
    }

    fn delete_identity(&self, person_id: &str) -> Result<Option<Identity>, StoreError> {
        let Some(identity) = self.get(person_id)? else {
            return Ok(None);
        };
        self.lock()?
            .execute("DELETE FROM faces WHERE id = ?1", params![person_id])?;
        tracing::debug!(person_id, name = %identity.display_name, "identity deleted");
        Ok(Some(identity))
    }

    fn count_by_name(&self, name: &str) -> Result<usize, StoreError> {
        let count: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM faces WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_list() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        let alice = store.create_identity("Alice").unwrap();
        let bob = store.create_identity("Bob").unwrap();

        let all = store.list_identities().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&alice));
        assert!(all.contains(&bob));
        assert_ne!(alice.person_id, bob.person_id);
    }

    #[test]
    fn test_find_by_name_returns_earliest() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        let first = store.create_identity("Alice").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create_identity("Alice").unwrap();

        assert_eq!(store.find_by_name("Alice").unwrap(), Some(first));
        assert_eq!(store.find_by_name("Nobody").unwrap(), None);
        assert_eq!(store.count_by_name("Alice").unwrap(), 2);
    }

    #[test]
    fn test_delete_identity() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        let alice = store.create_identity("Alice").unwrap();

        assert_eq!(store.delete_identity(&alice.person_id).unwrap(), Some(alice.clone()));
        assert_eq!(store.delete_identity(&alice.person_id).unwrap(), None);
        assert_eq!(store.count_by_name("Alice").unwrap(), 0);
        assert!(store.get(&alice.person_id).unwrap().is_none());
    }

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("faces.db");
        let store = SqliteIdentityStore::open(&path).unwrap();
        store.create_identity("Alice").unwrap();
        drop(store);

        let reopened = SqliteIdentityStore::open(&path).unwrap();
        assert_eq!(reopened.count_by_name("Alice").unwrap(), 1);
    }
}
