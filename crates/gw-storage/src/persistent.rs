//! The persistent tier's contract and its SQLite-backed implementation.
//!
//! `PersistentBackend` is the seam spec.md's Non-goals cut the real
//! production storage backend out at — what's implemented here is the
//! contract a production backend would satisfy, backed by a local SQLite
//! file rather than whatever clustered store the real deployment uses.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub enum PersistError {
    Sqlite(rusqlite::Error),
    Closed,
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            PersistError::Closed => write!(f, "persistent backend is closed"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<rusqlite::Error> for PersistError {
    fn from(e: rusqlite::Error) -> Self {
        PersistError::Sqlite(e)
    }
}

pub trait PersistentBackend: Send + Sync {
    fn put(&self, key: &str, value: &[u8], expires_at_ms: Option<i64>) -> Result<(), PersistError>;
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, Option<i64>)>, PersistError>;
    fn delete(&self, key: &str) -> Result<(), PersistError>;
    fn query_by_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistError>;
}

/// `rusqlite::Connection` is `!Sync`, so every access takes the mutex; the
/// store wraps calls to this in `spawn_blocking` rather than holding the
/// async executor hostage on a disk write.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, PersistError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, PersistError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl PersistentBackend for SqliteBackend {
    fn put(&self, key: &str, value: &[u8], expires_at_ms: Option<i64>) -> Result<(), PersistError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
            params![key, value, expires_at_ms],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, Option<i64>)>, PersistError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT value, expires_at_ms FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    fn delete(&self, key: &str) -> Result<(), PersistError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn query_by_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE key LIKE ?1")?;
        let like = format!("{}%", prefix.replace('%', "\\%"));
        let rows = stmt.query_map(params![like], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for r in rows {
            keys.push(r?);
        }
        Ok(keys)
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), PersistError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), PersistError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL,
            expires_at_ms INTEGER
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("a:persist:b", b"hello", None).unwrap();
        let (value, ttl) = backend.get("a:persist:b").unwrap().unwrap();
        assert_eq!(value, b"hello");
        assert!(ttl.is_none());
    }

    #[test]
    fn delete_removes_the_row() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("k", b"v", None).unwrap();
        backend.delete("k").unwrap();
        assert!(backend.get("k").unwrap().is_none());
    }

    #[test]
    fn query_by_prefix_matches_only_that_prefix() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("mapping:1", b"a", None).unwrap();
        backend.put("mapping:2", b"b", None).unwrap();
        backend.put("other:1", b"c", None).unwrap();
        let mut keys = backend.query_by_prefix("mapping:").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["mapping:1", "mapping:2"]);
    }
}
