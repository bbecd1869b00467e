//! # SQLite Store
//!
//! Relational backend with one table per collection.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  auth / chats / contacts / messages                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  row_id   INTEGER PRIMARY KEY AUTOINCREMENT   (insertion order)         │
//! │  session  TEXT NOT NULL                                                 │
//! │  id       TEXT NOT NULL                                                 │
//! │  value    TEXT NOT NULL                       (JSON)                    │
//! │  UNIQUE(session, id)                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Upserts use `ON CONFLICT(session, id) DO UPDATE`, so a record keeps its
//! original position when overwritten. Several sessions may share one
//! database file; every query is scoped to this store's session name.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;

use super::{KeepFn, RecordStore, StoredRecord, KNOWN_COLLECTIONS};
use crate::error::{Error, Result};

/// SQL to create the collection tables
fn create_tables() -> String {
    KNOWN_COLLECTIONS
        .iter()
        .map(|table| {
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session TEXT NOT NULL,
                    id TEXT NOT NULL,
                    value TEXT NOT NULL,
                    UNIQUE(session, id)
                );",
                table = table
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// SQLite-backed record store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    session: String,
}

impl SqliteStore {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database.
    pub fn open(path: Option<&Path>, session: &str) -> Result<Self> {
        let conn = match path {
            Some(p) => {
                if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::DatabaseError(format!("Failed to create {}: {}", parent.display(), e))
                    })?;
                }
                Connection::open(p)
                    .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?
            }
            None => Connection::open_in_memory().map_err(|e| {
                Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        conn.execute_batch(&create_tables())
            .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;

        tracing::info!(session, path = ?path, "SQLite store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            session: session.to_string(),
        })
    }

    /// Table names are interpolated into SQL, so only known ones pass.
    fn table(collection: &str) -> Result<&'static str> {
        KNOWN_COLLECTIONS
            .iter()
            .copied()
            .find(|known| *known == collection)
            .ok_or_else(|| Error::InvalidCollection(collection.to_string()))
    }
}

fn decode(id: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(id, error = %e, "Skipping undecodable row");
            None
        }
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let table = Self::table(collection)?;
        let conn = self.conn.lock();

        let result = conn.query_row(
            &format!("SELECT value FROM {} WHERE session = ? AND id = ?", table),
            params![self.session, id],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(raw) => Ok(decode(id, &raw)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::DatabaseError(format!("Failed to read {}/{}: {}", collection, id, e))),
        }
    }

    async fn upsert(&self, collection: &str, id: &str, value: Value) -> Result<()> {
        let table = Self::table(collection)?;
        let encoded = serde_json::to_string(&value)?;
        let conn = self.conn.lock();

        conn.execute(
            &format!(
                "INSERT INTO {} (session, id, value) VALUES (?, ?, ?)
                 ON CONFLICT(session, id) DO UPDATE SET value = excluded.value",
                table
            ),
            params![self.session, id, encoded],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to write {}/{}: {}", collection, id, e)))?;

        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<()> {
        let table = Self::table(collection)?;
        let conn = self.conn.lock();

        conn.execute(
            &format!("DELETE FROM {} WHERE session = ? AND id = ?", table),
            params![self.session, id],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to remove {}/{}: {}", collection, id, e)))?;

        Ok(())
    }

    async fn clear(&self, collection: &str, keep: Option<KeepFn<'_>>) -> Result<()> {
        let table = Self::table(collection)?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        let removed = match keep {
            None => tx
                .execute(&format!("DELETE FROM {} WHERE session = ?", table), params![self.session])
                .map_err(|e| Error::DatabaseError(format!("Failed to clear {}: {}", collection, e)))?,
            Some(keep) => {
                let ids: Vec<String> = {
                    let mut stmt = tx
                        .prepare(&format!("SELECT id FROM {} WHERE session = ?", table))
                        .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
                    let rows = stmt
                        .query_map(params![self.session], |row| row.get::<_, String>(0))
                        .map_err(|e| Error::DatabaseError(format!("Failed to query ids: {}", e)))?;
                    let mut ids = Vec::new();
                    for row in rows {
                        ids.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read id: {}", e)))?);
                    }
                    ids
                };

                let mut removed = 0;
                for id in ids.iter().filter(|id| !keep(id.as_str())) {
                    removed += tx
                        .execute(
                            &format!("DELETE FROM {} WHERE session = ? AND id = ?", table),
                            params![self.session, id],
                        )
                        .map_err(|e| Error::DatabaseError(format!("Failed to remove {}: {}", id, e)))?;
                }
                removed
            }
        };

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit clear: {}", e)))?;

        tracing::info!(collection, removed, "Collection cleared");
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        let table = Self::table(collection)?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, value FROM {} WHERE session = ? ORDER BY row_id",
                table
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![self.session], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| Error::DatabaseError(format!("Failed to query {}: {}", collection, e)))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, raw) = row.map_err(|e| Error::DatabaseError(format!("Failed to read row: {}", e)))?;
            if let Some(value) = decode(&id, &raw) {
                records.push(StoredRecord::new(id, value));
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_read_remove() {
        let store = SqliteStore::open(None, "main").unwrap();

        store.upsert("chats", "c1", json!({"name": "one"})).await.unwrap();
        assert_eq!(store.read("chats", "c1").await.unwrap(), Some(json!({"name": "one"})));

        store.upsert("chats", "c1", json!({"name": "uno"})).await.unwrap();
        assert_eq!(store.read("chats", "c1").await.unwrap(), Some(json!({"name": "uno"})));
        assert_eq!(store.list("chats").await.unwrap().len(), 1);

        store.remove("chats", "c1").await.unwrap();
        assert_eq!(store.read("chats", "c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_position() {
        let store = SqliteStore::open(None, "main").unwrap();
        store.upsert("messages", "a", json!(1)).await.unwrap();
        store.upsert("messages", "b", json!(2)).await.unwrap();
        store.upsert("messages", "a", json!(3)).await.unwrap();

        let records = store.list("messages").await.unwrap();
        assert_eq!(records[0], StoredRecord::new("a", json!(3)));
        assert_eq!(records[1], StoredRecord::new("b", json!(2)));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.db");

        let first = SqliteStore::open(Some(&path), "first").unwrap();
        let second = SqliteStore::open(Some(&path), "second").unwrap();

        first.upsert("contacts", "x", json!("first")).await.unwrap();
        second.upsert("contacts", "x", json!("second")).await.unwrap();

        assert_eq!(first.read("contacts", "x").await.unwrap(), Some(json!("first")));
        assert_eq!(second.read("contacts", "x").await.unwrap(), Some(json!("second")));
    }

    #[tokio::test]
    async fn test_clear_with_keep() {
        let store = SqliteStore::open(None, "main").unwrap();
        store.upsert("auth", "creds", json!({})).await.unwrap();
        store.upsert("auth", "pre-key-1", json!({})).await.unwrap();
        store.upsert("auth", "session-abc", json!({})).await.unwrap();

        let keep: KeepFn<'_> = &|id: &str| id == "creds";
        store.clear("auth", Some(keep)).await.unwrap();

        let ids: Vec<String> = store.list("auth").await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["creds"]);
    }

    #[tokio::test]
    async fn test_unknown_collection_rejected() {
        let store = SqliteStore::open(None, "main").unwrap();
        let result = store.read("users; DROP TABLE auth", "x").await;
        assert!(matches!(result, Err(Error::InvalidCollection(_))));
    }
}
