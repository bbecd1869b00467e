//! # Storage Module
//!
//! Durable key/value persistence for a single session.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   AuthState ──┐          ┌── MessageArchive                             │
//! │               ▼          ▼                                              │
//! │         ┌──────────────────────┐                                        │
//! │         │  RecordStore (trait) │  read / upsert / remove / clear / list │
//! │         └──────────┬───────────┘                                        │
//! │        ┌───────────┼──────────────┐                                     │
//! │        ▼           ▼              ▼                                     │
//! │   FileStore    SqliteStore    MemoryStore                               │
//! │                                                                         │
//! │  FileStore layout:                                                     │
//! │    sessions/<session>/auth.json                 (credentials)          │
//! │    sessions/<session>/stores/<coll>-<n>.json    (chunked archive)      │
//! │                                                                         │
//! │  SqliteStore layout:                                                   │
//! │    auth | chats | contacts | messages                                  │
//! │    (session TEXT, id TEXT, value TEXT, UNIQUE(session, id))            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callers never see chunk boundaries or backend details; every backend
//! behaves as a set of named collections of `{id, value}` records.

mod file;
mod memory;
pub mod recovery;
pub mod retry;
mod sqlite;

pub use file::{ChunkMetadata, FileStore};
pub use memory::MemoryStore;
pub use retry::RetryPolicy;
pub use sqlite::SqliteStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{SessionConfig, StoreBackend};
use crate::error::Result;

/// Collection holding credentials and signal keys
pub const AUTH_COLLECTION: &str = "auth";

/// Collections known to every backend
pub const KNOWN_COLLECTIONS: [&str; 4] = [AUTH_COLLECTION, "chats", "contacts", "messages"];

/// Records kept per chunk file
pub const DEFAULT_CHUNK_RECORDS: usize = 1000;

/// Serialized byte cap for a single chunk file (8 MiB)
pub const DEFAULT_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// A single persisted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Identity of the record within its collection
    pub id: String,
    /// Serialized payload
    pub value: Value,
}

impl StoredRecord {
    /// Create a record
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Predicate deciding which ids survive a [`RecordStore::clear`]
pub type KeepFn<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// Collection-oriented key/value store
///
/// Implementations must serialize concurrent writers on the same
/// collection/key, and a reader must never observe a half-applied write.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a record's value
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Insert or overwrite a record
    async fn upsert(&self, collection: &str, id: &str, value: Value) -> Result<()>;

    /// Remove a record (no-op when absent)
    async fn remove(&self, collection: &str, id: &str) -> Result<()>;

    /// Remove every record, except the ids `keep` returns true for
    async fn clear(&self, collection: &str, keep: Option<KeepFn<'_>>) -> Result<()>;

    /// List every record of a collection
    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>>;
}

/// Directory holding one session's files
pub fn session_dir(config: &SessionConfig) -> PathBuf {
    config.data_dir.join(&config.session)
}

/// Open the backend selected in the configuration
pub fn open_store(config: &SessionConfig) -> Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match &config.backend {
        StoreBackend::File => Arc::new(
            FileStore::new(session_dir(config))
                .with_chunk_limits(config.chunk_records, config.chunk_bytes),
        ),
        StoreBackend::Sqlite { path } => Arc::new(SqliteStore::open(Some(path.as_path()), &config.session)?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    tracing::info!(
        session = config.session.as_str(),
        backend = config.backend.name(),
        "Record store opened"
    );
    Ok(store)
}
