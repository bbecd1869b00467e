//! # File Store
//!
//! Chunked JSON collections on the local filesystem.
//!
//! ## Write Path
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         COLLECTION WRITE                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  upsert(coll, id, v)                                                    │
//! │     │  key lock   (coll/id)                                             │
//! │     │  collection lock                                                  │
//! │     ▼                                                                   │
//! │  in-memory records ── plan chunks (≤ N records, ≤ B bytes each)         │
//! │     │                                                                   │
//! │     ▼   for every chunk, under its file lock:                           │
//! │  1. write <file>.tmp, rename over <file>                                │
//! │  2. on failure: direct write of <file>                                  │
//! │  3. on failure: raw blocking write + fsync                              │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  delete chunk files past the new chunk count                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every write rewrites all chunks of the collection from the full record
//! list. A failed write restores the previous in-memory state so a retry
//! rewrites the same data.
//!
//! ## Read Path
//!
//! Chunks are loaded lazily on first access and parsed through
//! [`super::recovery`]. A chunk nothing can be salvaged from is renamed to
//! `<file>.corrupt.<epochMillis>` and replaced with `[]`.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Mutex;

use super::recovery::{parse_collection, Parsed, Recovery};
use super::{
    KeepFn, RecordStore, StoredRecord, AUTH_COLLECTION, DEFAULT_CHUNK_BYTES, DEFAULT_CHUNK_RECORDS,
};
use crate::error::{Error, Result};

/// Directory (under the session root) holding chunked collections
const STORES_DIR: &str = "stores";

/// Bookkeeping for a collection's on-disk chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    /// Number of chunk files currently on disk
    pub total_chunks: usize,
    /// Byte cap used when the chunks were planned
    pub chunk_size_bytes: usize,
    /// Collection the chunks belong to
    pub original_key: String,
}

struct CollectionState {
    records: IndexMap<String, Value>,
    meta: ChunkMetadata,
}

/// Holds a lazily loaded collection; the mutex is the whole-collection lock.
#[derive(Default)]
struct CollectionSlot {
    state: Mutex<Option<CollectionState>>,
}

/// Chunked JSON file backend
pub struct FileStore {
    root: PathBuf,
    chunk_records: usize,
    chunk_bytes: usize,
    collections: DashMap<String, Arc<CollectionSlot>>,
    file_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileStore {
    /// Create a store rooted at a session directory
    ///
    /// Nothing is read until a collection is first accessed.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_records: DEFAULT_CHUNK_RECORDS,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            collections: DashMap::new(),
            file_locks: DashMap::new(),
            key_locks: DashMap::new(),
        }
    }

    /// Override the chunk planning limits
    pub fn with_chunk_limits(mut self, records: usize, bytes: usize) -> Self {
        self.chunk_records = records.max(1);
        self.chunk_bytes = bytes.max(1);
        self
    }

    /// Session root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current chunk bookkeeping for a collection (loads it if needed)
    pub async fn chunk_metadata(&self, collection: &str) -> Result<ChunkMetadata> {
        validate_collection(collection)?;
        let slot = self.slot(collection);
        let mut guard = slot.state.lock().await;
        let state = self.ensure_loaded(collection, &mut guard).await?;
        Ok(state.meta.clone())
    }

    // ── Layout ─────────────────────────────────────────────────────────────

    fn is_chunked(collection: &str) -> bool {
        collection != AUTH_COLLECTION
    }

    fn chunk_path(&self, collection: &str, index: usize) -> PathBuf {
        if Self::is_chunked(collection) {
            self.root
                .join(STORES_DIR)
                .join(format!("{}-{}.json", collection, index))
        } else {
            self.root.join(format!("{}.json", collection))
        }
    }

    /// Chunk files present on disk, ordered by index.
    async fn existing_chunks(&self, collection: &str) -> Result<BTreeMap<usize, PathBuf>> {
        let mut found = BTreeMap::new();

        if !Self::is_chunked(collection) {
            let path = self.chunk_path(collection, 0);
            if tokio::fs::try_exists(&path).await? {
                found.insert(0, path);
            }
            return Ok(found);
        }

        let dir = self.root.join(STORES_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(Error::StorageReadError(format!("{}: {}", dir.display(), e))),
        };

        let prefix = format!("{}-", collection);
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let index = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(index) = index {
                found.insert(index, entry.path());
            }
        }
        Ok(found)
    }

    // ── Locks ──────────────────────────────────────────────────────────────

    fn slot(&self, collection: &str) -> Arc<CollectionSlot> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .clone()
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a key lock nobody else holds.
    fn release_key_lock(&self, key: &str) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    // ── Loading ────────────────────────────────────────────────────────────

    async fn ensure_loaded<'a>(
        &self,
        collection: &str,
        guard: &'a mut Option<CollectionState>,
    ) -> Result<&'a mut CollectionState> {
        if guard.is_none() {
            *guard = Some(self.load(collection).await?);
        }
        guard
            .as_mut()
            .ok_or_else(|| Error::StorageReadError(format!("collection {} not loaded", collection)))
    }

    async fn load(&self, collection: &str) -> Result<CollectionState> {
        let chunks = self.existing_chunks(collection).await?;
        let mut records = IndexMap::new();

        for path in chunks.values() {
            let lock = self.file_lock(path);
            let _file = lock.lock().await;
            for record in self.read_chunk(path).await? {
                records.insert(record.id, record.value);
            }
        }

        tracing::debug!(
            collection,
            chunks = chunks.len(),
            records = records.len(),
            "Collection loaded"
        );

        Ok(CollectionState {
            records,
            meta: ChunkMetadata {
                total_chunks: chunks.keys().next_back().map(|i| i + 1).unwrap_or(0),
                chunk_size_bytes: self.chunk_bytes,
                original_key: collection.to_string(),
            },
        })
    }

    /// Read one chunk, recovering or quarantining damaged content.
    async fn read_chunk(&self, path: &Path) -> Result<Vec<StoredRecord>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::StorageReadError(format!("{}: {}", path.display(), e))),
        };
        let raw = String::from_utf8_lossy(&bytes);

        match parse_collection(&raw) {
            Parsed::Records(records, Recovery::Strict) => Ok(records),
            Parsed::Records(records, how) => {
                tracing::warn!(
                    path = %path.display(),
                    recovery = ?how,
                    records = records.len(),
                    "Recovered damaged collection file"
                );
                Ok(records)
            }
            Parsed::Unrecoverable => {
                quarantine(path).await;
                Ok(Vec::new())
            }
        }
    }

    // ── Persisting ─────────────────────────────────────────────────────────

    /// Rewrite every chunk of a collection from its in-memory records.
    async fn persist(&self, collection: &str, state: &mut CollectionState) -> Result<()> {
        let chunks = if Self::is_chunked(collection) {
            plan_chunks(&state.records, self.chunk_records, self.chunk_bytes)?
        } else {
            plan_chunks(&state.records, usize::MAX, usize::MAX)?
        };

        for (index, contents) in chunks.iter().enumerate() {
            let path = self.chunk_path(collection, index);
            let lock = self.file_lock(&path);
            let _file = lock.lock().await;
            write_file(&path, contents).await?;
        }

        // Chunk files past the new count belong to records that no longer exist.
        for index in chunks.len()..state.meta.total_chunks {
            let path = self.chunk_path(collection, index);
            let lock = self.file_lock(&path);
            let _file = lock.lock().await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed stale chunk"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale chunk")
                }
            }
        }

        state.meta.total_chunks = chunks.len();
        state.meta.chunk_size_bytes = self.chunk_bytes;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        validate_collection(collection)?;
        let key = format!("{}/{}", collection, id);
        let key_lock = self.key_lock(&key);
        let result = async {
            let _key = key_lock.lock().await;
            let slot = self.slot(collection);
            let mut guard = slot.state.lock().await;
            let state = self.ensure_loaded(collection, &mut guard).await?;
            Ok::<_, Error>(state.records.get(id).cloned())
        }
        .await;
        drop(key_lock);
        self.release_key_lock(&key);
        result
    }

    async fn upsert(&self, collection: &str, id: &str, value: Value) -> Result<()> {
        validate_collection(collection)?;
        let key = format!("{}/{}", collection, id);
        let key_lock = self.key_lock(&key);
        let result = async {
            let _key = key_lock.lock().await;
            let slot = self.slot(collection);
            let mut guard = slot.state.lock().await;
            let state = self.ensure_loaded(collection, &mut guard).await?;

            if state.records.get(id) == Some(&value) {
                Ok(())
            } else {
                let previous = state.records.insert(id.to_string(), value);
                let result = self.persist(collection, state).await;
                if result.is_err() {
                    match previous {
                        Some(old) => {
                            state.records.insert(id.to_string(), old);
                        }
                        None => {
                            state.records.shift_remove(id);
                        }
                    }
                }
                result
            }
        }
        .await;
        drop(key_lock);
        self.release_key_lock(&key);
        result
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<()> {
        validate_collection(collection)?;
        let key = format!("{}/{}", collection, id);
        let key_lock = self.key_lock(&key);
        let result = async {
            let _key = key_lock.lock().await;
            let slot = self.slot(collection);
            let mut guard = slot.state.lock().await;
            let state = self.ensure_loaded(collection, &mut guard).await?;

            match state.records.get_index_of(id) {
                None => Ok(()),
                Some(index) => {
                    let (old_id, old_value) = state
                        .records
                        .shift_remove_index(index)
                        .ok_or_else(|| Error::StorageWriteError(format!("{} vanished", key)))?;
                    let result = self.persist(collection, state).await;
                    if result.is_err() {
                        state.records.shift_insert(index, old_id, old_value);
                    }
                    result
                }
            }
        }
        .await;
        drop(key_lock);
        self.release_key_lock(&key);
        result
    }

    async fn clear(&self, collection: &str, keep: Option<KeepFn<'_>>) -> Result<()> {
        validate_collection(collection)?;
        let slot = self.slot(collection);
        let mut guard = slot.state.lock().await;
        let state = self.ensure_loaded(collection, &mut guard).await?;

        let before = state.records.clone();
        match keep {
            Some(keep) => state.records.retain(|id, _| keep(id.as_str())),
            None => state.records.clear(),
        }

        let removed = before.len() - state.records.len();
        let result = self.persist(collection, state).await;
        if result.is_err() {
            state.records = before;
        } else {
            tracing::info!(collection, removed, "Collection cleared");
        }
        result
    }

    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        validate_collection(collection)?;
        let slot = self.slot(collection);
        let mut guard = slot.state.lock().await;
        let state = self.ensure_loaded(collection, &mut guard).await?;
        Ok(state
            .records
            .iter()
            .map(|(id, value)| StoredRecord::new(id.clone(), value.clone()))
            .collect())
    }
}

/// Collection names become file names; keep them to a safe alphabet.
fn validate_collection(collection: &str) -> Result<()> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidCollection(collection.to_string()))
    }
}

/// Split records into serialized chunk files.
///
/// A chunk closes when it holds `max_records` records or adding the next
/// record would push it past `max_bytes`. An empty collection still yields
/// one empty chunk so the file exists.
fn plan_chunks(
    records: &IndexMap<String, Value>,
    max_records: usize,
    max_bytes: usize,
) -> Result<Vec<String>> {
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_bytes = 2usize;

    for (id, value) in records {
        let encoded = serde_json::to_string(&StoredRecord::new(id.clone(), value.clone()))?;
        let over_count = current.len() >= max_records;
        let over_bytes = !current.is_empty() && current_bytes + encoded.len() + 1 > max_bytes;
        if over_count || over_bytes {
            chunks.push(format!("[{}]", current.join(",")));
            current.clear();
            current_bytes = 2;
        }
        current_bytes += encoded.len() + 1;
        current.push(encoded);
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(format!("[{}]", current.join(",")));
    }
    Ok(chunks)
}

/// Write a file, falling back step by step when the atomic path fails.
async fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::error!(error = %e, path = %parent.display(), "Failed to create store directory");
            return Err(Error::StorageWriteError(format!("{}: {}", parent.display(), e)));
        }
    }

    // 1. temp file + rename
    let tmp_path = tmp_path_for(path);
    match tokio::fs::write(&tmp_path, contents).await {
        Ok(()) => match tokio::fs::rename(&tmp_path, path).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Rename failed, falling back to direct write");
                let _ = tokio::fs::remove_file(&tmp_path).await;
            }
        },
        Err(e) => {
            tracing::warn!(path = %tmp_path.display(), error = %e, "Temp write failed, falling back to direct write");
        }
    }

    // 2. direct write
    match tokio::fs::write(path, contents).await {
        Ok(()) => return Ok(()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Direct write failed, trying raw write");
        }
    }

    // 3. raw blocking write
    let raw_path = path.to_path_buf();
    let bytes = contents.as_bytes().to_vec();
    let outcome = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&raw_path)?;
        file.write_all(&bytes)?;
        file.sync_all()
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(path = %path.display(), error = %e, "Raw write failed, chunk not persisted");
            Err(Error::StorageWriteError(format!("{}: {}", path.display(), e)))
        }
        Err(e) => Err(Error::StorageWriteError(format!("{}: {}", path.display(), e))),
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Move an unreadable file aside and leave an empty collection in its place.
async fn quarantine(path: &Path) {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".corrupt.{}", crate::time::now_timestamp_millis()));
    let target = path.with_file_name(name);

    match tokio::fs::rename(path, &target).await {
        Ok(()) => tracing::warn!(
            path = %path.display(),
            quarantined = %target.display(),
            "Unrecoverable collection file quarantined"
        ),
        Err(e) => tracing::error!(
            path = %path.display(),
            error = %e,
            "Failed to quarantine corrupt collection file"
        ),
    }

    if let Err(e) = tokio::fs::write(path, "[]").await {
        tracing::error!(path = %path.display(), error = %e, "Failed to reset corrupt collection file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &Path) -> FileStore {
        FileStore::new(dir)
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let value = json!({"key": {"id": "A1"}, "message": {"conversation": "hi"}});

        let fs = store(dir.path());
        fs.upsert("messages", "A1", value.clone()).await.unwrap();
        assert_eq!(fs.read("messages", "A1").await.unwrap(), Some(value.clone()));

        let reopened = store(dir.path());
        assert_eq!(reopened.read("messages", "A1").await.unwrap(), Some(value));
        assert_eq!(reopened.read("messages", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_layout_auth_unchunked_archive_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let fs = store(dir.path());
        fs.upsert("auth", "creds", json!({"registered": false})).await.unwrap();
        fs.upsert("chats", "123@g.us", json!({"id": "123@g.us"})).await.unwrap();

        assert!(dir.path().join("auth.json").exists());
        assert!(dir.path().join("stores").join("chats-0.json").exists());
    }

    #[tokio::test]
    async fn test_chunk_transparency() {
        let dir = tempfile::tempdir().unwrap();
        let fs = store(dir.path()).with_chunk_limits(10, usize::MAX);

        for i in 0..25 {
            fs.upsert("messages", &format!("m{}", i), json!({"n": i})).await.unwrap();
        }

        assert_eq!(
            files_in(&dir.path().join("stores")),
            vec!["messages-0.json", "messages-1.json", "messages-2.json"]
        );
        assert_eq!(fs.chunk_metadata("messages").await.unwrap().total_chunks, 3);
        assert_eq!(fs.list("messages").await.unwrap().len(), 25);

        let reopened = store(dir.path()).with_chunk_limits(10, usize::MAX);
        let records = reopened.list("messages").await.unwrap();
        assert_eq!(records.len(), 25);
        assert_eq!(records[24], StoredRecord::new("m24", json!({"n": 24})));
    }

    #[tokio::test]
    async fn test_byte_cap_splits_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let fs = store(dir.path()).with_chunk_limits(1000, 200);
        let filler = "x".repeat(80);

        for i in 0..6 {
            fs.upsert("contacts", &format!("c{}", i), json!({"bio": filler})).await.unwrap();
        }

        let meta = fs.chunk_metadata("contacts").await.unwrap();
        assert!(meta.total_chunks >= 3, "got {} chunks", meta.total_chunks);
        assert_eq!(meta.original_key, "contacts");
        assert_eq!(fs.list("contacts").await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_shrinking_removes_stale_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let fs = store(dir.path()).with_chunk_limits(5, usize::MAX);

        for i in 0..12 {
            fs.upsert("messages", &format!("m{}", i), json!(i)).await.unwrap();
        }
        assert_eq!(files_in(&dir.path().join("stores")).len(), 3);

        let keep: KeepFn<'_> = &|id: &str| id == "m1" || id == "m2";
        fs.clear("messages", Some(keep)).await.unwrap();

        assert_eq!(files_in(&dir.path().join("stores")), vec!["messages-0.json"]);
        let ids: Vec<String> = fs.list("messages").await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_remove_and_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let fs = store(dir.path());
        fs.upsert("chats", "a", json!(1)).await.unwrap();
        fs.upsert("chats", "b", json!(2)).await.unwrap();

        fs.remove("chats", "a").await.unwrap();
        fs.remove("chats", "never-existed").await.unwrap();
        assert_eq!(fs.read("chats", "a").await.unwrap(), None);
        assert_eq!(fs.list("chats").await.unwrap().len(), 1);

        fs.clear("chats", None).await.unwrap();
        assert!(fs.list("chats").await.unwrap().is_empty());
        assert!(store(dir.path()).list("chats").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concatenated_objects_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let stores = dir.path().join("stores");
        std::fs::create_dir_all(&stores).unwrap();
        std::fs::write(
            stores.join("messages-0.json"),
            r#"{"id":"a","value":{"n":1}}{"id":"b","value":{"n":2}}"#,
        )
        .unwrap();

        let fs = store(dir.path());
        let records = fs.list("messages").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_garbage_quarantined_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let stores = dir.path().join("stores");
        std::fs::create_dir_all(&stores).unwrap();
        std::fs::write(stores.join("chats-0.json"), "\u{1}\u{2}not json{{{").unwrap();

        let fs = store(dir.path());
        assert!(fs.list("chats").await.unwrap().is_empty());

        let names = files_in(&stores);
        assert!(names.iter().any(|n| n.starts_with("chats-0.json.corrupt.")), "{:?}", names);
        assert_eq!(std::fs::read_to_string(stores.join("chats-0.json")).unwrap(), "[]");

        // The collection stays usable.
        fs.upsert("chats", "c1", json!({"id": "c1"})).await.unwrap();
        assert_eq!(store(dir.path()).list("chats").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_lose_records() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(store(dir.path()).with_chunk_limits(7, usize::MAX));

        let mut handles = Vec::new();
        for i in 0..40 {
            let fs = fs.clone();
            handles.push(tokio::spawn(async move {
                fs.upsert("messages", &format!("m{}", i), json!({"n": i})).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fs.list("messages").await.unwrap().len(), 40);
        let reopened = store(dir.path());
        assert_eq!(reopened.list("messages").await.unwrap().len(), 40);
        assert!(fs.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_releases_key_locks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stores"), "not a directory").unwrap();
        let fs = store(dir.path());

        assert!(matches!(fs.read("chats", "x").await, Err(Error::StorageReadError(_))));
        assert!(fs.upsert("chats", "x", json!(1)).await.is_err());
        assert!(fs.remove("chats", "x").await.is_err());
        assert!(fs.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_collection_name() {
        let dir = tempfile::tempdir().unwrap();
        let fs = store(dir.path());
        let result = fs.upsert("../escape", "x", json!(1)).await;
        assert!(matches!(result, Err(Error::InvalidCollection(_))));
    }

    #[test]
    fn test_plan_chunks_empty_collection() {
        let chunks = plan_chunks(&IndexMap::new(), 10, 100).unwrap();
        assert_eq!(chunks, vec!["[]".to_string()]);
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(
            tmp_path_for(Path::new("/s/stores/chats-0.json")),
            PathBuf::from("/s/stores/chats-0.json.tmp")
        );
    }
}
