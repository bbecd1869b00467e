//! In-process backend for tests and throwaway sessions.

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;

use super::{KeepFn, RecordStore, StoredRecord};
use crate::error::Result;

/// Record store kept entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, RwLock<IndexMap<String, Value>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|records| records.read().get(id).cloned()))
    }

    async fn upsert(&self, collection: &str, id: &str, value: Value) -> Result<()> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .write()
            .insert(id.to_string(), value);
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<()> {
        if let Some(records) = self.collections.get(collection) {
            records.write().shift_remove(id);
        }
        Ok(())
    }

    async fn clear(&self, collection: &str, keep: Option<KeepFn<'_>>) -> Result<()> {
        if let Some(records) = self.collections.get(collection) {
            let mut records = records.write();
            match keep {
                Some(keep) => records.retain(|id, _| keep(id.as_str())),
                None => records.clear(),
            }
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        Ok(self
            .collections
            .get(collection)
            .map(|records| {
                records
                    .read()
                    .iter()
                    .map(|(id, value)| StoredRecord::new(id.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
