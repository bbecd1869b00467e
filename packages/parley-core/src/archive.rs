//! # Message Archive
//!
//! Named-collection view over a [`RecordStore`] holding what the extractor
//! needs to look things up by id.
//!
//! ```text
//! ┌──────────────┬───────────────────────────┬──────────────────────────────┐
//! │ collection   │ id                        │ value                        │
//! ├──────────────┼───────────────────────────┼──────────────────────────────┤
//! │ messages     │ key.id                    │ raw Envelope                 │
//! │ chats        │ room jid                  │ Chat { id, name?, … }        │
//! │ contacts     │ user jid                  │ Contact { id, name?, … }     │
//! └──────────────┴───────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Lookups never fail on a missing or unreadable record; they return
//! `None` and the caller falls back to the envelope's own fields.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::{Envelope, MessageKey};
use crate::error::Result;
use crate::jid;
use crate::storage::retry::retry;
use crate::storage::{RecordStore, RetryPolicy};

/// Collection of raw envelopes
pub const MESSAGES: &str = "messages";
/// Collection of room metadata
pub const CHATS: &str = "chats";
/// Collection of contact metadata
pub const CONTACTS: &str = "contacts";

/// Something the archive can store under its own id
pub trait ArchiveRecord: Serialize + DeserializeOwned {
    /// Collection the record lives in
    const COLLECTION: &'static str;

    /// Id derived from the record's own key field
    fn record_id(&self) -> Option<&str>;
}

impl ArchiveRecord for Envelope {
    const COLLECTION: &'static str = MESSAGES;

    fn record_id(&self) -> Option<&str> {
        Some(self.key.id.as_str()).filter(|id| !id.is_empty())
    }
}

/// Room metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    /// Room name or group subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ArchiveRecord for Chat {
    const COLLECTION: &'static str = CHATS;

    fn record_id(&self) -> Option<&str> {
        Some(self.id.as_str()).filter(|id| !id.is_empty())
    }
}

/// Contact metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    /// Name from the address book
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Push name the contact chose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
    /// Verified business name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ArchiveRecord for Contact {
    const COLLECTION: &'static str = CONTACTS;

    fn record_id(&self) -> Option<&str> {
        Some(self.id.as_str()).filter(|id| !id.is_empty())
    }
}

impl Contact {
    /// Best display name: address book, push name, business name
    pub fn display_name(&self) -> Option<&str> {
        [&self.name, &self.notify, &self.verified_name]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|name| !name.trim().is_empty())
    }
}

/// Id-keyed view over the archive collections
#[derive(Clone)]
pub struct MessageArchive {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
}

impl MessageArchive {
    /// Create an archive over a store
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Store a record under its own id
    ///
    /// Records without an id are skipped.
    pub async fn write<T: ArchiveRecord>(&self, record: &T) -> Result<()> {
        let Some(id) = record.record_id() else {
            tracing::debug!(collection = T::COLLECTION, "Skipping record without id");
            return Ok(());
        };
        let value = serde_json::to_value(record)?;
        retry(self.retry, "archive_write", || {
            self.store.upsert(T::COLLECTION, id, value.clone())
        })
        .await
    }

    /// Read a record by id
    pub async fn read<T: ArchiveRecord>(&self, id: &str) -> Result<Option<T>> {
        let value = retry(self.retry, "archive_read", || self.store.read(T::COLLECTION, id)).await?;

        Ok(value.and_then(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(collection = T::COLLECTION, id, error = %e, "Unreadable archive record");
                None
            }
        }))
    }

    /// Merge a partial update into a stored record
    ///
    /// Top-level fields of `patch` overwrite the stored ones; everything else
    /// is kept. A record that does not exist yet is created from the patch.
    pub async fn merge<T: ArchiveRecord>(&self, id: &str, patch: &Map<String, Value>) -> Result<()> {
        let stored = retry(self.retry, "archive_read", || self.store.read(T::COLLECTION, id)).await?;

        let mut merged = match stored {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (field, value) in patch {
            merged.insert(field.clone(), value.clone());
        }
        merged.insert("id".to_string(), Value::String(id.to_string()));

        // Round-trip through the typed record so garbage never lands in the store.
        let record: T = serde_json::from_value(Value::Object(merged))
            .map_err(|e| crate::Error::DeserializationError(format!("{}/{}: {}", T::COLLECTION, id, e)))?;
        let value = serde_json::to_value(&record)?;
        retry(self.retry, "archive_merge", || {
            self.store.upsert(T::COLLECTION, id, value.clone())
        })
        .await
    }

    /// Stored envelope for a key, used by the protocol client for resends
    pub async fn get_message(&self, key: &MessageKey) -> Result<Option<Envelope>> {
        if key.id.is_empty() {
            return Ok(None);
        }
        self.read::<Envelope>(&key.id).await
    }

    /// Display name of a room or user
    ///
    /// Groups resolve through `chats`; users through `contacts`, then
    /// `chats`.
    pub async fn display_name_for(&self, jid: &str) -> Result<Option<String>> {
        if jid.is_empty() {
            return Ok(None);
        }

        if !jid::is_group(jid) {
            let user = jid::normalize_user(jid);
            if let Some(contact) = self.read::<Contact>(&user).await? {
                if let Some(name) = contact.display_name() {
                    return Ok(Some(name.to_string()));
                }
            }
        }

        let chat = self.read::<Chat>(jid).await?;
        Ok(chat
            .and_then(|chat| chat.name)
            .filter(|name| !name.trim().is_empty()))
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn archive() -> MessageArchive {
        MessageArchive::new(Arc::new(MemoryStore::new()), RetryPolicy::none())
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_write_and_get_message() {
        let archive = archive();
        let envelope = Envelope::from_value(json!({
            "key": {"remoteJid": "1@s.whatsapp.net", "id": "M1"},
            "message": {"conversation": "hi"}
        }))
        .unwrap();

        archive.write(&envelope).await.unwrap();
        let key = MessageKey {
            id: "M1".into(),
            ..MessageKey::default()
        };
        assert_eq!(archive.get_message(&key).await.unwrap(), Some(envelope));
        assert_eq!(archive.get_message(&MessageKey::default()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_without_id_skipped() {
        let archive = archive();
        archive.write(&Chat::default()).await.unwrap();
        assert!(archive.store().list(CHATS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_preserves_fields() {
        let archive = archive();
        archive
            .write(&Chat {
                id: "123@g.us".into(),
                name: Some("Old".into()),
                extra: object(json!({"unreadCount": 3})),
            })
            .await
            .unwrap();

        archive
            .merge::<Chat>("123@g.us", &object(json!({"name": "New"})))
            .await
            .unwrap();

        let chat = archive.read::<Chat>("123@g.us").await.unwrap().unwrap();
        assert_eq!(chat.name.as_deref(), Some("New"));
        assert_eq!(chat.extra["unreadCount"], 3);

        archive
            .merge::<Contact>("5@s.whatsapp.net", &object(json!({"notify": "Eve"})))
            .await
            .unwrap();
        let contact = archive.read::<Contact>("5@s.whatsapp.net").await.unwrap().unwrap();
        assert_eq!(contact.notify.as_deref(), Some("Eve"));
    }

    #[tokio::test]
    async fn test_display_name_resolution() {
        let archive = archive();
        assert_eq!(archive.display_name_for("9@s.whatsapp.net").await.unwrap(), None);

        archive
            .write(&Contact {
                id: "9@s.whatsapp.net".into(),
                notify: Some("Nine".into()),
                ..Contact::default()
            })
            .await
            .unwrap();
        archive
            .write(&Chat {
                id: "123@g.us".into(),
                name: Some("Team".into()),
                ..Chat::default()
            })
            .await
            .unwrap();

        assert_eq!(
            archive.display_name_for("9:3@s.whatsapp.net").await.unwrap().as_deref(),
            Some("Nine")
        );
        assert_eq!(archive.display_name_for("123@g.us").await.unwrap().as_deref(), Some("Team"));
    }

    #[tokio::test]
    async fn test_unreadable_record_is_none() {
        let archive = archive();
        archive.store().upsert(CHATS, "x", json!("not a chat")).await.unwrap();
        assert_eq!(archive.read::<Chat>("x").await.unwrap(), None);
    }
}
