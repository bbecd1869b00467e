//! # Auth State
//!
//! Maps the protocol client's `{creds, keys: {get, set}}` contract onto a
//! [`RecordStore`].
//!
//! ## Credential Saves
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DEBOUNCED CREDENTIAL SAVES                         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  update_creds / save_creds ──► Schedule ─┐                              │
//! │  flush                     ──► Flush ────┤  mpsc                        │
//! │  shutdown                  ──► Shutdown ─┤                              │
//! │                                          ▼                              │
//! │                               ┌──────────────────────┐                  │
//! │                               │    saver task        │                  │
//! │                               │                      │                  │
//! │                               │ first Schedule arms  │                  │
//! │                               │ a deadline; more     │                  │
//! │                               │ Schedules coalesce   │                  │
//! │                               └──────────┬───────────┘                  │
//! │                                          │ deadline / Flush / Shutdown  │
//! │                                          ▼                              │
//! │                         retry(upsert("auth", "creds", snapshot))        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A scheduled save is never dropped: a failed save stays pending and is
//! retried on the next deadline, and `shutdown` flushes before the worker
//! exits.

pub mod buffer;
pub mod creds;

pub use creds::{AuthCreds, KeyPair, KeyType, SignedKeyPair};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::storage::retry::retry;
use crate::storage::{KeepFn, RecordStore, RetryPolicy, AUTH_COLLECTION};

/// Record id of the credential blob
pub const CREDS_ID: &str = "creds";

/// A batch of key writes; `None` deletes
pub type KeyPatch = HashMap<KeyType, HashMap<String, Option<Value>>>;

enum SaveCommand {
    Schedule,
    Flush(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Credential and signal-key state of one session
pub struct AuthState {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    creds: Arc<RwLock<AuthCreds>>,
    saver: mpsc::UnboundedSender<SaveCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuthState {
    /// Load credentials (creating them on first run) and start the saver
    pub async fn load(
        store: Arc<dyn RecordStore>,
        policy: RetryPolicy,
        debounce: Duration,
    ) -> Result<Self> {
        let existing = retry(policy, "load_creds", || store.read(AUTH_COLLECTION, CREDS_ID)).await?;

        let creds = match existing {
            Some(value) => serde_json::from_value::<AuthCreds>(value)
                .map_err(|e| Error::DeserializationError(format!("stored creds: {}", e)))?,
            None => {
                let creds = AuthCreds::generate();
                let value = serde_json::to_value(&creds)?;
                retry(policy, "save_creds", || {
                    store.upsert(AUTH_COLLECTION, CREDS_ID, value.clone())
                })
                .await?;
                tracing::info!(registration_id = creds.registration_id, "Generated new credentials");
                creds
            }
        };

        tracing::info!(
            registered = creds.registered,
            own_id = creds.own_id().unwrap_or("-"),
            "Credentials loaded"
        );

        let creds = Arc::new(RwLock::new(creds));
        let (saver, commands) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_saver(
            store.clone(),
            policy,
            creds.clone(),
            debounce,
            commands,
        ));

        Ok(Self {
            store,
            retry: policy,
            creds,
            saver,
            worker: Mutex::new(Some(worker)),
        })
    }

    // ========================================================================
    // CREDENTIALS
    // ========================================================================

    /// Snapshot of the current credentials
    pub fn creds(&self) -> AuthCreds {
        self.creds.read().clone()
    }

    /// Mutate credentials in memory and schedule a save
    pub fn update_creds<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AuthCreds),
    {
        {
            let mut creds = self.creds.write();
            f(&mut *creds);
        }
        self.save_creds()
    }

    /// Schedule a save of the current credentials
    pub fn save_creds(&self) -> Result<()> {
        self.saver
            .send(SaveCommand::Schedule)
            .map_err(|_| Error::AuthWorkerStopped)
    }

    /// Write any pending credential save now
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.saver
            .send(SaveCommand::Flush(tx))
            .map_err(|_| Error::AuthWorkerStopped)?;
        rx.await.map_err(|_| Error::AuthWorkerStopped)?
    }

    /// Flush pending saves and stop the saver
    ///
    /// Calling this twice is harmless.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.saver.send(SaveCommand::Shutdown(tx)).is_err() {
            return Ok(());
        }
        let result = rx.await.unwrap_or(Ok(()));

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Credential saver task failed");
            }
        }
        result
    }

    // ========================================================================
    // SIGNAL KEYS
    // ========================================================================

    /// Fetch keys of one category; missing ids are absent from the result
    pub async fn get(&self, key_type: KeyType, ids: &[String]) -> Result<HashMap<String, Value>> {
        let mut found = HashMap::with_capacity(ids.len());

        for id in ids {
            let record_id = key_type.record_id(id);
            let value = retry(self.retry, "get_key", || {
                self.store.read(AUTH_COLLECTION, &record_id)
            })
            .await?;

            let Some(value) = value else { continue };
            let value = match key_type {
                KeyType::AppStateSyncKey => match reinflate_app_state_key(&value) {
                    Ok(key) => serde_json::to_value(key)?,
                    Err(e) => {
                        tracing::warn!(id = %id, error = %e, "Unreadable app-state sync key");
                        continue;
                    }
                },
                _ => value,
            };
            found.insert(id.clone(), value);
        }

        Ok(found)
    }

    /// Apply a batch of key writes
    pub async fn set(&self, patch: KeyPatch) -> Result<()> {
        let mut written = 0usize;
        let mut removed = 0usize;

        for (key_type, entries) in patch {
            for (id, value) in entries {
                let record_id = key_type.record_id(&id);
                match value {
                    Some(value) => {
                        retry(self.retry, "set_key", || {
                            self.store.upsert(AUTH_COLLECTION, &record_id, value.clone())
                        })
                        .await?;
                        written += 1;
                    }
                    None => {
                        retry(self.retry, "remove_key", || {
                            self.store.remove(AUTH_COLLECTION, &record_id)
                        })
                        .await?;
                        removed += 1;
                    }
                }
            }
        }

        tracing::debug!(written, removed, "Signal keys updated");
        Ok(())
    }

    /// Drop every signal key, keeping the credential record
    pub async fn clear(&self) -> Result<()> {
        let keep: KeepFn<'_> = &|id: &str| id == CREDS_ID;
        retry(self.retry, "clear_keys", || self.store.clear(AUTH_COLLECTION, Some(keep)))
        .await
    }
}

impl Drop for AuthState {
    fn drop(&mut self) {
        // Dropping the sender ends the worker after its final save.
        if self.worker.lock().is_some() {
            tracing::debug!("AuthState dropped without shutdown");
        }
    }
}

async fn save_snapshot(
    store: &Arc<dyn RecordStore>,
    policy: RetryPolicy,
    creds: &RwLock<AuthCreds>,
) -> Result<()> {
    let value = serde_json::to_value(&*creds.read())?;
    retry(policy, "save_creds", || {
        store.upsert(AUTH_COLLECTION, CREDS_ID, value.clone())
    })
    .await?;
    tracing::debug!("Credentials saved");
    Ok(())
}

async fn run_saver(
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
    creds: Arc<RwLock<AuthCreds>>,
    debounce: Duration,
    mut commands: mpsc::UnboundedReceiver<SaveCommand>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = commands.recv() => command,
                _ = tokio::time::sleep_until(at) => {
                    deadline = match save_snapshot(&store, policy, &creds).await {
                        Ok(()) => None,
                        Err(e) => {
                            tracing::error!(error = %e, "Credential save failed, will retry");
                            Some(Instant::now() + debounce)
                        }
                    };
                    continue;
                }
            },
            None => commands.recv().await,
        };

        match command {
            Some(SaveCommand::Schedule) => {
                deadline.get_or_insert_with(|| Instant::now() + debounce);
            }
            Some(SaveCommand::Flush(reply)) => {
                let result = match deadline.take() {
                    Some(_) => save_snapshot(&store, policy, &creds).await,
                    None => Ok(()),
                };
                if result.is_err() {
                    deadline = Some(Instant::now() + debounce);
                }
                let _ = reply.send(result);
            }
            Some(SaveCommand::Shutdown(reply)) => {
                let result = match deadline.take() {
                    Some(_) => save_snapshot(&store, policy, &creds).await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
                break;
            }
            None => {
                if deadline.is_some() {
                    if let Err(e) = save_snapshot(&store, policy, &creds).await {
                        tracing::error!(error = %e, "Final credential save failed");
                    }
                }
                break;
            }
        }
    }

    tracing::debug!("Credential saver stopped");
}

// ============================================================================
// APP-STATE SYNC KEYS
// ============================================================================

/// Fingerprint of an app-state sync key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFingerprint {
    pub raw_id: u32,
    pub current_index: u32,
    pub device_indexes: Vec<u32>,
}

/// Fixed-shape app-state sync key handed to the protocol client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateSyncKeyData {
    #[serde(with = "buffer::bytes")]
    pub key_data: Vec<u8>,
    pub fingerprint: KeyFingerprint,
    pub timestamp: i64,
}

/// Rebuild an app-state sync key from its sparse stored form
///
/// Missing fingerprint fields default to zero/empty; key material may be in
/// any shape [`buffer::decode`] accepts.
pub fn reinflate_app_state_key(stored: &Value) -> Result<AppStateSyncKeyData> {
    let key_data = stored
        .get("keyData")
        .ok_or_else(|| Error::InvalidKeyMaterial("missing keyData".into()))?;
    let key_data = buffer::decode(key_data)
        .ok_or_else(|| Error::InvalidKeyMaterial("keyData is not a byte buffer".into()))?;

    let fingerprint = stored.get("fingerprint");
    let field = |name: &str| {
        fingerprint
            .and_then(|f| f.get(name))
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };
    let device_indexes = fingerprint
        .and_then(|f| f.get("deviceIndexes"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|n| n.as_u64().and_then(|n| u32::try_from(n).ok()))
                .collect()
        })
        .unwrap_or_default();

    Ok(AppStateSyncKeyData {
        key_data,
        fingerprint: KeyFingerprint {
            raw_id: field("rawId"),
            current_index: field("currentIndex"),
            device_indexes,
        },
        timestamp: stored
            .get("timestamp")
            .and_then(crate::time::long_from_json)
            .unwrap_or(0),
    })
}
