//! # Session
//!
//! Wires the components of one logged-in account together and consumes the
//! protocol client's event stream.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              SESSION                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   SessionConfig ──► open_store ──► RecordStore                          │
//! │                                        │                                │
//! │                    ┌───────────────────┼────────────────────┐           │
//! │                    ▼                   ▼                    │           │
//! │               AuthState          MessageArchive             │           │
//! │            (creds + keys)     (messages/chats/contacts)     │           │
//! │                                        │                    │           │
//! │                                        ▼                    │           │
//! │   ProtocolEvent ──► handle() ──► Extractor ◄── RateLimiter  │           │
//! │                                        │                                │
//! │                                        ▼                                │
//! │                                 EventDispatcher ──► application         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Envelopes of one `messages.upsert` batch are extracted concurrently; two
//! envelopes with the same message id never are.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::archive::{Chat, Contact, MessageArchive};
use crate::auth::AuthState;
use crate::config::SessionConfig;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::events::{
    AppEvent, CallEvent, CallStatus, ConnectionStatus, ConnectionUpdate, EventDispatcher, EventName,
};
use crate::extractor::{Account, Extractor, ExtractorSettings, MediaDownloader, MessageContext};
use crate::jid;
use crate::limiter::RateLimiter;
use crate::storage::{open_store, RecordStore};

/// Shortest interval between limiter purges
const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// PROTOCOL EVENTS
// ============================================================================

/// `connection.update` payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConnectionUpdate {
    #[serde(default)]
    pub connection: Option<ConnectionStatus>,
    #[serde(default)]
    pub last_disconnect: Option<Value>,
    /// Pairing QR payload, not forwarded
    #[serde(default)]
    pub qr: Option<String>,
}

/// `messages.upsert` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesUpsert {
    /// Raw envelopes; malformed ones are skipped
    pub messages: Vec<Value>,
    /// `notify` for live messages, `append` for ones added by sync
    #[serde(rename = "type", default = "default_upsert_type")]
    pub kind: String,
}

fn default_upsert_type() -> String {
    "notify".to_string()
}

/// One element of a `call` event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCall {
    pub id: String,
    pub chat_id: String,
    pub from: String,
    #[serde(default)]
    pub group_jid: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub offline: bool,
    pub status: CallStatus,
    /// Epoch number, numeric string or RFC 3339 date
    #[serde(default)]
    pub date: Option<Value>,
}

/// `messaging-history.set` payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySet {
    #[serde(default)]
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub is_latest: bool,
}

/// `groups.update` element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupUpdate {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
}

/// Event emitted by the protocol client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ProtocolEvent {
    #[serde(rename = "connection.update")]
    ConnectionUpdate(RawConnectionUpdate),
    #[serde(rename = "messages.upsert")]
    MessagesUpsert(MessagesUpsert),
    #[serde(rename = "call")]
    Call(Vec<RawCall>),
    #[serde(rename = "messaging-history.set")]
    HistorySet(HistorySet),
    #[serde(rename = "chats.upsert")]
    ChatsUpsert(Vec<Chat>),
    /// Partial chat records, each with an `id`
    #[serde(rename = "chats.update")]
    ChatsUpdate(Vec<Map<String, Value>>),
    #[serde(rename = "contacts.upsert")]
    ContactsUpsert(Vec<Contact>),
    /// Partial contact records, each with an `id`
    #[serde(rename = "contacts.update")]
    ContactsUpdate(Vec<Map<String, Value>>),
    #[serde(rename = "groups.update")]
    GroupsUpdate(Vec<GroupUpdate>),
}

impl ProtocolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::ConnectionUpdate(_) => "connection.update",
            ProtocolEvent::MessagesUpsert(_) => "messages.upsert",
            ProtocolEvent::Call(_) => "call",
            ProtocolEvent::HistorySet(_) => "messaging-history.set",
            ProtocolEvent::ChatsUpsert(_) => "chats.upsert",
            ProtocolEvent::ChatsUpdate(_) => "chats.update",
            ProtocolEvent::ContactsUpsert(_) => "contacts.upsert",
            ProtocolEvent::ContactsUpdate(_) => "contacts.update",
            ProtocolEvent::GroupsUpdate(_) => "groups.update",
        }
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// One account's add-on layer
pub struct Session {
    config: SessionConfig,
    auth: AuthState,
    archive: MessageArchive,
    limiter: Arc<RateLimiter>,
    extractor: Extractor,
    dispatcher: Arc<EventDispatcher>,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    purger: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Open the configured store and bring the session up
    pub async fn open(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config)?;
        Self::open_with(config, store, None).await
    }

    /// Bring the session up over an existing store
    pub async fn open_with(
        config: SessionConfig,
        store: Arc<dyn RecordStore>,
        downloader: Option<Arc<dyn MediaDownloader>>,
    ) -> Result<Self> {
        config.validate()?;

        let auth = AuthState::load(store.clone(), config.retry, config.creds_debounce).await?;
        let archive = MessageArchive::new(store, config.retry);
        let limiter = Arc::new(RateLimiter::new());

        let mut extractor = Extractor::new(archive.clone(), limiter.clone(), ExtractorSettings::from(&config));
        if let Some(downloader) = downloader {
            extractor = extractor.with_downloader(downloader);
        }

        let purger = spawn_purger(limiter.clone(), config.limiter.window.max(MIN_PURGE_INTERVAL));

        let session = Self {
            config,
            auth,
            archive,
            limiter,
            extractor,
            dispatcher: Arc::new(EventDispatcher::new()),
            in_flight: DashMap::new(),
            purger: Mutex::new(Some(purger)),
        };
        session.refresh_account();

        tracing::info!(session = session.config.session.as_str(), "Session opened");
        Ok(session)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Credential state handed to the protocol client
    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn archive(&self) -> &MessageArchive {
        &self.archive
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Register an application handler
    pub fn on<F>(&self, name: EventName, handler: F) -> usize
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on(name, handler)
    }

    /// Re-read the own account from credentials
    ///
    /// The protocol client fills `me` in during pairing; the session picks
    /// it up on open and on every `open` connection update.
    pub fn refresh_account(&self) {
        let creds = self.auth.creds();
        let account = creds.me.map(|me| Account {
            id: me.id,
            lid: me.lid,
            name: me.name,
        });
        self.extractor.set_account(account);
    }

    /// Archived envelope lookup for the protocol client's resend path
    pub async fn get_message(&self, key: &crate::envelope::MessageKey) -> Result<Option<Envelope>> {
        self.archive.get_message(key).await
    }

    // ========================================================================
    // EVENT HANDLING
    // ========================================================================

    /// Consume one protocol event
    pub async fn handle(&self, event: ProtocolEvent) -> Result<()> {
        tracing::trace!(event = event.name(), "Protocol event");

        match event {
            ProtocolEvent::ConnectionUpdate(update) => self.on_connection(update),
            ProtocolEvent::MessagesUpsert(upsert) => self.on_messages(upsert).await?,
            ProtocolEvent::Call(calls) => self.on_calls(calls),
            ProtocolEvent::HistorySet(history) => self.on_history(history).await?,
            ProtocolEvent::ChatsUpsert(chats) => {
                for chat in &chats {
                    self.archive.write(chat).await?;
                }
            }
            ProtocolEvent::ContactsUpsert(contacts) => {
                for contact in &contacts {
                    self.archive.write(contact).await?;
                }
            }
            ProtocolEvent::ChatsUpdate(patches) => {
                for patch in &patches {
                    if let Some(id) = patch_id(patch) {
                        self.archive.merge::<Chat>(id, patch).await?;
                    }
                }
            }
            ProtocolEvent::ContactsUpdate(patches) => {
                for patch in &patches {
                    if let Some(id) = patch_id(patch) {
                        self.archive.merge::<Contact>(id, patch).await?;
                    }
                }
            }
            ProtocolEvent::GroupsUpdate(groups) => {
                for group in groups {
                    let Some(subject) = group.subject else { continue };
                    let mut patch = Map::new();
                    patch.insert("name".into(), Value::String(subject));
                    self.archive.merge::<Chat>(&group.id, &patch).await?;
                }
            }
        }
        Ok(())
    }

    /// Deliver an external webhook payload to `webhook` handlers
    pub fn emit_webhook(&self, payload: Value) {
        self.dispatcher.emit(&AppEvent::Webhook(payload));
    }

    fn on_connection(&self, update: RawConnectionUpdate) {
        let Some(status) = update.connection else {
            if update.qr.is_some() {
                tracing::info!("Pairing code received");
            }
            return;
        };

        let reason = update.last_disconnect.as_ref().and_then(disconnect_reason);
        match status {
            ConnectionStatus::Open => {
                self.refresh_account();
                tracing::info!("Connection open");
            }
            ConnectionStatus::Close => tracing::warn!(reason = ?reason, "Connection closed"),
            ConnectionStatus::Connecting => tracing::info!("Connecting"),
        }
        self.dispatcher
            .emit(&AppEvent::Connection(ConnectionUpdate { status, reason }));
    }

    async fn on_messages(&self, upsert: MessagesUpsert) -> Result<()> {
        let envelopes = parse_envelopes(upsert.messages);

        for envelope in &envelopes {
            self.archive.write(envelope).await?;
        }
        if upsert.kind != "notify" {
            tracing::debug!(kind = upsert.kind.as_str(), count = envelopes.len(), "Archived without extraction");
            return Ok(());
        }

        let results = join_all(envelopes.into_iter().map(|envelope| self.process(envelope))).await;
        for result in results {
            match result {
                Ok(Some(context)) => self.dispatcher.emit(&AppEvent::Messages(Box::new(context))),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, code = e.code(), "Extraction failed"),
            }
        }
        Ok(())
    }

    /// Extract one envelope while holding its message-id lock
    pub async fn process(&self, envelope: Envelope) -> Result<Option<MessageContext>> {
        let id = envelope.key.id.clone();
        let lock = self
            .in_flight
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.extractor.extract(envelope).await
        };

        drop(lock);
        self.in_flight.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn on_calls(&self, calls: Vec<RawCall>) {
        for call in calls {
            let room_id = match (&call.group_jid, call.is_group) {
                (Some(group), true) => group.clone(),
                _ => call.chat_id.clone(),
            };
            let event = CallEvent {
                call_id: call.id,
                is_group: call.is_group || jid::is_group(&room_id),
                room_id,
                caller_id: jid::normalize_user(&call.from),
                date: call
                    .date
                    .as_ref()
                    .and_then(call_date)
                    .unwrap_or_else(crate::time::now_timestamp_millis),
                offline: call.offline,
                status: call.status,
                is_video: call.is_video,
            };
            tracing::debug!(call_id = event.call_id.as_str(), status = ?event.status, "Call event");
            self.dispatcher.emit(&AppEvent::Calls(event));
        }
    }

    async fn on_history(&self, history: HistorySet) -> Result<()> {
        for chat in &history.chats {
            self.archive.write(chat).await?;
        }
        for contact in &history.contacts {
            self.archive.write(contact).await?;
        }
        let envelopes = parse_envelopes(history.messages);
        for envelope in &envelopes {
            self.archive.write(envelope).await?;
        }
        tracing::info!(
            chats = history.chats.len(),
            contacts = history.contacts.len(),
            messages = envelopes.len(),
            is_latest = history.is_latest,
            "History synced"
        );
        Ok(())
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Purge idle limiter windows now
    pub fn purge_limiter(&self) -> usize {
        self.limiter.purge_expired()
    }

    /// Flush pending credential saves and stop background tasks
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(purger) = self.purger.lock().take() {
            purger.abort();
        }
        self.auth.shutdown().await?;
        tracing::info!(session = self.config.session.as_str(), "Session shut down");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(purger) = self.purger.lock().take() {
            purger.abort();
        }
    }
}

fn spawn_purger(limiter: Arc<RateLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            limiter.purge_expired();
        }
    })
}

fn parse_envelopes(raw: Vec<Value>) -> Vec<Envelope> {
    raw.into_iter()
        .filter_map(|value| match Envelope::from_value(value) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed envelope");
                None
            }
        })
        .collect()
}

fn patch_id(patch: &Map<String, Value>) -> Option<&str> {
    patch.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())
}

fn disconnect_reason(last_disconnect: &Value) -> Option<String> {
    ["error.message", "error.output.payload.message", "reason"]
        .iter()
        .filter_map(|path| crate::envelope::lookup(last_disconnect, path))
        .find_map(|value| match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn call_date(value: &Value) -> Option<i64> {
    if let Value::String(s) = value {
        if let Ok(date) = chrono::DateTime::parse_from_rfc3339(s) {
            return Some(date.timestamp_millis());
        }
    }
    crate::time::long_from_json(value).map(crate::time::to_millis)
}
