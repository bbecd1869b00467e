//! # Extractor
//!
//! Turns a raw envelope into a [`MessageContext`].
//!
//! ## Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         EXTRACTION PIPELINE                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  envelope                                                               │
//! │     │  1. reject: no content / no id / stub / bot invocation            │
//! │     │  2. reject: self-authored (top level, ignore_me)                  │
//! │     │  ── unwrap ephemeral / view-once / doc-with-caption / edited ──   │
//! │     │  3. pin     ──► archived target replaces working envelope         │
//! │     │  4. delete  ──► archived target replaces working envelope         │
//! │     │  5. edit    ──► new payload merged over archived target           │
//! │     ▼                                                                   │
//! │  6. classify content (ChatType)          none ──► None                  │
//! │  7. identity + names (archive, then envelope fields)                    │
//! │  8. rate limit (top level only)                                         │
//! │  9. citations                                                           │
//! │ 10. media descriptor                                                    │
//! │ 11. reply ──► same pipeline at ReplyDepth::Nested, never deeper         │
//! │ 12. text, mentions, links                                               │
//! │ 13. prefix                                                              │
//! │ 14. original envelope kept                                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Extractor::extract`] is the only entry point. It builds the top-level
//! context and then, at most once, a nested context for the quoted message.
//! The nested build never looks at replies, so reply chains (including a
//! message quoting itself) stop after one level.

mod context;
pub mod media;
pub mod text;

pub use context::{ChatIdentity, Device, MessageContext, MessageFlags};
pub use media::{MediaDescriptor, MediaDownloader};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::archive::MessageArchive;
use crate::config::{Citation, LimiterConfig, SessionConfig};
use crate::envelope::{lookup, Body, ChatType, Content, Envelope, MessageKey};
use crate::error::Result;
use crate::jid;
use crate::limiter::RateLimiter;

/// Wrapper keys unwrapped before classification
const WRAPPERS: &[&str] = &[
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "viewOnceMessageV2Extension",
    "documentWithCaptionMessage",
    "editedMessage",
];

/// Nesting bound for wrapper unwrapping
const MAX_UNWRAP: usize = 8;

/// `protocolMessage.type` of a revoke
const PROTOCOL_REVOKE: i64 = 0;

/// `pinInChatMessage.type` values
const PIN_FOR_ALL: i64 = 1;
const UNPIN_FOR_ALL: i64 = 2;

/// Where in the reply chain a build runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDepth {
    /// The envelope that arrived
    TopLevel,
    /// The message it quotes
    Nested,
}

/// The account this session is logged in as
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub lid: Option<String>,
    pub name: Option<String>,
}

/// Extraction settings taken from [`SessionConfig`]
#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub ignore_me: bool,
    pub prefix: Option<String>,
    pub limiter: LimiterConfig,
    pub citations: Vec<Citation>,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for ExtractorSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            ignore_me: config.ignore_me,
            prefix: config.prefix.clone(),
            limiter: config.limiter,
            citations: config.citations.clone(),
        }
    }
}

/// Quoted-message reference found in `contextInfo`
#[derive(Debug, Clone)]
struct ReplyTarget {
    id: String,
    room_id: Option<String>,
    participant: Option<String>,
    quoted: Option<Map<String, Value>>,
}

/// Flags collected while resolving the working envelope
#[derive(Debug, Default)]
struct Resolution {
    view_once: bool,
    ephemeral: bool,
    edited: bool,
    deleted: bool,
    pinned: bool,
    unpinned: bool,
}

/// Message normalization engine
pub struct Extractor {
    archive: MessageArchive,
    limiter: Arc<RateLimiter>,
    settings: ExtractorSettings,
    account: RwLock<Option<Account>>,
    downloader: Option<Arc<dyn MediaDownloader>>,
}

impl Extractor {
    /// Create an extractor over an archive and a limiter
    pub fn new(archive: MessageArchive, limiter: Arc<RateLimiter>, settings: ExtractorSettings) -> Self {
        Self {
            archive,
            limiter,
            settings,
            account: RwLock::new(None),
            downloader: None,
        }
    }

    /// Attach the protocol client's media download capability
    pub fn with_downloader(mut self, downloader: Arc<dyn MediaDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Set the logged-in account (own id, lid, push name)
    pub fn set_account(&self, account: Option<Account>) {
        *self.account.write() = account;
    }

    /// The logged-in account, if known
    pub fn account(&self) -> Option<Account> {
        self.account.read().clone()
    }

    /// Normalize an envelope
    ///
    /// `Ok(None)` means the envelope is not a user-visible message. Errors
    /// only come from the store giving up after retries.
    pub async fn extract(&self, envelope: Envelope) -> Result<Option<MessageContext>> {
        let original = Arc::new(envelope);
        let Some((mut context, reply)) = self.build(original, ReplyDepth::TopLevel).await? else {
            return Ok(None);
        };

        if let Some((reply, working)) = reply {
            let room = context.room_id().to_string();
            context.replied = self.resolve_reply(reply, &room, working).await?.map(Box::new);
        }
        Ok(Some(context))
    }

    /// Steps 1–14 without reply resolution; top-level builds also return the
    /// reply target together with the working envelope.
    async fn build(
        &self,
        original: Arc<Envelope>,
        depth: ReplyDepth,
    ) -> Result<Option<(MessageContext, Option<(ReplyTarget, Envelope)>)>> {
        let envelope = original.as_ref();

        // 1. not a user-visible message
        let Some(message) = envelope.message.as_ref().filter(|m| !m.is_empty()) else {
            tracing::debug!(id = %envelope.key.id, "Skipping envelope without content");
            return Ok(None);
        };
        if envelope.key.id.is_empty() {
            tracing::debug!("Skipping envelope without id");
            return Ok(None);
        }
        if envelope.is_stub() || message.contains_key("botInvokeMessage") {
            tracing::debug!(id = %envelope.key.id, "Skipping stub or bot invocation");
            return Ok(None);
        }

        // 2. self-authored
        if depth == ReplyDepth::TopLevel
            && self.settings.ignore_me
            && envelope.key.from_me
            && envelope.key.participant.as_deref().map_or(true, str::is_empty)
            && !jid::is_status(&envelope.key.remote_jid)
        {
            tracing::debug!(id = %envelope.key.id, "Ignoring own message");
            return Ok(None);
        }

        // 3–5. working envelope
        let mut resolution = Resolution::default();
        let Some(working) = self.resolve_working(envelope, &mut resolution).await? else {
            return Ok(None);
        };

        // 6. classification
        let Some(content) = working.content() else {
            tracing::debug!(id = %envelope.key.id, "No recognizable content");
            return Ok(None);
        };
        if content.kind == ChatType::Protocol {
            tracing::debug!(id = %envelope.key.id, "Skipping protocol control message");
            return Ok(None);
        }
        let context_info = content.context_info();

        // 7. identity
        let account = self.account();
        let room_id = working.key.remote_jid.clone();
        let sender_id = match account.as_ref().filter(|_| working.key.from_me) {
            Some(own) => jid::normalize_user(&own.id),
            None => jid::normalize_user(working.sender_jid()),
        };

        let own_name = account.as_ref().filter(|_| working.key.from_me).and_then(|a| a.name.clone());
        let sender_name = match own_name {
            Some(name) => Some(name),
            None => self.archive.display_name_for(&sender_id).await?,
        }
        .or_else(|| working.push_name.clone().filter(|n| !n.trim().is_empty()));

        let room_name = match self.archive.display_name_for(&room_id).await? {
            Some(name) => Some(name),
            None if !jid::is_group(&room_id) => sender_name.clone(),
            None => None,
        };

        let mut flags = MessageFlags {
            is_group: jid::is_group(&room_id),
            is_broadcast: jid::is_broadcast(&room_id),
            is_channel: jid::is_newsletter(&room_id),
            is_story: jid::is_status(&room_id),
            is_from_me: working.key.from_me,
            is_edited: resolution.edited,
            is_deleted: resolution.deleted,
            is_pinned: resolution.pinned,
            is_un_pinned: resolution.unpinned,
            is_view_once: resolution.view_once
                || matches!(content.body(), Some(Body::Media(media)) if media.view_once),
            is_ephemeral: resolution.ephemeral
                || context_info
                    .and_then(|c| c.get("expiration"))
                    .and_then(crate::time::long_from_json)
                    .map_or(false, |expiration| expiration > 0),
            is_forwarded: context_info.map_or(false, |c| {
                c.get("isForwarded").and_then(Value::as_bool).unwrap_or(false)
                    || c.get("forwardingScore").and_then(Value::as_u64).unwrap_or(0) > 0
            }),
            ..MessageFlags::default()
        };

        // 8. rate limit
        if depth == ReplyDepth::TopLevel {
            let LimiterConfig { max_messages, window } = self.settings.limiter;
            flags.is_spam = self.limiter.is_over_limit(&room_id, max_messages, window);
        }

        // 9. citations
        let citation = self.citations(&sender_id, &room_id);

        // 10. media
        let media = match content.kind {
            ChatType::Text => None,
            kind => MediaDescriptor::new(kind, content.payload, self.downloader.clone()),
        };

        // 11. reply target (resolved by `extract`)
        let reply = match depth {
            ReplyDepth::TopLevel => context_info.and_then(reply_target),
            ReplyDepth::Nested => None,
        };

        // 12. text
        let mut display = display_text(&content).map(|raw| text::normalize(&raw));
        let mut mentions = display.as_deref().map(text::mentions).unwrap_or_default();
        for mentioned in context_info
            .and_then(|c| c.get("mentionedJid"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            let local = jid::local_part(mentioned).to_string();
            if !mentions.contains(&local) {
                mentions.push(local);
            }
        }
        let links = display.as_deref().map(text::urls).unwrap_or_default();

        if let Some(account) = &account {
            let own = jid::local_part(&account.id);
            let own_lid = account.lid.as_deref().map(jid::local_part);
            flags.is_tag_me = mentions
                .iter()
                .any(|m| (!own.is_empty() && m == own) || Some(m.as_str()) == own_lid);
        }

        // 13. prefix
        if let (Some(prefix), Some(body)) = (&self.settings.prefix, display.as_deref()) {
            if let Some(rest) = body.strip_prefix(prefix.as_str()) {
                flags.is_prefix = true;
                display = Some(rest.trim_start().to_string());
            }
        }

        let sender_lid = sender_lid(&working, &sender_id);
        let identity = ChatIdentity::new(working.key.id.clone(), room_id, sender_id);

        let context = MessageContext {
            device: Device::from_message_id(identity.chat_id()),
            identity,
            room_name,
            sender_name,
            sender_lid,
            receiver_id: account.as_ref().map(|a| jid::normalize_user(&a.id)),
            receiver_name: account.as_ref().and_then(|a| a.name.clone()),
            chat_type: content.kind,
            timestamp: working
                .timestamp_ms()
                .or_else(|| envelope.timestamp_ms())
                .unwrap_or_else(crate::time::now_timestamp_millis),
            text: display.filter(|t| !t.is_empty()),
            mentions,
            links,
            flags,
            citation,
            media,
            replied: None,
            // 14. arrival envelope
            original: original.clone(),
        };

        Ok(Some((context, reply.map(|target| (target, working)))))
    }

    /// Unwrap the envelope and apply pin, delete and edit substitution.
    async fn resolve_working(&self, envelope: &Envelope, resolution: &mut Resolution) -> Result<Option<Envelope>> {
        let mut working = envelope.clone();
        unwrap_message(&mut working, resolution);

        let Some(content) = working.content() else {
            return Ok(Some(working));
        };

        match content.kind {
            // 3. pin
            ChatType::PinInChat => {
                let pin_type = content
                    .payload
                    .get("type")
                    .and_then(crate::time::long_from_json)
                    .unwrap_or(PIN_FOR_ALL);
                resolution.pinned = pin_type == PIN_FOR_ALL;
                resolution.unpinned = pin_type == UNPIN_FOR_ALL;

                if let Some(target) = target_id(content.payload) {
                    match self.archive.read::<Envelope>(&target).await? {
                        Some(mut stored) => {
                            unwrap_message(&mut stored, resolution);
                            working = stored;
                        }
                        None => tracing::debug!(target = %target, "Pinned message not archived"),
                    }
                }
                Ok(Some(working))
            }

            ChatType::Protocol => {
                let edited = content
                    .payload
                    .get("editedMessage")
                    .and_then(Value::as_object)
                    .cloned();

                match edited {
                    // 5. edit
                    Some(edited) => {
                        resolution.edited = true;
                        let target = target_id(content.payload);
                        let stored = match &target {
                            Some(id) => self.archive.read::<Envelope>(id).await?,
                            None => None,
                        };

                        match stored {
                            Some(mut stored) => {
                                merge_edit(&mut stored, &edited);
                                self.archive.write(&stored).await?;
                                tracing::debug!(target = %stored.key.id, "Edit merged into archived message");
                                unwrap_message(&mut stored, resolution);
                                Ok(Some(stored))
                            }
                            None => {
                                tracing::debug!(target = ?target, "Edited message not archived");
                                if let Some(id) = target {
                                    working.key.id = id;
                                }
                                working.message = Some(edited);
                                unwrap_message(&mut working, resolution);
                                Ok(Some(working))
                            }
                        }
                    }

                    // 4. delete
                    None if is_revoke(content.payload) => {
                        let Some(target) = target_id(content.payload) else {
                            return Ok(None);
                        };
                        match self.archive.read::<Envelope>(&target).await? {
                            Some(mut stored) => {
                                resolution.deleted = true;
                                unwrap_message(&mut stored, resolution);
                                Ok(Some(stored))
                            }
                            None => {
                                tracing::debug!(target = %target, "Deleted message not archived");
                                Ok(None)
                            }
                        }
                    }

                    None => Ok(Some(working)),
                }
            }

            _ => Ok(Some(working)),
        }
    }

    fn citations(&self, sender_id: &str, room_id: &str) -> Option<BTreeMap<String, bool>> {
        if self.settings.citations.is_empty() {
            return None;
        }
        let sender = jid::numeric_id(sender_id);
        let room = jid::numeric_id(room_id);

        Some(
            self.settings
                .citations
                .iter()
                .map(|citation| {
                    let ids = citation.source.ids();
                    let cited = [sender, room].into_iter().flatten().any(|id| ids.contains(&id));
                    (citation.flag_name(), cited)
                })
                .collect(),
        )
    }

    /// 11. build the quoted message at nested depth
    ///
    /// Source order: archived copy, the quoted payload carried in
    /// `contextInfo`, then the replying working envelope. The working
    /// envelope already has any edit applied, so it is not merged again.
    async fn resolve_reply(
        &self,
        target: ReplyTarget,
        room_id: &str,
        fallback: Envelope,
    ) -> Result<Option<MessageContext>> {
        let source = match self.archive.read::<Envelope>(&target.id).await? {
            Some(stored) => stored,
            None => match target.quoted {
                Some(quoted) => {
                    let own = self.account().map(|a| jid::local_part(&a.id).to_string());
                    let from_me = match (&target.participant, &own) {
                        (Some(participant), Some(own)) => jid::local_part(participant) == own,
                        _ => false,
                    };
                    Envelope {
                        key: MessageKey {
                            remote_jid: target.room_id.unwrap_or_else(|| room_id.to_string()),
                            from_me,
                            id: target.id.clone(),
                            participant: target.participant,
                            extra: Map::new(),
                        },
                        message: Some(quoted),
                        ..Envelope::default()
                    }
                }
                None => {
                    tracing::debug!(id = %target.id, "Quoted message unavailable, using the reply itself");
                    fallback
                }
            },
        };

        Ok(self
            .build(Arc::new(source), ReplyDepth::Nested)
            .await?
            .map(|(context, _)| context))
    }
}

/// Strip wrapper layers, recording what they imply.
fn unwrap_message(envelope: &mut Envelope, resolution: &mut Resolution) {
    for _ in 0..MAX_UNWRAP {
        let Some(message) = envelope.message.as_ref() else { return };
        let Some((wrapper, inner)) = WRAPPERS.iter().find_map(|wrapper| {
            message
                .get(*wrapper)
                .and_then(|w| w.get("message"))
                .and_then(Value::as_object)
                .map(|inner| (*wrapper, inner.clone()))
        }) else {
            return;
        };

        match wrapper {
            "ephemeralMessage" => resolution.ephemeral = true,
            "viewOnceMessage" | "viewOnceMessageV2" | "viewOnceMessageV2Extension" => {
                resolution.view_once = true
            }
            _ => {}
        }
        envelope.message = Some(inner);
    }
}

fn target_id(payload: &Value) -> Option<String> {
    lookup(payload, "key.id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn is_revoke(payload: &Value) -> bool {
    match payload.get("type") {
        Some(Value::String(s)) => s == "REVOKE",
        Some(other) => crate::time::long_from_json(other) == Some(PROTOCOL_REVOKE),
        None => false,
    }
}

/// Merge an edited message over the archived one.
///
/// Only the content subtree named in the edit changes; sibling fields of
/// that subtree (media keys, urls) and other top-level keys are kept.
fn merge_edit(stored: &mut Envelope, edited: &Map<String, Value>) {
    let target = stored.message.get_or_insert_with(Map::new);

    // An edit may itself arrive wrapped.
    let mut edited = edited.clone();
    for _ in 0..MAX_UNWRAP {
        let inner = WRAPPERS.iter().find_map(|w| {
            edited
                .get(*w)
                .and_then(|v| v.get("message"))
                .and_then(Value::as_object)
                .cloned()
        });
        match inner {
            Some(inner) => edited = inner,
            None => break,
        }
    }

    for (key, new_value) in &edited {
        if key == "messageContextInfo" {
            continue;
        }
        if let (Some(Value::Object(old)), Value::Object(new)) = (target.get_mut(key), new_value) {
            for (field, value) in new {
                old.insert(field.clone(), value.clone());
            }
            continue;
        }

        // Plain and extended text are the same content in two shapes.
        if !target.contains_key(key) {
            if key == "conversation" {
                if let Some(extended) = target.get_mut("extendedTextMessage").and_then(Value::as_object_mut) {
                    extended.insert("text".into(), new_value.clone());
                    continue;
                }
            }
            if key == "extendedTextMessage" && target.contains_key("conversation") {
                if let Some(text) = new_value.get("text") {
                    target.insert("conversation".into(), text.clone());
                    continue;
                }
            }
        }
        target.insert(key.clone(), new_value.clone());
    }
}

/// 12. probe the payload for display text
fn display_text(content: &Content<'_>) -> Option<String> {
    if let Some(body) = content.body() {
        return body.display_text().map(str::to_string);
    }
    content
        .kind
        .text_fields()
        .iter()
        .filter_map(|field| lookup(content.payload, field))
        .filter_map(Value::as_str)
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn reply_target(context_info: &Map<String, Value>) -> Option<ReplyTarget> {
    let id = context_info
        .get("stanzaId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())?;

    Some(ReplyTarget {
        id: id.to_string(),
        room_id: context_info
            .get("remoteJid")
            .and_then(Value::as_str)
            .map(str::to_string),
        participant: context_info
            .get("participant")
            .and_then(Value::as_str)
            .map(str::to_string),
        quoted: context_info
            .get("quotedMessage")
            .and_then(Value::as_object)
            .cloned(),
    })
}

/// Linked-identity alias of the sender, if the envelope carries one
fn sender_lid(envelope: &Envelope, sender_id: &str) -> Option<String> {
    if jid::is_lid(sender_id) {
        return Some(sender_id.to_string());
    }
    ["senderLid", "participantLid", "participantAlt", "remoteJidAlt"]
        .iter()
        .filter_map(|field| envelope.key.extra.get(*field))
        .filter_map(Value::as_str)
        .find(|candidate| jid::is_lid(candidate))
        .or_else(|| envelope.key.participant.as_deref().filter(|p| jid::is_lid(p)))
        .map(str::to_string)
}
