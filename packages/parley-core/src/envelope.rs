//! # Envelopes
//!
//! Raw message envelopes as delivered by the protocol client, and the
//! closed set of content kinds they can carry.
//!
//! ```text
//! Envelope
//! ├── key: MessageKey { remoteJid, fromMe, id, participant? }
//! ├── message: { "<contentKey>": payload, "messageContextInfo": … }
//! ├── messageTimestamp: number | "string" | {low, high}
//! ├── pushName?
//! └── messageStubType?
//! ```
//!
//! Unknown fields are kept so an archived envelope round-trips unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jid;

// ============================================================================
// ENVELOPE
// ============================================================================

/// Identity of a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Room the message belongs to
    #[serde(default)]
    pub remote_jid: String,
    /// Sent by this session's account
    #[serde(default)]
    pub from_me: bool,
    /// Message id
    #[serde(default)]
    pub id: String,
    /// Author inside a group or broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A raw message envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub key: MessageKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_stub_type: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Parse an envelope from JSON
    pub fn from_value(value: Value) -> crate::Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| crate::Error::MalformedEnvelope(e.to_string()))
    }

    /// Message timestamp in epoch milliseconds, if present
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.message_timestamp
            .as_ref()
            .and_then(crate::time::long_from_json)
            .map(crate::time::to_millis)
    }

    /// Author of the message: participant in groups, otherwise the room
    pub fn sender_jid(&self) -> &str {
        match &self.key.participant {
            Some(participant) if !participant.is_empty() => participant,
            _ => &self.key.remote_jid,
        }
    }

    /// Whether this is a protocol stub (group notices and the like)
    pub fn is_stub(&self) -> bool {
        match &self.message_stub_type {
            None | Some(Value::Null) => false,
            Some(Value::Number(n)) => n.as_u64() != Some(0),
            Some(_) => true,
        }
    }

    /// First recognizable content of the message
    pub fn content(&self) -> Option<Content<'_>> {
        self.message.as_ref().and_then(Content::find)
    }

    /// Room kind flags
    pub fn is_group(&self) -> bool {
        jid::is_group(&self.key.remote_jid)
    }
}

// ============================================================================
// CONTENT
// ============================================================================

/// Classified content of a message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Content<'a> {
    /// Content kind
    pub kind: ChatType,
    /// Protocol key the payload was found under
    pub key: &'a str,
    /// The payload itself
    pub payload: &'a Value,
}

impl<'a> Content<'a> {
    /// First key of a message map that names a known content kind
    pub fn find(message: &'a Map<String, Value>) -> Option<Self> {
        message.iter().find_map(|(key, payload)| {
            ChatType::from_key(key).map(|kind| Content {
                kind,
                key: key.as_str(),
                payload,
            })
        })
    }

    /// `contextInfo` of the payload
    pub fn context_info(&self) -> Option<&'a Map<String, Value>> {
        self.payload.get("contextInfo").and_then(Value::as_object)
    }

    /// Typed view of the payload for kinds that carry display text
    ///
    /// `None` for other kinds, or when the payload does not have the
    /// expected shape.
    pub fn body(&self) -> Option<Body> {
        match self.kind {
            ChatType::Text => match self.payload {
                Value::String(text) => Some(Body::Text(TextBody {
                    text: Some(text.clone()),
                })),
                payload => typed(payload).map(Body::Text),
            },
            ChatType::Image
            | ChatType::Video
            | ChatType::Ptv
            | ChatType::Album
            | ChatType::Document
            | ChatType::Audio
            | ChatType::Sticker
            | ChatType::LottieSticker
            | ChatType::StickerPack => typed(self.payload).map(Body::Media),
            ChatType::Location | ChatType::LiveLocation => typed(self.payload).map(Body::Location),
            ChatType::Contact | ChatType::ContactsArray => typed(self.payload).map(Body::Contact),
            ChatType::Poll | ChatType::Event | ChatType::ScheduledCall => {
                typed(self.payload).map(Body::Titled)
            }
            ChatType::Reaction => typed(self.payload).map(Body::Reaction),
            ChatType::ButtonsResponse | ChatType::TemplateButtonReply => {
                typed(self.payload).map(Body::Response)
            }
            _ => None,
        }
    }
}

fn typed<'de, T: Deserialize<'de>>(payload: &'de Value) -> Option<T> {
    T::deserialize(payload).ok()
}

// ============================================================================
// TYPED BODIES
// ============================================================================

/// `conversation` string or `extendedTextMessage`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextBody {
    pub text: Option<String>,
}

/// Image, video, audio, document and sticker payloads
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaBody {
    pub caption: Option<String>,
    pub title: Option<String>,
    pub file_name: Option<String>,
    pub name: Option<String>,
    pub mimetype: Option<String>,
    pub view_once: bool,
}

/// Static and live locations
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocationBody {
    pub name: Option<String>,
    pub caption: Option<String>,
    pub address: Option<String>,
    pub comment: Option<String>,
    pub degrees_latitude: Option<f64>,
    pub degrees_longitude: Option<f64>,
}

/// Shared contact cards
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContactBody {
    pub display_name: Option<String>,
    pub vcard: Option<String>,
}

/// Polls, events and scheduled calls
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TitledBody {
    pub name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Emoji reaction to another message
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReactionBody {
    pub text: Option<String>,
    pub key: Option<MessageKey>,
}

/// Button and template replies
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResponseBody {
    pub selected_display_text: Option<String>,
    pub selected_button_id: Option<String>,
    pub selected_id: Option<String>,
}

/// Typed payload of a text-bearing content kind
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(TextBody),
    Media(MediaBody),
    Location(LocationBody),
    Contact(ContactBody),
    Titled(TitledBody),
    Reaction(ReactionBody),
    Response(ResponseBody),
}

impl Body {
    /// First non-blank text candidate, in display priority order
    pub fn display_text(&self) -> Option<&str> {
        let candidates: Vec<&Option<String>> = match self {
            Body::Text(b) => vec![&b.text],
            Body::Media(b) => vec![&b.caption, &b.title, &b.file_name, &b.name],
            Body::Location(b) => vec![&b.name, &b.caption, &b.address, &b.comment],
            Body::Contact(b) => vec![&b.display_name],
            Body::Titled(b) => vec![&b.name, &b.title, &b.description],
            Body::Reaction(b) => vec![&b.text],
            Body::Response(b) => vec![&b.selected_display_text, &b.selected_button_id, &b.selected_id],
        };
        candidates
            .into_iter()
            .filter_map(Option::as_deref)
            .find(|text| !text.trim().is_empty())
    }
}

macro_rules! chat_types {
    ($($variant:ident => [$($key:literal),+]),+ $(,)?) => {
        /// Closed set of content kinds, serialized in camelCase
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub enum ChatType {
            $($variant),+
        }

        impl ChatType {
            /// Every kind
            pub const ALL: &'static [ChatType] = &[$(ChatType::$variant),+];

            /// Kind for a protocol content key
            pub fn from_key(key: &str) -> Option<Self> {
                match key {
                    $($($key)|+ => Some(ChatType::$variant),)+
                    _ => None,
                }
            }

            /// Protocol keys that map to this kind
            pub fn keys(&self) -> &'static [&'static str] {
                match self {
                    $(ChatType::$variant => &[$($key),+],)+
                }
            }
        }
    };
}

chat_types! {
    Text => ["conversation", "extendedTextMessage"],
    Image => ["imageMessage"],
    Video => ["videoMessage"],
    Ptv => ["ptvMessage"],
    Audio => ["audioMessage"],
    Document => ["documentMessage"],
    Sticker => ["stickerMessage"],
    LottieSticker => ["lottieStickerMessage"],
    StickerPack => ["stickerPackMessage"],
    Album => ["albumMessage"],
    Location => ["locationMessage"],
    LiveLocation => ["liveLocationMessage"],
    Contact => ["contactMessage"],
    ContactsArray => ["contactsArrayMessage"],
    Poll => ["pollCreationMessage", "pollCreationMessageV2", "pollCreationMessageV3", "pollCreationMessageV4"],
    PollUpdate => ["pollUpdateMessage"],
    PollResult => ["pollResultSnapshotMessage"],
    Reaction => ["reactionMessage"],
    EncReaction => ["encReactionMessage"],
    Protocol => ["protocolMessage"],
    PinInChat => ["pinInChatMessage"],
    KeepInChat => ["keepInChatMessage"],
    Buttons => ["buttonsMessage"],
    ButtonsResponse => ["buttonsResponseMessage"],
    List => ["listMessage"],
    ListResponse => ["listResponseMessage"],
    Template => ["templateMessage"],
    TemplateButtonReply => ["templateButtonReplyMessage"],
    Interactive => ["interactiveMessage"],
    InteractiveResponse => ["interactiveResponseMessage"],
    HighlyStructured => ["highlyStructuredMessage"],
    Product => ["productMessage"],
    Order => ["orderMessage"],
    Invoice => ["invoiceMessage"],
    GroupInvite => ["groupInviteMessage"],
    NewsletterAdminInvite => ["newsletterAdminInviteMessage"],
    Event => ["eventMessage"],
    EventResponse => ["encEventResponseMessage"],
    ScheduledCall => ["scheduledCallCreationMessage"],
    CallLog => ["callLogMesssage", "callLogMessage"],
    RequestPayment => ["requestPaymentMessage"],
    SendPayment => ["sendPaymentMessage"],
    DeclinePayment => ["declinePaymentRequestMessage"],
    CancelPayment => ["cancelPaymentRequestMessage"],
    PaymentInvite => ["paymentInviteMessage"],
    StatusMention => ["statusMentionMessage"],
    GroupMentioned => ["groupMentionedMessage"],
    Comment => ["commentMessage"],
    Placeholder => ["placeholderMessage"],
}

impl ChatType {
    /// Kinds that carry downloadable media
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            ChatType::Image
                | ChatType::Video
                | ChatType::Ptv
                | ChatType::Audio
                | ChatType::Document
                | ChatType::Sticker
                | ChatType::LottieSticker
        )
    }

    /// Payload fields probed, in order, for display text of kinds without a
    /// typed [`Body`]
    ///
    /// Dotted names descend into nested objects.
    pub fn text_fields(&self) -> &'static [&'static str] {
        match self {
            ChatType::ListResponse => &["title", "singleSelectReply.selectedRowId", "description"],
            ChatType::InteractiveResponse => &["body.text", "nativeFlowResponseMessage.paramsJson"],
            ChatType::Buttons => &["contentText", "text", "footerText"],
            ChatType::List => &["description", "title", "buttonText"],
            ChatType::Template => &["hydratedTemplate.hydratedContentText", "hydratedFourRowTemplate.hydratedContentText"],
            ChatType::Interactive => &["body.text", "header.title", "footer.text"],
            ChatType::GroupInvite | ChatType::NewsletterAdminInvite => &["caption", "groupName", "newsletterName"],
            ChatType::Product => &["body", "product.title", "product.description"],
            ChatType::Order => &["message", "orderTitle"],
            ChatType::RequestPayment | ChatType::SendPayment => &["noteMessage.extendedTextMessage.text"],
            ChatType::HighlyStructured
            | ChatType::Invoice
            | ChatType::Comment
            | ChatType::StatusMention
            | ChatType::GroupMentioned => &["text", "caption", "name", "title"],
            ChatType::PollUpdate
            | ChatType::PollResult
            | ChatType::EncReaction
            | ChatType::Protocol
            | ChatType::PinInChat
            | ChatType::KeepInChat
            | ChatType::EventResponse
            | ChatType::CallLog
            | ChatType::DeclinePayment
            | ChatType::CancelPayment
            | ChatType::PaymentInvite
            | ChatType::Placeholder => &["name", "text"],
            ChatType::Text
            | ChatType::Image
            | ChatType::Video
            | ChatType::Ptv
            | ChatType::Album
            | ChatType::Document
            | ChatType::Audio
            | ChatType::Sticker
            | ChatType::LottieSticker
            | ChatType::StickerPack
            | ChatType::Location
            | ChatType::LiveLocation
            | ChatType::Contact
            | ChatType::ContactsArray
            | ChatType::Poll
            | ChatType::Event
            | ChatType::ScheduledCall
            | ChatType::Reaction
            | ChatType::ButtonsResponse
            | ChatType::TemplateButtonReply => &[],
        }
    }
}

/// Look up a dotted path in a JSON value
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_round_trip() {
        let raw = json!({
            "key": {"remoteJid": "123@g.us", "fromMe": false, "id": "A1", "participant": "99@s.whatsapp.net"},
            "message": {"conversation": "hello"},
            "messageTimestamp": {"low": 1_700_000_000, "high": 0, "unsigned": true},
            "pushName": "Ann",
            "broadcast": false
        });
        let envelope = Envelope::from_value(raw.clone()).unwrap();

        assert_eq!(envelope.key.id, "A1");
        assert_eq!(envelope.sender_jid(), "99@s.whatsapp.net");
        assert_eq!(envelope.timestamp_ms(), Some(1_700_000_000_000));
        assert!(envelope.is_group());
        assert_eq!(serde_json::to_value(&envelope).unwrap(), raw);
    }

    #[test]
    fn test_malformed_envelope() {
        assert!(matches!(
            Envelope::from_value(json!({"key": "nope"})),
            Err(crate::Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_content_skips_context_keys() {
        let envelope = Envelope::from_value(json!({
            "key": {"remoteJid": "1@s.whatsapp.net", "id": "X"},
            "message": {
                "messageContextInfo": {"deviceListMetadata": {}},
                "senderKeyDistributionMessage": {},
                "imageMessage": {"caption": "look"}
            }
        }))
        .unwrap();

        let content = envelope.content().unwrap();
        assert_eq!(content.kind, ChatType::Image);
        assert_eq!(content.key, "imageMessage");
    }

    #[test]
    fn test_stub_detection() {
        let mut envelope = Envelope::default();
        assert!(!envelope.is_stub());
        envelope.message_stub_type = Some(json!(0));
        assert!(!envelope.is_stub());
        envelope.message_stub_type = Some(json!(27));
        assert!(envelope.is_stub());
    }

    #[test]
    fn test_chat_type_table() {
        assert!(ChatType::ALL.len() >= 45);
        for kind in ChatType::ALL {
            for key in kind.keys() {
                assert_eq!(ChatType::from_key(key), Some(*kind));
            }
        }
        assert_eq!(serde_json::to_value(ChatType::ButtonsResponse).unwrap(), json!("buttonsResponse"));
        assert_eq!(ChatType::from_key("messageContextInfo"), None);
    }

    #[test]
    fn test_typed_bodies() {
        let message = json!({"conversation": "plain"});
        let content = Content::find(message.as_object().unwrap()).unwrap();
        assert_eq!(content.body().unwrap().display_text(), Some("plain"));

        let message = json!({"documentMessage": {"caption": " ", "fileName": "report.pdf", "mimetype": "application/pdf", "viewOnce": true}});
        let content = Content::find(message.as_object().unwrap()).unwrap();
        match content.body() {
            Some(Body::Media(media)) => {
                assert_eq!(media.mimetype.as_deref(), Some("application/pdf"));
                assert!(media.view_once);
                assert_eq!(Body::Media(media).display_text(), Some("report.pdf"));
            }
            other => panic!("expected media body, got {:?}", other),
        }

        let message = json!({"reactionMessage": {"text": "👍", "key": {"id": "A1", "remoteJid": "1@s.whatsapp.net"}}});
        let content = Content::find(message.as_object().unwrap()).unwrap();
        match content.body() {
            Some(Body::Reaction(reaction)) => assert_eq!(reaction.key.unwrap().id, "A1"),
            other => panic!("expected reaction body, got {:?}", other),
        }

        let message = json!({"listMessage": {"title": "menu"}});
        assert_eq!(Content::find(message.as_object().unwrap()).unwrap().body(), None);
    }

    #[test]
    fn test_lookup() {
        let value = json!({"body": {"text": "hi"}});
        assert_eq!(lookup(&value, "body.text"), Some(&json!("hi")));
        assert_eq!(lookup(&value, "body.missing"), None);
    }
}
