//! The canonical message context handed to applications.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::media::MediaDescriptor;
use crate::envelope::{ChatType, Envelope};
use crate::jid;

/// Sender device, guessed from the message-id shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Android,
    Ios,
    Web,
    Desktop,
    Unknown,
}

impl Device {
    /// Classify a message id
    ///
    /// ```text
    ///   3A + 18 chars       ios
    ///   3E + 20 chars       web
    ///   21 or 32 chars      android
    ///   3F… or 18 chars     desktop
    /// ```
    pub fn from_message_id(id: &str) -> Self {
        let len = id.chars().count();
        if id.starts_with("3A") && len == 20 {
            Device::Ios
        } else if id.starts_with("3E") && len == 22 {
            Device::Web
        } else if len == 21 || len == 32 {
            Device::Android
        } else if id.starts_with("3F") || len == 18 {
            Device::Desktop
        } else {
            Device::Unknown
        }
    }
}

/// Identity fields that are derived together and never edited apart
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatIdentity {
    chat_id: String,
    room_id: String,
    sender_id: String,
    channel_id: String,
    unique_id: String,
}

impl ChatIdentity {
    /// Derive channel and unique ids from the message, room and sender
    pub fn new(chat_id: impl Into<String>, room_id: impl Into<String>, sender_id: impl Into<String>) -> Self {
        let chat_id = chat_id.into();
        let room_id = room_id.into();
        let sender_id = sender_id.into();
        let channel_id = format!("{}-{}", jid::local_part(&room_id), jid::local_part(&sender_id));
        let unique_id = format!("{}-{}", channel_id, chat_id);
        Self {
            chat_id,
            room_id,
            sender_id,
            channel_id,
            unique_id,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }
}

/// Boolean facts about a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFlags {
    pub is_group: bool,
    pub is_broadcast: bool,
    pub is_channel: bool,
    pub is_story: bool,
    pub is_from_me: bool,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub is_pinned: bool,
    pub is_un_pinned: bool,
    pub is_view_once: bool,
    pub is_ephemeral: bool,
    pub is_forwarded: bool,
    pub is_spam: bool,
    pub is_prefix: bool,
    pub is_tag_me: bool,
}

/// A normalized message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    #[serde(flatten)]
    pub identity: ChatIdentity,
    pub room_name: Option<String>,
    pub sender_name: Option<String>,
    pub sender_lid: Option<String>,
    pub receiver_id: Option<String>,
    pub receiver_name: Option<String>,
    pub device: Device,
    pub chat_type: ChatType,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub text: Option<String>,
    pub mentions: Vec<String>,
    pub links: Vec<String>,
    #[serde(flatten)]
    pub flags: MessageFlags,
    /// `is<Label>` → whether sender or room is cited
    pub citation: Option<BTreeMap<String, bool>>,
    pub media: Option<MediaDescriptor>,
    /// The quoted message, resolved one level deep
    pub replied: Option<Box<MessageContext>>,
    #[serde(skip)]
    pub(crate) original: Arc<Envelope>,
}

impl MessageContext {
    pub fn chat_id(&self) -> &str {
        self.identity.chat_id()
    }

    pub fn room_id(&self) -> &str {
        self.identity.room_id()
    }

    pub fn sender_id(&self) -> &str {
        self.identity.sender_id()
    }

    pub fn channel_id(&self) -> &str {
        self.identity.channel_id()
    }

    pub fn unique_id(&self) -> &str {
        self.identity.unique_id()
    }

    /// The envelope as it arrived, before pin/delete/edit substitution
    pub fn original(&self) -> &Envelope {
        &self.original
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_derivation() {
        let identity = ChatIdentity::new("A1", "123@g.us", "99:2@s.whatsapp.net");
        assert_eq!(identity.channel_id(), "123-99");
        assert_eq!(identity.unique_id(), "123-99-A1");
    }

    #[test]
    fn test_device_from_id() {
        assert_eq!(Device::from_message_id("3A1234567890ABCDEF12"), Device::Ios);
        assert_eq!(Device::from_message_id("3EB0123456789ABCDEF012"), Device::Web);
        assert_eq!(Device::from_message_id("ABCDEF0123456789ABCDE"), Device::Android);
        assert_eq!(Device::from_message_id("0123456789ABCDEF0123456789ABCDEF"), Device::Android);
        assert_eq!(Device::from_message_id("3F0123"), Device::Desktop);
        assert_eq!(Device::from_message_id("A1"), Device::Unknown);
    }

    #[test]
    fn test_flags_serialize_camel_case() {
        let flags = MessageFlags {
            is_un_pinned: true,
            is_tag_me: true,
            ..MessageFlags::default()
        };
        let json = serde_json::to_value(flags).unwrap();
        assert_eq!(json["isUnPinned"], true);
        assert_eq!(json["isTagMe"], true);
        assert_eq!(json["isSpam"], false);
    }
}
