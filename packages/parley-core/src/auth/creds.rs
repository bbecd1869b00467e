//! # Credentials
//!
//! Long-lived identity material of a session and the signal-key namespace.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         AUTH COLLECTION                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  "creds"                    AuthCreds (one record, rewritten whole)     │
//! │                                                                         │
//! │  "<category>-<id>"          signal key payloads, read by id batch:      │
//! │     pre-key-12              session-628..@s.whatsapp.net.0              │
//! │     sender-key-…            app-state-sync-key-AAAAAF…                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fresh identity
//!
//! ```text
//!   noise key        X25519 ──┐
//!   pairing key      X25519   │  random
//!   identity key     X25519   │
//!   signed pre-key   X25519 ──┘
//!   signature        Ed25519(identity secret, 0x05 ‖ pre-key public)
//!   registration id  random u16 & 0x3FFF
//!   adv secret       32 random bytes, base64
//! ```

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::buffer;
use crate::error::{Error, Result};

/// Key-type byte prefixed to public keys before signing
const KEY_BUNDLE_TYPE: u8 = 0x05;

/// Registration ids are 14-bit
const REGISTRATION_ID_MASK: u16 = 0x3FFF;

// ============================================================================
// KEY PAIRS
// ============================================================================

/// X25519 key pair in its persisted form
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Private key bytes
    #[serde(with = "buffer::key32")]
    pub private: [u8; 32],
    /// Public key bytes
    #[serde(with = "buffer::key32")]
    pub public: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self {
            private: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &STANDARD.encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Pre-key signed by the identity key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedKeyPair {
    /// The pre-key itself
    pub key_pair: KeyPair,
    /// Signature over `0x05 ‖ public`
    #[serde(with = "buffer::bytes")]
    pub signature: Vec<u8>,
    /// Pre-key id
    pub key_id: u32,
}

impl SignedKeyPair {
    /// Generate a pre-key and sign it with `identity`
    pub fn generate(identity: &KeyPair, key_id: u32) -> Self {
        let key_pair = KeyPair::generate();
        let signer = SigningKey::from_bytes(&identity.private);

        let mut message = Vec::with_capacity(33);
        message.push(KEY_BUNDLE_TYPE);
        message.extend_from_slice(&key_pair.public);

        Self {
            signature: signer.sign(&message).to_bytes().to_vec(),
            key_pair,
            key_id,
        }
    }
}

// ============================================================================
// CREDENTIALS
// ============================================================================

/// Account-level settings carried inside creds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSettings {
    /// Unarchive chats on new messages
    #[serde(default)]
    pub unarchive_chats: bool,
    /// Fields this crate does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The logged-in account, once pairing completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Own jid, e.g. `628123:4@s.whatsapp.net`
    pub id: String,
    /// Push name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Linked-identity alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

/// The credential record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCreds {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key_pair: KeyPair,
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: SignedKeyPair,
    pub registration_id: u16,
    pub adv_secret_key: String,
    #[serde(default)]
    pub next_pre_key_id: u32,
    #[serde(default)]
    pub first_unuploaded_pre_key_id: u32,
    #[serde(default)]
    pub account_sync_counter: u32,
    #[serde(default)]
    pub account_settings: AccountSettings,
    #[serde(default)]
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<Contact>,
    /// Fields written by the protocol client that this crate passes through
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuthCreds {
    /// Create a fresh, unregistered identity
    pub fn generate() -> Self {
        let signed_identity_key = KeyPair::generate();
        let signed_pre_key = SignedKeyPair::generate(&signed_identity_key, 1);

        let mut adv_secret = [0u8; 32];
        OsRng.fill_bytes(&mut adv_secret);

        Self {
            noise_key: KeyPair::generate(),
            pairing_ephemeral_key_pair: KeyPair::generate(),
            signed_identity_key,
            signed_pre_key,
            registration_id: OsRng.gen::<u16>() & REGISTRATION_ID_MASK,
            adv_secret_key: STANDARD.encode(adv_secret),
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            account_sync_counter: 0,
            account_settings: AccountSettings::default(),
            registered: false,
            me: None,
            extra: Map::new(),
        }
    }

    /// Own jid, if paired
    pub fn own_id(&self) -> Option<&str> {
        self.me.as_ref().map(|me| me.id.as_str())
    }

    /// Own linked-identity alias, if known
    pub fn own_lid(&self) -> Option<&str> {
        self.me.as_ref().and_then(|me| me.lid.as_deref())
    }
}

// ============================================================================
// KEY TYPES
// ============================================================================

/// Signal-key categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
    LidMapping,
    DeviceList,
    Tctoken,
    IdentityKey,
}

impl KeyType {
    /// Every category
    pub const ALL: [KeyType; 10] = [
        KeyType::PreKey,
        KeyType::Session,
        KeyType::SenderKey,
        KeyType::SenderKeyMemory,
        KeyType::AppStateSyncKey,
        KeyType::AppStateSyncVersion,
        KeyType::LidMapping,
        KeyType::DeviceList,
        KeyType::Tctoken,
        KeyType::IdentityKey,
    ];

    /// Category name as used in record ids
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::PreKey => "pre-key",
            KeyType::Session => "session",
            KeyType::SenderKey => "sender-key",
            KeyType::SenderKeyMemory => "sender-key-memory",
            KeyType::AppStateSyncKey => "app-state-sync-key",
            KeyType::AppStateSyncVersion => "app-state-sync-version",
            KeyType::LidMapping => "lid-mapping",
            KeyType::DeviceList => "device-list",
            KeyType::Tctoken => "tctoken",
            KeyType::IdentityKey => "identity-key",
        }
    }

    /// Record id of a key in the auth collection
    pub fn record_id(&self, id: &str) -> String {
        format!("{}-{}", self.as_str(), id)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        KeyType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidKeyType(s.to_string()))
    }
}
