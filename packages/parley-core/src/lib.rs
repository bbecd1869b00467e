//! # Parley Core
//!
//! Add-on layer for a chat protocol session: persists credentials and a
//! message archive, and turns raw protocol envelopes into typed message
//! contexts for the application.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         PARLEY CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   protocol client (external)                                            │
//! │        │ ProtocolEvent                ▲ auth / get_message              │
//! │        ▼                              │                                 │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌─────────────┐  │
//! │  │   Session   │──►│  Extractor  │──►│   Events    │──►│ application │  │
//! │  │             │   │             │   │             │   └─────────────┘  │
//! │  │ - handle()  │   │ - pin/edit  │   │ - on/off    │                    │
//! │  │ - shutdown  │   │ - replies   │   │ - emit      │                    │
//! │  └──────┬──────┘   └──┬───────┬──┘   └─────────────┘                    │
//! │         │             │       │                                         │
//! │         ▼             ▼       ▼                                         │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐                    │
//! │  │    Auth     │   │   Archive   │   │   Limiter   │                    │
//! │  │ - creds     │   │ - messages  │   │ - per room  │                    │
//! │  │ - keys      │   │ - chats     │   │   window    │                    │
//! │  └──────┬──────┘   └──────┬──────┘   └─────────────┘                    │
//! │         └────────┬────────┘                                             │
//! │                  ▼                                                      │
//! │  ┌───────────────────────────────────────────────────┐                  │
//! │  │                 Storage (RecordStore)             │                  │
//! │  │   FileStore (chunked JSON) | SqliteStore | Memory │                  │
//! │  └───────────────────────────────────────────────────┘                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Session configuration
//! - [`storage`] - Record stores, JSON recovery, retry
//! - [`auth`] - Credentials and signal keys
//! - [`archive`] - Messages, chats and contacts by id
//! - [`envelope`] - Raw envelope model and content classification
//! - [`limiter`] - Per-room rate limiting
//! - [`extractor`] - Envelope to [`MessageContext`] normalization
//! - [`events`] - Application event dispatch
//! - [`session`] - Everything above wired together

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod archive;
pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod extractor;
pub mod jid;
pub mod limiter;
pub mod session;
pub mod storage;
/// Wall-clock time utilities.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::{Citation, CitationSource, LimiterConfig, SessionConfig, StoreBackend};
pub use envelope::{ChatType, Envelope, MessageKey};
pub use error::{Error, Result};
pub use events::{AppEvent, EventDispatcher, EventName};
pub use extractor::{MediaDownloader, MessageContext};
pub use session::{ProtocolEvent, Session};
pub use storage::RecordStore;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Get the library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
