//! # Session Configuration
//!
//! Everything a [`crate::Session`] needs to know before it opens a store.
//! Construct with struct-update syntax over [`SessionConfig::default`] and
//! call [`SessionConfig::validate`] (done by `Session::open`) before use.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::storage::{RetryPolicy, DEFAULT_CHUNK_BYTES, DEFAULT_CHUNK_RECORDS};

/// Default session name
pub const DEFAULT_SESSION: &str = "main";

/// Default directory holding session folders
pub const DEFAULT_DATA_DIR: &str = "sessions";

/// Default credential save debounce window
pub const DEFAULT_CREDS_DEBOUNCE: Duration = Duration::from_secs(1);

/// Where a session's records live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Chunked JSON files under `<data_dir>/<session>/`
    File,
    /// A SQLite database file, shareable between sessions
    Sqlite {
        /// Database file path
        path: PathBuf,
    },
    /// Process memory only
    Memory,
}

impl StoreBackend {
    /// Short name used in logs and CLI flags
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::File => "file",
            StoreBackend::Sqlite { .. } => "sqlite",
            StoreBackend::Memory => "memory",
        }
    }
}

/// Per-room spam limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Messages allowed per window; 0 disables limiting
    pub max_messages: u32,
    /// Window length
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_messages: 20,
            window: Duration::from_secs(10),
        }
    }
}

/// Supplies the numeric ids a citation label applies to
///
/// Evaluated synchronously on every extraction, so implementations should
/// answer from memory.
pub trait CitationSource: Send + Sync {
    /// Numeric ids (phone-number local parts) the label covers
    fn ids(&self) -> Vec<u64>;
}

impl<F> CitationSource for F
where
    F: Fn() -> Vec<u64> + Send + Sync,
{
    fn ids(&self) -> Vec<u64> {
        self()
    }
}

/// A named citation source; produces the `is<Label>` flag
#[derive(Clone)]
pub struct Citation {
    /// Label, e.g. `owner` for an `isOwner` flag
    pub label: String,
    /// Id provider
    pub source: Arc<dyn CitationSource>,
}

impl Citation {
    /// Create a citation from a label and a source
    pub fn new(label: impl Into<String>, source: impl CitationSource + 'static) -> Self {
        Self {
            label: label.into(),
            source: Arc::new(source),
        }
    }

    /// Output key: `owner` becomes `isOwner`
    pub fn flag_name(&self) -> String {
        let mut chars = self.label.chars();
        match chars.next() {
            Some(first) => format!("is{}{}", first.to_uppercase(), chars.as_str()),
            None => "is".to_string(),
        }
    }
}

impl fmt::Debug for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Citation").field("label", &self.label).finish_non_exhaustive()
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session name (directory / SQL scope)
    pub session: String,
    /// Parent directory of session folders
    pub data_dir: PathBuf,
    /// Storage backend
    pub backend: StoreBackend,
    /// Drop self-authored envelopes (except group/status ones)
    pub ignore_me: bool,
    /// Command prefix stripped from matching text
    pub prefix: Option<String>,
    /// Per-room spam limit
    pub limiter: LimiterConfig,
    /// Citation predicates, evaluated in order
    pub citations: Vec<Citation>,
    /// Coalescing window for credential saves
    pub creds_debounce: Duration,
    /// Retry policy for store operations
    pub retry: RetryPolicy,
    /// Records per chunk file
    pub chunk_records: usize,
    /// Byte cap per chunk file
    pub chunk_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session: DEFAULT_SESSION.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            backend: StoreBackend::File,
            ignore_me: true,
            prefix: None,
            limiter: LimiterConfig::default(),
            citations: Vec::new(),
            creds_debounce: DEFAULT_CREDS_DEBOUNCE,
            retry: RetryPolicy::default(),
            chunk_records: DEFAULT_CHUNK_RECORDS,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

impl SessionConfig {
    /// Config for a named session, everything else default
    pub fn named(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            ..Self::default()
        }
    }

    /// Reject settings that would misbehave later
    pub fn validate(&self) -> Result<()> {
        if self.session.trim().is_empty() {
            return Err(Error::InvalidConfig("session name is empty".into()));
        }
        if self.session.contains(['/', '\\']) || self.session.contains("..") {
            return Err(Error::InvalidConfig(format!(
                "session name {:?} must not contain path separators or '..'",
                self.session
            )));
        }
        if let Some(prefix) = &self.prefix {
            if prefix.is_empty() {
                return Err(Error::InvalidConfig("prefix is empty".into()));
            }
        }
        for citation in &self.citations {
            let valid = !citation.label.is_empty()
                && citation.label.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(Error::InvalidConfig(format!(
                    "invalid citation label {:?}",
                    citation.label
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig("retry attempts must be at least 1".into()));
        }
        if self.chunk_records == 0 || self.chunk_bytes == 0 {
            return Err(Error::InvalidConfig("chunk size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limiter.max_messages, 20);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.chunk_records, 1000);
        assert!(config.ignore_me);
    }

    #[test]
    fn test_rejects_bad_session_names() {
        for name in ["", "  ", "a/b", "..", "a\\b"] {
            let config = SessionConfig::named(name);
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfig(_))),
                "{:?} accepted",
                name
            );
        }
    }

    #[test]
    fn test_rejects_empty_prefix_and_zero_retry() {
        let config = SessionConfig {
            prefix: Some(String::new()),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            retry: RetryPolicy {
                max_attempts: 0,
                delay: Duration::ZERO,
            },
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            chunk_records: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_citation_labels() {
        let owner = Citation::new("owner", || vec![628123u64]);
        assert_eq!(owner.flag_name(), "isOwner");
        assert_eq!(owner.source.ids(), vec![628123]);

        let config = SessionConfig {
            citations: vec![Citation::new("bad label", Vec::new)],
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(StoreBackend::File.name(), "file");
        assert_eq!(StoreBackend::Sqlite { path: "x.db".into() }.name(), "sqlite");
        assert_eq!(StoreBackend::Memory.name(), "memory");
    }
}
