//! # Error Handling
//!
//! Error types for Parley Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Configuration Errors (fail fast, before any store is opened)      │
//! │  │   └── InvalidConfig          - Rejected session options            │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── StorageReadError       - Transient read failure (retried)    │
//! │  │   ├── StorageWriteError      - All write fallbacks failed          │
//! │  │   ├── InvalidCollection      - Collection unknown to the backend   │
//! │  │   ├── DatabaseError          - Relational backend failure          │
//! │  │   └── RetriesExhausted       - Retry wrapper gave up               │
//! │  │                                                                      │
//! │  ├── Auth Errors                                                       │
//! │  │   ├── InvalidKeyType         - Unknown signal-key category         │
//! │  │   ├── InvalidKeyMaterial     - Key payload could not be rebuilt    │
//! │  │   └── AuthWorkerStopped      - Debounce worker is gone             │
//! │  │                                                                      │
//! │  ├── Extraction Errors                                                 │
//! │  │   ├── MalformedEnvelope      - Envelope does not parse             │
//! │  │   └── MediaUnavailable       - No media download capability        │
//! │  │                                                                      │
//! │  └── Serialization Errors                                              │
//! │      ├── SerializationError                                            │
//! │      └── DeserializationError                                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Corrupted files are *not* an error: the store recovers or quarantines
//! them and keeps serving the collection.

use thiserror::Error;

/// Result type alias for Parley Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Parley Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors (100-199)
    // ========================================================================

    /// Session options were rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Storage Errors (200-299)
    // ========================================================================

    /// Failed to read from storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to storage after every fallback
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Collection is not known to this backend
    #[error("Unknown collection: {0}")]
    InvalidCollection(String),

    /// Relational backend error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A retried operation failed on every attempt
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Name of the retried operation
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Message of the final failure
        last_error: String,
    },

    // ========================================================================
    // Auth Errors (300-399)
    // ========================================================================

    /// Unknown signal-key category
    #[error("Invalid key type: {0}")]
    InvalidKeyType(String),

    /// Key payload could not be reconstructed
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// The credential save worker has stopped
    #[error("Credential save worker is not running.")]
    AuthWorkerStopped,

    // ========================================================================
    // Extraction Errors (400-499)
    // ========================================================================

    /// Raw envelope could not be parsed
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Media accessor used without a download capability
    #[error("Media download unavailable: {0}")]
    MediaUnavailable(String),

    // ========================================================================
    // Serialization Errors (500-599)
    // ========================================================================

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Configuration
    /// - 200-299: Storage
    /// - 300-399: Auth
    /// - 400-499: Extraction
    /// - 500-599: Serialization
    pub fn code(&self) -> i32 {
        match self {
            // Configuration (100-199)
            Error::InvalidConfig(_) => 100,

            // Storage (200-299)
            Error::StorageReadError(_) => 200,
            Error::StorageWriteError(_) => 201,
            Error::InvalidCollection(_) => 202,
            Error::DatabaseError(_) => 203,
            Error::RetriesExhausted { .. } => 204,

            // Auth (300-399)
            Error::InvalidKeyType(_) => 300,
            Error::InvalidKeyMaterial(_) => 301,
            Error::AuthWorkerStopped => 302,

            // Extraction (400-499)
            Error::MalformedEnvelope(_) => 400,
            Error::MediaUnavailable(_) => 401,

            // Serialization (500-599)
            Error::SerializationError(_) => 500,
            Error::DeserializationError(_) => 501,
        }
    }

    /// Check if this error is transient
    ///
    /// Transient errors are retried by [`crate::storage::retry`] before being
    /// surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StorageReadError(_) | Error::StorageWriteError(_) | Error::DatabaseError(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageReadError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidConfig("test".into()).code(), 100);
        assert_eq!(Error::StorageReadError("test".into()).code(), 200);
        assert_eq!(Error::InvalidKeyType("x".into()).code(), 300);
        assert_eq!(Error::MalformedEnvelope("x".into()).code(), 400);
        assert_eq!(Error::SerializationError("x".into()).code(), 500);
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::StorageReadError("busy".into()).is_transient());
        assert!(Error::StorageWriteError("busy".into()).is_transient());
        assert!(!Error::InvalidConfig("bad".into()).is_transient());
        assert!(!Error::InvalidCollection("nope".into()).is_transient());
    }

    #[test]
    fn test_retries_exhausted_message() {
        let err = Error::RetriesExhausted {
            operation: "read auth/creds".into(),
            attempts: 10,
            last_error: "locked".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("read auth/creds"));
        assert!(msg.contains("10 attempts"));
    }
}
