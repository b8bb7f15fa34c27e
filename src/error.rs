// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the routing and apply engine.
//!
//! Errors are categorized by where they originate (staging store, reader,
//! router, target platform) and carry enough context to find the offending
//! channel, table or row in the logs.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Busy only | SQLite errors from the staging, gap or batch tables |
//! | `ReaderTimeout` | Yes | Reader produced nothing within `take_timeout` (pass restarts) |
//! | `ReaderAborted` | Yes | Reader task vanished without an end-of-stream marker |
//! | `Config` | No | Configuration invalid |
//! | `Payload` | No | Row payload could not be decoded |
//! | `Platform` | No | Target statement failed for a reason other than a conflict |
//! | `NoLookupKeys` | No | No usable WHERE columns for an update/delete |
//! | `ConflictUnresolved` | No | MANUAL resolution, operator must intervene |
//! | `IgnoreBatch` | No | Resolver asked for the rest of the batch to be skipped |
//! | `Serialization` | No | JSON table definition could not be parsed |
//! | `Routing` | No | Router misconfiguration (bad expression, unknown router) |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`ReplicationError::is_retryable()`] tells the routing loop whether a
//! failed pass should simply be run again after backoff. A reader timeout
//! is fatal for the pass that hit it, but the next pass starts fresh.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Classification of a failed target statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorKind {
    /// Primary key or unique index violation.
    UniqueViolation,
    /// Foreign key violation (parent missing on insert, child present on delete).
    ForeignKeyViolation,
    /// Anything else.
    Other,
}

impl std::fmt::Display for PlatformErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformErrorKind::UniqueViolation => write!(f, "unique violation"),
            PlatformErrorKind::ForeignKeyViolation => write!(f, "foreign key violation"),
            PlatformErrorKind::Other => write!(f, "statement failed"),
        }
    }
}

/// Errors that can occur while routing or applying changes.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// SQLite error in the staging, gap or batch tables.
    ///
    /// Busy/locked errors are retried inside the store before surfacing here.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The reader produced neither a row nor the end-of-stream marker in time.
    ///
    /// The source is presumed stalled. The pass is abandoned, never retried
    /// transparently.
    #[error("Reader for channel {channel_id} produced nothing for {waited_ms}ms")]
    ReaderTimeout { channel_id: String, waited_ms: u64 },

    /// The reader task ended without sending its end-of-stream marker.
    #[error("Reader for channel {channel_id} ended without an end-of-stream marker")]
    ReaderAborted { channel_id: String },

    /// A row payload could not be decoded.
    #[error("Payload error: {0}")]
    Payload(String),

    /// Target statement failure that is not treated as a conflict.
    #[error("Platform error ({kind}): {message}")]
    Platform {
        kind: PlatformErrorKind,
        message: String,
    },

    /// Neither the conflict policy nor the table offered a usable lookup column.
    #[error("No lookup keys available for table {table}")]
    NoLookupKeys { table: String },

    /// A conflict that the configured policy refuses to resolve.
    #[error("Unresolved {event} conflict on table {table} (data id {data_id})")]
    ConflictUnresolved {
        table: String,
        event: String,
        data_id: i64,
    },

    /// The resolver asked for the remainder of the batch to be skipped.
    #[error("Batch ignored by conflict resolution")]
    IgnoreBatch,

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Router misconfiguration.
    #[error("Routing error ({router_id}): {message}")]
    Routing { router_id: String, message: String },

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a platform error of the given kind.
    pub fn platform(kind: PlatformErrorKind, message: impl Into<String>) -> Self {
        Self::Platform {
            kind,
            message: message.into(),
        }
    }

    /// Create a routing error for a router.
    pub fn routing(router_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Routing {
            router_id: router_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => crate::store::is_sqlite_busy_error(e),
            Self::ReaderTimeout { .. } => true, // Next pass reopens the reader
            Self::ReaderAborted { .. } => true,
            Self::Config(_) => false,
            Self::Payload(_) => false, // Data corruption at the source
            Self::Platform { .. } => false,
            Self::NoLookupKeys { .. } => false,
            Self::ConflictUnresolved { .. } => false,
            Self::IgnoreBatch => false,
            Self::Serialization(_) => false,
            Self::Routing { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// The platform error kind, if this is a platform error.
    pub fn platform_kind(&self) -> Option<PlatformErrorKind> {
        match self {
            Self::Platform { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
