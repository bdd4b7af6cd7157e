//! Error types for the storage layer.

use thiserror::Error;

/// One failed item of a best-effort batch operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BatchFailure {
    pub key: String,
    pub cause: String,
}

/// Storage error taxonomy. Every operation wraps driver errors with its own
/// name so callers can tell which step failed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A lookup whose contract requires existence came back empty.
    #[error("{entity} not found: {identifier}")]
    NotFound {
        entity: &'static str,
        identifier: String,
    },

    /// Unique or foreign-key conflict, or a failed integrity check.
    #[error("constraint violation in {op}: {message}")]
    Constraint { op: &'static str, message: String },

    /// Any other driver failure, wrapped with the failing operation's name.
    #[error("{op}: {source}")]
    Sqlite {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Filesystem failure.
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// An optional storage capability is missing. Degraded-mode paths handle
    /// this locally; it only escapes when no fallback exists.
    #[error("unsupported feature: {0}")]
    Unsupported(String),

    /// Caller-supplied configuration is unusable (non-positive budget,
    /// populated destination, malformed path).
    #[error("configuration error: {0}")]
    Config(String),

    /// A best-effort chunked operation where some items failed. All chunks
    /// were attempted; every failed item is listed with its cause.
    #[error("partial failure in {op}: {} of {attempted} items failed", failures.len())]
    PartialBatch {
        op: &'static str,
        attempted: usize,
        failures: Vec<BatchFailure>,
    },

    /// Timestamp or payload encoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl StoreError {
    #[must_use]
    pub fn not_found(entity: &'static str, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            identifier: identifier.into(),
        }
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wrap a driver error with the failing operation's name, classifying
    /// constraint conflicts into their own variant.
    #[must_use]
    pub fn from_sqlite(op: &'static str, source: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &source {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                return Self::Constraint {
                    op,
                    message: source.to_string(),
                };
            }
        }
        Self::Sqlite { op, source }
    }

    #[must_use]
    pub fn from_io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Extension for wrapping `rusqlite` results with an operation name.
pub(crate) trait SqlContext<T> {
    fn op(self, op: &'static str) -> StoreResult<T>;
}

impl<T> SqlContext<T> for Result<T, rusqlite::Error> {
    fn op(self, op: &'static str) -> StoreResult<T> {
        self.map_err(|err| StoreError::from_sqlite(op, err))
    }
}

/// True when the error is SQLite reporting a missing FTS5 module, the signal
/// that flips the store into degraded search.
pub(crate) fn is_missing_fts5(err: &rusqlite::Error) -> bool {
    err.to_string().contains("no such module: fts5")
}

/// True when the error is a missing-table failure, tolerated by stats and
/// index maintenance on partially initialized databases.
pub(crate) fn is_missing_table(err: &rusqlite::Error) -> bool {
    err.to_string().contains("no such table")
}
