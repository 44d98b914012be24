//! Error types for the reactor server.

use reactor_core::{JobError, QueueError, ReducerError, RegistryError, SignerError};
use reactor_types::DocumentId;

/// Main error type for reactor operations.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// The log advanced under a job more often than the conflict retry limit allows.
    #[error("index conflict on {document_id}/{scope}/{branch}: expected {expected}, got {actual}")]
    Conflict {
        /// Document of the log.
        document_id: DocumentId,
        /// Scope of the log.
        scope: String,
        /// Branch of the log.
        branch: String,
        /// Index storage expected next.
        expected: u64,
        /// Index the operation carried.
        actual: u64,
    },

    /// A remote operation failed signature verification. It was not applied.
    #[error("invalid signature on operation {index} of {document_id}: {reason}")]
    SignatureInvalid {
        /// Document of the operation.
        document_id: DocumentId,
        /// Index the operation carried.
        index: u64,
        /// Why verification failed.
        reason: String,
    },

    /// Module lookup or upgrade failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Incoming operations start past the end of the local log.
    #[error("missing operations for {document_id}/{scope}/{branch}: expected index {expected}, found {found}")]
    MissingOperations {
        /// Document of the log.
        document_id: DocumentId,
        /// Scope of the log.
        scope: String,
        /// Branch of the log.
        branch: String,
        /// Next index of the local log.
        expected: u64,
        /// First index that could not be placed.
        found: u64,
    },

    /// The document does not exist.
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    /// The document exists with another type.
    #[error("document {document_id} has type {actual}, not {expected}")]
    DocumentTypeMismatch {
        /// The document.
        document_id: DocumentId,
        /// Type the job asked for.
        expected: String,
        /// Type stored.
        actual: String,
    },

    /// The job was cancelled by shutdown.
    #[error("job aborted: reactor is shutting down")]
    Aborted,

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    /// The job was malformed.
    #[error("invalid job: {0}")]
    Job(#[from] JobError),

    /// The job queue is full.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The reducer or validator rejected an action.
    #[error("reducer error: {0}")]
    Reducer(#[from] ReducerError),

    /// Signing failed.
    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReactorError {
    /// True for cooperative cancellation, which callers treat as "stopped".
    pub fn is_aborted(&self) -> bool {
        matches!(self, ReactorError::Aborted)
    }

    /// True when re-running the job against fresh state can help.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReactorError::Conflict { .. })
    }

    /// True when the same attempt may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReactorError::Storage(e) if e.is_transient())
    }
}

impl From<StorageError> for ReactorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict {
                document_id,
                scope,
                branch,
                expected,
                actual,
            } => ReactorError::Conflict {
                document_id,
                scope,
                branch,
                expected,
                actual,
            },
            other => ReactorError::Storage(other),
        }
    }
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Append rejected: the operation's index is not the next one.
    #[error("append conflict on {document_id}/{scope}/{branch}: expected index {expected}, got {actual}")]
    Conflict {
        /// Document of the log.
        document_id: DocumentId,
        /// Scope of the log.
        scope: String,
        /// Branch of the log.
        branch: String,
        /// Next free index.
        expected: u64,
        /// Index the operation carried.
        actual: u64,
    },

    /// Document not found.
    #[error("document not found: {0}")]
    NotFound(DocumentId),

    /// An operation does not belong where it was appended.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// A pending migration may lose data and the strategy does not allow it.
    #[error("migration {version} ({name}) is destructive; run `drive-reactor migrate` to apply it")]
    ManualMigrationRequired {
        /// Migration version.
        version: u32,
        /// Migration name.
        name: String,
    },
}

impl StorageError {
    /// True for pool timeouts, I/O errors and busy or locked databases.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(sqlx::Error::PoolTimedOut) => true,
            StorageError::Database(sqlx::Error::Io(_)) => true,
            StorageError::Database(sqlx::Error::Database(db)) => db
                .code()
                .is_some_and(|code| TRANSIENT_CODES.iter().any(|c| code == *c)),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// SQLite busy/locked (primary and extended) and PostgreSQL
/// serialization failure / deadlock codes.
const TRANSIENT_CODES: &[&str] = &["5", "6", "261", "262", "517", "40001", "40P01"];

/// Result type alias for reactor operations.
pub type Result<T> = std::result::Result<T, ReactorError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
