//! Storage layer for the reactor.
//!
//! Provides the durable operation log, the per-log revision index, document
//! snapshots, checkpoints and sync cursors behind one trait with two
//! relational backends.

mod migrations;
mod postgres;
mod sqlite;

pub use migrations::{plan, Migration, MigrationMode, MigrationStatus, MigrationStrategy, MIGRATIONS};
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use reactor_core::Document;
use reactor_types::{Cursor, DocumentId, DriveId, Operation, Signature, Strand};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How far a consumer of the log has caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    /// Ordinal of the last operation processed.
    pub last_ordinal: u64,
    /// Timestamp of that operation.
    pub last_timestamp_utc_ms: u64,
}

impl Checkpoint {
    /// Checkpoint at a committed operation.
    pub fn at(operation: &CommittedOperation) -> Self {
        Self {
            last_ordinal: operation.ordinal,
            last_timestamp_utc_ms: operation.operation.timestamp_utc_ms,
        }
    }
}

/// An operation as stored, with its global position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedOperation {
    /// Global, monotonically increasing position in the log.
    pub ordinal: u64,
    /// Drive of the document.
    pub drive_id: DriveId,
    /// The document.
    pub document_id: DocumentId,
    /// Document model type.
    pub document_type: String,
    /// The operation.
    pub operation: Operation,
}

impl CommittedOperation {
    /// A single-operation strand.
    pub fn to_strand(&self) -> Strand {
        Strand {
            drive_id: self.drive_id.clone(),
            document_id: self.document_id.clone(),
            document_type: self.document_type.clone(),
            scope: self.operation.scope.clone(),
            branch: self.operation.branch.clone(),
            operations: vec![self.operation.clone()],
        }
    }
}

/// Trait for operation log backends.
///
/// Both backends implement identical semantics. All writes to the log go
/// through [`append_batch`](Self::append_batch).
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert a document header and initial state unless the id exists.
    ///
    /// Returns the stored document, which may predate this call.
    async fn create_document(&self, document: &Document) -> StorageResult<Document>;

    /// Get a document with its materialized state.
    async fn get_document(&self, document_id: &DocumentId) -> StorageResult<Option<Document>>;

    /// Documents of a drive, oldest first.
    async fn list_documents(&self, drive_id: &DriveId) -> StorageResult<Vec<Document>>;

    /// Delete a document with its operations and revisions.
    ///
    /// Returns false if the document did not exist.
    async fn delete_document(&self, document_id: &DocumentId) -> StorageResult<bool>;

    /// Append operations and store the document's new state, atomically.
    ///
    /// Every operation must carry the next index of its log; otherwise the
    /// whole batch is rejected with [`StorageError::Conflict`] and nothing
    /// is written. The revision index and the indexer checkpoint advance in
    /// the same transaction.
    async fn append_batch(
        &self,
        document: &Document,
        operations: &[Operation],
    ) -> StorageResult<Vec<CommittedOperation>>;

    /// Append one operation to a log, leaving the document state as is.
    async fn append(
        &self,
        document_id: &DocumentId,
        scope: &str,
        branch: &str,
        operation: Operation,
    ) -> StorageResult<Operation> {
        if operation.scope != scope || operation.branch != branch {
            return Err(StorageError::InvalidOperation(format!(
                "operation for {}/{} appended to {}/{}",
                operation.scope, operation.branch, scope, branch
            )));
        }
        let document = self
            .get_document(document_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(document_id.clone()))?;
        let mut committed = self
            .append_batch(&document, std::slice::from_ref(&operation))
            .await?;
        committed
            .pop()
            .map(|c| c.operation)
            .ok_or_else(|| StorageError::InvalidOperation("append committed nothing".into()))
    }

    /// Operations of a log with `index >= from_index`, in index order.
    async fn read_operations(
        &self,
        document_id: &DocumentId,
        scope: &str,
        branch: &str,
        from_index: u64,
    ) -> StorageResult<Vec<Operation>>;

    /// Last index of a log, or `None` when the log is empty.
    async fn current_revision(
        &self,
        document_id: &DocumentId,
        scope: &str,
        branch: &str,
    ) -> StorageResult<Option<u64>>;

    /// Up to `limit` operations with `ordinal > after`, in ordinal order.
    async fn operations_since(&self, after: u64, limit: u32) -> StorageResult<Vec<CommittedOperation>>;

    /// Recompute the revision index for every log written after `after`.
    ///
    /// Returns the number of logs reindexed.
    async fn reindex_since(&self, after: u64) -> StorageResult<u64>;

    /// How far views have caught up.
    async fn read_view_state(&self) -> StorageResult<Checkpoint>;

    /// Advance the view checkpoint. It never moves back.
    async fn write_view_state(&self, checkpoint: Checkpoint) -> StorageResult<()>;

    /// How far the revision index has caught up.
    async fn read_indexer_state(&self) -> StorageResult<Checkpoint>;

    /// Advance the indexer checkpoint. It never moves back.
    async fn write_indexer_state(&self, checkpoint: Checkpoint) -> StorageResult<()>;

    /// Last cursor acknowledged to a remote.
    async fn read_sync_cursor(&self, remote: &str) -> StorageResult<Option<Cursor>>;

    /// Persist the last cursor acknowledged to a remote.
    async fn write_sync_cursor(&self, remote: &str, cursor: Cursor) -> StorageResult<()>;

    /// Number of operations in the log.
    async fn operation_count(&self) -> StorageResult<u64>;

    /// Apply pending schema migrations as `strategy` and `mode` allow.
    ///
    /// Returns the versions applied.
    async fn migrate(&self, strategy: MigrationStrategy, mode: MigrationMode) -> StorageResult<Vec<u32>>;

    /// Every known migration and whether it has been applied.
    async fn migration_status(&self) -> StorageResult<Vec<MigrationStatus>>;
}

/// Open the configured backend and run startup migrations.
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn OperationStore>> {
    let storage: Arc<dyn OperationStore> = match config.backend {
        StorageBackend::Sqlite => {
            Arc::new(SqliteStorage::new(&config.path, config.max_connections).await?)
        }
        StorageBackend::Postgres => {
            let url = config.url.as_deref().ok_or_else(|| {
                StorageError::Migration("storage.url is required for the postgres backend".into())
            })?;
            Arc::new(PostgresStorage::connect(url, config.max_connections).await?)
        }
    };
    let applied = storage
        .migrate(config.migration_strategy, MigrationMode::Startup)
        .await?;
    if !applied.is_empty() {
        tracing::info!(?applied, "applied schema migrations");
    }
    Ok(storage)
}

// ===== Row mapping shared by both backends =====

/// Columns selected for [`OperationRow`]. Expects `operations o` joined
/// with `documents d`.
const OPERATION_COLUMNS: &str = "o.ordinal, o.drive_id, o.document_id, d.document_type, \
     o.scope, o.branch, o.idx, o.action_type, o.input, o.hash, o.timestamp_utc_ms, \
     o.action_id, o.signature, o.resulting_state, o.source_remote";

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    drive_id: String,
    document_type: String,
    version: i64,
    state: String,
}

impl TryFrom<DocumentRow> for Document {
    type Error = StorageError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let state: BTreeMap<String, serde_json::Value> = serde_json::from_str(&row.state)?;
        let version = u32::try_from(row.version)
            .map_err(|_| StorageError::Serialization(format!("bad document version {}", row.version)))?;
        Ok(Document {
            id: DocumentId::new(row.id),
            drive_id: DriveId::new(row.drive_id),
            document_type: row.document_type,
            version,
            state,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    ordinal: i64,
    drive_id: String,
    document_id: String,
    document_type: String,
    scope: String,
    branch: String,
    idx: i64,
    action_type: String,
    input: String,
    hash: String,
    timestamp_utc_ms: i64,
    action_id: String,
    signature: Option<String>,
    resulting_state: Option<String>,
    source_remote: Option<String>,
}

impl TryFrom<OperationRow> for CommittedOperation {
    type Error = StorageError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let signature: Option<Signature> = row
            .signature
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let resulting_state = row
            .resulting_state
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let action_id = uuid::Uuid::parse_str(&row.action_id)
            .map_err(|e| StorageError::Serialization(format!("bad action id: {}", e)))?;

        Ok(CommittedOperation {
            ordinal: row.ordinal as u64,
            drive_id: DriveId::new(row.drive_id),
            document_id: DocumentId::new(row.document_id),
            document_type: row.document_type,
            operation: Operation {
                index: row.idx as u64,
                scope: row.scope,
                branch: row.branch,
                action_type: row.action_type,
                input: serde_json::from_str(&row.input)?,
                hash: row.hash,
                timestamp_utc_ms: row.timestamp_utc_ms as u64,
                action_id,
                signature,
                resulting_state,
                source_remote: row.source_remote,
            },
        })
    }
}

/// JSON columns of an operation: input, signature, resulting state.
fn encode_operation(
    operation: &Operation,
) -> StorageResult<(String, Option<String>, Option<String>)> {
    let input = serde_json::to_string(&operation.input)?;
    let signature = operation
        .signature
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let resulting_state = operation
        .resulting_state
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    Ok((input, signature, resulting_state))
}

fn conflict(document: &Document, operation: &Operation, expected: u64) -> StorageError {
    StorageError::Conflict {
        document_id: document.id.clone(),
        scope: operation.scope.clone(),
        branch: operation.branch.clone(),
        expected,
        actual: operation.index,
    }
}

/// Map a unique violation on the operation log to a conflict.
///
/// Another writer took the index between our head read and the insert.
fn map_insert_error(err: sqlx::Error, document: &Document, operation: &Operation) -> StorageError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            conflict(document, operation, operation.index + 1)
        }
        _ => StorageError::Database(err),
    }
}

fn now_ms() -> i64 {
    reactor_types::now_utc_ms() as i64
}

const VIEW_CHECKPOINT: &str = "view";
const INDEXER_CHECKPOINT: &str = "indexer";
