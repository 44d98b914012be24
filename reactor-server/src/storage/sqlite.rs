//! SQLite storage backend.

use super::{
    conflict, encode_operation, map_insert_error, migrations, now_ms, Checkpoint,
    CommittedOperation, DocumentRow, MigrationMode, MigrationStatus, MigrationStrategy,
    OperationRow, OperationStore, INDEXER_CHECKPOINT, OPERATION_COLUMNS, VIEW_CHECKPOINT,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use reactor_core::Document;
use reactor_types::{Cursor, DocumentId, DriveId, Operation};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// SQLite-based operation store.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("connections", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Open a SQLite database file, creating it if it doesn't exist.
    ///
    /// Does not run migrations; see [`OperationStore::migrate`].
    pub async fn new(path: &Path, max_connections: u32) -> Result<Self, StorageError> {
        let path_str = path.to_str().ok_or_else(|| {
            StorageError::Migration(format!("database path is not UTF-8: {}", path.display()))
        })?;
        let options = SqliteConnectOptions::from_str(path_str)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        tracing::info!(path = %path.display(), "opened sqlite storage");
        Ok(Self { pool })
    }

    /// Create an in-memory SQLite storage with every migration applied (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage
            .migrate(MigrationStrategy::Auto, MigrationMode::Operator)
            .await?;
        Ok(storage)
    }

    async fn applied_versions(&self) -> StorageResult<Vec<u32>> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        let versions: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await
                .map_err(StorageError::Database)?;
        Ok(versions.into_iter().map(|v| v as u32).collect())
    }

    async fn read_checkpoint(&self, name: &str) -> StorageResult<Checkpoint> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT last_ordinal, last_timestamp_utc_ms FROM checkpoints WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(row
            .map(|(ordinal, ts)| Checkpoint {
                last_ordinal: ordinal as u64,
                last_timestamp_utc_ms: ts as u64,
            })
            .unwrap_or_default())
    }

    async fn write_checkpoint<'e, E>(executor: E, name: &str, checkpoint: Checkpoint) -> StorageResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (name, last_ordinal, last_timestamp_utc_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                last_ordinal = excluded.last_ordinal,
                last_timestamp_utc_ms = excluded.last_timestamp_utc_ms
            WHERE excluded.last_ordinal >= checkpoints.last_ordinal
            "#,
        )
        .bind(name)
        .bind(checkpoint.last_ordinal as i64)
        .bind(checkpoint.last_timestamp_utc_ms as i64)
        .execute(executor)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }
}

#[async_trait]
impl OperationStore for SqliteStorage {
    async fn create_document(&self, document: &Document) -> StorageResult<Document> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO documents (id, drive_id, document_type, version, state, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(document.id.as_str())
        .bind(document.drive_id.as_str())
        .bind(&document.document_type)
        .bind(document.version as i64)
        .bind(serde_json::to_string(&document.state)?)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        self.get_document(&document.id)
            .await?
            .ok_or_else(|| StorageError::NotFound(document.id.clone()))
    }

    async fn get_document(&self, document_id: &DocumentId) -> StorageResult<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, drive_id, document_type, version, state FROM documents WHERE id = ?1",
        )
        .bind(document_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        row.map(Document::try_from).transpose()
    }

    async fn list_documents(&self, drive_id: &DriveId) -> StorageResult<Vec<Document>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, drive_id, document_type, version, state
            FROM documents
            WHERE drive_id = ?1
            ORDER BY created_at_ms ASC, id ASC
            "#,
        )
        .bind(drive_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        rows.into_iter().map(Document::try_from).collect()
    }

    async fn delete_document(&self, document_id: &DocumentId) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        for sql in [
            "DELETE FROM operations WHERE document_id = ?1",
            "DELETE FROM revisions WHERE document_id = ?1",
        ] {
            sqlx::query(sql)
                .bind(document_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(StorageError::Database)?;
        }
        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(document_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn append_batch(
        &self,
        document: &Document,
        operations: &[Operation],
    ) -> StorageResult<Vec<CommittedOperation>> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;
        let mut committed = Vec::with_capacity(operations.len());

        for op in operations {
            let head: Option<i64> = sqlx::query_scalar(
                "SELECT head FROM revisions WHERE document_id = ?1 AND scope = ?2 AND branch = ?3",
            )
            .bind(document.id.as_str())
            .bind(&op.scope)
            .bind(&op.branch)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

            // Rejected batches roll back when `tx` is dropped.
            let expected = head.map_or(0, |h| h as u64 + 1);
            if op.index != expected {
                return Err(conflict(document, op, expected));
            }

            let (input, signature, resulting_state) = encode_operation(op)?;
            let ordinal: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO operations (
                    document_id, drive_id, scope, branch, idx, action_type, input, hash,
                    timestamp_utc_ms, action_id, signature, resulting_state, source_remote
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                RETURNING ordinal
                "#,
            )
            .bind(document.id.as_str())
            .bind(document.drive_id.as_str())
            .bind(&op.scope)
            .bind(&op.branch)
            .bind(op.index as i64)
            .bind(&op.action_type)
            .bind(input)
            .bind(&op.hash)
            .bind(op.timestamp_utc_ms as i64)
            .bind(op.action_id.to_string())
            .bind(signature)
            .bind(resulting_state)
            .bind(op.source_remote.as_deref())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, document, op))?;

            sqlx::query(
                r#"
                INSERT INTO revisions (document_id, scope, branch, head)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(document_id, scope, branch) DO UPDATE SET head = excluded.head
                "#,
            )
            .bind(document.id.as_str())
            .bind(&op.scope)
            .bind(&op.branch)
            .bind(op.index as i64)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

            committed.push(CommittedOperation {
                ordinal: ordinal as u64,
                drive_id: document.drive_id.clone(),
                document_id: document.id.clone(),
                document_type: document.document_type.clone(),
                operation: op.clone(),
            });
        }

        let updated = sqlx::query(
            "UPDATE documents SET state = ?1, version = ?2, updated_at_ms = ?3 WHERE id = ?4",
        )
        .bind(serde_json::to_string(&document.state)?)
        .bind(document.version as i64)
        .bind(now_ms())
        .bind(document.id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::NotFound(document.id.clone()));
        }

        if let Some(last) = committed.last() {
            Self::write_checkpoint(&mut *tx, INDEXER_CHECKPOINT, Checkpoint::at(last)).await?;
        }

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(committed)
    }

    async fn read_operations(
        &self,
        document_id: &DocumentId,
        scope: &str,
        branch: &str,
        from_index: u64,
    ) -> StorageResult<Vec<Operation>> {
        let sql = format!(
            r#"
            SELECT {OPERATION_COLUMNS}
            FROM operations o JOIN documents d ON d.id = o.document_id
            WHERE o.document_id = ?1 AND o.scope = ?2 AND o.branch = ?3 AND o.idx >= ?4
            ORDER BY o.idx ASC
            "#
        );
        let rows = sqlx::query_as::<_, OperationRow>(&sql)
            .bind(document_id.as_str())
            .bind(scope)
            .bind(branch)
            .bind(from_index as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        rows.into_iter()
            .map(|row| CommittedOperation::try_from(row).map(|c| c.operation))
            .collect()
    }

    async fn current_revision(
        &self,
        document_id: &DocumentId,
        scope: &str,
        branch: &str,
    ) -> StorageResult<Option<u64>> {
        let head: Option<i64> = sqlx::query_scalar(
            "SELECT head FROM revisions WHERE document_id = ?1 AND scope = ?2 AND branch = ?3",
        )
        .bind(document_id.as_str())
        .bind(scope)
        .bind(branch)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(head.map(|h| h as u64))
    }

    async fn operations_since(&self, after: u64, limit: u32) -> StorageResult<Vec<CommittedOperation>> {
        let sql = format!(
            r#"
            SELECT {OPERATION_COLUMNS}
            FROM operations o JOIN documents d ON d.id = o.document_id
            WHERE o.ordinal > ?1
            ORDER BY o.ordinal ASC
            LIMIT ?2
            "#
        );
        let rows = sqlx::query_as::<_, OperationRow>(&sql)
            .bind(after as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        rows.into_iter().map(CommittedOperation::try_from).collect()
    }

    async fn reindex_since(&self, after: u64) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        let reindexed = sqlx::query(
            r#"
            INSERT INTO revisions (document_id, scope, branch, head)
            SELECT document_id, scope, branch, MAX(idx)
            FROM operations
            WHERE (document_id, scope, branch) IN (
                SELECT document_id, scope, branch FROM operations WHERE ordinal > ?1
            )
            GROUP BY document_id, scope, branch
            ON CONFLICT(document_id, scope, branch) DO UPDATE SET head = excluded.head
            "#,
        )
        .bind(after as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let last: Option<(i64, i64)> = sqlx::query_as(
            "SELECT ordinal, timestamp_utc_ms FROM operations ORDER BY ordinal DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::Database)?;
        if let Some((ordinal, ts)) = last {
            let checkpoint = Checkpoint {
                last_ordinal: ordinal as u64,
                last_timestamp_utc_ms: ts as u64,
            };
            Self::write_checkpoint(&mut *tx, INDEXER_CHECKPOINT, checkpoint).await?;
        }

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(reindexed.rows_affected())
    }

    async fn read_view_state(&self) -> StorageResult<Checkpoint> {
        self.read_checkpoint(VIEW_CHECKPOINT).await
    }

    async fn write_view_state(&self, checkpoint: Checkpoint) -> StorageResult<()> {
        Self::write_checkpoint(&self.pool, VIEW_CHECKPOINT, checkpoint).await
    }

    async fn read_indexer_state(&self) -> StorageResult<Checkpoint> {
        self.read_checkpoint(INDEXER_CHECKPOINT).await
    }

    async fn write_indexer_state(&self, checkpoint: Checkpoint) -> StorageResult<()> {
        Self::write_checkpoint(&self.pool, INDEXER_CHECKPOINT, checkpoint).await
    }

    async fn read_sync_cursor(&self, remote: &str) -> StorageResult<Option<Cursor>> {
        let cursor: Option<i64> =
            sqlx::query_scalar("SELECT cursor FROM sync_cursors WHERE remote = ?1")
                .bind(remote)
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::Database)?;

        Ok(cursor.map(|c| Cursor::new(c as u64)))
    }

    async fn write_sync_cursor(&self, remote: &str, cursor: Cursor) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (remote, cursor, updated_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(remote) DO UPDATE SET cursor = excluded.cursor, updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(remote)
        .bind(cursor.value() as i64)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    async fn operation_count(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM operations")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(count as u64)
    }

    async fn migrate(&self, strategy: MigrationStrategy, mode: MigrationMode) -> StorageResult<Vec<u32>> {
        let applied = self.applied_versions().await?;
        let plan = migrations::plan(migrations::MIGRATIONS, &applied, strategy, mode)?;

        let mut done = Vec::with_capacity(plan.len());
        for migration in plan {
            let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;
            sqlx::query(migration.sqlite)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    StorageError::Migration(format!("{} failed: {}", migration.name, e))
                })?;
            sqlx::query(
                "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (?1, ?2, ?3)",
            )
            .bind(migration.version as i64)
            .bind(migration.name)
            .bind(now_ms())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;
            tx.commit().await.map_err(StorageError::Database)?;

            tracing::debug!(version = migration.version, name = migration.name, "applied migration");
            done.push(migration.version);
        }
        Ok(done)
    }

    async fn migration_status(&self) -> StorageResult<Vec<MigrationStatus>> {
        let applied = self.applied_versions().await?;
        Ok(migrations::status(migrations::MIGRATIONS, &applied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactor_types::{Action, DEFAULT_BRANCH};
    use serde_json::json;

    fn document(id: &str) -> Document {
        Document::new(DocumentId::from(id), DriveId::from("drive"), "test/counter", 1)
    }

    fn op(scope: &str, index: u64) -> Operation {
        let action = Action::new("INC", scope, json!({ "by": 1 }));
        Operation::from_action(&action, index, DEFAULT_BRANCH)
    }

    async fn storage_with(id: &str) -> (SqliteStorage, Document) {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let doc = storage.create_document(&document(id)).await.unwrap();
        (storage, doc)
    }

    // ===== Documents =====

    #[tokio::test]
    async fn create_document_is_idempotent() {
        let (storage, doc) = storage_with("doc").await;

        let mut other = document("doc");
        other.document_type = "other/type".into();
        let stored = storage.create_document(&other).await.unwrap();

        assert_eq!(stored, doc);
        assert_eq!(stored.document_type, "test/counter");
    }

    #[tokio::test]
    async fn list_documents_by_drive() {
        let (storage, _) = storage_with("a").await;
        storage.create_document(&document("b")).await.unwrap();
        let mut foreign = document("c");
        foreign.drive_id = DriveId::from("elsewhere");
        storage.create_document(&foreign).await.unwrap();

        let docs = storage.list_documents(&DriveId::from("drive")).await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn delete_document_removes_log() {
        let (storage, doc) = storage_with("doc").await;
        storage.append_batch(&doc, &[op("global", 0)]).await.unwrap();

        assert!(storage.delete_document(&doc.id).await.unwrap());
        assert!(storage.get_document(&doc.id).await.unwrap().is_none());
        assert_eq!(storage.operation_count().await.unwrap(), 0);
        assert_eq!(
            storage.current_revision(&doc.id, "global", DEFAULT_BRANCH).await.unwrap(),
            None
        );
        assert!(!storage.delete_document(&doc.id).await.unwrap());
    }

    // ===== Append =====

    #[tokio::test]
    async fn append_assigns_contiguous_indices() {
        let (storage, mut doc) = storage_with("doc").await;
        doc.state.insert("global".into(), json!({"count": 2}));

        let committed = storage
            .append_batch(&doc, &[op("global", 0), op("global", 1), op("local", 0)])
            .await
            .unwrap();
        assert_eq!(committed.len(), 3);
        assert!(committed.windows(2).all(|w| w[1].ordinal > w[0].ordinal));

        let ops = storage.read_operations(&doc.id, "global", DEFAULT_BRANCH, 0).await.unwrap();
        let indices: Vec<u64> = ops.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(
            storage.current_revision(&doc.id, "local", DEFAULT_BRANCH).await.unwrap(),
            Some(0)
        );

        let stored = storage.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.state["global"], json!({"count": 2}));
    }

    #[tokio::test]
    async fn conflicting_append_never_mutates() {
        let (storage, doc) = storage_with("doc").await;
        storage.append_batch(&doc, &[op("global", 0)]).await.unwrap();

        let mut changed = doc.clone();
        changed.state.insert("global".into(), json!("changed"));
        // Second operation is valid, third reuses index 1: the whole batch fails.
        let err = storage
            .append_batch(&changed, &[op("global", 1), op("global", 1)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                expected: 2,
                actual: 1,
                ..
            }
        ));

        assert_eq!(storage.operation_count().await.unwrap(), 1);
        assert_eq!(
            storage.current_revision(&doc.id, "global", DEFAULT_BRANCH).await.unwrap(),
            Some(0)
        );
        let stored = storage.get_document(&doc.id).await.unwrap().unwrap();
        assert!(stored.state.get("global").is_none());
    }

    #[tokio::test]
    async fn append_rejects_stale_and_future_index() {
        let (storage, doc) = storage_with("doc").await;
        storage
            .append(&doc.id, "global", DEFAULT_BRANCH, op("global", 0))
            .await
            .unwrap();

        for index in [0, 5] {
            let err = storage
                .append(&doc.id, "global", DEFAULT_BRANCH, op("global", index))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::Conflict { expected: 1, .. }));
        }
    }

    #[tokio::test]
    async fn append_checks_log_identity() {
        let (storage, doc) = storage_with("doc").await;
        let err = storage
            .append(&doc.id, "local", DEFAULT_BRANCH, op("global", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidOperation(_)));

        let err = storage
            .append(&DocumentId::from("missing"), "global", DEFAULT_BRANCH, op("global", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn operation_fields_roundtrip() {
        let (storage, doc) = storage_with("doc").await;
        let mut operation = op("global", 0);
        operation.signature = Some(reactor_types::Signature::new("1", "me", "h", "", "0xab"));
        operation.resulting_state = Some(json!({"count": 1}));
        operation.source_remote = Some("peer".into());

        storage.append_batch(&doc, &[operation.clone()]).await.unwrap();
        let read = storage.read_operations(&doc.id, "global", DEFAULT_BRANCH, 0).await.unwrap();
        assert_eq!(read, vec![operation]);
    }

    // ===== Checkpoints and recovery =====

    #[tokio::test]
    async fn indexer_checkpoint_follows_appends() {
        let (storage, doc) = storage_with("doc").await;
        let committed = storage
            .append_batch(&doc, &[op("global", 0), op("global", 1)])
            .await
            .unwrap();

        let checkpoint = storage.read_indexer_state().await.unwrap();
        assert_eq!(checkpoint.last_ordinal, committed[1].ordinal);
    }

    #[tokio::test]
    async fn view_checkpoint_never_moves_back() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert_eq!(storage.read_view_state().await.unwrap(), Checkpoint::default());

        let ahead = Checkpoint {
            last_ordinal: 10,
            last_timestamp_utc_ms: 1000,
        };
        storage.write_view_state(ahead).await.unwrap();
        storage
            .write_view_state(Checkpoint {
                last_ordinal: 3,
                last_timestamp_utc_ms: 300,
            })
            .await
            .unwrap();
        assert_eq!(storage.read_view_state().await.unwrap(), ahead);
    }

    #[tokio::test]
    async fn operations_since_pages_in_ordinal_order() {
        let (storage, doc) = storage_with("doc").await;
        storage
            .append_batch(&doc, &[op("global", 0), op("global", 1), op("global", 2)])
            .await
            .unwrap();

        let first = storage.operations_since(0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].document_type, "test/counter");
        let rest = storage.operations_since(first[1].ordinal, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].operation.index, 2);
    }

    #[tokio::test]
    async fn reindex_rebuilds_revisions() {
        let (storage, doc) = storage_with("doc").await;
        storage
            .append_batch(&doc, &[op("global", 0), op("global", 1)])
            .await
            .unwrap();
        sqlx::query("DELETE FROM revisions")
            .execute(&storage.pool)
            .await
            .unwrap();

        let reindexed = storage.reindex_since(0).await.unwrap();
        assert_eq!(reindexed, 1);
        assert_eq!(
            storage.current_revision(&doc.id, "global", DEFAULT_BRANCH).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn sync_cursor_roundtrip() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert_eq!(storage.read_sync_cursor("peer").await.unwrap(), None);

        storage.write_sync_cursor("peer", Cursor::new(7)).await.unwrap();
        storage.write_sync_cursor("peer", Cursor::new(9)).await.unwrap();
        assert_eq!(storage.read_sync_cursor("peer").await.unwrap(), Some(Cursor::new(9)));
    }

    // ===== Migrations =====

    #[tokio::test]
    async fn in_memory_applies_every_migration() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let status = storage.migration_status().await.unwrap();
        assert!(status.iter().all(|m| m.applied));

        let again = storage
            .migrate(MigrationStrategy::Auto, MigrationMode::Startup)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn file_database_respects_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reactor.db");

        let storage = SqliteStorage::new(&path, 2).await.unwrap();
        let applied = storage
            .migrate(MigrationStrategy::Manual, MigrationMode::Startup)
            .await
            .unwrap();
        assert!(applied.is_empty());

        let applied = storage
            .migrate(MigrationStrategy::Manual, MigrationMode::Operator)
            .await
            .unwrap();
        assert_eq!(applied.len(), migrations::MIGRATIONS.len());

        drop(storage);
        let reopened = SqliteStorage::new(&path, 2).await.unwrap();
        let status = reopened.migration_status().await.unwrap();
        assert!(status.iter().all(|m| m.applied));
    }
}
