//! PostgreSQL storage backend.
//!
//! Same schema and semantics as the SQLite backend. Index conflicts between
//! concurrent writers surface as unique violations on
//! `(document_id, scope, branch, idx)`.

use super::{
    conflict, encode_operation, map_insert_error, migrations, now_ms, Checkpoint,
    CommittedOperation, DocumentRow, MigrationMode, MigrationStatus, MigrationStrategy,
    OperationRow, OperationStore, INDEXER_CHECKPOINT, OPERATION_COLUMNS, VIEW_CHECKPOINT,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use reactor_core::Document;
use reactor_types::{Cursor, DocumentId, DriveId, Operation};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// PostgreSQL-based operation store.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStorage")
            .field("connections", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl PostgresStorage {
    /// Connect to a PostgreSQL server.
    ///
    /// Does not run migrations; see [`OperationStore::migrate`].
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(StorageError::Database)?;

        tracing::info!("connected to postgres storage");
        Ok(Self { pool })
    }

    async fn applied_versions(&self) -> StorageResult<Vec<u32>> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_ms BIGINT NOT NULL
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
            "SELECT last_ordinal, last_timestamp_utc_ms FROM checkpoints WHERE name = $1",
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
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (name, last_ordinal, last_timestamp_utc_ms)
            VALUES ($1, $2, $3)
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
impl OperationStore for PostgresStorage {
    async fn create_document(&self, document: &Document) -> StorageResult<Document> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO documents (id, drive_id, document_type, version, state, created_at_ms, updated_at_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
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
            "SELECT id, drive_id, document_type, version, state FROM documents WHERE id = $1",
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
            WHERE drive_id = $1
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
            "DELETE FROM operations WHERE document_id = $1",
            "DELETE FROM revisions WHERE document_id = $1",
        ] {
            sqlx::query(sql)
                .bind(document_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(StorageError::Database)?;
        }
        let deleted = sqlx::query("DELETE FROM documents WHERE id = $1")
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
                "SELECT head FROM revisions WHERE document_id = $1 AND scope = $2 AND branch = $3",
            )
            .bind(document.id.as_str())
            .bind(&op.scope)
            .bind(&op.branch)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

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
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
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
                VALUES ($1, $2, $3, $4)
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
            "UPDATE documents SET state = $1, version = $2, updated_at_ms = $3 WHERE id = $4",
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
            WHERE o.document_id = $1 AND o.scope = $2 AND o.branch = $3 AND o.idx >= $4
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
            "SELECT head FROM revisions WHERE document_id = $1 AND scope = $2 AND branch = $3",
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
            WHERE o.ordinal > $1
            ORDER BY o.ordinal ASC
            LIMIT $2
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
                SELECT document_id, scope, branch FROM operations WHERE ordinal > $1
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
            sqlx::query_scalar("SELECT cursor FROM sync_cursors WHERE remote = $1")
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
            VALUES ($1, $2, $3)
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
            sqlx::query(migration.postgres)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    StorageError::Migration(format!("{} failed: {}", migration.name, e))
                })?;
            sqlx::query(
                "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES ($1, $2, $3)",
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
