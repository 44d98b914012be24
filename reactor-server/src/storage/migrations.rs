//! Versioned schema migrations.
//!
//! Migrations are numbered and additive; each one makes exactly one
//! structural change. Applied versions are recorded in `schema_migrations`.
//! Which migrations run is decided by [`plan`], a pure function.

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// When pending migrations are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStrategy {
    /// Apply additive migrations at startup; refuse destructive ones.
    #[default]
    Auto,
    /// Apply nothing at startup; the operator runs `drive-reactor migrate`.
    Manual,
    /// Never touch the schema at startup.
    None,
}

/// Who is asking for migrations to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    /// The reactor is starting up.
    Startup,
    /// An operator ran the migrate command.
    Operator,
}

/// One schema change, in both SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    /// Version number; applied in ascending order.
    pub version: u32,
    /// Short name.
    pub name: &'static str,
    /// SQLite statement.
    pub sqlite: &'static str,
    /// PostgreSQL statement.
    pub postgres: &'static str,
    /// Whether the change can lose data.
    pub destructive: bool,
}

/// Whether a migration has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Version number.
    pub version: u32,
    /// Short name.
    pub name: &'static str,
    /// Whether it is recorded in `schema_migrations`.
    pub applied: bool,
}

/// Every migration this build knows, in version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_documents",
        sqlite: r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                drive_id TEXT NOT NULL,
                document_type TEXT NOT NULL,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
        "#,
        postgres: r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                drive_id TEXT NOT NULL,
                document_type TEXT NOT NULL,
                version BIGINT NOT NULL,
                state TEXT NOT NULL,
                created_at_ms BIGINT NOT NULL,
                updated_at_ms BIGINT NOT NULL
            )
        "#,
        destructive: false,
    },
    Migration {
        version: 2,
        name: "create_operations",
        sqlite: r#"
            CREATE TABLE IF NOT EXISTS operations (
                ordinal INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                drive_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                branch TEXT NOT NULL,
                idx INTEGER NOT NULL,
                action_type TEXT NOT NULL,
                input TEXT NOT NULL,
                hash TEXT NOT NULL,
                timestamp_utc_ms INTEGER NOT NULL,
                action_id TEXT NOT NULL,
                signature TEXT,
                resulting_state TEXT,
                UNIQUE(document_id, scope, branch, idx)
            )
        "#,
        postgres: r#"
            CREATE TABLE IF NOT EXISTS operations (
                ordinal BIGSERIAL PRIMARY KEY,
                document_id TEXT NOT NULL,
                drive_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                branch TEXT NOT NULL,
                idx BIGINT NOT NULL,
                action_type TEXT NOT NULL,
                input TEXT NOT NULL,
                hash TEXT NOT NULL,
                timestamp_utc_ms BIGINT NOT NULL,
                action_id TEXT NOT NULL,
                signature TEXT,
                resulting_state TEXT,
                UNIQUE(document_id, scope, branch, idx)
            )
        "#,
        destructive: false,
    },
    Migration {
        version: 3,
        name: "create_revisions",
        sqlite: r#"
            CREATE TABLE IF NOT EXISTS revisions (
                document_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                branch TEXT NOT NULL,
                head INTEGER NOT NULL,
                PRIMARY KEY (document_id, scope, branch)
            )
        "#,
        postgres: r#"
            CREATE TABLE IF NOT EXISTS revisions (
                document_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                branch TEXT NOT NULL,
                head BIGINT NOT NULL,
                PRIMARY KEY (document_id, scope, branch)
            )
        "#,
        destructive: false,
    },
    Migration {
        version: 4,
        name: "create_checkpoints",
        sqlite: r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                name TEXT PRIMARY KEY,
                last_ordinal INTEGER NOT NULL,
                last_timestamp_utc_ms INTEGER NOT NULL
            )
        "#,
        postgres: r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                name TEXT PRIMARY KEY,
                last_ordinal BIGINT NOT NULL,
                last_timestamp_utc_ms BIGINT NOT NULL
            )
        "#,
        destructive: false,
    },
    // Nullable so rows written before sync provenance existed read as local.
    Migration {
        version: 5,
        name: "add_operations_source_remote",
        sqlite: "ALTER TABLE operations ADD COLUMN source_remote TEXT",
        postgres: "ALTER TABLE operations ADD COLUMN IF NOT EXISTS source_remote TEXT",
        destructive: false,
    },
    Migration {
        version: 6,
        name: "create_sync_cursors",
        sqlite: r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                remote TEXT PRIMARY KEY,
                cursor INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
        "#,
        postgres: r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                remote TEXT PRIMARY KEY,
                cursor BIGINT NOT NULL,
                updated_at_ms BIGINT NOT NULL
            )
        "#,
        destructive: false,
    },
    Migration {
        version: 7,
        name: "index_documents_drive",
        sqlite: "CREATE INDEX IF NOT EXISTS idx_documents_drive ON documents(drive_id)",
        postgres: "CREATE INDEX IF NOT EXISTS idx_documents_drive ON documents(drive_id)",
        destructive: false,
    },
    Migration {
        version: 8,
        name: "index_operations_action",
        sqlite: "CREATE INDEX IF NOT EXISTS idx_operations_action ON operations(document_id, action_id)",
        postgres: "CREATE INDEX IF NOT EXISTS idx_operations_action ON operations(document_id, action_id)",
        destructive: false,
    },
];

/// Decide which migrations to apply.
///
/// At startup, `auto` applies every pending migration unless one of them is
/// destructive, in which case nothing is applied and
/// [`StorageError::ManualMigrationRequired`] names the first destructive one.
/// `manual` and `none` apply nothing. An operator run applies everything
/// pending.
///
/// Fails if the database records a version this build does not know.
pub fn plan<'a>(
    migrations: &'a [Migration],
    applied: &[u32],
    strategy: MigrationStrategy,
    mode: MigrationMode,
) -> StorageResult<Vec<&'a Migration>> {
    if let Some(unknown) = applied
        .iter()
        .find(|v| !migrations.iter().any(|m| m.version == **v))
    {
        return Err(StorageError::Migration(format!(
            "database has migration {} which this build does not know",
            unknown
        )));
    }

    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    pending.sort_by_key(|m| m.version);

    match (mode, strategy) {
        (MigrationMode::Operator, _) => Ok(pending),
        (MigrationMode::Startup, MigrationStrategy::Manual | MigrationStrategy::None) => Ok(Vec::new()),
        (MigrationMode::Startup, MigrationStrategy::Auto) => {
            if let Some(m) = pending.iter().find(|m| m.destructive) {
                return Err(StorageError::ManualMigrationRequired {
                    version: m.version,
                    name: m.name.to_string(),
                });
            }
            Ok(pending)
        }
    }
}

/// Status of every migration given the applied versions.
pub(crate) fn status(migrations: &[Migration], applied: &[u32]) -> Vec<MigrationStatus> {
    migrations
        .iter()
        .map(|m| MigrationStatus {
            version: m.version,
            name: m.name,
            applied: applied.contains(&m.version),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DROP: Migration = Migration {
        version: 9,
        name: "drop_legacy",
        sqlite: "DROP TABLE legacy",
        postgres: "DROP TABLE legacy",
        destructive: true,
    };

    fn versions(plan: &[&Migration]) -> Vec<u32> {
        plan.iter().map(|m| m.version).collect()
    }

    #[test]
    fn versions_are_unique_and_ordered() {
        let versions: Vec<u32> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert!(MIGRATIONS.iter().all(|m| !m.destructive));
    }

    #[test]
    fn source_remote_is_a_nullable_column() {
        let m = MIGRATIONS.iter().find(|m| m.version == 5).unwrap();
        assert!(m.sqlite.contains("ADD COLUMN source_remote TEXT"));
        assert!(!m.sqlite.contains("NOT NULL"));
    }

    #[test]
    fn auto_applies_pending_additive() {
        let plan = plan(MIGRATIONS, &[1, 2, 3], MigrationStrategy::Auto, MigrationMode::Startup).unwrap();
        assert_eq!(versions(&plan), vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn auto_refuses_destructive() {
        let mut all = MIGRATIONS.to_vec();
        all.push(DROP);
        let applied: Vec<u32> = MIGRATIONS.iter().map(|m| m.version).collect();

        let err = plan(&all, &applied, MigrationStrategy::Auto, MigrationMode::Startup).unwrap_err();
        assert!(matches!(err, StorageError::ManualMigrationRequired { version: 9, .. }));
    }

    #[test]
    fn operator_applies_destructive() {
        let mut all = MIGRATIONS.to_vec();
        all.push(DROP);
        let applied: Vec<u32> = MIGRATIONS.iter().map(|m| m.version).collect();

        let plan = plan(&all, &applied, MigrationStrategy::Manual, MigrationMode::Operator).unwrap();
        assert_eq!(versions(&plan), vec![9]);
    }

    #[test]
    fn manual_and_none_skip_startup() {
        for strategy in [MigrationStrategy::Manual, MigrationStrategy::None] {
            let plan = plan(MIGRATIONS, &[], strategy, MigrationMode::Startup).unwrap();
            assert!(plan.is_empty());
        }
    }

    #[test]
    fn unknown_applied_version_fails() {
        let err = plan(MIGRATIONS, &[1, 42], MigrationStrategy::Auto, MigrationMode::Startup).unwrap_err();
        assert!(matches!(err, StorageError::Migration(_)));
    }

    #[test]
    fn status_marks_applied() {
        let status = status(MIGRATIONS, &[1, 2]);
        assert!(status[0].applied);
        assert!(!status[2].applied);
        assert_eq!(status.len(), MIGRATIONS.len());
    }
}
