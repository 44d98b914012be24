//! CLI command implementations.

pub mod migrate;
pub mod serve;
pub mod status;

use anyhow::{Context, Result};
use reactor_server::config::StorageConfig;
use reactor_server::storage::{self, MigrationStrategy, OperationStore};
use std::sync::Arc;

/// Open storage without startup migrations, for administrative commands.
pub(crate) async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn OperationStore>> {
    let mut config = config.clone();
    config.migration_strategy = MigrationStrategy::Manual;
    storage::open(&config).await.context("Failed to open storage")
}
