//! Migrate command - apply pending schema migrations.

use anyhow::{Context, Result};
use reactor_server::storage::MigrationMode;

use crate::config::CliConfig;

/// Run the migrate command.
pub async fn run(config: CliConfig) -> Result<()> {
    let storage = super::open_storage(&config.reactor.storage).await?;
    let applied = storage
        .migrate(config.reactor.storage.migration_strategy, MigrationMode::Operator)
        .await
        .context("Migration failed")?;

    if applied.is_empty() {
        println!("Schema is up to date.");
    } else {
        for version in &applied {
            println!("Applied migration {}", version);
        }
    }
    Ok(())
}
