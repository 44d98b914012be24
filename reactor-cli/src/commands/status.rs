//! Show reactor status.

use anyhow::{Context, Result};

use crate::config::CliConfig;

/// Run the status command.
pub async fn run(config: CliConfig) -> Result<()> {
    let storage = super::open_storage(&config.reactor.storage).await?;

    println!("=== drive-reactor status ===");
    println!();
    println!("Reactor: {}", config.name);
    println!();

    println!("Schema:");
    let migrations = storage
        .migration_status()
        .await
        .context("Failed to read migration status")?;
    for m in &migrations {
        let mark = if m.applied { "applied" } else { "PENDING" };
        println!("  [{:>3}] {:<32} {}", m.version, m.name, mark);
    }
    if migrations.iter().any(|m| !m.applied) {
        println!();
        println!("Run 'drive-reactor migrate' to apply pending migrations.");
        return Ok(());
    }
    println!();

    let operations = storage.operation_count().await?;
    let view = storage.read_view_state().await?;
    let indexer = storage.read_indexer_state().await?;
    println!("Log:");
    println!("  Operations: {}", operations);
    println!("  Views:      ordinal {}", view.last_ordinal);
    println!("  Indexer:    ordinal {}", indexer.last_ordinal);
    println!();

    println!("Remotes: {} configured", config.remotes.len());
    for remote in &config.remotes {
        let cursor = storage.read_sync_cursor(&remote.name).await?;
        let cursor = cursor.map_or_else(|| "never synced".to_string(), |c| format!("cursor {}", c.value()));
        println!("  {} ({:?}) {} - {}", remote.name, remote.channel, remote.url, cursor);
    }

    Ok(())
}
