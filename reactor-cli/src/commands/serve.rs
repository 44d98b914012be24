//! Serve command - run the reactor, its HTTP endpoints and its remotes.

use anyhow::{Context, Result};
use reactor_server::http::{build_router, health};
use reactor_server::{Reactor, SyncService};
use reactor_sync::{ChannelFactory, SyncCoordinator};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CliConfig;

/// Run the serve command.
pub async fn run(config: CliConfig) -> Result<()> {
    health::init_start_time();

    let reactor = Arc::new(
        Reactor::builder(config.reactor.clone())
            .build()
            .await
            .context("Failed to start reactor")?,
    );
    let service = Arc::new(SyncService::new(reactor.clone()));

    let coordinator = SyncCoordinator::new(reactor.clone(), ChannelFactory::new(&config.name));
    for remote in &config.remotes {
        let name = remote.name.clone();
        if let Err(e) = coordinator.add_remote(remote.clone()).await {
            warn!(remote = %name, error = %e, "remote not added");
            continue;
        }
        match coordinator.sync_remote(&name).await {
            Ok(received) => info!(remote = %name, received, "initial sync complete"),
            Err(e) => warn!(remote = %name, error = %e, "initial sync failed"),
        }
    }

    // Listeners are in place; deliver what the last run committed but never sent.
    reactor
        .resume_delivery()
        .await
        .context("Failed to resume delivery")?;

    let addr: SocketAddr = config
        .reactor
        .http
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.reactor.http.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, name = %config.name, remotes = config.remotes.len(), "serving");

    axum::serve(listener, build_router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    coordinator.shutdown().await;
    reactor.shutdown().await;
    for entry in coordinator.errors() {
        warn!(remote = %entry.remote, document = ?entry.document_id, error = %entry.error, "unresolved sync error");
    }
    Ok(())
}

/// Wait for Ctrl+C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; stopping");
        return;
    }
    info!("received Ctrl+C, shutting down");
}
