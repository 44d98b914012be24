//! Health check endpoint.
//!
//! Reports whether storage answers and how far listeners have been
//! delivered. Answers 503 when storage is unreachable.

use crate::error::StorageResult;
use crate::events::TransmitterKind;
use crate::service::SyncService;
use crate::storage::Checkpoint;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Whether storage answered the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageHealth {
    /// Storage answered.
    Ok,
    /// Reading the view checkpoint failed.
    Unreachable,
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `ok`, or `degraded` when storage is unreachable.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Storage reachability.
    pub storage: StorageHealth,
    /// Ordinal of the last operation every push listener has received.
    pub view_ordinal: Option<u64>,
    /// Timestamp of that operation.
    pub view_timestamp_utc_ms: Option<u64>,
    /// Registered listeners.
    pub listeners: usize,
    /// Strands waiting for push listeners.
    pub push_backlog: usize,
    /// Jobs waiting in the queue.
    pub queued_jobs: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

impl HealthStatus {
    fn with_view_state(mut self, view: StorageResult<Checkpoint>) -> Self {
        match view {
            Ok(checkpoint) => {
                self.storage = StorageHealth::Ok;
                self.view_ordinal = Some(checkpoint.last_ordinal);
                self.view_timestamp_utc_ms = Some(checkpoint.last_timestamp_utc_ms);
            }
            Err(e) => {
                tracing::warn!(error = %e, "health check could not read the view checkpoint");
                self.status = "degraded".to_string();
                self.storage = StorageHealth::Unreachable;
                self.view_ordinal = None;
                self.view_timestamp_utc_ms = None;
            }
        }
        self
    }

    fn http_status(&self) -> StatusCode {
        match self.storage {
            StorageHealth::Ok => StatusCode::OK,
            StorageHealth::Unreachable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Health check handler.
pub async fn health_handler(
    Extension(service): Extension<Arc<SyncService>>,
) -> (StatusCode, Json<HealthStatus>) {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);
    let reactor = service.reactor();
    let listeners = reactor.emitter().listeners();
    let push_backlog = listeners
        .iter()
        .filter(|l| l.kind == TransmitterKind::Push)
        .map(|l| l.pending)
        .sum();

    let health = HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage: StorageHealth::Ok,
        view_ordinal: None,
        view_timestamp_utc_ms: None,
        listeners: listeners.len(),
        push_backlog,
        queued_jobs: reactor.queued_jobs(),
        uptime_seconds: uptime,
    }
    .with_view_state(reactor.storage().read_view_state().await);

    (health.http_status(), Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    fn healthy() -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            storage: StorageHealth::Ok,
            view_ordinal: None,
            view_timestamp_utc_ms: None,
            listeners: 3,
            push_backlog: 0,
            queued_jobs: 12,
            uptime_seconds: 3600,
        }
    }

    #[test]
    fn view_checkpoint_is_reported() {
        let status = healthy().with_view_state(Ok(Checkpoint {
            last_ordinal: 42,
            last_timestamp_utc_ms: 1_700_000_000_000,
        }));

        assert_eq!(status.http_status(), StatusCode::OK);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"storage\":\"ok\""));
        assert!(json.contains("\"view_ordinal\":42"));
        assert!(json.contains("\"queued_jobs\":12"));
    }

    #[test]
    fn unreachable_storage_degrades() {
        let status = healthy().with_view_state(Err(StorageError::Database(sqlx::Error::PoolClosed)));

        assert_eq!(status.status, "degraded");
        assert_eq!(status.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"storage\":\"unreachable\""));
        assert!(json.contains("\"view_ordinal\":null"));
    }
}
