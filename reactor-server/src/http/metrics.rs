//! Prometheus metrics endpoint.

use crate::service::SyncService;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format: gauges for current state,
/// counters since startup.
pub async fn metrics_handler(Extension(service): Extension<Arc<SyncService>>) -> impl IntoResponse {
    let reactor = service.reactor();
    let m = reactor.metrics();

    let listeners = reactor.emitter().listeners().len();
    let queued = reactor.queued_jobs();

    let committed = m.jobs_committed.load(Ordering::Relaxed);
    let failed = m.jobs_failed.load(Ordering::Relaxed);
    let appended = m.operations_appended.load(Ordering::Relaxed);
    let delivered = m.strands_delivered.load(Ordering::Relaxed);
    let sync_requests = m.sync_requests.load(Ordering::Relaxed);

    // Best effort
    let stored = reactor.storage().operation_count().await.unwrap_or(0);

    let body = format!(
        r#"# HELP drive_reactor_info Server information
# TYPE drive_reactor_info gauge
drive_reactor_info{{version="{version}"}} 1

# HELP drive_reactor_listeners_active Registered listeners
# TYPE drive_reactor_listeners_active gauge
drive_reactor_listeners_active {listeners}

# HELP drive_reactor_jobs_queued Jobs waiting to run
# TYPE drive_reactor_jobs_queued gauge
drive_reactor_jobs_queued {queued}

# HELP drive_reactor_storage_operations Operations in the log
# TYPE drive_reactor_storage_operations gauge
drive_reactor_storage_operations {stored}

# HELP drive_reactor_jobs_committed_total Jobs committed
# TYPE drive_reactor_jobs_committed_total counter
drive_reactor_jobs_committed_total {committed}

# HELP drive_reactor_jobs_failed_total Jobs failed
# TYPE drive_reactor_jobs_failed_total counter
drive_reactor_jobs_failed_total {failed}

# HELP drive_reactor_operations_appended_total Operations appended to the log
# TYPE drive_reactor_operations_appended_total counter
drive_reactor_operations_appended_total {appended}

# HELP drive_reactor_strands_delivered_total Strands delivered to listeners
# TYPE drive_reactor_strands_delivered_total counter
drive_reactor_strands_delivered_total {delivered}

# HELP drive_reactor_sync_requests_total Sync requests served
# TYPE drive_reactor_sync_requests_total counter
drive_reactor_sync_requests_total {sync_requests}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
