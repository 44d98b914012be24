//! HTTP endpoints for the reactor.
//!
//! Provides health checks, metrics, and the `/sync` endpoint remote
//! channels talk to.

pub mod health;
mod metrics;

use crate::service::SyncService;
use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Content type of `/sync` requests and responses.
pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// Build the HTTP router with all endpoints.
pub fn build_router(service: Arc<SyncService>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health_handler))
        .route("/sync", post(sync_handler));
    if service.reactor().config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(service))
}

/// One MessagePack request in, one MessagePack response out.
///
/// Protocol errors are answered with a `Message::Error` body and status 200.
async fn sync_handler(Extension(service): Extension<Arc<SyncService>>, body: Bytes) -> impl IntoResponse {
    let response = service.handle_bytes(&body).await;
    ([(CONTENT_TYPE, MSGPACK_CONTENT_TYPE)], response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reactor::Reactor;
    use crate::storage::{OperationStore, SqliteStorage};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use reactor_types::{DriveId, ListenerFilter, Message, RegisterListener};
    use tower::util::ServiceExt;

    async fn test_service(config: Config) -> Arc<SyncService> {
        let storage: Arc<dyn OperationStore> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let reactor = Reactor::builder(config).storage(storage).build().await.unwrap();
        Arc::new(SyncService::new(Arc::new(reactor)))
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = build_router(test_service(Config::default()).await);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["storage"], "ok");
        assert_eq!(body["view_ordinal"], 0);
        assert_eq!(body["push_backlog"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let app = build_router(test_service(Config::default()).await);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(body.contains("drive_reactor_jobs_committed_total 0"));
    }

    #[tokio::test]
    async fn metrics_endpoint_can_be_disabled() {
        let mut config = Config::default();
        config.http.metrics_enabled = false;
        let app = build_router(test_service(config).await);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_endpoint_speaks_msgpack() {
        let service = test_service(Config::default()).await;
        let app = build_router(Arc::clone(&service));

        let request = Message::RegisterListener(RegisterListener {
            drive_id: DriveId::from("drive"),
            filter: ListenerFilter::default(),
            backfill: false,
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync")
                    .header(CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
                    .body(Body::from(request.to_bytes().unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], MSGPACK_CONTENT_TYPE);
        let reply = Message::from_bytes(&body_bytes(response).await).unwrap();
        assert!(matches!(reply, Message::ListenerRegistered(_)));
        assert_eq!(service.reactor().emitter().listeners().len(), 1);
    }

    #[tokio::test]
    async fn sync_endpoint_rejects_get() {
        let app = build_router(test_service(Config::default()).await);

        let response = app
            .oneshot(Request::builder().uri("/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
