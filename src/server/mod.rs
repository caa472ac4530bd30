//! HTTP surface of the relay.
//!
//! # Endpoints
//!
//! - `GET /api/v1/{domain}/{job_id}/events` - Server-sent event stream for
//!   one job: snapshot, catch-up, then live events until terminal
//! - `GET /healthz` - Liveness probe with subscriber/listener counts

use std::sync::Arc;

pub mod health;
pub mod stream;

pub use health::health_handler;
pub use stream::stream_handler;

use crate::config::RelayConfig;
use crate::gateway::BroadcastManager;

/// Shared application state, passed to handlers via axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    manager: Arc<BroadcastManager>,
    config: RelayConfig,
}

impl AppState {
    pub fn new(manager: Arc<BroadcastManager>, config: RelayConfig) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { manager, config }),
        }
    }

    pub fn manager(&self) -> &Arc<BroadcastManager> {
        &self.inner.manager
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/api/v1/{domain}/{job_id}/events", get(stream_handler))
        .route("/healthz", get(health_handler))
        .with_state(app_state)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::backend::memory::{MemoryEventStore, MemoryFanoutBus};

    fn test_app_state() -> AppState {
        let config = RelayConfig::for_tests();
        let manager = Arc::new(BroadcastManager::new(
            Arc::new(MemoryEventStore::new()),
            Arc::new(MemoryFanoutBus::new()),
            config.clone(),
        ));
        AppState::new(manager, config)
    }

    #[tokio::test]
    async fn healthz_returns_counts() {
        let app = build_router(test_app_state());

        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["subscribers"], 0);
        assert_eq!(json["listeners"], 0);
    }

    #[tokio::test]
    async fn unknown_domain_is_404() {
        let app = build_router(test_app_state());

        let request = Request::builder()
            .uri("/api/v1/nope/job-1/events")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn known_domain_opens_an_event_stream() {
        let app = build_router(test_app_state());

        let request = Request::builder()
            .uri("/api/v1/scan/job-1/events")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("text/event-stream"));
        // The body streams until terminal/timeout; don't consume it here.
    }
}
