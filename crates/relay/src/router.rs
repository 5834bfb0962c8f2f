//! HTTP surface: the viewer signaling WebSocket, the health endpoint, and
//! the optional static frontend.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use relay_protocol::RelayConfig;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::subscriber;

pub fn build_router(state: Arc<AppState>, config: &RelayConfig) -> Router {
    let mut router = Router::new()
        .route("/v1/broadcast/signal", get(subscriber::signal_ws_upgrade))
        .route("/healthz", get(health))
        .with_state(state);

    if config.webrtc.enable_frontend {
        router = router.fallback_service(tower_http::services::ServeDir::new("web/dist"));
    }

    router.layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": state.registry.len_for_health().await,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(
            &RelayConfig::default(),
            tokio_util::sync::CancellationToken::new(),
        ))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok_and_zero_sessions() {
        let config = RelayConfig::default();
        let app = build_router(test_state(), &config);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found_without_frontend() {
        let config = RelayConfig::default();
        let app = build_router(test_state(), &config);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/does-not-exist")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
