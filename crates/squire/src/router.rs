//! The server's HTTP surface: webhook ingress plus observability routes.

use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use telemetry::metrics;
use webhook::{webhook_router, WebhookState};

/// Full application router: `POST /webhook`, `GET /metrics`, `GET /health`.
pub fn app_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .merge(webhook_router(state))
}

/// Prometheus text exposition of the process registry.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics().export(),
    )
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
