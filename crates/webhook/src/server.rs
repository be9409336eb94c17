//! The HTTP ingress: one `POST /webhook` route, everything else 404.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use store::TaskStore;
use telemetry::{audit, metrics, with_trace_id};

use crate::events::{validate, EventKind};
use crate::handlers::{process_event, WebhookHooks};
use crate::verify::{verify_signature, EVENT_HEADER, SIGNATURE_HEADER};

/// Ingress configuration.
#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    /// Shared HMAC secret; requests are unauthenticated when absent.
    pub secret: Option<String>,
    /// Refuse to serve without a secret (production deployments).
    pub require_secret: bool,
    /// Logins treated as review bots for the auto-fix path.
    pub review_bot_users: Vec<String>,
}

impl WebhookConfig {
    #[must_use]
    pub fn is_review_bot(&self, login: &str) -> bool {
        self.review_bot_users
            .iter()
            .any(|user| user.eq_ignore_ascii_case(login))
    }

    /// Startup check: a deployment that requires a secret must have one.
    pub fn validate(&self) -> Result<(), String> {
        if self.require_secret && self.secret.is_none() {
            return Err(
                "webhook secret required but not configured (set SQUIRE_WEBHOOK_SECRET)"
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Shared state behind the ingress routes.
pub struct WebhookState {
    pub store: TaskStore,
    pub config: WebhookConfig,
    pub hooks: Arc<dyn WebhookHooks>,
}

/// Build the ingress router. Wrong paths and wrong methods are both 404.
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .method_not_allowed_fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
}

async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let request_id = Uuid::new_v4().simple().to_string();
    let started = Instant::now();

    let (status, response) = with_trace_id(
        request_id.clone(),
        receive(state, request_id.clone(), headers, body),
    )
    .await;

    metrics().inc_counter(
        "squire_api_requests_total",
        &[("path", "/webhook"), ("status", status.as_str())],
    );
    metrics().observe_histogram(
        "squire_api_request_duration_seconds",
        &[("path", "/webhook")],
        started.elapsed().as_secs_f64(),
    );
    (status, Json(response))
}

async fn receive(
    state: Arc<WebhookState>,
    request_id: String,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Value) {
    let event_header = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    if state.config.require_secret && state.config.secret.is_none() {
        audit(
            "webhook",
            "rejected_misconfigured",
            &json!({ "request_id": request_id }),
        );
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "webhook secret required but not configured" }),
        );
    }

    if let Some(secret) = &state.config.secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(&body, signature, secret) {
            audit(
                "webhook",
                "signature_rejected",
                &json!({
                    "request_id": request_id,
                    "event": event_header,
                    "had_signature": !signature.is_empty(),
                }),
            );
            return (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "invalid signature" }),
            );
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(request_id, error = %e, "webhook body is not valid JSON");
            audit(
                "webhook",
                "rejected_invalid_json",
                &json!({ "request_id": request_id, "event": event_header }),
            );
            return (
                StatusCode::BAD_REQUEST,
                json!({ "error": "request body is not valid JSON" }),
            );
        }
    };

    let Some(kind) = EventKind::from_header(&event_header) else {
        // Unknown kinds are accepted without action.
        audit(
            "webhook",
            "accepted_ignored",
            &json!({ "request_id": request_id, "event": event_header }),
        );
        return (
            StatusCode::OK,
            json!({ "status": "ignored", "reason": "unhandled_event_kind" }),
        );
    };

    if let Err(e) = validate(kind, &payload) {
        audit(
            "webhook",
            "rejected_schema_invalid",
            &json!({
                "request_id": request_id,
                "event": event_header,
                "path": e.path,
            }),
        );
        return (StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }));
    }

    let response = process_event(&state, kind, &payload).await;
    audit(
        "webhook",
        "accepted",
        &json!({
            "request_id": request_id,
            "event": kind.as_str(),
            "action": payload.get("action"),
        }),
    );
    (StatusCode::OK, response)
}
