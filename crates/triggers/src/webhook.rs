//! Webhook trigger: a loopback-only HTTP endpoint that turns signed POST
//! bodies into events.
//!
//! Request discipline, in order: configured method only (405), token-bucket
//! rate limit (429), 1 MiB body cap via `content-length` and the actual read
//! (413), HMAC-SHA256 signature in `X-Hub-Signature-256` when a secret is
//! configured (403, constant-time compare).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Json;
use axum::routing::any;
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tracing::{error, info, warn};

use vigil_config::WebhookTriggerConfig;

use crate::rate_limit::TokenBucketRateLimiter;
use crate::{EventSender, TriggerEvent};

const MAX_BODY_BYTES: usize = 1_048_576; // 1 MiB

struct WebhookState {
    config: WebhookTriggerConfig,
    secret: String,
    limiter: TokenBucketRateLimiter,
    events: EventSender,
}

fn json_error(status: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}

fn signature_matches(secret: &str, body: &[u8], header: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = format!("sha256={:x}", mac.finalize().into_bytes());
    expected.as_bytes().ct_eq(header.as_bytes()).into()
}

async fn respond(
    state: &WebhookState,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    if method.as_str() != state.config.method.to_uppercase() {
        return json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    if !state.limiter.allow() {
        return json_error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
    }

    if let Some(length) = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > MAX_BODY_BYTES {
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
        }
    }
    if body.len() > MAX_BODY_BYTES {
        return json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
    }

    if !state.secret.is_empty() {
        let header = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !signature_matches(&state.secret, &body, header) {
            warn!("webhook request rejected: invalid signature");
            return json_error(StatusCode::FORBIDDEN, "invalid signature");
        }
    }

    let prompt = String::from_utf8_lossy(&body).into_owned();
    let event = TriggerEvent::new("webhook", prompt).with_metadata("path", &state.config.path);
    if state.events.send(event).await.is_err() {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn handle(
    State(state): State<Arc<WebhookState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    respond(&state, &method, &headers, body).await
}

pub(crate) async fn run(
    config: WebhookTriggerConfig,
    events: EventSender,
    mut stop: watch::Receiver<bool>,
) {
    let secret = config.secret_or_generated();
    let state = Arc::new(WebhookState {
        limiter: TokenBucketRateLimiter::from_rpm(config.rate_limit_rpm),
        secret,
        events,
        config: config.clone(),
    });

    let app = Router::new()
        .route(&config.path, any(handle))
        // The handler enforces the 1 MiB cap itself so oversized bodies get
        // the JSON error envelope; leave a little slack above it here.
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES * 2))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await {
        Ok(l) => l,
        Err(err) => {
            error!(port = config.port, %err, "webhook port bind failed, trigger not started");
            return;
        }
    };
    info!(port = config.port, path = %config.path, "webhook listening on loopback");

    let shutdown = async move {
        crate::stopped(&mut stop).await;
    };
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(%err, "webhook server error");
    }
}
