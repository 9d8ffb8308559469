use crate::channels::messenger::{
    extract_inbound_messages, is_page_payload, verify_signature, SIGNATURE_HEADER,
};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const WEBHOOK_PATH: &str = "/webhook/messenger";

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode", default)]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token", default)]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge", default)]
    challenge: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(WEBHOOK_PATH, get(verify_webhook).post(receive_webhook))
}

async fn verify_webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let expected = non_empty(state.config.messenger.verify_token.as_deref());
    let subscribe = query.mode.as_deref() == Some("subscribe");
    let token_matches = match (expected, non_empty(query.verify_token.as_deref())) {
        (Some(expected), Some(given)) => expected == given,
        _ => false,
    };
    if subscribe && token_matches {
        info!("messenger webhook verified");
        return (StatusCode::OK, query.challenge.unwrap_or_default()).into_response();
    }
    warn!("messenger webhook verification rejected");
    error_response(StatusCode::FORBIDDEN, "verification failed")
}

async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = non_empty(state.config.messenger.app_secret.as_deref()) {
        let valid = header_string(&headers, SIGNATURE_HEADER)
            .map(|signature| verify_signature(&body, &signature, secret))
            .unwrap_or(false);
        if !valid {
            warn!("messenger webhook signature mismatch");
            return error_response(StatusCode::UNAUTHORIZED, "invalid signature");
        }
    }
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid json body"),
    };
    if !is_page_payload(&payload) {
        return error_response(StatusCode::NOT_FOUND, "unsupported object");
    }
    let messages = match extract_inbound_messages(&payload) {
        Ok(messages) => messages,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    if messages.is_empty() {
        debug!("messenger webhook without user messages");
    } else {
        let count = messages.len();
        match state.queue.enqueue(messages).await {
            Ok(job_id) => debug!("messenger job queued: id={job_id}, messages={count}"),
            Err(err) => {
                warn!("enqueue messenger job failed: {err}");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "queue unavailable");
            }
        }
    }
    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn header_string(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": { "message": message } }))).into_response()
}
