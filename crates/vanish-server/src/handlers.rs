use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::{
    error::BrokerError,
    render,
    store::{now_millis, AuditQuery, Payload},
    AppState,
};

/// Largest accepted secret payload.
pub const MAX_CONTENT_BYTES: usize = 1_048_576;

// ── Front door ───────────────────────────────────────────────────────────────

fn page(status: StatusCode, body: String) -> Response {
    (
        status,
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::REFERRER_POLICY, "no-referrer"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Html(body),
    )
        .into_response()
}

pub async fn index() -> Response {
    page(StatusCode::OK, render::INDEX_PAGE.to_owned())
}

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Constant body for absent secrets in the JSON representation.
pub const NOT_AVAILABLE_JSON: &str = r#"{"error":"not available"}"#;

#[derive(Serialize, Deserialize)]
pub struct RevealedBody {
    pub content: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub burned: bool,
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"))
}

fn json_page(status: StatusCode, body: String) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "no-store"),
            (header::REFERRER_POLICY, "no-referrer"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body,
    )
        .into_response()
}

/// `GET /view/{handle}`: reveal once, or render the single not-available page.
/// Clients sending `Accept: application/json` get the same outcome as JSON.
pub async fn view_secret(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    headers: HeaderMap,
) -> Response {
    let json = wants_json(&headers);
    match state.broker.retrieve_and_burn(&handle) {
        Ok(Some(revealed)) if json => {
            let body = RevealedBody {
                content: String::from_utf8_lossy(revealed.payload.as_bytes()).into_owned(),
                created_at: revealed.created_at,
                expires_at: revealed.expires_at,
                burned: revealed.burned,
            };
            match serde_json::to_string(&body) {
                Ok(text) => json_page(StatusCode::OK, text),
                Err(e) => {
                    error!(error = %e, "encode revealed secret");
                    json_page(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        r#"{"error":"internal server error"}"#.to_owned(),
                    )
                }
            }
        }
        Ok(Some(revealed)) => page(StatusCode::OK, render::secret_page(&revealed)),
        Ok(None) if json => json_page(StatusCode::NOT_FOUND, NOT_AVAILABLE_JSON.to_owned()),
        Ok(None) => page(StatusCode::NOT_FOUND, render::NOT_AVAILABLE_PAGE.to_owned()),
        Err(e) => {
            error!(error = %e, "retrieval failed");
            if json {
                json_page(
                    StatusCode::SERVICE_UNAVAILABLE,
                    r#"{"error":"temporarily unavailable"}"#.to_owned(),
                )
            } else {
                page(
                    StatusCode::SERVICE_UNAVAILABLE,
                    render::TEMPORARILY_UNAVAILABLE_PAGE.to_owned(),
                )
            }
        }
    }
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct CreateRequest {
    pub content: String,
    pub ttl_seconds: Option<u64>,
    pub burn_after_reading: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub handle: String,
    pub url: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

pub async fn create_secret(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> Response {
    if body.content.is_empty() {
        return bad_request("content must not be empty");
    }
    if body.content.len() > MAX_CONTENT_BYTES {
        return bad_request("content exceeds 1 MiB limit");
    }

    let ttl = body
        .ttl_seconds
        .map(Duration::from_secs)
        .unwrap_or(state.policy.default_ttl);
    if ttl.is_zero() || ttl > state.policy.max_ttl {
        return bad_request(&format!(
            "ttl_seconds must be between 1 and {}",
            state.policy.max_ttl.as_secs()
        ));
    }
    let burn = body
        .burn_after_reading
        .unwrap_or(state.policy.burn_after_reading);

    match state.broker.create(Payload::from(body.content), ttl, burn) {
        Ok(created) => {
            info!(
                handle = %created.handle.fingerprint(),
                ttl_seconds = ttl.as_secs(),
                burn_after_reading = burn,
                "secret created"
            );
            let url = state.view_url(created.handle.as_str());
            (
                StatusCode::CREATED,
                Json(CreateResponse {
                    handle: created.handle.as_str().to_owned(),
                    url,
                    expires_at: created.expires_at,
                }),
            )
                .into_response()
        }
        Err(BrokerError::InvalidTtl) => bad_request("ttl_seconds is out of range"),
        Err(e) => store_unavailable(e),
    }
}

// ── Revoke ────────────────────────────────────────────────────────────────────

/// `DELETE /secrets/{handle}`. Idempotent: unknown handles also get 204.
pub async fn revoke_secret(State(state): State<AppState>, Path(handle): Path<String>) -> Response {
    match state.broker.revoke(&handle) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_unavailable(e),
    }
}

// ── Prune ─────────────────────────────────────────────────────────────────────

pub async fn prune_secrets(State(state): State<AppState>) -> Response {
    match state.broker.sweep_expired(now_millis()) {
        Ok(n) => Json(json!({"swept": n})).into_response(),
        Err(e) => store_unavailable(e),
    }
}

// ── Audit query ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    pub limit: Option<usize>,
}

pub async fn audit_events(
    State(state): State<AppState>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    let query = AuditQuery {
        since: params.since,
        until: params.until,
        action: params.action,
        limit: params.limit.unwrap_or(100).min(1000),
    };
    match state.broker.audit().query(&query) {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => {
            error!(error = %e, "audit query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
}

fn store_unavailable(e: BrokerError) -> Response {
    error!(error = %e, "secret store failure");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "secret store unavailable"})),
    )
        .into_response()
}
