//! Client-facing chat endpoints.
//!
//! `/v1/chat/completions` accepts the OpenAI shape, `/v1/messages` the
//! Anthropic shape; either may be routed to either kind of upstream. Any
//! non-empty `Authorization` (or `x-api-key`) header is accepted; the value
//! is not validated.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use super::AppState;
use crate::dispatch::DispatchReply;
use crate::error::GatewayError;
use crate::registry::ApiFormat;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1/models", get(list_models))
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, ApiFormat::OpenAi, headers, body).await
}

async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, ApiFormat::Anthropic, headers, body).await
}

async fn handle(
    state: Arc<AppState>,
    format: ApiFormat,
    headers: HeaderMap,
    body: Value,
) -> Response {
    if !client_authorized(&headers) {
        return error_response(
            format,
            StatusCode::UNAUTHORIZED,
            "Missing authorization header",
            "authentication_error",
        );
    }

    match state.dispatcher.dispatch(format, body).await {
        Ok(DispatchReply::Json(value)) => Json(value).into_response(),
        Ok(DispatchReply::Stream(stream)) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            (StatusCode::OK, headers, Body::from_stream(stream)).into_response()
        }
        Err(err) => gateway_error_response(format, err),
    }
}

/// Virtual models, presented as an OpenAI-style model list.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let created = Utc::now().timestamp();
    let data: Vec<Value> = state
        .registry
        .virtual_model_names()
        .into_iter()
        .map(|name| {
            json!({
                "id": name,
                "object": "model",
                "created": created,
                "owned_by": "llm-api-pool",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

fn client_authorized(headers: &HeaderMap) -> bool {
    let non_empty = |name: header::HeaderName| {
        headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    };
    non_empty(header::AUTHORIZATION)
        || headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
}

fn gateway_error_response(format: ApiFormat, err: GatewayError) -> Response {
    let (status, code) = match &err {
        GatewayError::UnknownModel(_) => (StatusCode::BAD_REQUEST, "model_not_found"),
        GatewayError::Translation(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
        GatewayError::PoolEmpty(_) => (StatusCode::SERVICE_UNAVAILABLE, "pool_empty"),
        GatewayError::AllCandidatesFailed { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "all_candidates_failed")
        }
        GatewayError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    error_response(format, status, &err.to_string(), code)
}

/// Error body in the client's own wire format.
fn error_response(format: ApiFormat, status: StatusCode, message: &str, code: &str) -> Response {
    let body = match format {
        ApiFormat::OpenAi => json!({
            "error": {"message": message, "type": "error", "code": code}
        }),
        ApiFormat::Anthropic => json!({
            "type": "error",
            "error": {"type": code, "message": message}
        }),
    };
    (status, Json(body)).into_response()
}
