//! Admin surface: CRUD over providers, endpoints and pool configs, stats,
//! log paging, and the upstream model-list probe. Every route requires the
//! shared admin password as a bearer token or `admin_token` cookie.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::error::GatewayError;
use crate::registry::{ApiFormat, Endpoint, PoolTag, Provider};
use crate::stats::GatewayStats;
use crate::store::LogFilter;

pub fn routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/providers", get(list_providers).post(create_provider))
        .route(
            "/providers/:id",
            get(get_provider).put(update_provider).delete(delete_provider),
        )
        .route("/providers/:id/fetch-models", post(fetch_models))
        .route("/endpoints", get(list_endpoints).post(create_endpoint))
        .route("/endpoints/batch", post(batch_create_endpoints))
        .route("/endpoints/:id", put(update_endpoint).delete(delete_endpoint))
        .route("/pools", get(list_pools))
        .route("/pools/:tag/config", put(update_pool_config))
        .route("/stats", get(stats))
        .route("/logs", get(page_logs).delete(clear_logs))
        .layer(middleware::from_fn_with_state(state, require_admin))
}

async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let password = &state.config.admin_password;
    let headers = request.headers();

    let bearer_ok = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t == password)
        .unwrap_or(false);
    let cookie_ok = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|cookies| {
            cookies
                .split(';')
                .any(|kv| kv.trim() == format!("admin_token={}", password))
        })
        .unwrap_or(false);

    if !bearer_ok && !cookie_ok {
        return error(StatusCode::UNAUTHORIZED, "Invalid admin credentials");
    }
    next.run(request).await
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

fn store_error(err: GatewayError) -> Response {
    let message = err.to_string();
    if message.contains("UNIQUE constraint") {
        error(StatusCode::CONFLICT, message)
    } else {
        error(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

// ─── Providers ──────────────────────────────────────────────────────────────

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Vec<Provider>> {
    Json(state.registry.list_providers())
}

async fn get_provider(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.registry.get_provider(id) {
        Some(provider) => Json(provider).into_response(),
        None => error(StatusCode::NOT_FOUND, "provider not found"),
    }
}

#[derive(Deserialize)]
struct CreateProvider {
    name: String,
    base_url: String,
    api_key: String,
    api_format: ApiFormat,
}

async fn create_provider(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateProvider>,
) -> Response {
    if let Err(e) = url::Url::parse(&body.base_url) {
        return error(StatusCode::BAD_REQUEST, format!("invalid base_url: {}", e));
    }
    match state
        .store
        .create_provider(&body.name, &body.base_url, &body.api_key, body.api_format)
        .await
    {
        Ok(provider) => {
            info!(provider = %provider.name, id = provider.id, "Provider created");
            state.registry.insert_provider(provider.clone());
            (StatusCode::CREATED, Json(provider)).into_response()
        }
        Err(e) => store_error(e),
    }
}

#[derive(Deserialize)]
struct UpdateProvider {
    name: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    api_format: Option<ApiFormat>,
    enabled: Option<bool>,
}

async fn update_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateProvider>,
) -> Response {
    let Some(mut provider) = state.registry.get_provider(id) else {
        return error(StatusCode::NOT_FOUND, "provider not found");
    };
    if let Some(name) = body.name {
        provider.name = name;
    }
    if let Some(base_url) = body.base_url {
        if let Err(e) = url::Url::parse(&base_url) {
            return error(StatusCode::BAD_REQUEST, format!("invalid base_url: {}", e));
        }
        provider.base_url = base_url;
    }
    if let Some(api_key) = body.api_key {
        provider.api_key = api_key;
    }
    if let Some(api_format) = body.api_format {
        provider.api_format = api_format;
    }
    if let Some(enabled) = body.enabled {
        provider.enabled = enabled;
    }

    match state.store.update_provider(&provider).await {
        Ok(true) => {
            state.registry.update_provider(provider.clone());
            Json(provider).into_response()
        }
        Ok(false) => error(StatusCode::NOT_FOUND, "provider not found"),
        Err(e) => store_error(e),
    }
}

async fn delete_provider(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.store.delete_provider(id).await {
        Ok(true) => {
            if let Some(endpoint_ids) = state.registry.remove_provider(id) {
                for endpoint_id in endpoint_ids {
                    state.health.remove(endpoint_id);
                }
            }
            state.health.remove_provider(id);
            info!(id, "Provider deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error(StatusCode::NOT_FOUND, "provider not found"),
        Err(e) => store_error(e),
    }
}

/// Probe the upstream for its model catalogue. The result is returned
/// verbatim for the UI to drive a batch-create; nothing is persisted.
async fn fetch_models(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    let Some(provider) = state.registry.get_provider(id) else {
        return error(StatusCode::NOT_FOUND, "provider not found");
    };

    let base = provider.base_url.trim_end_matches('/');
    let request = match provider.api_format {
        ApiFormat::OpenAi => state
            .http
            .get(format!("{}/models", base))
            .header("Authorization", format!("Bearer {}", provider.api_key)),
        ApiFormat::Anthropic => {
            let url = if base.ends_with("/v1") {
                format!("{}/models", base)
            } else {
                format!("{}/v1/models", base)
            };
            state
                .http
                .get(url)
                .header("x-api-key", &provider.api_key)
                .header("anthropic-version", "2023-06-01")
        }
    };

    match request.send().await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            match response.json::<Value>().await {
                Ok(body) => (status, Json(body)).into_response(),
                Err(e) => error(StatusCode::BAD_GATEWAY, e.to_string()),
            }
        }
        Err(e) => error(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

// ─── Endpoints ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EndpointListQuery {
    pool: Option<String>,
    provider_id: Option<i64>,
}

async fn list_endpoints(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EndpointListQuery>,
) -> Response {
    let pool = match query.pool.as_deref().map(PoolTag::from_str).transpose() {
        Ok(pool) => pool,
        Err(e) => return error(StatusCode::BAD_REQUEST, e),
    };
    let endpoints = state.registry.list_endpoints(crate::registry::EndpointFilter {
        pool,
        provider_id: query.provider_id,
    });
    Json(endpoints).into_response()
}

#[derive(Deserialize)]
struct CreateEndpoint {
    provider_id: i64,
    upstream_model: String,
    pool: PoolTag,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_weight")]
    weight: u32,
    #[serde(default)]
    min_interval_secs: u32,
    #[serde(default)]
    priority: i32,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

async fn create_endpoint(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateEndpoint>,
) -> Response {
    if state.registry.get_provider(body.provider_id).is_none() {
        return error(StatusCode::NOT_FOUND, "provider not found");
    }
    if state
        .registry
        .endpoint_exists(body.provider_id, &body.upstream_model, body.pool)
    {
        return error(StatusCode::CONFLICT, "endpoint already exists in this pool");
    }

    let draft = Endpoint {
        id: 0,
        provider_id: body.provider_id,
        upstream_model: body.upstream_model,
        pool: body.pool,
        enabled: body.enabled,
        weight: body.weight.max(1),
        min_interval_secs: body.min_interval_secs,
        priority: body.priority,
    };
    match state.store.create_endpoint(draft).await {
        Ok(endpoint) => {
            state.registry.insert_endpoint(endpoint.clone());
            (StatusCode::CREATED, Json(endpoint)).into_response()
        }
        Err(e) => store_error(e),
    }
}

#[derive(Deserialize)]
struct BatchCreateEndpoints {
    provider_id: i64,
    pool: PoolTag,
    models: Vec<String>,
    #[serde(default = "default_weight")]
    weight: u32,
}

/// Create several endpoints for one `(provider, pool)`, skipping models
/// already placed there.
async fn batch_create_endpoints(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchCreateEndpoints>,
) -> Response {
    if state.registry.get_provider(body.provider_id).is_none() {
        return error(StatusCode::NOT_FOUND, "provider not found");
    }

    let mut created = Vec::new();
    let mut skipped = Vec::new();
    for model in body.models {
        if state
            .registry
            .endpoint_exists(body.provider_id, &model, body.pool)
        {
            skipped.push(model);
            continue;
        }
        let draft = Endpoint::new(0, body.provider_id, model.clone(), body.pool)
            .with_weight(body.weight);
        match state.store.create_endpoint(draft).await {
            Ok(endpoint) => {
                state.registry.insert_endpoint(endpoint.clone());
                created.push(endpoint);
            }
            Err(_) => skipped.push(model),
        }
    }
    info!(
        provider_id = body.provider_id,
        pool = %body.pool,
        created = created.len(),
        skipped = skipped.len(),
        "Batch endpoint create"
    );
    Json(json!({"created": created, "skipped": skipped})).into_response()
}

#[derive(Deserialize)]
struct UpdateEndpoint {
    enabled: Option<bool>,
    weight: Option<u32>,
    min_interval_secs: Option<u32>,
    priority: Option<i32>,
}

async fn update_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateEndpoint>,
) -> Response {
    let Some(mut endpoint) = state.registry.get_endpoint(id) else {
        return error(StatusCode::NOT_FOUND, "endpoint not found");
    };
    if let Some(enabled) = body.enabled {
        endpoint.enabled = enabled;
    }
    if let Some(weight) = body.weight {
        endpoint.weight = weight.max(1);
    }
    if let Some(min_interval_secs) = body.min_interval_secs {
        endpoint.min_interval_secs = min_interval_secs;
    }
    if let Some(priority) = body.priority {
        endpoint.priority = priority;
    }

    match state.store.update_endpoint(&endpoint).await {
        Ok(true) => {
            state.registry.update_endpoint(endpoint.clone());
            Json(endpoint).into_response()
        }
        Ok(false) => error(StatusCode::NOT_FOUND, "endpoint not found"),
        Err(e) => store_error(e),
    }
}

async fn delete_endpoint(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.store.delete_endpoint(id).await {
        Ok(true) => {
            state.registry.remove_endpoint(id);
            state.health.remove(id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error(StatusCode::NOT_FOUND, "endpoint not found"),
        Err(e) => store_error(e),
    }
}

// ─── Pools ──────────────────────────────────────────────────────────────────

async fn list_pools(State(state): State<Arc<AppState>>) -> Json<Value> {
    let pools: Vec<Value> = state
        .registry
        .pool_configs()
        .into_iter()
        .map(|(tag, config)| json!({"pool": tag, "config": config}))
        .collect();
    Json(json!(pools))
}

#[derive(Deserialize)]
struct UpdatePoolConfig {
    virtual_model: Option<String>,
    cooldown_secs: Option<u64>,
    timeout_secs: Option<u64>,
    /// Missing leaves the cap unchanged; explicit null clears it.
    #[serde(default)]
    max_retries: Option<Option<u32>>,
}

/// Changing cooldown applies to subsequent failures only; cooldowns already
/// scheduled keep their original expiry.
async fn update_pool_config(
    State(state): State<Arc<AppState>>,
    Path(tag): Path<String>,
    Json(body): Json<UpdatePoolConfig>,
) -> Response {
    let tag = match PoolTag::from_str(&tag) {
        Ok(tag) => tag,
        Err(e) => return error(StatusCode::BAD_REQUEST, e),
    };
    let mut config = state.registry.pool_config(tag);
    if let Some(virtual_model) = body.virtual_model {
        config.virtual_model = virtual_model;
    }
    if let Some(cooldown_secs) = body.cooldown_secs {
        config.cooldown_secs = cooldown_secs;
    }
    if let Some(timeout_secs) = body.timeout_secs {
        config.timeout_secs = timeout_secs;
    }
    if let Some(max_retries) = body.max_retries {
        config.max_retries = max_retries;
    }

    match state.store.set_pool_config(tag, &config).await {
        Ok(()) => {
            state.registry.set_pool_config(tag, config.clone());
            Json(json!({"pool": tag, "config": config})).into_response()
        }
        Err(e) => store_error(e),
    }
}

// ─── Stats and logs ─────────────────────────────────────────────────────────

async fn stats(State(state): State<Arc<AppState>>) -> Json<GatewayStats> {
    Json(GatewayStats::collect(
        &state.registry,
        &state.health,
        Utc::now(),
    ))
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(default)]
    offset: u64,
    limit: Option<u64>,
    pool: Option<String>,
    success: Option<bool>,
    provider: Option<String>,
}

async fn page_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Response {
    let pool = match query.pool.as_deref().map(PoolTag::from_str).transpose() {
        Ok(pool) => pool,
        Err(e) => return error(StatusCode::BAD_REQUEST, e),
    };
    let filter = LogFilter {
        pool,
        success: query.success,
        provider_name: query.provider,
    };
    let limit = query.limit.unwrap_or(100).min(1000);

    match state.store.page_logs(&filter, query.offset, limit).await {
        Ok((entries, total)) => {
            let entries: Vec<Value> = entries
                .into_iter()
                .map(|e| {
                    let created_at =
                        ensure_utc_suffix(e.created_at.to_rfc3339_opts(SecondsFormat::Millis, true));
                    let mut value = serde_json::to_value(&e).unwrap_or_default();
                    value["created_at"] = json!(created_at);
                    value
                })
                .collect();
            Json(json!({"total": total, "entries": entries})).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn clear_logs(State(state): State<Arc<AppState>>) -> Response {
    match state.store.clear_logs().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error(e),
    }
}

/// The store formats timestamps in UTC; attach the `Z` marker if a stored
/// value lost it.
fn ensure_utc_suffix(timestamp: String) -> String {
    if timestamp.ends_with('Z') || timestamp.contains('+') {
        timestamp
    } else {
        format!("{}Z", timestamp)
    }
}
