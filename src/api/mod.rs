//! HTTP surface: client endpoints, admin CRUD and server bootstrap.

pub mod admin;
pub mod chat;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::{Html, Json};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::health::EndpointHealth;
use crate::logsink::{LogSink, DEFAULT_LOG_CAP};
use crate::registry::Registry;
use crate::stats::GatewayStats;
use crate::store::Store;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub health: Arc<EndpointHealth>,
    pub dispatcher: Dispatcher,
    pub store: Arc<Store>,
    pub sink: LogSink,
    pub http: reqwest::Client,
}

impl AppState {
    /// Wire the full state from an opened store: seed pool configs, load
    /// rows into the registry and health tracker, start the log writer.
    pub async fn build(config: Config, store: Arc<Store>) -> anyhow::Result<Arc<AppState>> {
        store.seed_pool_configs(&config).await?;

        let providers = store.load_providers().await?;
        let endpoints = store.load_endpoints().await?;
        let pools = store.load_pool_configs().await?;

        let health = Arc::new(EndpointHealth::new());
        for (provider, counters) in &providers {
            health.seed_provider(provider.id, *counters);
        }
        for (endpoint, state) in &endpoints {
            health.seed(endpoint.id, state.clone());
        }

        let registry = Arc::new(Registry::new(
            providers.into_iter().map(|(p, _)| p).collect(),
            endpoints.into_iter().map(|(e, _)| e).collect(),
            pools,
        ));

        let (sink, _writer) = LogSink::spawn_writer(store.clone(), DEFAULT_LOG_CAP);

        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        let dispatcher = Dispatcher::new(
            registry.clone(),
            health.clone(),
            sink.clone(),
            http.clone(),
        );

        Ok(Arc::new(AppState {
            config,
            registry,
            health,
            dispatcher,
            store,
            sink,
            http,
        }))
    }
}

/// Assemble the router: client paths at the root, admin nested under
/// `/admin` behind the password gate.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .merge(chat::routes())
        .nest("/admin", admin::routes(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server. Bind failure surfaces as an error, giving the
/// process a non-zero exit.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&config.database_path)?);
    let port = config.port;
    let state = AppState::build(config, store).await?;
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

/// Placeholder landing page; the management UI ships separately.
async fn index() -> Html<&'static str> {
    Html("<html><body><h1>llm-api-pool</h1><p>Gateway is running. Admin API at /admin.</p></body></html>")
}

async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = GatewayStats::collect(&state.registry, &state.health, Utc::now());
    Json(json!({
        "status": "ok",
        "endpoints": stats.endpoints.len(),
        "healthy_endpoints": stats.healthy_count(),
        "total_requests": stats.total_requests,
    }))
}
