//! HTTP surface of the analytics service.

pub mod dashboard;
pub mod ingest;
pub mod params;

use std::sync::Arc;

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, Request},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::metrics;
use crate::query::MetricQueryEngine;
use crate::retention::spawn_retention_sweep;
use crate::rollup::{HotspotRollup, OverviewRollup, ServiceHealthRollup};
use crate::store::{DuckDbStore, EventStore, QueryContext};
use crate::{AnalyticsError, Result};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub config: Arc<Config>,
    pub engine: MetricQueryEngine,
    pub health: ServiceHealthRollup,
    pub overview: OverviewRollup,
    pub hotspots: HotspotRollup,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>, config: Config) -> Self {
        Self {
            engine: MetricQueryEngine::new(store.clone())
                .with_default_interval(config.default_interval_secs),
            health: ServiceHealthRollup::new(store.clone(), config.health.clone()),
            overview: OverviewRollup::new(store.clone()),
            hotspots: HotspotRollup::new(store.clone()),
            config: Arc::new(config),
            store,
        }
    }

    /// Fresh deadline for one request.
    pub fn query_context(&self) -> QueryContext {
        QueryContext::with_timeout(self.config.query_timeout)
    }
}

/// Tags every request with a random `x-request-id` unless the caller sent one.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest::ingest_batch))
        .route("/api/metrics/query", post(dashboard::query_metrics))
        .route("/api/overview", get(dashboard::overview))
        .route("/api/services/health", get(dashboard::service_health))
        .route("/api/infrastructure/hotspots", get(dashboard::hotspots))
        .route("/api/profiles/flamegraph", get(dashboard::flamegraph))
        .route("/api/logs", get(dashboard::logs))
        .route("/metrics", get(prometheus_metrics))
        .route("/health", get(health_check))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn prometheus_metrics() -> Result<impl IntoResponse> {
    let body = metrics::gather_text()?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

pub async fn serve(config: Config) -> Result<()> {
    let store: Arc<dyn EventStore> =
        Arc::new(DuckDbStore::open(&config.database_path, config.retention)?);
    let shutdown = CancellationToken::new();
    let sweep = spawn_retention_sweep(store.clone(), config.purge_interval, shutdown.clone());

    let addr = config.bind_addr();
    let app = router(AppState::new(store, config));
    info!("Starting analytics service on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AnalyticsError::Internal(format!("Failed to bind to address: {}", e)))?;

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            signal.cancel();
        })
        .await
        .map_err(|e| AnalyticsError::Internal(format!("Server error: {}", e)))?;

    shutdown.cancel();
    sweep.await?;
    Ok(())
}
