use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::params::DashboardParams;
use super::AppState;
use crate::metrics::RequestTimer;
use crate::models::{AccountId, LogRecord, MetricQuery, MetricSeries, Page, TimeWindow};
use crate::query::{search_logs, LogSearch};
use crate::rollup::{
    build_flamegraph, FlamegraphNode, FlamegraphRequest, HotspotReport, Overview, Resource,
    ServiceHealthRow, SloStatus,
};
use crate::window::Lookback;
use crate::{AnalyticsError, Result};

type RawQuery = Query<Vec<(String, String)>>;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsQueryRequest {
    pub account_id: AccountId,
    #[serde(default, alias = "window_minutes")]
    pub window: Lookback,
    pub queries: Vec<MetricQuery>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsQueryResponse {
    pub window_minutes: i64,
    pub series: Vec<MetricSeries>,
}

pub async fn query_metrics(
    State(state): State<AppState>,
    Json(request): Json<MetricsQueryRequest>,
) -> Result<Json<MetricsQueryResponse>> {
    let _timer = RequestTimer::new("metrics_query");
    if request.queries.iter().any(|q| q.metric_name.trim().is_empty()) {
        return Err(AnalyticsError::InvalidRequest(
            "every query needs a metric_name".to_string(),
        ));
    }

    let window_minutes = request.window.minutes();
    let window = TimeWindow::lookback(now_ms(), window_minutes);
    info!(
        account = %request.account_id,
        queries = request.queries.len(),
        window_minutes,
        "Resolving metric queries"
    );

    let series = state
        .engine
        .resolve(&state.query_context(), &request.account_id, window, &request.queries)
        .await?;

    Ok(Json(MetricsQueryResponse {
        window_minutes,
        series,
    }))
}

pub async fn overview(State(state): State<AppState>, Query(pairs): RawQuery) -> Result<Json<Overview>> {
    let _timer = RequestTimer::new("overview");
    let params = DashboardParams::from_pairs(pairs)?;

    let overview = state
        .overview
        .compute(
            &state.query_context(),
            &params.account,
            now_ms(),
            params.window_minutes(),
        )
        .await?;
    Ok(Json(overview))
}

pub async fn service_health(
    State(state): State<AppState>,
    Query(pairs): RawQuery,
) -> Result<Json<Page<ServiceHealthRow>>> {
    let _timer = RequestTimer::new("service_health");
    let params = DashboardParams::from_pairs(pairs)?;
    let slo_filter = params.get("slo_status").and_then(|raw| {
        let parsed = SloStatus::parse(raw);
        if parsed.is_none() {
            debug!(slo_status = raw, "Ignoring unknown slo_status filter");
        }
        parsed
    });

    let rows = state
        .health
        .compute_filtered(
            &state.query_context(),
            &params.account,
            params.window(now_ms()),
            slo_filter,
            &params.labels,
        )
        .await?;

    let total_count = rows.len() as u64;
    Ok(Json(Page {
        items: params.pagination.apply(rows),
        total_count,
        page: params.pagination.page,
        page_size: params.pagination.page_size,
    }))
}

pub async fn hotspots(State(state): State<AppState>, Query(pairs): RawQuery) -> Result<Json<HotspotReport>> {
    let _timer = RequestTimer::new("hotspots");
    let params = DashboardParams::from_pairs(pairs)?;

    let mut resources: Vec<Resource> = Vec::new();
    for resource in params
        .get("resource")
        .into_iter()
        .flat_map(|raw| raw.split(','))
        .filter_map(Resource::parse)
    {
        if !resources.contains(&resource) {
            resources.push(resource);
        }
    }
    if resources.is_empty() {
        resources = Resource::ALL.to_vec();
    }

    let mut rollup = state.hotspots.clone();
    if let Some(limit) = params.get("limit").and_then(|v| v.parse::<usize>().ok()) {
        rollup = rollup.with_top_n(limit);
    }

    let report = rollup
        .compute(
            &state.query_context(),
            &params.account,
            now_ms(),
            params.window_minutes(),
            &resources,
        )
        .await;
    Ok(Json(report))
}

pub async fn flamegraph(
    State(state): State<AppState>,
    Query(pairs): RawQuery,
) -> Result<Json<FlamegraphNode>> {
    let _timer = RequestTimer::new("flamegraph");
    let params = DashboardParams::from_pairs(pairs)?;
    let request = FlamegraphRequest {
        service: params.get("service").map(str::to_string),
        profile_type: params.get("profile_type").map(str::to_string),
    };

    let root = build_flamegraph(
        state.store.as_ref(),
        &state.query_context(),
        &params.account,
        params.window(now_ms()),
        &request,
    )
    .await?;
    Ok(Json(root))
}

pub async fn logs(State(state): State<AppState>, Query(pairs): RawQuery) -> Result<Json<Page<LogRecord>>> {
    let _timer = RequestTimer::new("logs");
    let params = DashboardParams::from_pairs(pairs)?;

    let search = LogSearch {
        account: params.account.clone(),
        window: params.window(now_ms()),
        service: params.get("service").map(str::to_string),
        severity: params.get("severity").map(str::to_string),
        filters: params.labels.clone(),
        pagination: params.pagination,
    };
    let page = search_logs(state.store.as_ref(), &state.query_context(), &search).await?;
    Ok(Json(page))
}
