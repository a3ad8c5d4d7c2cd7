//! Per-service health and SLO rollup.
//!
//! Metrics and traces are aggregated independently, then left-joined on the
//! metrics side's service list. Rows are rebuilt from scratch on every call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{AccountId, EventKind, LabelMap, TimeWindow};
use crate::query::FilterSet;
use crate::store::{Aggregate, AggregateRow, EventStore, Field, Predicate, QueryContext, RangeQuery, Term};
use crate::Result;

pub const REQUEST_METRIC: &str = "http.server.request.duration";
pub const STATUS_LABEL: &str = "status";
pub const POD_ATTRIBUTE: &str = "k8s.pod.name";
pub const SPAN_OK_STATUS: &str = "OK";

/// (key in `runtime_metrics`, source metric name)
pub const RUNTIME_GAUGES: [(&str, &str); 6] = [
    ("heap_usage", "runtime.heap.usage"),
    ("gc_time", "runtime.gc.time"),
    ("event_loop_lag", "runtime.event_loop.lag"),
    ("thread_lock_wait", "runtime.thread.lock_wait"),
    ("exception_rate", "runtime.exception.rate"),
    ("heap_fragmentation", "runtime.heap.fragmentation"),
];

pub const CRITICAL_ERROR_RATE: f64 = 5.0;
pub const WARNING_ERROR_RATE: f64 = 1.0;
pub const CRITICAL_P95_MS: f64 = 1000.0;
pub const WARNING_P95_MS: f64 = 500.0;
pub const AVAILABILITY_BASELINE: f64 = 99.9;
pub const LATENCY_COMPLIANCE_FULL: f64 = 100.0;
pub const LATENCY_COMPLIANCE_DEGRADED: f64 = 95.0;
pub const LATENCY_COMPLIANCE_POOR: f64 = 85.0;
pub const SLO_BREACH_SUCCESS_RATE: f64 = 95.0;
pub const SLO_BREACH_AVAILABILITY: f64 = 95.0;
pub const SLO_BREACH_LATENCY_COMPLIANCE: f64 = 90.0;
pub const SLO_WARN_SUCCESS_RATE: f64 = 99.0;
pub const SLO_WARN_AVAILABILITY: f64 = 99.0;
pub const SLO_WARN_LATENCY_COMPLIANCE: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SloStatus {
    Meeting,
    Warning,
    Breaching,
}

impl SloStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "meeting" => Some(SloStatus::Meeting),
            "warning" => Some(SloStatus::Warning),
            "breaching" => Some(SloStatus::Breaching),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloBlock {
    pub success_rate: f64,
    pub availability: f64,
    pub latency_compliance: f64,
    pub status: SloStatus,
}

/// Thresholds behind status and SLO classification. Defaults are the
/// module constants; configuration may override any of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    pub critical_error_rate: f64,
    pub warning_error_rate: f64,
    pub critical_p95_ms: f64,
    pub warning_p95_ms: f64,
    pub availability_baseline: f64,
    pub latency_compliance_full: f64,
    pub latency_compliance_degraded: f64,
    pub latency_compliance_poor: f64,
    pub breach_success_rate: f64,
    pub breach_availability: f64,
    pub breach_latency_compliance: f64,
    pub warn_success_rate: f64,
    pub warn_availability: f64,
    pub warn_latency_compliance: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            critical_error_rate: CRITICAL_ERROR_RATE,
            warning_error_rate: WARNING_ERROR_RATE,
            critical_p95_ms: CRITICAL_P95_MS,
            warning_p95_ms: WARNING_P95_MS,
            availability_baseline: AVAILABILITY_BASELINE,
            latency_compliance_full: LATENCY_COMPLIANCE_FULL,
            latency_compliance_degraded: LATENCY_COMPLIANCE_DEGRADED,
            latency_compliance_poor: LATENCY_COMPLIANCE_POOR,
            breach_success_rate: SLO_BREACH_SUCCESS_RATE,
            breach_availability: SLO_BREACH_AVAILABILITY,
            breach_latency_compliance: SLO_BREACH_LATENCY_COMPLIANCE,
            warn_success_rate: SLO_WARN_SUCCESS_RATE,
            warn_availability: SLO_WARN_AVAILABILITY,
            warn_latency_compliance: SLO_WARN_LATENCY_COMPLIANCE,
        }
    }
}

impl HealthPolicy {
    pub fn status(&self, error_rate: f64, p95_latency_ms: f64) -> HealthStatus {
        if error_rate > self.critical_error_rate || p95_latency_ms > self.critical_p95_ms {
            HealthStatus::Critical
        } else if error_rate > self.warning_error_rate || p95_latency_ms > self.warning_p95_ms {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn slo(&self, error_rate: f64, request_rate: f64, p95_latency_ms: f64) -> SloBlock {
        let success_rate = 100.0 - error_rate;
        let availability = if request_rate == 0.0 {
            0.0
        } else {
            self.availability_baseline
        };
        let latency_compliance = if p95_latency_ms > self.critical_p95_ms {
            self.latency_compliance_poor
        } else if p95_latency_ms > self.warning_p95_ms {
            self.latency_compliance_degraded
        } else {
            self.latency_compliance_full
        };

        let status = if success_rate < self.breach_success_rate
            || availability < self.breach_availability
            || latency_compliance < self.breach_latency_compliance
        {
            SloStatus::Breaching
        } else if success_rate < self.warn_success_rate
            || availability < self.warn_availability
            || latency_compliance < self.warn_latency_compliance
        {
            SloStatus::Warning
        } else {
            SloStatus::Meeting
        };

        SloBlock {
            success_rate,
            availability,
            latency_compliance,
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthRow {
    pub service_name: String,
    pub status: HealthStatus,
    pub active_instances: u64,
    /// Requests per minute.
    pub request_rate: f64,
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    pub last_seen: i64,
    pub span_count: u64,
    pub avg_span_duration_ms: f64,
    pub error_span_count: u64,
    pub runtime_metrics: BTreeMap<String, f64>,
    pub slo: SloBlock,
}

/// Metrics-side aggregate for one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsAggregate {
    pub active_instances: u64,
    pub last_seen: i64,
    pub request_count: f64,
    pub error_count: f64,
    pub p95_latency_ms: f64,
    pub runtime_metrics: BTreeMap<String, f64>,
}

/// Trace-side aggregate for one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceAggregate {
    pub span_count: u64,
    pub avg_duration_ms: f64,
    pub error_span_count: u64,
}

fn ratio_percent(part: f64, whole: f64) -> f64 {
    if whole == 0.0 {
        0.0
    } else {
        part * 100.0 / whole
    }
}

/// Left outer join on the metrics side. Services that only appear in traces
/// are dropped; services without traces keep zeroed trace fields.
pub fn merge_service_rows(
    policy: &HealthPolicy,
    window: TimeWindow,
    metrics: BTreeMap<String, MetricsAggregate>,
    mut traces: HashMap<String, TraceAggregate>,
) -> Vec<ServiceHealthRow> {
    let window_minutes = window.duration_minutes();

    metrics
        .into_iter()
        .map(|(service_name, m)| {
            let trace = traces.remove(&service_name).unwrap_or_default();
            let request_rate = if window_minutes > 0.0 {
                m.request_count / window_minutes
            } else {
                0.0
            };
            let error_rate = ratio_percent(m.error_count, m.request_count);

            ServiceHealthRow {
                status: policy.status(error_rate, m.p95_latency_ms),
                slo: policy.slo(error_rate, request_rate, m.p95_latency_ms),
                service_name,
                active_instances: m.active_instances,
                request_rate,
                error_rate,
                p95_latency_ms: m.p95_latency_ms,
                last_seen: m.last_seen,
                span_count: trace.span_count,
                avg_span_duration_ms: trace.avg_duration_ms,
                error_span_count: trace.error_span_count,
                runtime_metrics: m.runtime_metrics,
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct ServiceHealthRollup {
    store: Arc<dyn EventStore>,
    policy: HealthPolicy,
}

impl ServiceHealthRollup {
    pub fn new(store: Arc<dyn EventStore>, policy: HealthPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Rows sorted by service name. `slo_filter` is applied after the full
    /// computation.
    pub async fn compute(
        &self,
        ctx: &QueryContext,
        account: &AccountId,
        window: TimeWindow,
        slo_filter: Option<SloStatus>,
    ) -> Result<Vec<ServiceHealthRow>> {
        self.compute_filtered(ctx, account, window, slo_filter, &LabelMap::new())
            .await
    }

    /// Like [`compute`](Self::compute), but only events whose labels match
    /// every entry of `labels` feed the aggregates.
    pub async fn compute_filtered(
        &self,
        ctx: &QueryContext,
        account: &AccountId,
        window: TimeWindow,
        slo_filter: Option<SloStatus>,
        labels: &LabelMap,
    ) -> Result<Vec<ServiceHealthRow>> {
        let scope = Predicate::new(account.clone()).and_all(FilterSet::new(labels, &[]).terms());

        let presence = RangeQuery::new(EventKind::Metric, scope.clone(), window)
            .group(Field::ServiceName)
            .aggregate(Aggregate::CountDistinct(Field::resource(POD_ATTRIBUTE)))
            .aggregate(Aggregate::Max(Field::Timestamp));

        let requests = RangeQuery::new(
            EventKind::Metric,
            scope
                .clone()
                .and(Term::Eq(Field::MetricName, REQUEST_METRIC.to_string())),
            window,
        )
        .group(Field::ServiceName)
        .aggregate(Aggregate::Count)
        .aggregate(Aggregate::CountIf(Term::AtLeast(Field::label(STATUS_LABEL), 400.0)))
        .aggregate(Aggregate::Quantile(Field::Value, 0.95));

        let runtime = RangeQuery::new(
            EventKind::Metric,
            scope.clone().and(Term::In(
                Field::MetricName,
                RUNTIME_GAUGES.iter().map(|(_, m)| m.to_string()).collect(),
            )),
            window,
        )
        .group(Field::ServiceName)
        .group(Field::MetricName)
        .aggregate(Aggregate::Avg(Field::Value));

        let spans = RangeQuery::new(EventKind::Span, scope, window)
            .group(Field::ServiceName)
            .aggregate(Aggregate::Count)
            .aggregate(Aggregate::Avg(Field::DurationMs))
            .aggregate(Aggregate::CountIf(Term::NotEq(
                Field::StatusCode,
                SPAN_OK_STATUS.to_string(),
            )));

        let (presence, requests, runtime, spans) = futures::try_join!(
            self.store.aggregate(ctx, &presence),
            self.store.aggregate(ctx, &requests),
            self.store.aggregate(ctx, &runtime),
            self.store.aggregate(ctx, &spans),
        )?;
        debug!(
            account = %account,
            services = presence.len(),
            traced = spans.len(),
            "Health inputs loaded"
        );

        let metrics = metrics_side(presence, requests, runtime);
        let traces = trace_side(spans);
        let mut rows = merge_service_rows(&self.policy, window, metrics, traces);

        if let Some(wanted) = slo_filter {
            rows.retain(|row| row.slo.status == wanted);
        }
        Ok(rows)
    }
}

fn metrics_side(
    presence: Vec<AggregateRow>,
    requests: Vec<AggregateRow>,
    runtime: Vec<AggregateRow>,
) -> BTreeMap<String, MetricsAggregate> {
    let mut services: BTreeMap<String, MetricsAggregate> = presence
        .into_iter()
        .map(|row| {
            let aggregate = MetricsAggregate {
                active_instances: row.value(0) as u64,
                last_seen: row.value(1) as i64,
                ..Default::default()
            };
            (row.key(0).to_string(), aggregate)
        })
        .collect();

    for row in requests {
        if let Some(service) = services.get_mut(row.key(0)) {
            service.request_count = row.value(0);
            service.error_count = row.value(1);
            service.p95_latency_ms = row.value(2);
        }
    }

    for row in runtime {
        let Some(service) = services.get_mut(row.key(0)) else {
            continue;
        };
        let Some((name, _)) = RUNTIME_GAUGES.iter().find(|(_, metric)| *metric == row.key(1)) else {
            continue;
        };
        let value = row.value(0);
        if value != 0.0 {
            service.runtime_metrics.insert(name.to_string(), value);
        }
    }

    services
}

fn trace_side(spans: Vec<AggregateRow>) -> HashMap<String, TraceAggregate> {
    spans
        .into_iter()
        .map(|row| {
            (
                row.key(0).to_string(),
                TraceAggregate {
                    span_count: row.value(0) as u64,
                    avg_duration_ms: row.value(1),
                    error_span_count: row.value(2) as u64,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventBatch, EventHeader, MetricPoint, TraceSpan};
    use crate::store::DuckDbStore;
    use pretty_assertions::assert_eq;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_status_steps() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.status(0.5, 100.0), HealthStatus::Healthy);
        assert_eq!(policy.status(1.5, 100.0), HealthStatus::Warning);
        assert_eq!(policy.status(6.0, 100.0), HealthStatus::Critical);
        assert_eq!(policy.status(0.0, 600.0), HealthStatus::Warning);
        assert_eq!(policy.status(0.0, 1200.0), HealthStatus::Critical);
    }

    #[test]
    fn test_slo_classification() {
        let policy = HealthPolicy::default();

        let slo = policy.slo(0.2, 50.0, 120.0);
        assert_eq!(slo.status, SloStatus::Meeting);
        assert_eq!(slo.availability, AVAILABILITY_BASELINE);
        assert_eq!(slo.latency_compliance, 100.0);

        let slo = policy.slo(6.0, 5.0, 1200.0);
        assert_eq!(slo.status, SloStatus::Breaching);
        assert_eq!(slo.latency_compliance, 85.0);

        assert_eq!(policy.slo(1.5, 5.0, 100.0).status, SloStatus::Warning);
        assert_eq!(policy.slo(0.0, 0.0, 100.0).status, SloStatus::Breaching);
        assert_eq!(policy.slo(0.0, 5.0, 700.0).latency_compliance, 95.0);
    }

    #[test]
    fn test_policy_overrides() {
        let policy = HealthPolicy {
            critical_error_rate: 10.0,
            ..Default::default()
        };
        assert_eq!(policy.status(6.0, 100.0), HealthStatus::Warning);
    }

    #[test]
    fn test_merge_two_services_scenario() {
        let window = TimeWindow::lookback(NOW, 15);
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "svc-a".to_string(),
            MetricsAggregate {
                active_instances: 2,
                last_seen: NOW,
                request_count: 750.0,
                error_count: 1.5,
                p95_latency_ms: 120.0,
                runtime_metrics: BTreeMap::new(),
            },
        );
        metrics.insert(
            "svc-b".to_string(),
            MetricsAggregate {
                active_instances: 1,
                last_seen: NOW,
                request_count: 75.0,
                error_count: 4.5,
                p95_latency_ms: 1200.0,
                runtime_metrics: BTreeMap::new(),
            },
        );
        let mut traces = HashMap::new();
        traces.insert(
            "svc-a".to_string(),
            TraceAggregate { span_count: 10, avg_duration_ms: 40.0, error_span_count: 0 },
        );
        traces.insert(
            "svc-traces-only".to_string(),
            TraceAggregate { span_count: 3, avg_duration_ms: 5.0, error_span_count: 3 },
        );

        let rows = merge_service_rows(&HealthPolicy::default(), window, metrics, traces);
        assert_eq!(rows.len(), 2);

        let a = &rows[0];
        assert_eq!(a.service_name, "svc-a");
        assert!((a.request_rate - 50.0).abs() < 1e-9);
        assert!((a.error_rate - 0.2).abs() < 1e-9);
        assert_eq!(a.status, HealthStatus::Healthy);
        assert_eq!(a.slo.status, SloStatus::Meeting);
        assert_eq!(a.span_count, 10);

        let b = &rows[1];
        assert_eq!(b.service_name, "svc-b");
        assert!((b.request_rate - 5.0).abs() < 1e-9);
        assert!((b.error_rate - 6.0).abs() < 1e-9);
        assert_eq!(b.status, HealthStatus::Critical);
        assert_eq!(b.slo.status, SloStatus::Breaching);
        assert_eq!(b.span_count, 0);
        assert_eq!(b.avg_span_duration_ms, 0.0);
    }

    #[test]
    fn test_zero_requests_never_nan() {
        let mut metrics = BTreeMap::new();
        metrics.insert("idle".to_string(), MetricsAggregate::default());
        let rows = merge_service_rows(
            &HealthPolicy::default(),
            TimeWindow::lookback(NOW, 15),
            metrics,
            HashMap::new(),
        );
        assert_eq!(rows[0].error_rate, 0.0);
        assert_eq!(rows[0].request_rate, 0.0);
        assert_eq!(rows[0].slo.availability, 0.0);
    }

    fn request(service: &str, pod: &str, status: &str, duration: f64, offset_ms: i64) -> MetricPoint {
        MetricPoint {
            header: EventHeader::new("acct-1", NOW - offset_ms, service, "host-1")
                .with_label(STATUS_LABEL, status)
                .with_resource(POD_ATTRIBUTE, pod),
            metric_name: REQUEST_METRIC.to_string(),
            value: duration,
        }
    }

    fn gauge(service: &str, metric: &str, value: f64) -> MetricPoint {
        MetricPoint {
            header: EventHeader::new("acct-1", NOW - 1000, service, "host-1"),
            metric_name: metric.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn test_compute_against_store() {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        let ctx = QueryContext::new();

        let mut points = Vec::new();
        for i in 0..100 {
            let status = if i < 10 { "503" } else { "200" };
            let pod = if i % 2 == 0 { "pay-0" } else { "pay-1" };
            points.push(request("payments", pod, status, 80.0, i * 1000));
        }
        for i in 0..20 {
            points.push(request("search", "search-0", "200", 40.0, i * 1000));
        }
        points.push(gauge("payments", "runtime.heap.usage", 512.0));
        points.push(gauge("payments", "runtime.gc.time", 0.0));
        store.insert_batch(&ctx, EventBatch::Metrics(points)).await.unwrap();

        let spans = (0..4)
            .map(|i| TraceSpan {
                header: EventHeader::new("acct-1", NOW - 500, "payments", "host-1"),
                trace_id: "t1".into(),
                span_id: format!("s{}", i),
                parent_span_id: None,
                span_name: "charge".into(),
                duration_ms: 25.0,
                status_code: if i == 0 { "ERROR".into() } else { "OK".into() },
            })
            .collect();
        store.insert_batch(&ctx, EventBatch::Spans(spans)).await.unwrap();

        let rollup = ServiceHealthRollup::new(store, HealthPolicy::default());
        let account = AccountId::new("acct-1").unwrap();
        let window = TimeWindow::lookback(NOW, 10);
        let rows = rollup.compute(&ctx, &account, window, None).await.unwrap();

        assert_eq!(rows.len(), 2);
        let payments = &rows[0];
        assert_eq!(payments.service_name, "payments");
        assert_eq!(payments.active_instances, 2);
        assert_eq!(payments.error_rate, 10.0);
        assert_eq!(payments.request_rate, 10.0);
        assert_eq!(payments.status, HealthStatus::Critical);
        assert_eq!(payments.span_count, 4);
        assert_eq!(payments.error_span_count, 1);
        assert_eq!(payments.last_seen, NOW);
        assert_eq!(payments.runtime_metrics.get("heap_usage"), Some(&512.0));
        assert!(!payments.runtime_metrics.contains_key("gc_time"));
        assert!(!payments.runtime_metrics.contains_key("event_loop_lag"));

        let search = &rows[1];
        assert_eq!(search.status, HealthStatus::Healthy);
        assert_eq!(search.span_count, 0);
        assert!(search.runtime_metrics.is_empty());

        let breaching = rollup
            .compute(&ctx, &account, window, Some(SloStatus::Breaching))
            .await
            .unwrap();
        let names: Vec<&str> = breaching.iter().map(|r| r.service_name.as_str()).collect();
        assert_eq!(names, vec!["payments"]);
    }

    #[tokio::test]
    async fn test_label_filters_scope_every_aggregate() {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        let ctx = QueryContext::new();
        let tagged = |service: &str, region: &str| MetricPoint {
            header: EventHeader::new("acct-1", NOW - 1000, service, "host-1")
                .with_label(STATUS_LABEL, "200")
                .with_label("region", region),
            metric_name: REQUEST_METRIC.to_string(),
            value: 30.0,
        };
        store
            .insert_batch(
                &ctx,
                EventBatch::Metrics(vec![
                    tagged("payments", "eu"),
                    tagged("search", "us"),
                    request("untagged", "p-0", "200", 30.0, 1000),
                ]),
            )
            .await
            .unwrap();

        let rollup = ServiceHealthRollup::new(store, HealthPolicy::default());
        let mut labels = LabelMap::new();
        labels.insert("region", "eu");
        let rows = rollup
            .compute_filtered(
                &ctx,
                &AccountId::new("acct-1").unwrap(),
                TimeWindow::lookback(NOW, 10),
                None,
                &labels,
            )
            .await
            .unwrap();

        let names: Vec<&str> = rows.iter().map(|r| r.service_name.as_str()).collect();
        assert_eq!(names, vec!["payments"]);
        assert_eq!(rows[0].request_rate, 0.1);
    }
}
