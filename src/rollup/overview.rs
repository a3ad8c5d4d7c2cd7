use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{AccountId, EventKind, TimeWindow};
use crate::query::period::{scalar, PeriodComparator, PeriodDelta};
use crate::store::{Aggregate, EventStore, Field, Predicate, QueryContext, Term};
use crate::Result;

use super::health::SPAN_OK_STATUS;

/// Dashboard summary; every figure is a current-vs-previous comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub window_minutes: i64,
    pub active_services: PeriodDelta,
    pub error_rate: PeriodDelta,
    pub avg_latency_ms: PeriodDelta,
    pub log_volume: PeriodDelta,
    /// Spans per minute.
    pub throughput: PeriodDelta,
    pub events_ingested: PeriodDelta,
}

#[derive(Clone)]
pub struct OverviewRollup {
    store: Arc<dyn EventStore>,
}

impl OverviewRollup {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn compute(
        &self,
        ctx: &QueryContext,
        account: &AccountId,
        now_ms: i64,
        window_minutes: i64,
    ) -> Result<Overview> {
        let comparator = PeriodComparator::new(now_ms, window_minutes);
        let scope = Predicate::new(account.clone());
        let store = self.store.as_ref();

        let (active_services, error_rate, avg_latency_ms, log_volume, throughput, events_ingested) = futures::try_join!(
            comparator.compare(|w| scalar(
                store,
                ctx,
                EventKind::Metric,
                &scope,
                Aggregate::CountDistinct(Field::ServiceName),
                w
            )),
            comparator.compare(|w| span_error_rate(store, ctx, &scope, w)),
            comparator.compare(|w| scalar(
                store,
                ctx,
                EventKind::Span,
                &scope,
                Aggregate::Avg(Field::DurationMs),
                w
            )),
            comparator.compare(|w| scalar(store, ctx, EventKind::Log, &scope, Aggregate::Count, w)),
            comparator.compare(|w| span_throughput(store, ctx, &scope, w)),
            comparator.compare(|w| events_ingested(store, ctx, &scope, w)),
        )?;
        debug!(account = %account, window_minutes, "Overview computed");

        Ok(Overview {
            window_minutes,
            active_services,
            error_rate,
            avg_latency_ms,
            log_volume,
            throughput,
            events_ingested,
        })
    }
}

async fn span_error_rate(
    store: &dyn EventStore,
    ctx: &QueryContext,
    scope: &Predicate,
    window: TimeWindow,
) -> Result<f64> {
    let failed = Aggregate::CountIf(Term::NotEq(Field::StatusCode, SPAN_OK_STATUS.to_string()));
    let (total, failed) = futures::try_join!(
        scalar(store, ctx, EventKind::Span, scope, Aggregate::Count, window),
        scalar(store, ctx, EventKind::Span, scope, failed, window),
    )?;
    Ok(if total == 0.0 { 0.0 } else { failed * 100.0 / total })
}

async fn span_throughput(
    store: &dyn EventStore,
    ctx: &QueryContext,
    scope: &Predicate,
    window: TimeWindow,
) -> Result<f64> {
    let spans = scalar(store, ctx, EventKind::Span, scope, Aggregate::Count, window).await?;
    let minutes = window.duration_minutes();
    Ok(if minutes > 0.0 { spans / minutes } else { 0.0 })
}

async fn events_ingested(
    store: &dyn EventStore,
    ctx: &QueryContext,
    scope: &Predicate,
    window: TimeWindow,
) -> Result<f64> {
    let counts = futures::future::try_join_all(
        EventKind::ALL
            .into_iter()
            .map(|kind| scalar(store, ctx, kind, scope, Aggregate::Count, window)),
    )
    .await?;
    Ok(counts.into_iter().sum())
}
