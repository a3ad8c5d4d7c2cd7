use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, warn};

use super::filter::{FilterSet, GroupKeys};
use crate::models::{
    AccountId, Aggregation, DataPoint, EventKind, MetricQuery, MetricSeries, SeriesStats,
    TimeWindow,
};
use crate::store::{Aggregate, AggregateRow, EventStore, Field, Predicate, QueryContext, RangeQuery, Term};
use crate::window::parse_interval_secs;
use crate::Result;

pub const DEFAULT_INTERVAL_SECS: i64 = 60;

/// Resolves dashboard metric queries into labeled, bucketed series.
#[derive(Clone)]
pub struct MetricQueryEngine {
    store: Arc<dyn EventStore>,
    default_interval_secs: i64,
}

impl MetricQueryEngine {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            default_interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }

    pub fn with_default_interval(mut self, secs: i64) -> Self {
        if secs > 0 {
            self.default_interval_secs = secs;
        }
        self
    }

    pub fn bucket_width_ms(&self, query: &MetricQuery) -> i64 {
        query
            .interval
            .as_deref()
            .and_then(parse_interval_secs)
            .unwrap_or(self.default_interval_secs)
            * 1000
    }

    /// Queries run concurrently; output keeps request order, and the first
    /// failing query fails the whole call.
    pub async fn resolve(
        &self,
        ctx: &QueryContext,
        account: &AccountId,
        window: TimeWindow,
        queries: &[MetricQuery],
    ) -> Result<Vec<MetricSeries>> {
        let per_query = try_join_all(
            queries
                .iter()
                .map(|query| self.resolve_one(ctx, account, window, query)),
        )
        .await?;

        Ok(per_query.into_iter().flatten().collect())
    }

    async fn resolve_one(
        &self,
        ctx: &QueryContext,
        account: &AccountId,
        window: TimeWindow,
        query: &MetricQuery,
    ) -> Result<Vec<MetricSeries>> {
        let filters = FilterSet::new(&query.filters, &query.group_by);
        let range = self.range_query(account, window, query, &filters);

        let rows = self.store.aggregate(ctx, &range).await.map_err(|err| {
            warn!(metric = %query.metric_name, error = %err, "Metric query failed");
            err
        })?;
        debug!(metric = %query.metric_name, rows = rows.len(), "Metric query resolved");

        Ok(fold_series(query, &filters.group_keys(), rows))
    }

    fn range_query(
        &self,
        account: &AccountId,
        window: TimeWindow,
        query: &MetricQuery,
        filters: &FilterSet,
    ) -> RangeQuery {
        let predicate = Predicate::new(account.clone())
            .and(Term::Eq(Field::MetricName, query.metric_name.clone()))
            .and_all(filters.terms());

        let mut range = RangeQuery::new(EventKind::Metric, predicate, window)
            .bucket(self.bucket_width_ms(query))
            .aggregate(aggregate_for(query.aggregation));
        for field in filters.group_fields() {
            range = range.group(field);
        }
        range
    }
}

fn aggregate_for(aggregation: Aggregation) -> Aggregate {
    match aggregation {
        Aggregation::Avg => Aggregate::Avg(Field::Value),
        Aggregation::Sum => Aggregate::Sum(Field::Value),
        Aggregation::Min => Aggregate::Min(Field::Value),
        Aggregation::Max => Aggregate::Max(Field::Value),
        Aggregation::Count => Aggregate::Count,
        Aggregation::P50 | Aggregation::P95 | Aggregation::P99 => {
            Aggregate::Quantile(Field::Value, aggregation.quantile().unwrap_or(0.5))
        }
    }
}

/// Groups rows by their key tuple, in first-seen order. Stats are computed
/// once per series after every row is in.
pub fn fold_series(query: &MetricQuery, keys: &GroupKeys, rows: Vec<AggregateRow>) -> Vec<MetricSeries> {
    let mut order: Vec<Vec<String>> = Vec::new();
    let mut points: HashMap<Vec<String>, Vec<DataPoint>> = HashMap::new();

    for row in rows {
        let point = DataPoint {
            timestamp: row.bucket.unwrap_or_default(),
            value: row.value(0),
        };
        let key = if keys.is_empty() { Vec::new() } else { row.keys };
        points
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(point);
    }

    order
        .into_iter()
        .map(|key| {
            let mut data_points = points.remove(&key).unwrap_or_default();
            data_points.sort_by_key(|p| p.timestamp);
            let stats = SeriesStats::from_points(&data_points);
            MetricSeries {
                name: query.series_name().to_string(),
                labels: keys.labels_for(&key),
                data_points,
                stats,
            }
        })
        .collect()
}
