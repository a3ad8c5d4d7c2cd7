//! Event store adapter.
//!
//! Engine code never writes SQL. It describes what it wants as a
//! [`RangeQuery`] built from typed [`Term`]s and [`Aggregate`]s, and an
//! [`EventStore`] implementation turns that into a scan over one event kind.

pub mod duckdb_store;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::{AccountId, EventBatch, EventKind, LogRecord, StackSample, TimeWindow};
use crate::window::Pagination;
use crate::{AnalyticsError, Result};

pub use self::duckdb_store::DuckDbStore;

/// Deadline and cancellation handle threaded through every store call.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Drives `fut` until it finishes, the deadline passes, or the context is cancelled.
    pub async fn run<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AnalyticsError::Cancelled);
        }

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Err(AnalyticsError::Cancelled),
                res = tokio::time::timeout_at(deadline, fut) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(AnalyticsError::Timeout(what.to_string())),
                },
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => Err(AnalyticsError::Cancelled),
                res = fut => res,
            },
        }
    }
}

/// A column of an event table, or a key inside one of its label maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Timestamp,
    ServiceName,
    HostName,
    MetricName,
    Value,
    Severity,
    SpanName,
    DurationMs,
    StatusCode,
    ProfileType,
    Label(String),
    Resource(String),
}

impl Field {
    pub fn label(key: &str) -> Self {
        Field::Label(key.to_string())
    }

    pub fn resource(key: &str) -> Self {
        Field::Resource(key.to_string())
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Field::Timestamp | Field::Value | Field::DurationMs)
    }

    pub fn supported_by(&self, kind: EventKind) -> bool {
        match self {
            Field::Timestamp
            | Field::ServiceName
            | Field::HostName
            | Field::Label(_)
            | Field::Resource(_) => true,
            Field::MetricName => kind == EventKind::Metric,
            Field::Value => matches!(kind, EventKind::Metric | EventKind::Profile),
            Field::Severity => kind == EventKind::Log,
            Field::SpanName | Field::DurationMs | Field::StatusCode => kind == EventKind::Span,
            Field::ProfileType => kind == EventKind::Profile,
        }
    }
}

/// One typed predicate term. Label lookups on a missing key never match.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Eq(Field, String),
    NotEq(Field, String),
    In(Field, Vec<String>),
    AtLeast(Field, f64),
}

impl Term {
    pub fn field(&self) -> &Field {
        match self {
            Term::Eq(f, _) | Term::NotEq(f, _) | Term::In(f, _) | Term::AtLeast(f, _) => f,
        }
    }
}

/// Account scope plus additional terms, all joined with AND.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub account: AccountId,
    pub terms: Vec<Term>,
}

impl Predicate {
    pub fn new(account: AccountId) -> Self {
        Self {
            account,
            terms: Vec::new(),
        }
    }

    pub fn and(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    pub fn and_all(mut self, terms: impl IntoIterator<Item = Term>) -> Self {
        self.terms.extend(terms);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    Avg(Field),
    Sum(Field),
    Min(Field),
    Max(Field),
    /// Row count; ignores every column.
    Count,
    CountDistinct(Field),
    CountIf(Term),
    Quantile(Field, f64),
}

impl Aggregate {
    fn field(&self) -> Option<&Field> {
        match self {
            Aggregate::Avg(f)
            | Aggregate::Sum(f)
            | Aggregate::Min(f)
            | Aggregate::Max(f)
            | Aggregate::CountDistinct(f)
            | Aggregate::Quantile(f, _) => Some(f),
            Aggregate::CountIf(term) => Some(term.field()),
            Aggregate::Count => None,
        }
    }
}

/// Grouped aggregation over one event kind inside a time window.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub kind: EventKind,
    pub predicate: Predicate,
    pub window: TimeWindow,
    pub bucket_ms: Option<i64>,
    pub group_by: Vec<Field>,
    pub aggregates: Vec<Aggregate>,
}

impl RangeQuery {
    pub fn new(kind: EventKind, predicate: Predicate, window: TimeWindow) -> Self {
        Self {
            kind,
            predicate,
            window,
            bucket_ms: None,
            group_by: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    pub fn bucket(mut self, width_ms: i64) -> Self {
        self.bucket_ms = Some(width_ms);
        self
    }

    pub fn group(mut self, field: Field) -> Self {
        self.group_by.push(field);
        self
    }

    pub fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggregates.is_empty() {
            return Err(AnalyticsError::InvalidRequest(
                "range query needs at least one aggregate".to_string(),
            ));
        }
        if matches!(self.bucket_ms, Some(width) if width <= 0) {
            return Err(AnalyticsError::InvalidRequest(
                "bucket width must be positive".to_string(),
            ));
        }

        let fields = self
            .predicate
            .terms
            .iter()
            .map(Term::field)
            .chain(self.group_by.iter())
            .chain(self.aggregates.iter().filter_map(Aggregate::field));
        for field in fields {
            if !field.supported_by(self.kind) {
                return Err(AnalyticsError::InvalidRequest(format!(
                    "{:?} is not available on {} events",
                    field,
                    self.kind.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Typed result row: `keys` follow `group_by`, `values` follow `aggregates`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub bucket: Option<i64>,
    pub keys: Vec<String>,
    pub values: Vec<f64>,
}

impl AggregateRow {
    pub fn key(&self, idx: usize) -> &str {
        self.keys.get(idx).map(String::as_str).unwrap_or("")
    }

    pub fn value(&self, idx: usize) -> f64 {
        self.values.get(idx).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleQuery {
    pub predicate: Predicate,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogQuery {
    pub predicate: Predicate,
    pub window: TimeWindow,
    pub pagination: Pagination,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_batch(&self, ctx: &QueryContext, batch: EventBatch) -> Result<usize>;

    async fn aggregate(&self, ctx: &QueryContext, query: &RangeQuery) -> Result<Vec<AggregateRow>>;

    async fn profile_samples(&self, ctx: &QueryContext, query: &SampleQuery) -> Result<Vec<StackSample>>;

    /// Newest first, with the total number of matches before pagination.
    async fn logs(&self, ctx: &QueryContext, query: &LogQuery) -> Result<(Vec<LogRecord>, u64)>;

    /// Drops rows that have aged out of retention.
    async fn purge_expired(&self, now_ms: i64) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountId {
        AccountId::new("acct-1").unwrap()
    }

    #[test]
    fn test_validate_rejects_foreign_fields() {
        let query = RangeQuery::new(
            EventKind::Span,
            Predicate::new(account()),
            TimeWindow::new(0, 1),
        )
        .aggregate(Aggregate::Avg(Field::Value));
        assert!(matches!(
            query.validate(),
            Err(AnalyticsError::InvalidRequest(_))
        ));

        let query = RangeQuery::new(
            EventKind::Span,
            Predicate::new(account()).and(Term::NotEq(Field::StatusCode, "OK".into())),
            TimeWindow::new(0, 1),
        )
        .group(Field::label("route"))
        .aggregate(Aggregate::Avg(Field::DurationMs));
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_aggregate_and_bucket() {
        let base = RangeQuery::new(EventKind::Metric, Predicate::new(account()), TimeWindow::new(0, 1));
        assert!(base.validate().is_err());
        assert!(base.clone().aggregate(Aggregate::Count).bucket(0).validate().is_err());
        assert!(base.aggregate(Aggregate::Count).bucket(60_000).validate().is_ok());
    }

    #[test]
    fn test_context_passes_results_through() {
        let ctx = QueryContext::new();
        let value = tokio_test::assert_ok!(tokio_test::block_on(ctx.run("noop", async { Ok(7) })));
        assert_eq!(value, 7);

        ctx.cancel();
        let res: Result<i32> = tokio_test::block_on(ctx.run("noop", async { Ok(7) }));
        assert!(matches!(tokio_test::assert_err!(res), AnalyticsError::Cancelled));
    }

    #[tokio::test]
    async fn test_context_times_out() {
        let ctx = QueryContext::with_timeout(Duration::from_millis(10));
        let res: Result<()> = ctx
            .run("slow scan", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(AnalyticsError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let ctx = QueryContext::new();
        let token = ctx.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let res: Result<()> = ctx
            .run("slow scan", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(AnalyticsError::Cancelled)));
    }
}
