use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duckdb::types::ToSqlOutput;
use duckdb::{params, Connection, Row, ToSql};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    Aggregate, AggregateRow, EventStore, Field, LogQuery, Predicate, QueryContext, RangeQuery,
    SampleQuery, Term,
};
use crate::metrics::{self, StoreTimer};
use crate::models::{
    EventBatch, EventHeader, EventKind, LabelMap, LogRecord, StackSample, TimeWindow,
};
use crate::{AnalyticsError, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metric_points (
        account_id VARCHAR NOT NULL,
        timestamp BIGINT NOT NULL,
        service_name VARCHAR NOT NULL,
        host_name VARCHAR NOT NULL,
        labels VARCHAR NOT NULL,
        resource_attributes VARCHAR NOT NULL,
        metric_name VARCHAR NOT NULL,
        value DOUBLE NOT NULL
    );
    CREATE TABLE IF NOT EXISTS log_records (
        account_id VARCHAR NOT NULL,
        timestamp BIGINT NOT NULL,
        service_name VARCHAR NOT NULL,
        host_name VARCHAR NOT NULL,
        labels VARCHAR NOT NULL,
        resource_attributes VARCHAR NOT NULL,
        severity VARCHAR NOT NULL,
        body VARCHAR NOT NULL
    );
    CREATE TABLE IF NOT EXISTS trace_spans (
        account_id VARCHAR NOT NULL,
        timestamp BIGINT NOT NULL,
        service_name VARCHAR NOT NULL,
        host_name VARCHAR NOT NULL,
        labels VARCHAR NOT NULL,
        resource_attributes VARCHAR NOT NULL,
        trace_id VARCHAR NOT NULL,
        span_id VARCHAR NOT NULL,
        parent_span_id VARCHAR,
        span_name VARCHAR NOT NULL,
        duration_ms DOUBLE NOT NULL,
        status_code VARCHAR NOT NULL
    );
    CREATE TABLE IF NOT EXISTS profile_samples (
        account_id VARCHAR NOT NULL,
        timestamp BIGINT NOT NULL,
        service_name VARCHAR NOT NULL,
        host_name VARCHAR NOT NULL,
        labels VARCHAR NOT NULL,
        resource_attributes VARCHAR NOT NULL,
        profile_type VARCHAR NOT NULL,
        stack VARCHAR NOT NULL,
        value DOUBLE NOT NULL
    );
";

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(72 * 3600);

/// Event store backed by DuckDB. Label maps are kept as JSON text and
/// resolved with `json_extract_string`, so keys stay schemaless.
#[derive(Clone)]
pub struct DuckDbStore {
    db: Arc<Mutex<Connection>>,
    retention: Duration,
}

impl DuckDbStore {
    pub fn open(path: &str, retention: Duration) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(SCHEMA)?;
        info!(path, retention_secs = retention.as_secs(), "Opened event store");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            retention,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:", DEFAULT_RETENTION)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Runs `op` on its own connection off the async runtime, so independent
    /// scans do not serialize behind one another.
    ///
    /// A statement that has already started runs to completion on its cloned
    /// connection even after the caller gives up; only the wait is abandoned.
    /// Work still queued for a blocking thread is skipped once the caller is gone.
    async fn run_blocking<T, F>(
        &self,
        ctx: &QueryContext,
        kind: EventKind,
        operation: &'static str,
        op: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(AnalyticsError::Cancelled);
        }

        let mut conn = self.db.lock().try_clone()?;
        let _timer = StoreTimer::new(kind, operation);
        let abandoned = CancellationToken::new();
        let _abandon_on_return = abandoned.clone().drop_guard();
        let task = tokio::task::spawn_blocking(move || {
            if abandoned.is_cancelled() {
                return Err(AnalyticsError::Cancelled);
            }
            op(&mut conn)
        });

        let result = ctx.run(operation, async move { task.await? }).await;
        if let Err(err) = &result {
            metrics::record_store_error(kind, operation);
            debug!(kind = kind.as_str(), operation, error = %err, "Store call failed");
        }
        result
    }
}

#[async_trait]
impl EventStore for DuckDbStore {
    async fn insert_batch(&self, ctx: &QueryContext, batch: EventBatch) -> Result<usize> {
        let kind = batch.kind();
        if let Some(header) = headers(&batch).find(|h| h.account_id.trim().is_empty()) {
            return Err(AnalyticsError::InvalidRequest(format!(
                "event at {} has no account_id",
                header.timestamp
            )));
        }

        let rows = self
            .run_blocking(ctx, kind, "insert", move |conn| insert_rows(conn, &batch))
            .await?;
        metrics::record_rows_ingested(kind, rows);
        Ok(rows)
    }

    async fn aggregate(&self, ctx: &QueryContext, query: &RangeQuery) -> Result<Vec<AggregateRow>> {
        query.validate()?;
        let (sql, binds) = render_range_query(query);
        let has_bucket = query.bucket_ms.is_some();
        let key_count = query.group_by.len();
        let value_count = query.aggregates.len();
        debug!(kind = query.kind.as_str(), %sql, "Running range query");

        self.run_blocking(ctx, query.kind, "aggregate", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(binds.as_params().as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(decode_aggregate_row(row, has_bucket, key_count, value_count)?);
            }
            Ok(out)
        })
        .await
    }

    async fn profile_samples(&self, ctx: &QueryContext, query: &SampleQuery) -> Result<Vec<StackSample>> {
        let mut binds = Binds::default();
        let filter = render_where(&mut binds, &query.predicate, &query.window);
        let sql = format!("SELECT stack, value FROM profile_samples WHERE {}", filter);

        self.run_blocking(ctx, EventKind::Profile, "samples", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(binds.as_params().as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let stack: String = row.get(0)?;
                out.push(StackSample {
                    stack: serde_json::from_str(&stack)?,
                    value: row.get(1)?,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn logs(&self, ctx: &QueryContext, query: &LogQuery) -> Result<(Vec<LogRecord>, u64)> {
        let mut count_binds = Binds::default();
        let count_filter = render_where(&mut count_binds, &query.predicate, &query.window);
        let count_sql = format!("SELECT count(*) FROM log_records WHERE {}", count_filter);

        let mut page_binds = Binds::default();
        let page_filter = render_where(&mut page_binds, &query.predicate, &query.window);
        let page_sql = format!(
            "SELECT account_id, timestamp, service_name, host_name, labels, resource_attributes, severity, body
             FROM log_records
             WHERE {}
             ORDER BY timestamp DESC
             LIMIT {} OFFSET {}",
            page_filter,
            query.pagination.page_size,
            query.pagination.offset().min(i64::MAX as u64)
        );

        self.run_blocking(ctx, EventKind::Log, "logs", move |conn| {
            let total: i64 = conn
                .prepare(&count_sql)?
                .query_row(count_binds.as_params().as_slice(), |row| row.get(0))?;

            let mut stmt = conn.prepare(&page_sql)?;
            let mut rows = stmt.query(page_binds.as_params().as_slice())?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(LogRecord {
                    header: decode_header(row)?,
                    severity: row.get(6)?,
                    body: row.get(7)?,
                });
            }
            Ok((records, total.max(0) as u64))
        })
        .await
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize> {
        let cutoff = now_ms - self.retention.as_millis() as i64;
        let ctx = QueryContext::new();
        let purged = self
            .run_blocking(&ctx, EventKind::Metric, "purge", move |conn| {
                let mut total = 0;
                for kind in EventKind::ALL {
                    let sql = format!("DELETE FROM {} WHERE timestamp <= ?", kind.table());
                    total += conn.execute(&sql, params![cutoff])?;
                }
                Ok(total)
            })
            .await?;

        if purged > 0 {
            info!(purged, cutoff, "Dropped rows past retention");
        }
        metrics::record_rows_purged(purged);
        Ok(purged)
    }
}

fn headers(batch: &EventBatch) -> Box<dyn Iterator<Item = &EventHeader> + '_> {
    match batch {
        EventBatch::Metrics(r) => Box::new(r.iter().map(|e| &e.header)),
        EventBatch::Logs(r) => Box::new(r.iter().map(|e| &e.header)),
        EventBatch::Spans(r) => Box::new(r.iter().map(|e| &e.header)),
        EventBatch::Profiles(r) => Box::new(r.iter().map(|e| &e.header)),
    }
}

fn insert_rows(conn: &mut Connection, batch: &EventBatch) -> Result<usize> {
    let tx = conn.transaction()?;
    {
        match batch {
            EventBatch::Metrics(points) => {
                let mut stmt = tx.prepare(
                    "INSERT INTO metric_points
                     (account_id, timestamp, service_name, host_name, labels, resource_attributes, metric_name, value)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                for p in points {
                    let h = &p.header;
                    stmt.execute(params![
                        h.account_id,
                        h.timestamp,
                        h.service_name,
                        h.host_name,
                        h.labels.to_json()?,
                        h.resource_attributes.to_json()?,
                        p.metric_name,
                        p.value
                    ])?;
                }
            }
            EventBatch::Logs(records) => {
                let mut stmt = tx.prepare(
                    "INSERT INTO log_records
                     (account_id, timestamp, service_name, host_name, labels, resource_attributes, severity, body)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                for r in records {
                    let h = &r.header;
                    stmt.execute(params![
                        h.account_id,
                        h.timestamp,
                        h.service_name,
                        h.host_name,
                        h.labels.to_json()?,
                        h.resource_attributes.to_json()?,
                        r.severity.trim().to_ascii_uppercase(),
                        r.body
                    ])?;
                }
            }
            EventBatch::Spans(spans) => {
                let mut stmt = tx.prepare(
                    "INSERT INTO trace_spans
                     (account_id, timestamp, service_name, host_name, labels, resource_attributes,
                      trace_id, span_id, parent_span_id, span_name, duration_ms, status_code)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                for s in spans {
                    let h = &s.header;
                    stmt.execute(params![
                        h.account_id,
                        h.timestamp,
                        h.service_name,
                        h.host_name,
                        h.labels.to_json()?,
                        h.resource_attributes.to_json()?,
                        s.trace_id,
                        s.span_id,
                        s.parent_span_id,
                        s.span_name,
                        s.duration_ms,
                        s.status_code
                    ])?;
                }
            }
            EventBatch::Profiles(samples) => {
                let mut stmt = tx.prepare(
                    "INSERT INTO profile_samples
                     (account_id, timestamp, service_name, host_name, labels, resource_attributes, profile_type, stack, value)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                for s in samples {
                    let h = &s.header;
                    stmt.execute(params![
                        h.account_id,
                        h.timestamp,
                        h.service_name,
                        h.host_name,
                        h.labels.to_json()?,
                        h.resource_attributes.to_json()?,
                        s.profile_type,
                        serde_json::to_string(&s.stack)?,
                        s.value
                    ])?;
                }
            }
        }
    }
    tx.commit()?;
    Ok(batch.len())
}

/// Bind values, in the order their placeholders appear in the rendered SQL.
#[derive(Debug, Default)]
struct Binds(Vec<Bind>);

#[derive(Debug, Clone, PartialEq)]
enum Bind {
    Text(String),
    Int(i64),
    Float(f64),
}

impl ToSql for Bind {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        match self {
            Bind::Text(v) => v.to_sql(),
            Bind::Int(v) => v.to_sql(),
            Bind::Float(v) => v.to_sql(),
        }
    }
}

impl Binds {
    fn text(&mut self, value: &str) -> &'static str {
        self.0.push(Bind::Text(value.to_string()));
        "CAST(? AS VARCHAR)"
    }

    fn int(&mut self, value: i64) -> &'static str {
        self.0.push(Bind::Int(value));
        "CAST(? AS BIGINT)"
    }

    fn float(&mut self, value: f64) -> &'static str {
        self.0.push(Bind::Float(value));
        "CAST(? AS DOUBLE)"
    }

    fn as_params(&self) -> Vec<&dyn ToSql> {
        self.0.iter().map(|b| b as &dyn ToSql).collect()
    }
}

fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('\\', "\\\\").replace('"', "\\\""))
}

fn render_field(binds: &mut Binds, field: &Field) -> String {
    match field {
        Field::Label(key) => format!("json_extract_string(labels, {})", binds.text(&json_path(key))),
        Field::Resource(key) => format!(
            "json_extract_string(resource_attributes, {})",
            binds.text(&json_path(key))
        ),
        Field::Timestamp => "timestamp".to_string(),
        Field::ServiceName => "service_name".to_string(),
        Field::HostName => "host_name".to_string(),
        Field::MetricName => "metric_name".to_string(),
        Field::Value => "value".to_string(),
        Field::Severity => "severity".to_string(),
        Field::SpanName => "span_name".to_string(),
        Field::DurationMs => "duration_ms".to_string(),
        Field::StatusCode => "status_code".to_string(),
        Field::ProfileType => "profile_type".to_string(),
    }
}

fn render_text_field(binds: &mut Binds, field: &Field) -> String {
    let expr = render_field(binds, field);
    if field.is_numeric() {
        format!("CAST({} AS VARCHAR)", expr)
    } else {
        expr
    }
}

fn render_numeric_field(binds: &mut Binds, field: &Field) -> String {
    let expr = render_field(binds, field);
    if field.is_numeric() {
        expr
    } else {
        format!("TRY_CAST({} AS DOUBLE)", expr)
    }
}

fn render_term(binds: &mut Binds, term: &Term) -> String {
    match term {
        Term::Eq(field, value) => {
            let expr = render_text_field(binds, field);
            format!("{} = {}", expr, binds.text(value))
        }
        Term::NotEq(field, value) => {
            let expr = render_text_field(binds, field);
            format!("{} <> {}", expr, binds.text(value))
        }
        Term::In(_, values) if values.is_empty() => "FALSE".to_string(),
        Term::In(field, values) => {
            let expr = render_text_field(binds, field);
            let placeholders: Vec<&str> = values.iter().map(|v| binds.text(v)).collect();
            format!("{} IN ({})", expr, placeholders.join(", "))
        }
        Term::AtLeast(field, threshold) => {
            let expr = render_numeric_field(binds, field);
            format!("{} >= {}", expr, binds.float(*threshold))
        }
    }
}

/// Account scope first, then the window, then caller terms.
fn render_where(binds: &mut Binds, predicate: &Predicate, window: &TimeWindow) -> String {
    let mut clauses = vec![
        format!("account_id = {}", binds.text(predicate.account.as_str())),
        format!("timestamp > {}", binds.int(window.start_ms)),
        format!("timestamp <= {}", binds.int(window.end_ms)),
    ];
    for term in &predicate.terms {
        clauses.push(format!("({})", render_term(binds, term)));
    }
    clauses.join(" AND ")
}

fn render_aggregate(binds: &mut Binds, aggregate: &Aggregate) -> String {
    let expr = match aggregate {
        Aggregate::Avg(f) => format!("avg({})", render_numeric_field(binds, f)),
        Aggregate::Sum(f) => format!("sum({})", render_numeric_field(binds, f)),
        Aggregate::Min(f) => format!("min({})", render_numeric_field(binds, f)),
        Aggregate::Max(f) => format!("max({})", render_numeric_field(binds, f)),
        Aggregate::Count => "count(*)".to_string(),
        Aggregate::CountDistinct(f) => format!("count(DISTINCT {})", render_field(binds, f)),
        Aggregate::CountIf(term) => format!("count(*) FILTER (WHERE {})", render_term(binds, term)),
        Aggregate::Quantile(f, q) => format!(
            "approx_quantile({}, {})",
            render_numeric_field(binds, f),
            q.clamp(0.0, 1.0)
        ),
    };
    format!("CAST({} AS DOUBLE)", expr)
}

fn render_range_query(query: &RangeQuery) -> (String, Binds) {
    let mut binds = Binds::default();
    let mut select = Vec::new();

    if let Some(width) = query.bucket_ms {
        // floor(ts / w) * w, also for timestamps before the epoch
        let (a, b, c) = (binds.int(width), binds.int(width), binds.int(width));
        select.push(format!("timestamp - (((timestamp % {}) + {}) % {})", a, b, c));
    }
    for field in &query.group_by {
        select.push(format!("coalesce({}, '')", render_text_field(&mut binds, field)));
    }
    let group_columns = select.len();
    for aggregate in &query.aggregates {
        select.push(render_aggregate(&mut binds, aggregate));
    }

    let filter = render_where(&mut binds, &query.predicate, &query.window);
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select.join(", "),
        query.kind.table(),
        filter
    );
    if group_columns > 0 {
        let ordinals: Vec<String> = (1..=group_columns).map(|i| i.to_string()).collect();
        sql.push_str(&format!(
            " GROUP BY {0} ORDER BY {0}",
            ordinals.join(", ")
        ));
    }
    (sql, binds)
}

fn decode_aggregate_row(
    row: &Row<'_>,
    has_bucket: bool,
    key_count: usize,
    value_count: usize,
) -> Result<AggregateRow> {
    let mut idx = 0;
    let bucket = if has_bucket {
        idx += 1;
        Some(row.get::<_, i64>(0)?)
    } else {
        None
    };

    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        keys.push(row.get::<_, String>(idx)?);
        idx += 1;
    }

    let mut values = Vec::with_capacity(value_count);
    for _ in 0..value_count {
        values.push(row.get::<_, Option<f64>>(idx)?.unwrap_or(0.0));
        idx += 1;
    }

    Ok(AggregateRow { bucket, keys, values })
}

fn decode_header(row: &Row<'_>) -> Result<EventHeader> {
    let labels: String = row.get(4)?;
    let resource_attributes: String = row.get(5)?;
    Ok(EventHeader {
        account_id: row.get(0)?,
        timestamp: row.get(1)?,
        service_name: row.get(2)?,
        host_name: row.get(3)?,
        labels: LabelMap::from_json(&labels)?,
        resource_attributes: LabelMap::from_json(&resource_attributes)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, MetricPoint, ProfileSample, TraceSpan, MINUTE_MS};
    use crate::window::Pagination;
    use pretty_assertions::assert_eq;

    const NOW: i64 = 1_700_000_000_000;

    fn account() -> AccountId {
        AccountId::new("acct-1").unwrap()
    }

    fn point(account: &str, offset_ms: i64, name: &str, value: f64, device: Option<&str>) -> MetricPoint {
        let mut header = EventHeader::new(account, NOW - offset_ms, "api", "host-1");
        if let Some(device) = device {
            header = header.with_label("device", device);
        }
        MetricPoint {
            header,
            metric_name: name.to_string(),
            value,
        }
    }

    async fn seeded() -> DuckDbStore {
        let store = DuckDbStore::open_in_memory().unwrap();
        let ctx = QueryContext::new();
        store
            .insert_batch(
                &ctx,
                EventBatch::Metrics(vec![
                    point("acct-1", MINUTE_MS, "cpu_usage", 10.0, Some("sda")),
                    point("acct-1", 2 * MINUTE_MS, "cpu_usage", 30.0, Some("sdb")),
                    point("acct-1", 3 * MINUTE_MS, "cpu_usage", 20.0, None),
                    point("acct-2", MINUTE_MS, "cpu_usage", 99.0, Some("sda")),
                ]),
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_render_puts_account_first() {
        let query = RangeQuery::new(
            EventKind::Metric,
            Predicate::new(account()).and(Term::Eq(Field::label("device"), "sda".into())),
            TimeWindow::new(0, 10),
        )
        .group(Field::label("zone"))
        .aggregate(Aggregate::Quantile(Field::Value, 0.95));

        let (sql, binds) = render_range_query(&query);
        assert!(sql.contains("approx_quantile(value, 0.95)"));
        assert!(sql.contains("GROUP BY 1 ORDER BY 1"));
        let where_at = sql.find("WHERE").unwrap();
        assert!(sql[where_at..].starts_with("WHERE account_id = "));
        // group key path, then account, window bounds, filter path and value
        assert_eq!(
            binds.0,
            vec![
                Bind::Text("$.\"zone\"".into()),
                Bind::Text("acct-1".into()),
                Bind::Int(0),
                Bind::Int(10),
                Bind::Text("$.\"device\"".into()),
                Bind::Text("sda".into()),
            ]
        );
    }

    #[test]
    fn test_json_path_quotes_dotted_keys() {
        assert_eq!(json_path("k8s.pod.name"), "$.\"k8s.pod.name\"");
        assert_eq!(json_path("we\"ird"), "$.\"we\\\"ird\"");
    }

    #[tokio::test]
    async fn test_aggregate_is_account_scoped() {
        let store = seeded().await;
        let query = RangeQuery::new(
            EventKind::Metric,
            Predicate::new(account()),
            TimeWindow::lookback(NOW, 15),
        )
        .aggregate(Aggregate::Count)
        .aggregate(Aggregate::Max(Field::Value));

        let rows = store.aggregate(&QueryContext::new(), &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec![3.0, 30.0]);
    }

    #[tokio::test]
    async fn test_missing_label_groups_as_empty_and_never_matches() {
        let store = seeded().await;
        let ctx = QueryContext::new();
        let grouped = RangeQuery::new(
            EventKind::Metric,
            Predicate::new(account()),
            TimeWindow::lookback(NOW, 15),
        )
        .group(Field::label("device"))
        .aggregate(Aggregate::Sum(Field::Value));

        let rows = store.aggregate(&ctx, &grouped).await.unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.key(0)).collect();
        assert_eq!(keys, vec!["", "sda", "sdb"]);

        let filtered = RangeQuery::new(
            EventKind::Metric,
            Predicate::new(account()).and(Term::Eq(Field::label("device"), "".into())),
            TimeWindow::lookback(NOW, 15),
        )
        .aggregate(Aggregate::Count);
        let rows = store.aggregate(&ctx, &filtered).await.unwrap();
        assert_eq!(rows[0].value(0), 0.0);
    }

    #[tokio::test]
    async fn test_bucket_alignment() {
        let store = seeded().await;
        let query = RangeQuery::new(
            EventKind::Metric,
            Predicate::new(account()),
            TimeWindow::lookback(NOW, 15),
        )
        .bucket(5 * MINUTE_MS)
        .aggregate(Aggregate::Count);

        let rows = store.aggregate(&QueryContext::new(), &query).await.unwrap();
        for row in &rows {
            let bucket = row.bucket.unwrap();
            assert_eq!(bucket % (5 * MINUTE_MS), 0);
        }
        let total: f64 = rows.iter().map(|r| r.value(0)).sum();
        assert_eq!(total, 3.0);
    }

    #[tokio::test]
    async fn test_count_if_and_quantile_on_spans() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let ctx = QueryContext::new();
        let spans = (0..10)
            .map(|i| TraceSpan {
                header: EventHeader::new("acct-1", NOW - 1000 - i, "checkout", "h1"),
                trace_id: format!("t{}", i),
                span_id: format!("s{}", i),
                parent_span_id: None,
                span_name: "GET /cart".into(),
                duration_ms: (i + 1) as f64 * 10.0,
                status_code: if i < 2 { "ERROR".into() } else { "OK".into() },
            })
            .collect();
        store.insert_batch(&ctx, EventBatch::Spans(spans)).await.unwrap();

        let query = RangeQuery::new(
            EventKind::Span,
            Predicate::new(account()),
            TimeWindow::lookback(NOW, 5),
        )
        .group(Field::ServiceName)
        .aggregate(Aggregate::Count)
        .aggregate(Aggregate::CountIf(Term::NotEq(Field::StatusCode, "OK".into())))
        .aggregate(Aggregate::Quantile(Field::DurationMs, 0.5));

        let rows = store.aggregate(&ctx, &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key(0), "checkout");
        assert_eq!(rows[0].value(0), 10.0);
        assert_eq!(rows[0].value(1), 2.0);
        let median = rows[0].value(2);
        assert!((40.0..=70.0).contains(&median), "median was {}", median);
    }

    #[tokio::test]
    async fn test_insert_rejects_unscoped_events() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let res = store
            .insert_batch(
                &QueryContext::new(),
                EventBatch::Metrics(vec![point("", 0, "cpu_usage", 1.0, None)]),
            )
            .await;
        assert!(matches!(res, Err(AnalyticsError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_profile_samples_round_trip_stack() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let ctx = QueryContext::new();
        store
            .insert_batch(
                &ctx,
                EventBatch::Profiles(vec![ProfileSample {
                    header: EventHeader::new("acct-1", NOW - 10, "api", "h1"),
                    profile_type: "cpu".into(),
                    stack: vec!["main".into(), "handler;with;semicolons".into()],
                    value: 7.0,
                }]),
            )
            .await
            .unwrap();

        let samples = store
            .profile_samples(
                &ctx,
                &SampleQuery {
                    predicate: Predicate::new(account()).and(Term::Eq(Field::ProfileType, "cpu".into())),
                    window: TimeWindow::lookback(NOW, 1),
                },
            )
            .await
            .unwrap();
        assert_eq!(samples, vec![StackSample::new(["main", "handler;with;semicolons"], 7.0)]);
    }

    #[tokio::test]
    async fn test_logs_paginate_newest_first() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let ctx = QueryContext::new();
        let records = (0..5)
            .map(|i| LogRecord {
                header: EventHeader::new("acct-1", NOW - i * 1000, "api", "h1"),
                severity: "INFO".into(),
                body: format!("line {}", i),
            })
            .collect();
        store.insert_batch(&ctx, EventBatch::Logs(records)).await.unwrap();

        let (page, total) = store
            .logs(
                &ctx,
                &LogQuery {
                    predicate: Predicate::new(account()),
                    window: TimeWindow::lookback(NOW, 1),
                    pagination: Pagination::new(Some(2), Some(2)),
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 5);
        let bodies: Vec<&str> = page.iter().map(|r| r.body.as_str()).collect();
        assert_eq!(bodies, vec!["line 2", "line 3"]);

        let (beyond, total) = store
            .logs(
                &ctx,
                &LogQuery {
                    predicate: Predicate::new(account()),
                    window: TimeWindow::lookback(NOW, 1),
                    pagination: Pagination::new(Some(u64::MAX), None),
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert!(beyond.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_the_scan() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let cancelled = QueryContext::new();
        cancelled.cancel();

        let res = store
            .insert_batch(
                &cancelled,
                EventBatch::Metrics(vec![point("acct-1", MINUTE_MS, "cpu_usage", 1.0, None)]),
            )
            .await;
        assert!(matches!(res, Err(AnalyticsError::Cancelled)));

        let rows = store
            .aggregate(
                &QueryContext::new(),
                &RangeQuery::new(EventKind::Metric, Predicate::new(account()), TimeWindow::lookback(NOW, 15))
                    .aggregate(Aggregate::Count),
            )
            .await
            .unwrap();
        assert_eq!(rows.first().map_or(0.0, |row| row.value(0)), 0.0);
    }

    #[tokio::test]
    async fn test_log_severity_is_stored_uppercase() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let ctx = QueryContext::new();
        let record = LogRecord {
            header: EventHeader::new("acct-1", NOW, "api", "h1"),
            severity: " warn".into(),
            body: "disk almost full".into(),
        };
        store.insert_batch(&ctx, EventBatch::Logs(vec![record])).await.unwrap();

        let (page, _) = store
            .logs(
                &ctx,
                &LogQuery {
                    predicate: Predicate::new(account())
                        .and(Term::Eq(Field::Severity, "WARN".into())),
                    window: TimeWindow::lookback(NOW, 1),
                    pagination: Pagination::default(),
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].severity, "WARN");
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = seeded().await;
        // cutoff lands 90s before NOW: the two older acct-1 points age out
        let later = NOW + store.retention().as_millis() as i64 - 90_000;
        let purged = store.purge_expired(later).await.unwrap();
        assert_eq!(purged, 2);

        let remaining = RangeQuery::new(
            EventKind::Metric,
            Predicate::new(account()),
            TimeWindow::lookback(NOW, 15),
        )
        .aggregate(Aggregate::Count);
        let rows = store.aggregate(&QueryContext::new(), &remaining).await.unwrap();
        assert_eq!(rows[0].value(0), 1.0);
    }
}
