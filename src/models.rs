use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{AnalyticsError, Result};

pub const MINUTE_MS: i64 = 60_000;

/// Insertion-ordered label map.
///
/// Label keys are free-form, so this is a plain ordered list of pairs rather
/// than a schema. Re-inserting a key overwrites its value but keeps its
/// original position. A key that is present with an empty value is distinct
/// from a key that is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap(Vec<(String, String)>);

impl LabelMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = LabelMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for LabelMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LabelMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct LabelMapVisitor;

        impl<'de> Visitor<'de> for LabelMapVisitor {
            type Value = LabelMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string labels")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<LabelMap, A::Error> {
                let mut labels = LabelMap::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    labels.insert(k, v);
                }
                Ok(labels)
            }
        }

        deserializer.deserialize_map(LabelMapVisitor)
    }
}

/// Account scope carried by every store query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(AnalyticsError::InvalidRequest(
                "account_id is required".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AccountId {
    type Error = AnalyticsError;

    fn try_from(value: String) -> Result<Self> {
        AccountId::new(value)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open `(start_ms, end_ms]` range in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn lookback(now_ms: i64, minutes: i64) -> Self {
        Self::new(now_ms.saturating_sub(minutes.saturating_mul(MINUTE_MS)), now_ms)
    }

    /// Splits `2 * minutes` before `now_ms` into (previous, current) halves.
    pub fn split(now_ms: i64, minutes: i64) -> (Self, Self) {
        let span = minutes.saturating_mul(MINUTE_MS);
        let split_time = now_ms.saturating_sub(span);
        let start_time = split_time.saturating_sub(span);
        (
            Self::new(start_time, split_time),
            Self::new(split_time, now_ms),
        )
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms > self.start_ms && timestamp_ms <= self.end_ms
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms.saturating_sub(self.start_ms).max(0)
    }

    pub fn duration_minutes(&self) -> f64 {
        self.duration_ms() as f64 / MINUTE_MS as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Metric,
    Log,
    Span,
    Profile,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Metric,
        EventKind::Log,
        EventKind::Span,
        EventKind::Profile,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            EventKind::Metric => "metric_points",
            EventKind::Log => "log_records",
            EventKind::Span => "trace_spans",
            EventKind::Profile => "profile_samples",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Metric => "metric",
            EventKind::Log => "log",
            EventKind::Span => "span",
            EventKind::Profile => "profile",
        }
    }
}

/// Fields every telemetry event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    pub account_id: String,
    pub timestamp: i64,
    pub service_name: String,
    pub host_name: String,
    #[serde(default)]
    pub labels: LabelMap,
    #[serde(default)]
    pub resource_attributes: LabelMap,
}

impl EventHeader {
    pub fn new(account_id: &str, timestamp: i64, service_name: &str, host_name: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            timestamp,
            service_name: service_name.to_string(),
            host_name: host_name.to_string(),
            labels: LabelMap::new(),
            resource_attributes: LabelMap::new(),
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key, value);
        self
    }

    pub fn with_resource(mut self, key: &str, value: &str) -> Self {
        self.resource_attributes.insert(key, value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    #[serde(flatten)]
    pub header: EventHeader,
    pub metric_name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(flatten)]
    pub header: EventHeader,
    pub severity: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    #[serde(flatten)]
    pub header: EventHeader,
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub span_name: String,
    pub duration_ms: f64,
    pub status_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSample {
    #[serde(flatten)]
    pub header: EventHeader,
    pub profile_type: String,
    /// Frames ordered root to leaf.
    pub stack: Vec<String>,
    pub value: f64,
}

/// One call stack and its weight, as read back from the profile table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSample {
    pub stack: Vec<String>,
    pub value: f64,
}

impl StackSample {
    pub fn new<S: Into<String>>(stack: impl IntoIterator<Item = S>, value: f64) -> Self {
        Self {
            stack: stack.into_iter().map(Into::into).collect(),
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "records", rename_all = "snake_case")]
pub enum EventBatch {
    Metrics(Vec<MetricPoint>),
    Logs(Vec<LogRecord>),
    Spans(Vec<TraceSpan>),
    Profiles(Vec<ProfileSample>),
}

impl EventBatch {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBatch::Metrics(_) => EventKind::Metric,
            EventBatch::Logs(_) => EventKind::Log,
            EventBatch::Spans(_) => EventKind::Span,
            EventBatch::Profiles(_) => EventKind::Profile,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EventBatch::Metrics(r) => r.len(),
            EventBatch::Logs(r) => r.len(),
            EventBatch::Spans(r) => r.len(),
            EventBatch::Profiles(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Aggregation {
    #[default]
    Avg,
    Sum,
    Min,
    Max,
    Count,
    P50,
    P95,
    P99,
}

impl Aggregation {
    /// Unknown keywords fall back to `avg`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sum" => Aggregation::Sum,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "count" => Aggregation::Count,
            "p50" => Aggregation::P50,
            "p95" => Aggregation::P95,
            "p99" => Aggregation::P99,
            _ => Aggregation::Avg,
        }
    }

    pub fn quantile(&self) -> Option<f64> {
        match self {
            Aggregation::P50 => Some(0.5),
            Aggregation::P95 => Some(0.95),
            Aggregation::P99 => Some(0.99),
            _ => None,
        }
    }
}

impl From<String> for Aggregation {
    fn from(raw: String) -> Self {
        Aggregation::parse(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub metric_name: String,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub filters: LabelMap,
    #[serde(default)]
    pub alias: Option<String>,
    /// Bucket width such as `"30s"` or `"5m"`.
    #[serde(default)]
    pub interval: Option<String>,
}

impl MetricQuery {
    pub fn new(metric_name: &str) -> Self {
        Self {
            metric_name: metric_name.to_string(),
            aggregation: Aggregation::Avg,
            group_by: Vec::new(),
            filters: LabelMap::new(),
            alias: None,
            interval: None,
        }
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn group_by(mut self, key: &str) -> Self {
        self.group_by.push(key.to_string());
        self
    }

    pub fn filter(mut self, key: &str, value: &str) -> Self {
        self.filters.insert(key, value);
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn interval(mut self, interval: &str) -> Self {
        self.interval = Some(interval.to_string());
        self
    }

    pub fn series_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.metric_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: i64,
    pub value: f64,
}

/// Summary over a series' own data points. All zero for an empty series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: usize,
}

impl SeriesStats {
    pub fn from_points(points: &[DataPoint]) -> Self {
        if points.is_empty() {
            return Self::default();
        }

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for point in points {
            min = min.min(point.value);
            max = max.max(point.value);
            sum += point.value;
        }

        Self {
            avg: sum / points.len() as f64,
            min,
            max,
            sum,
            count: points.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub name: String,
    pub labels: LabelMap,
    pub data_points: Vec<DataPoint>,
    pub stats: SeriesStats,
}

/// Envelope for paginated responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub page: u64,
    pub page_size: u64,
}
