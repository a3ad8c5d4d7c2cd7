use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::models::{EventKind, TimeWindow};
use crate::store::{Aggregate, EventStore, Predicate, QueryContext, RangeQuery};
use crate::Result;

/// A value over the most recent window and the window before it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodDelta {
    pub current: f64,
    pub previous: f64,
    pub delta_percent: f64,
}

impl PeriodDelta {
    /// `delta_percent` is 0 whenever `previous` is 0.
    pub fn new(current: f64, previous: f64) -> Self {
        let delta_percent = if previous == 0.0 {
            0.0
        } else {
            (current - previous) / previous * 100.0
        };
        Self {
            current,
            previous,
            delta_percent: if delta_percent.is_finite() { delta_percent } else { 0.0 },
        }
    }
}

/// Evaluates one expression over `(now - 2N, now - N]` and `(now - N, now]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodComparator {
    now_ms: i64,
    window_minutes: i64,
}

impl PeriodComparator {
    pub fn new(now_ms: i64, window_minutes: i64) -> Self {
        Self {
            now_ms,
            window_minutes,
        }
    }

    pub fn window_minutes(&self) -> i64 {
        self.window_minutes
    }

    /// (previous, current)
    pub fn windows(&self) -> (TimeWindow, TimeWindow) {
        TimeWindow::split(self.now_ms, self.window_minutes)
    }

    pub async fn compare<F, Fut>(&self, eval: F) -> Result<PeriodDelta>
    where
        F: Fn(TimeWindow) -> Fut,
        Fut: Future<Output = Result<f64>>,
    {
        let (previous_window, current_window) = self.windows();
        let (current, previous) =
            futures::try_join!(eval(current_window), eval(previous_window))?;
        Ok(PeriodDelta::new(current, previous))
    }
}

/// Single ungrouped aggregate over one event kind; 0 when nothing matched.
pub async fn scalar(
    store: &dyn EventStore,
    ctx: &QueryContext,
    kind: EventKind,
    predicate: &Predicate,
    aggregate: Aggregate,
    window: TimeWindow,
) -> Result<f64> {
    let query = RangeQuery::new(kind, predicate.clone(), window).aggregate(aggregate);
    let rows = store.aggregate(ctx, &query).await?;
    Ok(rows.first().map(|row| row.value(0)).unwrap_or(0.0))
}
