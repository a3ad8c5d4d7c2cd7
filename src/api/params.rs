use crate::models::{AccountId, LabelMap, TimeWindow};
use crate::window::{Lookback, Pagination};
use crate::{AnalyticsError, Result};

/// Query-string prefix for label filters, e.g. `label.status=500`.
pub const LABEL_PREFIX: &str = "label.";

/// Common dashboard query parameters.
///
/// Read from raw pairs so that `label.*` keys can be collected without a
/// fixed schema. Malformed numbers fall back to defaults instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardParams {
    pub account: AccountId,
    pub lookback: Lookback,
    pub pagination: Pagination,
    pub labels: LabelMap,
    pairs: Vec<(String, String)>,
}

impl DashboardParams {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Result<Self> {
        let get = |key: &str| {
            pairs
                .iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        let account = get("account_id")
            .ok_or_else(|| AnalyticsError::InvalidRequest("account_id is required".to_string()))
            .and_then(AccountId::new)?;
        let lookback = Lookback::from_params(
            get("window_minutes").and_then(|v| v.trim().parse().ok()),
            get("window"),
        );
        let pagination = Pagination::new(
            get("page").and_then(|v| v.trim().parse().ok()),
            get("page_size").and_then(|v| v.trim().parse().ok()),
        );

        let mut labels = LabelMap::new();
        for (key, value) in &pairs {
            if let Some(label) = key.strip_prefix(LABEL_PREFIX) {
                if !label.is_empty() {
                    labels.insert(label, value.as_str());
                }
            }
        }

        Ok(Self {
            account,
            lookback,
            pagination,
            labels,
            pairs,
        })
    }

    /// Last value wins for repeated keys. Empty values read as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn window_minutes(&self) -> i64 {
        self.lookback.minutes()
    }

    pub fn window(&self, now_ms: i64) -> TimeWindow {
        TimeWindow::lookback(now_ms, self.window_minutes())
    }
}
