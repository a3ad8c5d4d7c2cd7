use serde::{Deserialize, Serialize};

pub const DEFAULT_WINDOW_MINUTES: i64 = 15;
/// 90 days. Longer lookbacks are clamped here.
pub const MAX_WINDOW_MINUTES: i64 = 90 * 24 * 60;
pub const DEFAULT_PAGE_SIZE: u64 = 50;
pub const MAX_PAGE_SIZE: u64 = 1000;

/// Parses a lookback such as `"15m"`, `"1h"`, `"24h"` or `"7d"` into minutes.
///
/// Anything that does not parse, including an unknown unit or an amount too
/// large to represent, yields [`DEFAULT_WINDOW_MINUTES`]. Valid lookbacks are
/// capped at [`MAX_WINDOW_MINUTES`].
pub fn parse_duration_minutes(raw: &str) -> i64 {
    let raw = raw.trim();
    let Some(unit) = raw.chars().last() else {
        return DEFAULT_WINDOW_MINUTES;
    };
    let amount = match raw[..raw.len() - unit.len_utf8()].parse::<i64>() {
        Ok(amount) if amount > 0 => amount,
        _ => return DEFAULT_WINDOW_MINUTES,
    };

    let minutes = match unit {
        'm' => Some(amount),
        'h' => amount.checked_mul(60),
        'd' => amount.checked_mul(60 * 24),
        _ => None,
    };
    minutes.map_or(DEFAULT_WINDOW_MINUTES, clamp_minutes)
}

fn clamp_minutes(minutes: i64) -> i64 {
    minutes.min(MAX_WINDOW_MINUTES)
}

/// Parses a bucket width such as `"30s"`, `"5m"` or `"1h"` into seconds.
pub fn parse_interval_secs(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let unit = raw.chars().last()?;
    let amount = raw[..raw.len() - unit.len_utf8()].parse::<i64>().ok()?;
    if amount <= 0 {
        return None;
    }

    match unit {
        's' => Some(amount),
        'm' => amount.checked_mul(60),
        'h' => amount.checked_mul(3600),
        'd' => amount.checked_mul(86_400),
        _ => None,
    }
}

/// Lookback as sent by the dashboard: a preset minute count or a duration string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lookback {
    Minutes(i64),
    Duration(String),
}

impl Lookback {
    pub fn minutes(&self) -> i64 {
        match self {
            Lookback::Minutes(m) if *m > 0 => clamp_minutes(*m),
            Lookback::Minutes(_) => DEFAULT_WINDOW_MINUTES,
            Lookback::Duration(raw) => parse_duration_minutes(raw),
        }
    }

    /// `window_minutes` takes precedence over a `window` duration string.
    pub fn from_params(window_minutes: Option<i64>, window: Option<&str>) -> Self {
        match (window_minutes, window) {
            (Some(m), _) => Lookback::Minutes(m),
            (None, Some(raw)) => Lookback::Duration(raw.to_string()),
            (None, None) => Lookback::Minutes(DEFAULT_WINDOW_MINUTES),
        }
    }
}

impl Default for Lookback {
    fn default() -> Self {
        Lookback::Minutes(DEFAULT_WINDOW_MINUTES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u64,
    pub page_size: u64,
}

impl Pagination {
    pub fn new(page: Option<u64>, page_size: Option<u64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Saturates instead of wrapping for absurd page numbers.
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    /// Slices an already-computed row set.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let skip = usize::try_from(self.offset()).unwrap_or(usize::MAX);
        items
            .into_iter()
            .skip(skip)
            .take(self.page_size as usize)
            .collect()
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_units() {
        assert_eq!(parse_duration_minutes("15m"), 15);
        assert_eq!(parse_duration_minutes("1h"), 60);
        assert_eq!(parse_duration_minutes("24h"), 1440);
        assert_eq!(parse_duration_minutes("7d"), 10_080);
    }

    #[test]
    fn test_duration_fallback() {
        assert_eq!(parse_duration_minutes("3w"), DEFAULT_WINDOW_MINUTES);
        assert_eq!(parse_duration_minutes(""), DEFAULT_WINDOW_MINUTES);
        assert_eq!(parse_duration_minutes("abc"), DEFAULT_WINDOW_MINUTES);
        assert_eq!(parse_duration_minutes("-5m"), DEFAULT_WINDOW_MINUTES);
    }

    #[test]
    fn test_oversized_lookback_is_clamped() {
        assert_eq!(parse_duration_minutes("9999999999999d"), MAX_WINDOW_MINUTES);
        assert_eq!(parse_duration_minutes("9223372036854775807h"), DEFAULT_WINDOW_MINUTES);
        assert_eq!(parse_duration_minutes("365d"), MAX_WINDOW_MINUTES);
        assert_eq!(Lookback::Minutes(9_223_372_036_854_775).minutes(), MAX_WINDOW_MINUTES);
        assert_eq!(Lookback::Minutes(i64::MAX).minutes(), MAX_WINDOW_MINUTES);
        assert_eq!(parse_interval_secs("9223372036854775807d"), None);
    }

    #[test]
    fn test_interval() {
        assert_eq!(parse_interval_secs("30s"), Some(30));
        assert_eq!(parse_interval_secs("5m"), Some(300));
        assert_eq!(parse_interval_secs("1h"), Some(3600));
        assert_eq!(parse_interval_secs("0m"), None);
        assert_eq!(parse_interval_secs("fast"), None);
    }

    #[test]
    fn test_lookback() {
        assert_eq!(Lookback::from_params(Some(30), Some("1h")).minutes(), 30);
        assert_eq!(Lookback::from_params(None, Some("1h")).minutes(), 60);
        assert_eq!(Lookback::from_params(None, None).minutes(), 15);
        assert_eq!(Lookback::Minutes(0).minutes(), 15);

        let parsed: Lookback = serde_json::from_str(r#""24h""#).unwrap();
        assert_eq!(parsed.minutes(), 1440);
    }

    #[test]
    fn test_pagination() {
        let page = Pagination::new(Some(3), Some(20));
        assert_eq!(page.offset(), 40);

        let first = Pagination::new(Some(0), None);
        assert_eq!(first.page, 1);
        assert_eq!(first.offset(), 0);
        assert_eq!(first.page_size, DEFAULT_PAGE_SIZE);

        assert_eq!(Pagination::new(None, Some(5000)).page_size, MAX_PAGE_SIZE);

        let rows: Vec<u32> = (0..10).collect();
        assert_eq!(Pagination::new(Some(2), Some(4)).apply(rows), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_huge_page_saturates() {
        let page = Pagination::new(Some(u64::MAX), None);
        assert_eq!(page.offset(), u64::MAX);
        assert!(page.apply(vec![1, 2, 3]).is_empty());
    }
}
