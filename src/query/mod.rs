//! Dashboard query building blocks: label filters, period comparison,
//! metric series resolution and log search.

pub mod engine;
pub mod filter;
pub mod logs;
pub mod period;

pub use self::engine::MetricQueryEngine;
pub use self::filter::{FilterSet, GroupKeys};
pub use self::logs::{search_logs, LogSearch};
pub use self::period::{PeriodComparator, PeriodDelta};
