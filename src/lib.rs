pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod query;
pub mod retention;
pub mod rollup;
pub mod store;
pub mod window;

pub use error::{AnalyticsError, Result};
