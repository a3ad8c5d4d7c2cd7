use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub use crate::query::engine::DEFAULT_INTERVAL_SECS;
use crate::rollup::HealthPolicy;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATABASE_PATH: &str = ":memory:";
pub const DEFAULT_RETENTION_HOURS: u64 = 72;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PURGE_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub retention: Duration,
    pub query_timeout: Duration,
    pub default_interval_secs: i64,
    pub purge_interval: Duration,
    pub health: HealthPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            retention: Duration::from_secs(DEFAULT_RETENTION_HOURS * 3600),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            default_interval_secs: DEFAULT_INTERVAL_SECS,
            purge_interval: Duration::from_secs(DEFAULT_PURGE_INTERVAL_SECS),
            health: HealthPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Unset keys keep their default. Values that do not parse are logged and
    /// also keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let read = Reader { lookup: &lookup };
        let h = defaults.health;

        let health = HealthPolicy {
            critical_error_rate: read.positive("HEALTH_CRITICAL_ERROR_RATE", h.critical_error_rate),
            warning_error_rate: read.positive("HEALTH_WARNING_ERROR_RATE", h.warning_error_rate),
            critical_p95_ms: read.positive("HEALTH_CRITICAL_P95_MS", h.critical_p95_ms),
            warning_p95_ms: read.positive("HEALTH_WARNING_P95_MS", h.warning_p95_ms),
            availability_baseline: read.positive("SLO_AVAILABILITY_BASELINE", h.availability_baseline),
            latency_compliance_full: h.latency_compliance_full,
            latency_compliance_degraded: h.latency_compliance_degraded,
            latency_compliance_poor: h.latency_compliance_poor,
            breach_success_rate: read.positive("SLO_BREACH_SUCCESS_RATE", h.breach_success_rate),
            breach_availability: read.positive("SLO_BREACH_AVAILABILITY", h.breach_availability),
            breach_latency_compliance: read.positive(
                "SLO_BREACH_LATENCY_COMPLIANCE",
                h.breach_latency_compliance,
            ),
            warn_success_rate: read.positive("SLO_WARN_SUCCESS_RATE", h.warn_success_rate),
            warn_availability: read.positive("SLO_WARN_AVAILABILITY", h.warn_availability),
            warn_latency_compliance: read.positive(
                "SLO_WARN_LATENCY_COMPLIANCE",
                h.warn_latency_compliance,
            ),
        };

        Self {
            port: read.positive("PORT", defaults.port),
            database_path: lookup("DATABASE_PATH")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.database_path),
            retention: Duration::from_secs(
                read.positive("RETENTION_HOURS", DEFAULT_RETENTION_HOURS) * 3600,
            ),
            query_timeout: Duration::from_secs(
                read.positive("QUERY_TIMEOUT_SECS", DEFAULT_QUERY_TIMEOUT_SECS),
            ),
            default_interval_secs: read.positive("DEFAULT_INTERVAL_SECS", DEFAULT_INTERVAL_SECS),
            purge_interval: Duration::from_secs(
                read.positive("PURGE_INTERVAL_SECS", DEFAULT_PURGE_INTERVAL_SECS),
            ),
            health,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

struct Reader<'a, F> {
    lookup: &'a F,
}

impl<F> Reader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn positive<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + PartialOrd + Default + Copy,
    {
        let Some(raw) = (self.lookup)(key) else {
            return default;
        };
        match raw.trim().parse::<T>() {
            Ok(value) if value > T::default() => value,
            _ => {
                warn!(key, value = %raw, "Ignoring invalid setting, using default");
                default
            }
        }
    }
}
