//! Derived dashboard views. Everything here is rebuilt per request from the
//! event store and never cached.

pub mod flamegraph;
pub mod health;
pub mod hotspots;
pub mod overview;

pub use self::flamegraph::{build_flamegraph, FlamegraphNode, FlamegraphRequest};
pub use self::health::{HealthPolicy, HealthStatus, ServiceHealthRollup, ServiceHealthRow, SloStatus};
pub use self::hotspots::{HotspotReport, HotspotRollup, Resource};
pub use self::overview::{Overview, OverviewRollup};
