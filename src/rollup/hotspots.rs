//! Infrastructure hotspots per resource class.
//!
//! Each resource is resolved on its own. One failing resource does not fail
//! the response; it is listed under `unavailable` instead.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{AccountId, EventKind, TimeWindow};
use crate::query::period::{scalar, PeriodComparator, PeriodDelta};
use crate::store::{
    Aggregate, AggregateRow, EventStore, Field, Predicate, QueryContext, RangeQuery, Term,
};
use crate::Result;

pub const DEFAULT_TOP_N: usize = 5;
pub const MAX_TOP_N: usize = 100;
pub const GPU_UUID_LABEL: &str = "gpu_uuid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
    Network,
    Gpu,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::Cpu,
        Resource::Memory,
        Resource::Disk,
        Resource::Network,
        Resource::Gpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Memory => "memory",
            Resource::Disk => "disk",
            Resource::Network => "network",
            Resource::Gpu => "gpu",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    pub fn metric_name(&self) -> &'static str {
        match self {
            Resource::Cpu => "system.cpu.utilization",
            Resource::Memory => "system.memory.utilization",
            Resource::Disk => "system.disk.utilization",
            Resource::Network => "system.network.utilization",
            Resource::Gpu => "gpu.utilization",
        }
    }

    /// GPUs are ranked per device, everything else per host.
    pub fn entity_field(&self) -> Field {
        match self {
            Resource::Gpu => Field::label(GPU_UUID_LABEL),
            _ => Field::HostName,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotspotEntity {
    pub entity: String,
    /// Every service that reported this entity in the window, sorted.
    pub services: Vec<String>,
    pub current: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHotspots {
    pub resource: Resource,
    pub average: PeriodDelta,
    pub top: Vec<HotspotEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotspotReport {
    pub window_minutes: i64,
    pub resources: Vec<ResourceHotspots>,
    pub unavailable: Vec<Resource>,
}

#[derive(Clone)]
pub struct HotspotRollup {
    store: Arc<dyn EventStore>,
    top_n: usize,
}

impl HotspotRollup {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            top_n: DEFAULT_TOP_N,
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n.clamp(1, MAX_TOP_N);
        self
    }

    pub async fn compute(
        &self,
        ctx: &QueryContext,
        account: &AccountId,
        now_ms: i64,
        window_minutes: i64,
        resources: &[Resource],
    ) -> HotspotReport {
        let comparator = PeriodComparator::new(now_ms, window_minutes);
        let outcomes = join_all(
            resources
                .iter()
                .map(|&resource| self.resource(ctx, account, &comparator, resource)),
        )
        .await;

        let mut report = HotspotReport {
            window_minutes,
            resources: Vec::new(),
            unavailable: Vec::new(),
        };
        for (resource, outcome) in resources.iter().zip(outcomes) {
            match outcome {
                Ok(hotspots) => report.resources.push(hotspots),
                Err(err) => {
                    warn!(resource = resource.as_str(), error = %err, "Hotspot query failed");
                    report.unavailable.push(*resource);
                }
            }
        }
        report
    }

    async fn resource(
        &self,
        ctx: &QueryContext,
        account: &AccountId,
        comparator: &PeriodComparator,
        resource: Resource,
    ) -> Result<ResourceHotspots> {
        let store = self.store.as_ref();
        let scope = Predicate::new(account.clone())
            .and(Term::Eq(Field::MetricName, resource.metric_name().to_string()));
        let (_, current_window) = comparator.windows();

        let (average, top) = futures::try_join!(
            comparator.compare(|w| scalar(
                store,
                ctx,
                EventKind::Metric,
                &scope,
                Aggregate::Avg(Field::Value),
                w
            )),
            self.top_entities(ctx, &scope, resource, current_window),
        )?;

        Ok(ResourceHotspots {
            resource,
            average,
            top,
        })
    }

    async fn top_entities(
        &self,
        ctx: &QueryContext,
        scope: &Predicate,
        resource: Resource,
        window: TimeWindow,
    ) -> Result<Vec<HotspotEntity>> {
        let query = RangeQuery::new(EventKind::Metric, scope.clone(), window)
            .group(resource.entity_field())
            .group(Field::ServiceName)
            .aggregate(Aggregate::Sum(Field::Value))
            .aggregate(Aggregate::Count);

        let rows = self.store.aggregate(ctx, &query).await?;
        let mut entities = merge_entities(rows);

        entities.sort_by(|a, b| {
            b.current
                .total_cmp(&a.current)
                .then_with(|| a.entity.cmp(&b.entity))
        });
        entities.truncate(self.top_n);
        Ok(entities)
    }
}

/// Folds (entity, service) rows into one entry per entity so a host shared by
/// several services holds a single top-N slot. Rows without an entity are dropped.
fn merge_entities(rows: Vec<AggregateRow>) -> Vec<HotspotEntity> {
    let mut merged: BTreeMap<String, (BTreeSet<String>, f64, f64)> = BTreeMap::new();
    for row in rows.iter().filter(|row| !row.key(0).is_empty()) {
        let (services, sum, count) = merged.entry(row.key(0).to_string()).or_default();
        services.insert(row.key(1).to_string());
        *sum += row.value(0);
        *count += row.value(1);
    }

    merged
        .into_iter()
        .map(|(entity, (services, sum, count))| HotspotEntity {
            entity,
            services: services.into_iter().collect(),
            current: if count == 0.0 { 0.0 } else { sum / count },
        })
        .collect()
}
