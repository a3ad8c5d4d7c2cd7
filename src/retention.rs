use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::store::EventStore;

/// Periodically drops rows that have aged past the store's retention.
/// Runs until `shutdown` is cancelled.
pub fn spawn_retention_sweep(
    store: Arc<dyn EventStore>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(every_secs = every.as_secs(), "Retention sweep started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Retention sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    if let Err(e) = store.purge_expired(now_ms).await {
                        error!("Failed to purge expired rows: {}", e);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, EventBatch, EventHeader, EventKind, LogRecord, TimeWindow};
    use crate::store::{Aggregate, DuckDbStore, Predicate, QueryContext, RangeQuery};

    #[tokio::test]
    async fn test_sweep_purges_then_stops() {
        let store = Arc::new(DuckDbStore::open_in_memory().unwrap());
        let ctx = QueryContext::new();
        let now = chrono::Utc::now().timestamp_millis();
        let stale = now - store.retention().as_millis() as i64 - 60_000;
        let record = |ts: i64| LogRecord {
            header: EventHeader::new("acct-1", ts, "api", "h1"),
            severity: "INFO".into(),
            body: "x".into(),
        };
        store
            .insert_batch(&ctx, EventBatch::Logs(vec![record(stale), record(now - 1000)]))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_retention_sweep(store.clone(), Duration::from_millis(20), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let query = RangeQuery::new(
            EventKind::Log,
            Predicate::new(AccountId::new("acct-1").unwrap()),
            TimeWindow::new(i64::MIN / 2, now),
        )
        .aggregate(Aggregate::Count);
        let rows = store.aggregate(&ctx, &query).await.unwrap();
        assert_eq!(rows[0].value(0), 1.0);
    }
}
