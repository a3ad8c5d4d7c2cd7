use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppState;
use crate::metrics::RequestTimer;
use crate::models::{EventBatch, EventKind};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub kind: EventKind,
    pub inserted: usize,
}

pub async fn ingest_batch(
    State(state): State<AppState>,
    Json(batch): Json<EventBatch>,
) -> Result<Json<IngestResponse>> {
    let _timer = RequestTimer::new("ingest");
    let kind = batch.kind();
    if batch.is_empty() {
        return Ok(Json(IngestResponse { kind, inserted: 0 }));
    }

    let inserted = state.store.insert_batch(&state.query_context(), batch).await?;
    info!(kind = kind.as_str(), inserted, "Ingested batch");
    Ok(Json(IngestResponse { kind, inserted }))
}
