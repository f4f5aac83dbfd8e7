//! Raw ingest endpoints (§4.3, §6).
//!
//! `POST /ingest/raw` accepts one trader's scraped snapshot verbatim —
//! arbitrary shape beyond `leadId`/`fetchedAt` — stores it, then runs a
//! derivation pass inline so the caller's next read sees fresh scores.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::api::state::AppState;
use crate::derive::run_derivation_pass;
use crate::error::{AppError, AppResult};
use crate::models::TraderScore;

#[derive(Debug, serde::Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub trader_id: String,
    pub derived: Option<TraderScore>,
}

pub async fn ingest_raw(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> AppResult<Json<IngestResponse>> {
    let trader_id = payload
        .get("leadId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::validation("leadId is required"))?
        .to_string();

    if payload.get("fetchedAt").and_then(|v| v.as_str()).is_none() {
        return Err(AppError::validation("fetchedAt is required"));
    }

    state
        .db
        .insert_raw_ingest(&trader_id, &payload)
        .map_err(AppError::Internal)?;

    let derived = match run_derivation_pass(&state.db, &trader_id) {
        Ok(score) => score,
        Err(err) => {
            warn!(trader_id, error = %err, "derivation pass failed after ingest");
            None
        }
    };

    Ok(Json(IngestResponse {
        success: true,
        trader_id,
        derived,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListRawIngestQuery {
    #[serde(default)]
    pub include_payload: bool,
    pub limit: Option<i64>,
}

pub async fn list_raw_ingest(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
    Query(query): Query<ListRawIngestQuery>,
) -> AppResult<Json<Vec<crate::storage::raw_ingest::RawIngestRecord>>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let records = state
        .db
        .list_raw_ingest(&lead_id, limit, query.include_payload)
        .map_err(AppError::Internal)?;
    Ok(Json(records))
}
