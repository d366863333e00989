use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use super::{
    error::AdminError,
    models::{CheckpointResponse, DeletionResponse, GcResponse, HealthResponse},
    state::AdminState,
};
use crate::ledger::LedgerId;
use crate::maintenance;

/// Health check endpoint (GET /health)
///
/// Reports the storage lifecycle state, the read-only flag and the
/// storage counters. Returns 503 unless storage is running.
pub async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let storage = state.storage.status();
    let (status_code, status) = match (storage.state, storage.readonly) {
        ("running", false) => (StatusCode::OK, "healthy"),
        ("running", true) => (StatusCode::OK, "readonly"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        storage,
    };
    (status_code, Json(response))
}

/// Ledger status (GET /ledgers/{ledger_id})
pub async fn get_ledger(
    State(state): State<AdminState>,
    Path(ledger_id): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let ledger_id = parse_ledger_id(&ledger_id)?;
    let info = state.storage.ledger_info(ledger_id)?;
    Ok((StatusCode::OK, Json(info)))
}

/// Take a checkpoint now (POST /admin/checkpoint)
pub async fn checkpoint(
    State(state): State<AdminState>,
) -> Result<impl IntoResponse, AdminError> {
    let outcome = maintenance::checkpoint(state.storage.clone()).await?;
    info!(mark = %outcome.mark, "Checkpoint taken on request");
    Ok((StatusCode::OK, Json(CheckpointResponse { checkpoint: outcome })))
}

/// Run garbage collection now (POST /admin/gc)
pub async fn gc(State(state): State<AdminState>) -> Result<impl IntoResponse, AdminError> {
    let stats = maintenance::reclaim(state.storage.clone()).await?;
    Ok((StatusCode::OK, Json(GcResponse { gc: stats })))
}

/// Record a ledger deletion (POST /admin/ledgers/{ledger_id}/deleted)
///
/// The ledger's data is reclaimed by the next garbage collection run.
pub async fn mark_deleted(
    State(state): State<AdminState>,
    Path(ledger_id): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let ledger_id = parse_ledger_id(&ledger_id)?;
    let newly_marked = state.deleted.mark_deleted(ledger_id);
    info!(ledger_id, newly_marked, "Ledger marked deleted");
    Ok((
        StatusCode::ACCEPTED,
        Json(DeletionResponse {
            ledger_id,
            newly_marked,
        }),
    ))
}

fn parse_ledger_id(raw: &str) -> Result<LedgerId, AdminError> {
    raw.parse()
        .map_err(|_| AdminError::InvalidRequest(format!("invalid ledger id: {raw}")))
}
