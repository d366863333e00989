use serde::Serialize;

use crate::ledger::{CheckpointOutcome, GcStats, LedgerId, StorageStatus};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub storage: StorageStatus,
}

#[derive(Debug, Serialize)]
pub struct CheckpointResponse {
    pub checkpoint: CheckpointOutcome,
}

#[derive(Debug, Serialize)]
pub struct GcResponse {
    pub gc: GcStats,
}

#[derive(Debug, Serialize)]
pub struct DeletionResponse {
    pub ledger_id: LedgerId,
    /// False if the ledger was already marked deleted
    pub newly_marked: bool,
}
