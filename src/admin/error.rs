use axum::{Json, http::StatusCode, response::IntoResponse};
use thiserror::Error;

use super::models::ErrorResponse;
use crate::ledger::{ErrorKind, StorageError};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AdminError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::Storage(err) => match err.kind() {
                ErrorKind::NoSuchLedger | ErrorKind::NoSuchEntry => StatusCode::NOT_FOUND,
                ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
                ErrorKind::LedgerFenced => StatusCode::CONFLICT,
                ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
                ErrorKind::Interrupted => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::IoFailure => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AdminError::InvalidRequest(_) => "INVALID_REQUEST",
            AdminError::Storage(err) => match err.kind() {
                ErrorKind::NoSuchLedger => "NO_SUCH_LEDGER",
                ErrorKind::NoSuchEntry => "NO_SUCH_ENTRY",
                ErrorKind::Unauthorized => "UNAUTHORIZED",
                ErrorKind::LedgerFenced => "LEDGER_FENCED",
                ErrorKind::InvalidRequest => "INVALID_REQUEST",
                ErrorKind::Interrupted => "UNAVAILABLE",
                ErrorKind::IoFailure => "STORAGE_FAILURE",
            },
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "Admin request failed");
        }
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
