//! Crate-wide error type.
//!
//! Mirrors §7 of the design: every handler-facing failure collapses into one
//! of these variants, each carrying its own status code and a
//! `{success:false, error}` body. Nothing here is retried automatically —
//! retry is the caller's duty.

use axum::{http::StatusCode, response::IntoResponse, response::Json, response::Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("upstream fetch failed: {0}")]
    Upstream(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("portfolio risk rejected: {reason}")]
    PortfolioRiskRejected { reason: String, meta: serde_json::Value },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn portfolio_risk(reason: impl Into<String>, meta: serde_json::Value) -> Self {
        AppError::PortfolioRiskRejected {
            reason: reason.into(),
            meta,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, meta) = match &self {
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, None),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, None),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, None),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            AppError::PortfolioRiskRejected { meta, .. } => {
                (StatusCode::BAD_REQUEST, Some(meta.clone()))
            }
            AppError::InsufficientData(_) => (StatusCode::BAD_REQUEST, None),
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal failure");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        let message = match &self {
            // Internal errors are redacted outside development.
            AppError::Internal(_) if !cfg!(debug_assertions) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                error: message,
                meta,
            }),
        )
            .into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
