//! Central error taxonomy.
//!
//! Every fallible operation in the controller returns `Result<T, AppError>`
//! (or `anyhow::Result<T>` deep inside a single adapter where the call site
//! immediately folds the error into one of these kinds). The HTTP layer maps
//! `AppError` to a status code once, at the edge, via `IntoResponse`.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("credential missing for {exchange}: {detail}")]
    CredentialMissing { exchange: String, detail: String },

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("venue error {code}: {message}")]
    VenueError { code: String, message: String },

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("{0}")]
    OrderError(#[from] Box<OrderError>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl AppError {
    pub fn order(err: OrderError) -> Self {
        Self::OrderError(Box::new(err))
    }
}

/// Structured per-order failure surface, per spec §4.1.
#[derive(Debug, Clone, Serialize, Error)]
#[error("{exchange}/{symbol} order failed: {message}")]
pub struct OrderError {
    pub exchange: String,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub leverage: u32,
    pub required_margin_usd: Option<f64>,
    pub available_usd: Option<f64>,
    pub code: String,
    pub message: String,
    pub friendly: String,
    pub suggestion: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::ConfigInvalid(_) | AppError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::CredentialMissing { .. } => StatusCode::UNAUTHORIZED,
            AppError::TransientNetwork(_) => StatusCode::BAD_GATEWAY,
            AppError::VenueError { .. } => StatusCode::BAD_GATEWAY,
            AppError::ParseError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ValidationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::OrderError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::TransientNetwork(err.to_string())
    }
}
