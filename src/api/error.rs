use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::errors::{BalancerError, ConfigurationError, LedgerError};

/// Error returned by every handler; rendered as `{"error": kind, "message": ...}`.
#[derive(Debug)]
pub enum ApiError {
    Balancer(BalancerError),
    BadRequest(String),
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Balancer(err) => match err {
                BalancerError::Configuration(ConfigurationError::Persist(_)) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                BalancerError::Configuration(_) => StatusCode::BAD_REQUEST,
                BalancerError::Ledger(LedgerError::NotFound(_)) => StatusCode::NOT_FOUND,
                BalancerError::Ledger(LedgerError::InvalidTransition { .. }) => StatusCode::CONFLICT,
                BalancerError::Collection(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Balancer(err) => err.kind(),
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
        }
    }
}

impl From<BalancerError> for ApiError {
    fn from(err: BalancerError) -> Self {
        ApiError::Balancer(err)
    }
}

impl From<ConfigurationError> for ApiError {
    fn from(err: ConfigurationError) -> Self {
        ApiError::Balancer(err.into())
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Balancer(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Balancer(err) => err.to_string(),
            ApiError::BadRequest(message) | ApiError::NotFound(message) => message.clone(),
        };
        (
            self.status(),
            Json(json!({
                "error": self.kind(),
                "message": message
            })),
        )
            .into_response()
    }
}
