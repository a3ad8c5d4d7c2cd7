use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Data source error: {0}")]
    Database(String),

    #[error("Query timed out: {0}")]
    Timeout(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<duckdb::Error> for AnalyticsError {
    fn from(err: duckdb::Error) -> Self {
        AnalyticsError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AnalyticsError {
    fn from(err: serde_json::Error) -> Self {
        AnalyticsError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AnalyticsError {
    fn from(err: tokio::task::JoinError) -> Self {
        AnalyticsError::Internal(format!("Store task failed: {}", err))
    }
}

impl IntoResponse for AnalyticsError {
    fn into_response(self) -> Response {
        let status = match self {
            AnalyticsError::Database(_) => StatusCode::BAD_GATEWAY,
            AnalyticsError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AnalyticsError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            AnalyticsError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AnalyticsError::Serialization(_) => StatusCode::BAD_REQUEST,
            AnalyticsError::NotFound(_) => StatusCode::NOT_FOUND,
            AnalyticsError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
