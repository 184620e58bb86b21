use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use zanzibar_storage::StorageError;

/// Startup and lifecycle failures of the server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Datastore connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(#[from] database_layer::MigrationError),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl From<config_engine::ConfigError> for ServerError {
    fn from(err: config_engine::ConfigError) -> Self {
        ServerError::Configuration(err.to_string())
    }
}

impl From<auth_gateway::AuthError> for ServerError {
    fn from(err: auth_gateway::AuthError) -> Self {
        ServerError::Configuration(err.to_string())
    }
}

impl From<telemetry::TelemetryError> for ServerError {
    fn from(err: telemetry::TelemetryError) -> Self {
        ServerError::Configuration(err.to_string())
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Connection(msg) => ServerError::Connection(msg),
            other => ServerError::Storage(other),
        }
    }
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error_type: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A storage failure surfaced through the HTTP API.
#[derive(Debug)]
pub struct ApiError(pub StorageError);

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self.0 {
            StorageError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            StorageError::InvalidWriteInput(_) => (StatusCode::BAD_REQUEST, "invalid_write_input"),
            StorageError::ExceededWriteBatchLimit { .. } => {
                (StatusCode::BAD_REQUEST, "exceeded_write_batch_limit")
            }
            StorageError::InvalidFilter(_) => (StatusCode::BAD_REQUEST, "invalid_filter"),
            StorageError::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded"),
            StorageError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
            StorageError::Connection(_) => (StatusCode::SERVICE_UNAVAILABLE, "connection"),
            StorageError::Query(_) | StorageError::Serialization(_) | StorageError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            error!(error_type, "Request failed: {}", self.0);
        }

        let body = ApiErrorResponse {
            error_type: error_type.to_string(),
            message: self.0.to_string(),
            timestamp: chrono::Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}
