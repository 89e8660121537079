//! Error types for the drain
//! Storage failures, record-level failures and their HTTP mapping

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::document::MetricTable;

pub type Result<T> = std::result::Result<T, DrainError>;

/// Failures reported by a [`MetricStore`](crate::store::MetricStore).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum DrainError {
    #[error("Invalid frame timestamp '{value}': {source}")]
    TimestampError {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Routing table error: {0}")]
    RoutingError(#[from] serde_json::Error),

    #[error("Serialization error for {table}: {message}")]
    SerializationError { table: MetricTable, message: String },

    #[error("Storage error on {table}: {source}")]
    WriteError {
        table: MetricTable,
        #[source]
        source: StorageError,
    },

    #[error("Partition initialization failed for {metric}: {source}")]
    PartitionError {
        metric: String,
        #[source]
        source: StorageError,
    },

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl DrainError {
    /// Status code and stable machine-readable code for the HTTP boundary.
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            DrainError::MethodNotAllowed(_) => (StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED"),
            DrainError::AuthenticationRequired(_) => (StatusCode::BAD_REQUEST, "AUTHORIZATION_REQUIRED"),
            DrainError::AuthenticationFailed(_) => (StatusCode::UNAUTHORIZED, "AUTHORIZATION_FAILED"),
            DrainError::WriteError { .. }
            | DrainError::PartitionError { .. } => (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for DrainError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Client-facing messages never carry storage internals.
        let message = match &self {
            DrainError::MethodNotAllowed(msg)
            | DrainError::AuthenticationRequired(msg)
            | DrainError::AuthenticationFailed(msg) => msg.clone(),
            _ => "An unexpected error occurred".to_string(),
        };

        let body = json!({
            "error": {
                "code": code,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        });

        let mut resp = Response::new(Body::from(body.to_string()));
        *resp.status_mut() = status;
        resp.headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if status == StatusCode::UNAUTHORIZED {
            resp.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"logdrain\""),
            );
        }
        resp
    }
}
