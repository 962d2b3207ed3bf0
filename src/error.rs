//! Centralized error handling module
//!
//! Provides the fetch error taxonomy used by the FHIR client and the unified
//! application error with its HTTP response mapping.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::fhir::ResourceType;

/// Failure fetching one resource type from the upstream FHIR server
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// 4xx from upstream: the query is malformed or unauthorized.
    #[error("Client error fetching {resource_type}: {status} {message}")]
    Client {
        resource_type: ResourceType,
        status: u16,
        message: String,
    },

    /// Network failure, timeout, 5xx or an undecodable body.
    #[error("Transient error fetching {resource_type}: {cause}")]
    Transient {
        resource_type: ResourceType,
        cause: String,
    },

    #[error("Failed to fetch {resource_type} after {attempts} attempts: {cause}")]
    Exhausted {
        resource_type: ResourceType,
        attempts: u32,
        cause: String,
    },
}

impl FetchError {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            FetchError::Client { resource_type, .. }
            | FetchError::Transient { resource_type, .. }
            | FetchError::Exhausted { resource_type, .. } => *resource_type,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A period assembly failed; carries the user-facing message.
    #[error("Aggregation failure: {message}")]
    Aggregation {
        message: String,
        #[source]
        source: FetchError,
    },

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Standardized error response format
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Unique correlation ID for tracing
    pub correlation_id: String,
    /// Error type classification
    pub error_type: String,
    /// Human-readable error message (safe for clients)
    pub message: String,
    /// HTTP status code
    pub status_code: u16,
    /// Timestamp of the error
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_type: &str, message: &str, status_code: StatusCode) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            status_code: status_code.as_u16(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let (error_type, message) = match self {
            AppError::ValidationError(msg) => ("VALIDATION_ERROR", msg.as_str()),
            AppError::Aggregation { message, source } => {
                error!(
                    resource_type = %source.resource_type(),
                    cause = %source,
                    "Period assembly failed"
                );
                ("UPSTREAM_ERROR", message.as_str())
            }
            AppError::NotFound(msg) => ("NOT_FOUND", msg.as_str()),
        };

        let error_response = ErrorResponse::new(error_type, message, status);

        error!(
            correlation_id = %error_response.correlation_id,
            error_type = %error_type,
            status_code = %status.as_u16(),
            "Error response generated"
        );

        HttpResponse::build(status).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Aggregation { .. } => StatusCode::BAD_GATEWAY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;
