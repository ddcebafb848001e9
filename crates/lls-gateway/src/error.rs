//! Gateway error types

use crate::openai::{ErrorDetail, ErrorEnvelope};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use lls_local_llm::BackendError;
use std::time::Duration;
use thiserror::Error;

/// Request-level failures, each mapped to one HTTP status.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no model selected")]
    ModelNotSelected,

    #[error("no backend available: {0}")]
    NoBackendAvailable(String),

    #[error("backend launch failed: {0}")]
    BackendLaunchError(String),

    #[error("backend produced no output for {0:?}")]
    BackendTimeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ModelNotSelected => StatusCode::FAILED_DEPENDENCY,
            GatewayError::NoBackendAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendLaunchError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::ModelNotSelected => "MODEL_NOT_SELECTED",
            GatewayError::NoBackendAvailable(_) => "NO_BACKEND_AVAILABLE",
            GatewayError::BackendLaunchError(_) => "BACKEND_LAUNCH_ERROR",
            GatewayError::BackendTimeout(_) => "BACKEND_TIMEOUT",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn message(&self) -> String {
        match self {
            GatewayError::ModelNotSelected => {
                "no model is selected; start the server with --model <path>".to_string()
            }
            GatewayError::BackendTimeout(after) => format!(
                "backend produced no output for {}s and was terminated; the request can be retried",
                after.as_secs()
            ),
            GatewayError::InvalidRequest(msg)
            | GatewayError::NoBackendAvailable(msg)
            | GatewayError::BackendLaunchError(msg)
            | GatewayError::Internal(msg) => msg.clone(),
        }
    }
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NoCompatibleBinary { .. } => {
                GatewayError::NoBackendAvailable(err.to_string())
            }
            BackendError::LaunchFailed { .. } => GatewayError::BackendLaunchError(err.to_string()),
            BackendError::Timeout(after) => GatewayError::BackendTimeout(after),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::warn!(code = self.code(), error = %self, "request rejected");
        }

        let body = ErrorEnvelope::new(ErrorDetail {
            code: self.code().to_string(),
            message: self.message(),
        });
        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
