//! Error taxonomy for the orchestrator.
//!
//! Every public operation returns an [`AppError`] variant drawn from the stable
//! families below; the HTTP layer renders them as `{error, message, ...}` JSON
//! with the matching status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    // --- Input ---
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown environment: {name}")]
    UnknownEnvironment { name: String, available: Vec<String> },
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // --- Resource ---
    #[error("not found: {0}")]
    NotFound(String),
    #[error("a channel is already attached to this session")]
    AlreadyAttached,

    // --- Admission ---
    #[error("too many requests: {reason}")]
    TooManyRequests { reason: String, retry_after_secs: u64 },
    #[error("service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    // --- Runtime ---
    #[error("container failed: {0}")]
    ContainerFailed(String),
    #[error("container runtime daemon unavailable: {0}")]
    DaemonUnavailable(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),

    // --- Channel ---
    #[error("failed to attach stream: {0}")]
    StreamAttachFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("socket closed")]
    SocketClosed,
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    // --- Startup ---
    #[error("missing images: {0:?}")]
    MissingImages(Vec<(String, String)>),
    #[error("port already in use: {0}")]
    PortInUse(String),
    #[error("startup failed: {0}")]
    StartupFailed(String),
}

impl AppError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidConfig(_) => "InvalidConfig",
            AppError::UnknownEnvironment { .. } => "InvalidConfig",
            AppError::InvalidRequest(_) => "InvalidRequest",
            AppError::NotFound(_) => "NotFound",
            AppError::AlreadyAttached => "AlreadyAttached",
            AppError::TooManyRequests { .. } => "TooManyRequests",
            AppError::ServiceUnavailable { .. } => "ServiceUnavailable",
            AppError::ContainerFailed(_) => "ContainerFailed",
            AppError::DaemonUnavailable(_) => "DaemonUnavailable",
            AppError::OperationFailed(_) => "OperationFailed",
            AppError::StreamAttachFailed(_) => "StreamAttachFailed",
            AppError::WriteFailed(_) => "WriteFailed",
            AppError::SocketClosed => "SocketClosed",
            AppError::InvalidMessage(_) => "InvalidMessage",
            AppError::MissingImages(_) => "MissingImages",
            AppError::PortInUse(_) => "PortInUse",
            AppError::StartupFailed(_) => "StartupFailed",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidConfig(_) | AppError::UnknownEnvironment { .. } | AppError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyAttached => StatusCode::CONFLICT,
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ContainerFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::DaemonUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::OperationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::StreamAttachFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::WriteFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::SocketClosed => StatusCode::BAD_REQUEST,
            AppError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            AppError::MissingImages(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::PortInUse(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::StartupFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_environments: Option<Vec<String>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            AppError::TooManyRequests { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        };
        let available_environments = match &self {
            AppError::UnknownEnvironment { available, .. } => Some(available.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            retry_after,
            available_environments,
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<bollard::errors::Error> for AppError {
    fn from(e: bollard::errors::Error) -> Self {
        match &e {
            bollard::errors::Error::DockerResponseServerError { status_code, .. }
                if *status_code == 404 =>
            {
                AppError::NotFound(e.to_string())
            }
            bollard::errors::Error::HyperResponseError { .. }
            | bollard::errors::Error::HyperLegacyConnectError { .. } => {
                AppError::DaemonUnavailable(e.to_string())
            }
            _ => AppError::OperationFailed(e.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::OperationFailed(e.to_string())
    }
}
