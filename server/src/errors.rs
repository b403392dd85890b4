//! Error types for the swaphost server

use axum::http::StatusCode;
use thiserror::Error;

/// Main error type for the swaphost server
#[derive(Error, Debug)]
pub enum HostError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    #[error("Service startup failed: {0}")]
    StartupFailure(String),

    #[error("Reload lock failed: {0}")]
    LockFailure(String),

    #[error("Staging failed: {0}")]
    StageFailure(String),

    #[error("Install failed: {0}")]
    InstallFailure(String),

    #[error("Swap failed: {0}")]
    SwapFailure(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HostError {
    /// HTTP status reported to a deploy caller for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            HostError::Unauthorized(_) => StatusCode::FORBIDDEN,
            HostError::InvalidSignature | HostError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error happened before any live state was touched
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, HostError::SwapFailure(_))
    }

    /// Re-tag an error raised while staging. Signature and package errors keep their identity.
    pub fn into_stage_failure(self) -> Self {
        match self {
            e @ (HostError::InvalidSignature
            | HostError::InvalidPackage(_)
            | HostError::StageFailure(_)) => e,
            other => HostError::StageFailure(other.to_string()),
        }
    }

    /// Re-tag an error raised while installing. Startup failures keep their identity.
    pub fn into_install_failure(self) -> Self {
        match self {
            e @ (HostError::StartupFailure(_) | HostError::InstallFailure(_)) => e,
            other => HostError::InstallFailure(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for HostError {
    fn from(err: tokio::task::JoinError) -> Self {
        HostError::Internal(format!("background task failed: {}", err))
    }
}
