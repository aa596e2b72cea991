use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failure taxonomy shared by the API client, linker, orchestrator and queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("API request failed: {0}")]
    Transport(String),
    #[error("API returned error {status}: {message}")]
    Api {
        status: u16,
        message: String,
        raw_body: String,
    },
    #[error("invalid JSON response: {0}")]
    Decode(String),
    #[error("provisioning timeout exceeded for service {service_id} after {waited_secs}s")]
    Timeout { service_id: String, waited_secs: u64 },
    #[error("service {service_id} provisioning failed remotely")]
    ProvisioningFailed { service_id: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("credential encryption error: {0}")]
    Crypto(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for ProvisioningError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl ProvisioningError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::Duplicate(message.into())
    }

    /// Short machine-readable tag used in log context.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Duplicate(_) => "duplicate",
            Self::Transport(_) => "transport",
            Self::Api { .. } => "api",
            Self::Decode(_) => "decode",
            Self::Timeout { .. } => "timeout",
            Self::ProvisioningFailed { .. } => "provisioning_failed",
            Self::NotFound(_) => "not_found",
            Self::Crypto(_) => "crypto",
            Self::Unauthorized => "unauthorized",
            Self::Storage(_) => "storage",
        }
    }

    /// Whether re-running the same job later could succeed.
    ///
    /// `Crypto` is terminal: it surfaces after the remote service already went
    /// active, so a rerun would create a second live service for the order.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_) | Self::Duplicate(_) | Self::Unauthorized | Self::Crypto(_)
        )
    }
}

pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Provisioning(err) => match err {
                ProvisioningError::Validation(_) => StatusCode::BAD_REQUEST,
                ProvisioningError::Duplicate(_) => StatusCode::CONFLICT,
                ProvisioningError::NotFound(_) => StatusCode::NOT_FOUND,
                ProvisioningError::Unauthorized => StatusCode::FORBIDDEN,
                ProvisioningError::Crypto(_) | ProvisioningError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                ProvisioningError::Transport(_)
                | ProvisioningError::Api { .. }
                | ProvisioningError::Decode(_)
                | ProvisioningError::Timeout { .. }
                | ProvisioningError::ProvisioningFailed { .. } => StatusCode::BAD_GATEWAY,
            },
        }
    }

    /// Message safe to hand back to the caller. Remote payloads stay in the logs.
    fn public_message(&self) -> String {
        match self {
            AppError::Provisioning(ProvisioningError::Api { status, .. }) => {
                format!("remote API returned error {status}")
            }
            AppError::Provisioning(ProvisioningError::Transport(_)) => {
                "remote API unreachable".to_string()
            }
            AppError::Provisioning(ProvisioningError::Decode(_)) => {
                "remote API returned an invalid response".to_string()
            }
            AppError::Provisioning(ProvisioningError::Crypto(_)) => {
                "failed to decrypt credentials".to_string()
            }
            AppError::Provisioning(ProvisioningError::Storage(_)) => "storage unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::error!(?self);
        (status, self.public_message()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
