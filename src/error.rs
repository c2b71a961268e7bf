//! Error types for previewd

use thiserror::Error;

/// Result type alias using previewd's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for previewd
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (no provider configured, bad credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sandbox provider error (environment create/write/run/terminate)
    #[error("Provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    /// Repair backend error
    #[error("Repair error: {0}")]
    Repair(String),

    /// Illegal sandbox status transition
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::pipeline::SandboxStatus,
        to: crate::pipeline::SandboxStatus,
    },

    /// Retry budget exhausted
    #[error("Retry budget exhausted: {0}")]
    RetryExhausted(String),

    /// Another pipeline run is in flight for this sandbox
    #[error("Sandbox busy: {0}")]
    Busy(String),

    /// A sandbox for this tool is already active
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unauthorized access
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the failure is worth a full pipeline retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Provider(_) | Error::Http(_) | Error::Timeout(_) | Error::Database(_)
        )
    }

    /// Check if error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::NotFound(_)
                | Error::Unauthorized(_)
                | Error::Conflict(_)
                | Error::Busy(_)
        )
    }

    /// Short, actionable message safe to show to an end user
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(_) => {
                "No sandbox provider is configured. Contact your administrator.".to_string()
            }
            Error::RetryExhausted(_) => {
                "The preview could not be built after several attempts. Start a new generation."
                    .to_string()
            }
            Error::Busy(_) => "A build is already running for this tool. Wait for it to finish."
                .to_string(),
            Error::Conflict(_) => {
                "A preview already exists for this tool. Terminate it or supersede it.".to_string()
            }
            Error::NotFound(_) => "Sandbox not found.".to_string(),
            Error::Unauthorized(_) => "You do not have access to this sandbox.".to_string(),
            Error::Timeout(_) => "The sandbox provider took too long to respond. Try again."
                .to_string(),
            _ => "Something went wrong while building your preview. You can retry.".to_string(),
        }
    }
}
