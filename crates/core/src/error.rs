//! Error types for b2pilot-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for b2pilot-core
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for b2pilot-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    /// Invalid configuration format
    #[error("Invalid configuration format: {0}")]
    InvalidConfig(String),

    /// Credentials rejected or expired
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Client-computed checksum or length did not match
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Account storage, transaction or download cap reached
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Request rejected as malformed
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Service asked us to slow down or is temporarily unavailable
    #[error("Service unavailable (HTTP {status}): {message}")]
    ServiceUnavailable { status: u16, message: String },

    /// Any other error reported by the storage API
    #[error("B2 API error (HTTP {status}, {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

/// Classification the resilience pipeline dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Re-authenticate, then retry.
    Authentication,
    /// Retry directly.
    Integrity,
    /// Retry directly (rate limiting, transient I/O).
    TransientNetwork,
    /// Surfaced immediately.
    CapacityExceeded,
    /// Surfaced immediately.
    Validation,
    /// Surfaced immediately.
    Fatal,
}

impl ErrorKind {
    /// Whether the pipeline retries errors of this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Authentication | ErrorKind::Integrity | ErrorKind::TransientNetwork
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Integrity => "integrity",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::Validation => "validation",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{}", s)
    }
}

impl Error {
    /// Tag used for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::ServiceUnavailable { .. } | Error::Network(_) | Error::Timeout => {
                ErrorKind::TransientNetwork
            }
            Error::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Error::Validation(_)
            | Error::InvalidInput(_)
            | Error::InvalidConfig(_)
            | Error::Config(_) => ErrorKind::Validation,
            _ => ErrorKind::Fatal,
        }
    }

    /// True when the caller's cancellation token ended the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Map an HTTP status and B2 error code onto the error taxonomy.
    pub fn from_status(status: u16, code: &str, message: &str) -> Self {
        let message = message.to_string();
        match (status, code) {
            (401, _) => Error::Authentication(format!("{}: {}", code, message)),
            (
                403,
                "cap_exceeded"
                | "storage_cap_exceeded"
                | "transaction_cap_exceeded"
                | "download_cap_exceeded",
            ) => Error::CapacityExceeded(message),
            (400, _) => Error::Validation(format!("{}: {}", code, message)),
            (404, _) => Error::NotFound(message),
            (408 | 429 | 500 | 502 | 503 | 504, _) => {
                Error::ServiceUnavailable { status, message }
            }
            _ => Error::Api {
                status,
                code: code.to_string(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else if err.is_connect() {
            Error::Network(err.to_string())
        } else if err.is_request() {
            Error::HttpClient(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Other(format!("Task join error: {}", err))
        }
    }
}
