//! Error types for pvedash

use thiserror::Error;

/// Result type alias using pvedash Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the core boundary
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    AuthRejected(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response shape from {path}: {detail}")]
    UpstreamFormat { path: String, detail: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("{failed} of {total} tasks failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("failed to bind local port: {0}")]
    LocalBind(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Shorthand for a format-mismatch error on an endpoint response.
    pub fn format(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::UpstreamFormat {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// True for errors that leave a usable snapshot behind.
    pub fn is_partial(&self) -> bool {
        matches!(self, Error::PartialFailure { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::UpstreamFormat {
                path: e
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "<unknown>".to_string()),
                detail: e.to_string(),
            }
        } else {
            Error::Network(e.to_string())
        }
    }
}
