//! Delivery error types.

use std::time::Duration;
use thiserror::Error;

/// Delivery error type.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// HTTP transport error (connect, timeout, reset)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 429 from the collector
    #[error("Rate limited{}", .retry_after.map(|d| format!(", retry after {}s", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// 401 / 403 from the collector
    #[error("Unauthorized: HTTP {status}")]
    Unauthorized { status: u16 },

    /// Any other 4xx
    #[error("Client error: HTTP {status}: {body}")]
    Client { status: u16, body: String },

    /// 5xx from the collector
    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    /// Token could not be obtained
    #[error("Token error: {0}")]
    Token(String),

    /// Payload could not be built or compressed
    #[error("Payload error: {0}")]
    Payload(String),

    /// Client could not be configured
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid endpoint configuration
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Token file could not be written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Whether another immediate attempt within the same send may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Server { .. })
    }

    /// Whether the failure points at the endpoint itself (counts toward the circuit).
    pub fn is_endpoint_failure(&self) -> bool {
        self.is_retryable()
    }
}

/// Result type alias using DeliveryError.
pub type DeliveryResult<T> = Result<T, DeliveryError>;
