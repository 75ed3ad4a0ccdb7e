//! Pipeline error types.

use thiserror::Error;

/// Pipeline error type.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Durable store or session flag failure
    #[error("Store error: {0}")]
    Store(#[from] harvest_store::StoreError),

    /// Delivery client could not be built
    #[error("Delivery error: {0}")]
    Delivery(#[from] harvest_delivery::DeliveryError),

    /// Configuration or path failure
    #[error("Core error: {0}")]
    Core(#[from] harvest_config_and_utils::CoreError),

    /// No async runtime to run harvest workers on
    #[error("No tokio runtime available: {0}")]
    Runtime(String),
}

/// Result type alias using PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;
