//! Errors raised while loading configuration, resolving paths and
//! handling event records.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `config.json` exists but does not parse.
    #[error("Config file {} is malformed: {source}", .path.display())]
    MalformedConfig {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Collector or connect override is not a URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// Collector or connect override uses something other than http(s).
    #[error("Endpoint must be http or https, got {0}")]
    UnsupportedScheme(String),

    #[error("Could not determine home directory")]
    NoHomeDirectory,

    /// A global subscriber was already installed.
    #[error("Logging already initialized: {0}")]
    LoggingInit(String),

    /// Event record or config could not be encoded, or an event record
    /// could not be decoded.
    #[error("JSON encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Event record parsed but is not an object.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_config_names_file() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = CoreError::MalformedConfig {
            path: PathBuf::from("/tmp/harvest/config.json"),
            source,
        };
        assert!(err.to_string().starts_with("Config file /tmp/harvest/config.json is malformed"));
    }

    #[test]
    fn test_unsupported_scheme_display() {
        let err = CoreError::UnsupportedScheme("ftp".to_string());
        assert_eq!(err.to_string(), "Endpoint must be http or https, got ftp");
    }
}
