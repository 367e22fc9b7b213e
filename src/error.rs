use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing a [`Client`](crate::Client) or refreshing its state.
///
/// Evaluation itself never fails: unknown toggles, unknown strategies, dangling segment references
/// and malformed constraint operands all resolve to a safe default instead.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Settings passed to [`ClientConfig`](crate::ClientConfig) are invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The server rejected our credentials.
    #[error("unauthorized, custom authorization header is likely invalid")]
    Unauthorized,

    /// Bootstrap source answered with a non-success status.
    #[error("bootstrap source responded with status {status}")]
    BootstrapFailed {
        /// HTTP status code.
        status: u16,
    },

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Toggle collection could not be deserialized.
    #[error("unable to parse toggle collection")]
    Parse(#[source] Arc<serde_json::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
