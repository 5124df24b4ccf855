//! Error types for the LISTEN.moe client

use pmostream::StreamError;

/// Result type alias for LISTEN.moe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to LISTEN.moe
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Audio endpoint answered with an error status
    #[error("{url} returned error status: {status}")]
    Status { url: String, status: u16 },

    /// WebSocket handshake or transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON parsing failed
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A gateway message did not have the expected shape
    #[error("Malformed gateway message: {0}")]
    Protocol(String),

    /// Timeout error
    #[error("Timed out connecting to {0}")]
    Timeout(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Map onto the stream error taxonomy, `target` naming the endpoint.
    pub fn into_stream_error(self, target: &str) -> StreamError {
        match self {
            Self::Protocol(msg) => StreamError::Decode(msg),
            Self::Json(err) => StreamError::Decode(err.to_string()),
            Self::Status { url, status } => StreamError::Http { status, url },
            other => StreamError::connect(target, other),
        }
    }
}
