//! Error types for the relay layer

use pmoevents::BusError;
use pmostream::StreamError;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// No station is registered under this key
    #[error("unknown station '{0}'")]
    UnknownStation(String),

    /// The consumer group has no session
    #[error("no session for group '{0}'")]
    UnknownSession(String),

    /// The station was destroyed
    #[error("station '{0}' destroyed")]
    StationDestroyed(String),

    /// The underlying stream failed (connect errors end up here)
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Bus(#[from] BusError),

    /// The rendering surface rejected a payload
    #[error("render surface failed: {0}")]
    Surface(String),
}

impl RelayError {
    pub fn surface(err: impl std::fmt::Display) -> Self {
        Self::Surface(err.to_string())
    }

    /// True when the station could not reach its remote source.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::Stream(StreamError::Connect { .. } | StreamError::Http { .. })
        )
    }
}
