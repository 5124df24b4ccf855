//! Error taxonomy shared by every stream implementation

use pmoevents::BusError;

/// Result type alias for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur while driving a stream
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A control message did not match the expected shape. Dropped, never fatal.
    #[error("malformed control message: {0}")]
    Decode(String),

    /// The control socket or the audio fetch could not be established
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    /// The audio endpoint answered with a non-success status
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The audio byte source ended before the next track boundary
    #[error("audio source closed prematurely after {bytes} bytes")]
    PrematureClose { bytes: u64 },

    /// An operation was attempted in a state that does not allow it
    #[error("invalid stream state: {0}")]
    State(String),

    /// The stream was destroyed
    #[error("stream destroyed")]
    Destroyed,

    /// The stream event bus rejected the operation
    #[error(transparent)]
    Bus(#[from] BusError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn connect(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Decode and premature-close conditions are handled inside the stream.
    pub fn is_recovered_locally(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::PrematureClose { .. })
    }
}
