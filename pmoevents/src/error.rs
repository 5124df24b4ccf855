//! Error types for the event bus

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised by [`EventBus`](crate::EventBus)
///
/// Every variant signals a contract violation by the caller: they are never
/// recovered internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The bus was torn down and can no longer be used
    #[error("event bus '{0}' already torn down")]
    TornDown(String),
}
