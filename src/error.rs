/// Error taxonomy for the engine and its message boundary.
///
/// A stale pivot is not an error; see `pivot::PivotOutcome::Stale`.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Any data operation issued before `load_data`.
    #[error("Engine not initialized: load data before querying")]
    EngineNotInitialized,

    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),

    /// The request type is known but its payload does not decode.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Remote load failed: {0}")]
    RemoteLoadFailed(String),

    /// A windowed read was issued against a view generation that has since changed.
    #[error("Stale view: expected generation {expected}, current is {current}")]
    StaleView { expected: u64, current: u64 },

    /// The channel to the engine is gone; the client is no longer usable.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A handler failed (or panicked) while processing one request.
    #[error("{0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
