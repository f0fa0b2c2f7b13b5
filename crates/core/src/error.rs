//! Error types for the modserve runtime

use thiserror::Error;

use crate::supervisor::ModuleState;

/// Result type alias for modserve runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the modserve runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Enqueue/dequeue was attempted against a queue that was never created
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    /// The queue's bounded buffer is full and cannot accept the request
    #[error("request queue '{queue}' is full (#reqid {reqid})")]
    QueueFull {
        /// The queue that rejected the request
        queue: String,
        /// The id of the rejected request
        reqid: String,
    },

    /// No worker produced a response within the caller's timeout
    #[error("the request timed out (#reqid {reqid})")]
    RequestTimeout {
        /// The id of the request that timed out
        reqid: String,
    },

    /// The caller's cancellation signal fired while the call was suspended
    #[error("the call was canceled by the caller ({context})")]
    Cancelled {
        /// What was cancelled (`#reqid ...` for enqueue, the queue name for
        /// dequeue)
        context: String,
    },

    /// A pending-response slot already exists for this request id
    #[error("unable to register pending response id {0}: already in use")]
    DuplicateRequestId(String),

    /// No module with this id is registered
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    /// The module is in a state from which it cannot be launched
    #[error("module '{module}' cannot be started from state {state}")]
    ModuleNotStartable {
        /// The module id
        module: String,
        /// The state that blocked the launch
        state: ModuleState,
    },

    /// The OS refused to spawn the module's worker process
    #[error("failed to launch module '{module}': {source}")]
    LaunchFailure {
        /// The module id
        module: String,
        /// The underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Numeric code carried in error payloads returned to front-end callers.
    ///
    /// The values line up with the HTTP status the transport layer maps the
    /// error to, so a single mapping serves both surfaces.
    pub fn code(&self) -> u16 {
        match self {
            Error::QueueNotFound(_) | Error::ModuleNotFound(_) => 404,
            Error::RequestTimeout { .. } => 408,
            Error::QueueFull { .. } => 429,
            Error::Cancelled { .. } => 499,
            Error::DuplicateRequestId(_) => 409,
            Error::ModuleNotStartable { .. } => 409,
            Error::Config(_) => 400,
            Error::LaunchFailure { .. }
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Other(_) => 500,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
