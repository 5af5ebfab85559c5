//! Error types for the control channel and supervision

use thiserror::Error;

/// Errors raised by pipes, the store and worker supervision
#[derive(Error, Debug)]
pub enum ControlError {
    /// Pipe or file I/O failed
    #[error("I/O error: {source}")]
    Io {
        /// Source I/O error
        #[from]
        source: std::io::Error,
    },

    /// A message or stored value could not be encoded or decoded
    #[error("Encoding error: {source}")]
    Encoding {
        /// Source bincode error
        #[from]
        source: bincode::Error,
    },

    /// A frame length exceeds the pipe limit
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Maximum accepted length
        max: usize,
    },

    /// The peer closed its end of the pipe
    #[error("Peer disconnected")]
    Disconnected,

    /// The peer sent a message that is not valid at this point
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The worker process could not be started
    #[error("Failed to spawn worker for stage {stage}: {reason}")]
    SpawnFailed {
        /// Stage name
        stage: String,
        /// OS or launcher reason
        reason: String,
    },

    /// The key-value store file is unusable
    #[error("Store error at {path}: {reason}")]
    Store {
        /// Store file path
        path: String,
        /// What went wrong
        reason: String,
    },
}

/// Result type for control operations
pub type ControlResult<T> = Result<T, ControlError>;

/// Error type returned by stage hooks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
