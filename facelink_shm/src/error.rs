//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Block already exists
    #[error("Shared memory block already exists: {name}")]
    AlreadyExists {
        /// Block name
        name: String,
    },

    /// Block not found
    #[error("Shared memory block not found: {name}")]
    NotFound {
        /// Block name
        name: String,
    },

    /// Block name unusable as a file name
    #[error("Invalid shared memory block name {name:?}")]
    InvalidName {
        /// Rejected name
        name: String,
    },

    /// Invalid block or heap size
    #[error("Invalid size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// The OS could not back the requested region
    #[error("Cannot allocate {size} bytes of shared memory: {reason}")]
    Allocation {
        /// Requested size in bytes
        size: usize,
        /// OS-level reason
        reason: String,
    },

    /// A heap has no contiguous room for the payload, even after wrapping
    #[error("Out of heap space: requested {requested} bytes, capacity {capacity} bytes")]
    OutOfSpace {
        /// Payload size in bytes
        requested: usize,
        /// Usable arena size in bytes
        capacity: usize,
    },

    /// Access outside of a memory view
    #[error("Out of bounds access: offset {offset} + {len} exceeds {size}")]
    OutOfBounds {
        /// Start offset of the access
        offset: usize,
        /// Length of the access
        len: usize,
        /// Size of the view
        size: usize,
    },

    /// Attached block does not carry the expected layout
    #[error("Corrupted block {name}: {reason}")]
    Corrupted {
        /// Block name
        name: String,
        /// What failed to validate
        reason: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

impl ShmError {
    /// True for the allocation failures a caller answers by dropping the frame.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, ShmError::Allocation { .. } | ShmError::OutOfSpace { .. })
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;

/// Outcome of reading through a weak reference.
///
/// `Stale` is an expected result, not an error: the bytes behind the
/// reference were recycled by a newer allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    /// The data was read intact.
    Fresh(T),
    /// The data has been overwritten.
    Stale,
}

impl<T> Fetched<T> {
    /// Convert into an `Option`, mapping `Stale` to `None`.
    pub fn fresh(self) -> Option<T> {
        match self {
            Fetched::Fresh(value) => Some(value),
            Fetched::Stale => None,
        }
    }

    /// True if the data was overwritten.
    pub fn is_stale(&self) -> bool {
        matches!(self, Fetched::Stale)
    }

    /// Map the fresh value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Fetched<U> {
        match self {
            Fetched::Fresh(value) => Fetched::Fresh(f(value)),
            Fetched::Stale => Fetched::Stale,
        }
    }
}
