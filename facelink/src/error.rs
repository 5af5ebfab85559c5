//! Error types of the pipeline host and stage workers

use crate::face::LandmarkScheme;
use facelink_common::config::ConfigError;
use facelink_control::ControlError;
use facelink_shm::ShmError;
use thiserror::Error;

/// Errors raised while wiring or running the pipeline
#[derive(Error, Debug)]
pub enum StageError {
    /// Shared memory failure
    #[error("Shared memory error: {0}")]
    Shm(#[from] ShmError),

    /// Control channel or supervision failure
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A frame record could not be encoded or decoded
    #[error("Frame encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// A frame record was written by an incompatible version
    #[error("Unsupported frame record version {0}")]
    FrameVersion(u8),

    /// Image buffer does not match its declared geometry
    #[error("Image of {width}x{height}x{channels} cannot hold {len} bytes")]
    ImageGeometry {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Channels per pixel
        channels: u8,
        /// Buffer length
        len: usize,
    },

    /// A landmark set does not have the point count of its scheme
    #[error("{scheme:?} landmarks need {} points, got {len}", scheme.point_count())]
    LandmarkCount {
        /// Declared scheme
        scheme: LandmarkScheme,
        /// Points supplied
        len: usize,
    },

    /// No stage with this name
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// No application with this name
    #[error("Unknown stage app: {0}")]
    UnknownApp(String),

    /// A worker was booted without its start arguments
    #[error("Stage {0} started without arguments")]
    MissingArgs(String),

    /// An inference or capture backend failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// The interrupt handler could not be installed
    #[error("Signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations
pub type StageResult<T> = Result<T, StageError>;
