//! Prelude module for common re-exports.
//!
//! ```rust
//! use facelink_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    AppConfig, ConfigError, ConfigLoader, LogLevel, PipelineConfig, SharedConfig, SourceConfig,
};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::{DEFAULT_BUFFER_SLACK, DEFAULT_TABLE_SIZE};

// ─── Scheduling ─────────────────────────────────────────────────────
pub use crate::tick::{Clock, ManualClock, SystemClock, run_loop};
