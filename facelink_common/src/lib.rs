//! facelink Common Library
//!
//! This crate provides shared constants, configuration loading utilities
//! and the cooperative tick scheduler for all facelink workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Segment limits, default sizes and intervals
//! - [`config`] - Configuration loading traits and types
//! - [`tick`] - Clock abstraction and the cooperative `run_loop`
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use facelink_common::config::{ConfigLoader, SharedConfig};
//! use facelink_common::consts::DEFAULT_TABLE_SIZE;
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
pub mod tick;
