//! TOML configuration of a facelink user data directory.
//!
//! The host reads `facelink.toml` once at startup; workers never read it and
//! receive what they need in their start arguments.
//!
//! # Usage
//!
//! ```rust,no_run
//! use facelink_common::config::{AppConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = AppConfig::load_or_default(Path::new("userdata/facelink.toml"))?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_BUFFER_SLACK, DEFAULT_HOST_INTERVAL_MS, DEFAULT_IMAGE_HEAP_MB,
    DEFAULT_READ_TIMEOUT_MS, DEFAULT_RING_HEAP_MB, DEFAULT_TABLE_SIZE, DEFAULT_TICK_INTERVAL_MS,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Why a configuration could not be used.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// Unreadable file or invalid TOML.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Parsed, but a value is out of range.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Default log verbosity, written lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything
    Trace,
    /// Per-frame detail
    Debug,
    /// Lifecycle events
    #[default]
    Info,
    /// Recoverable problems
    Warn,
    /// Failures only
    Error,
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Fields every facelink config carries.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "facelink-studio"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Default log level when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Name of this installation, used in log lines.
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            service_name: "facelink".to_string(),
        }
    }
}

impl SharedConfig {
    /// Reject an empty service name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sizing and cadence of the inter-stage transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Slots per ring directory.
    pub table_size: usize,
    /// Heap size of each ring directory, in megabytes.
    pub ring_heap_size_mb: usize,
    /// Size of the shared image heap, in megabytes.
    pub image_heap_size_mb: usize,
    /// Frames allowed to queue between two adjacent stages.
    pub buffer_slack: u64,
    /// Upstream read timeout of a stage loop.
    pub read_timeout_ms: u64,
    /// Minimum interval between worker ticks.
    pub tick_interval_ms: u64,
    /// Interval of the host message pump.
    pub host_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
            ring_heap_size_mb: DEFAULT_RING_HEAP_MB,
            image_heap_size_mb: DEFAULT_IMAGE_HEAP_MB,
            buffer_slack: DEFAULT_BUFFER_SLACK,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            host_interval_ms: DEFAULT_HOST_INTERVAL_MS,
        }
    }
}

impl PipelineConfig {
    /// Validate sizes and intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_size == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.table_size must be > 0".to_string(),
            ));
        }
        if self.ring_heap_size_mb == 0 || self.image_heap_size_mb == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline heap sizes must be > 0".to_string(),
            ));
        }
        if self.host_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.host_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Upstream read timeout as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Worker tick interval as a `Duration`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Host pump interval as a `Duration`.
    pub fn host_interval(&self) -> Duration {
        Duration::from_millis(self.host_interval_ms)
    }
}

/// Boot defaults of the simulated frame source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Target frames per second.
    pub fps: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 25.0,
        }
    }
}

impl SourceConfig {
    /// Validate frame geometry and rate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::ValidationError(
                "source width/height must be > 0".to_string(),
            ));
        }
        if !(self.fps > 0.0) {
            return Err(ConfigError::ValidationError(
                "source.fps must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration of a facelink host.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "facelink"
///
/// [pipeline]
/// table_size = 8
/// buffer_slack = 1
///
/// [source]
/// width = 1280
/// height = 720
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Common fields.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Transport sizing.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Simulated source defaults.
    #[serde(default)]
    pub source: SourceConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.pipeline.validate()?;
        self.source.validate()
    }

    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::FileNotFound) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
