//! # facelink
//!
//! Real-time face swap pipeline. A host process supervises one worker
//! process per stage; frames flow between stages through shared memory
//! rings while each stage's live parameters are mirrored to the host as
//! remote controls.
//!
//! ## Module Structure
//!
//! - [`image`] - Owned pixel buffers
//! - [`face`] - Face rectangles, landmarks, head pose and alignment
//! - [`frame`] - The per-frame record passed between stages
//! - [`reemit`] - Cross-process "resend the last frame" request
//! - [`backends`] - Capture and inference traits with simulation backends
//! - [`stages`] - The seven stage workers
//! - [`wiring`] - Apps, shared memory layout and the [`Pipeline`](wiring::Pipeline)
//! - [`host`] - The host loop and graceful shutdown
//!
//! ## Usage
//!
//! ```bash
//! facelink run facelink --userdata-dir ~/.facelink
//! facelink --verbose run passthrough --userdata-dir /tmp/fl
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod backends;
pub mod error;
pub mod face;
pub mod frame;
pub mod host;
pub mod image;
pub mod reemit;
pub mod stages;
pub mod wiring;

pub use error::{StageError, StageResult};
pub use face::{Affine2, AlignedFace, FaceRecord, FaceRect, HeadPose, LandmarkScheme, Landmarks};
pub use frame::{FrameRecord, ImageRef};
pub use host::{HostOptions, HostSummary, drive, run_host};
pub use image::Image;
pub use stages::{StageArgs, StageKind, run_stage};
pub use wiring::{APPS, AppSpec, ManagedStage, Pipeline, find_app};
