//! Pipeline stages.
//!
//! Every stage is a [`StageWorker`](facelink_control::StageWorker) running in
//! its own process. It reads frame records from its upstream ring, adds its
//! part, and publishes the record on its own ring. Stages learn where their
//! rings and the image heap live from [`StageArgs`] in the boot frame.

mod aligner;
mod detector;
mod marker;
mod merger;
mod output;
mod source;
mod swapper;

pub use aligner::{AlignerControls, AlignerStage};
pub use detector::{DetectorControls, DetectorStage};
pub use marker::{LandmarkSmoother, MarkerControls, MarkerStage};
pub use merger::{MergerControls, MergerStage};
pub use output::{OutputControls, OutputStage};
pub use source::{Resolution, SourceControls, SourceStage};
pub use swapper::{SwapperControls, SwapperStage};

use crate::backends::{DeviceRegistry, TestPatternSource};
use crate::error::{StageError, StageResult};
use crate::frame::FrameRecord;
use crate::reemit::ReemitSignal;
use facelink_common::config::SourceConfig;
use facelink_control::{ControlResult, MessagePipe, WorkerContext, WorkerState, run_worker};
use facelink_shm::{RingDirectory, WeakHeap};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// The stages of the pipeline, in processing order
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Frame capture
    Source,
    /// Face detection
    Detector,
    /// Landmark placement
    Marker,
    /// Face crop extraction
    Aligner,
    /// Face generation
    Swapper,
    /// Compositing back into the frame
    Merger,
    /// Display and saving
    Output,
}

impl StageKind {
    /// Every stage in processing order
    pub const ALL: [StageKind; 7] = [
        StageKind::Source,
        StageKind::Detector,
        StageKind::Marker,
        StageKind::Aligner,
        StageKind::Swapper,
        StageKind::Merger,
        StageKind::Output,
    ];

    /// Lowercase stage name
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Source => "source",
            StageKind::Detector => "detector",
            StageKind::Marker => "marker",
            StageKind::Aligner => "aligner",
            StageKind::Swapper => "swapper",
            StageKind::Merger => "merger",
            StageKind::Output => "output",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| StageError::UnknownStage(s.to_string()))
    }
}

/// Start arguments of every stage worker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StageArgs {
    /// Shared image heap
    pub image_heap: String,
    /// Ring this stage consumes, if any
    pub input: Option<String>,
    /// Ring this stage publishes on
    pub output: String,
    /// Reemit signal block
    pub reemit: String,
    /// Upstream read timeout
    pub read_timeout_ms: u64,
    /// Records allowed to queue on the output ring; `None` publishes freely
    pub buffer_slack: Option<u64>,
    /// Boot defaults of the source
    pub source: SourceConfig,
}

/// Shared memory a stage worker is attached to
#[derive(Debug)]
pub struct StageLinks {
    /// Image heap
    pub heap: WeakHeap,
    /// Upstream ring
    pub input: Option<RingDirectory>,
    /// Own ring
    pub output: RingDirectory,
    /// Reemit signal
    pub reemit: ReemitSignal,
    read_timeout: Duration,
    buffer_slack: Option<u64>,
}

impl StageLinks {
    /// Attach to everything `args` names
    pub fn open(args: &StageArgs) -> StageResult<Self> {
        Ok(Self {
            heap: WeakHeap::open(&args.image_heap)?,
            input: args.input.as_deref().map(RingDirectory::open).transpose()?,
            output: RingDirectory::open(&args.output)?,
            reemit: ReemitSignal::open(&args.reemit)?,
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            buffer_slack: args.buffer_slack,
        })
    }

    /// True when the consumer of the output ring is close enough behind
    pub fn downstream_ready(&self) -> bool {
        self.buffer_slack
            .is_none_or(|slack| self.output.is_caught_up(slack))
    }

    /// Next upstream record, waiting up to the read timeout.
    ///
    /// Undecodable records are logged and skipped.
    pub fn read_input(&self) -> Option<FrameRecord> {
        let bytes = self.input.as_ref()?.read(self.read_timeout)?;
        match FrameRecord::decode(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable frame record");
                None
            }
        }
    }

    /// Publish a record on the output ring
    pub fn publish(&self, record: &FrameRecord) -> StageResult<u64> {
        Ok(self.output.write(&record.encode()?)?)
    }
}

/// Attach a booted worker to its shared memory
pub(crate) fn open_links<S>(ctx: &WorkerContext<S>) -> StageResult<StageLinks> {
    StageLinks::open(&stage_args(ctx)?)
}

/// Decoded start arguments of a booted worker
pub(crate) fn stage_args<S>(ctx: &WorkerContext<S>) -> StageResult<StageArgs> {
    ctx.args()
        .ok_or_else(|| StageError::MissingArgs(ctx.stage().to_string()))
}

/// Persist `value` under `key` in the worker state
pub(crate) fn remember<S, T: Serialize>(ctx: &mut WorkerContext<S>, key: &str, value: &T) -> StageResult<()> {
    ctx.state_mut().set(key, value)?;
    ctx.save_state();
    Ok(())
}

/// Persisted value under `key`, or `default`
pub(crate) fn recall<T: serde::de::DeserializeOwned>(state: &WorkerState, key: &str, default: T) -> T {
    state.get(key).unwrap_or(default)
}

/// Run the worker of `kind` over `pipe` until it stops
pub fn run_stage(kind: StageKind, pipe: MessagePipe, tick_interval: Duration, devices: DeviceRegistry) -> ControlResult<()> {
    match kind {
        StageKind::Source => run_worker(SourceStage::new(Box::new(TestPatternSource::new(1))), pipe, tick_interval),
        StageKind::Detector => run_worker(DetectorStage::new(devices), pipe, tick_interval),
        StageKind::Marker => run_worker(MarkerStage::default(), pipe, tick_interval),
        StageKind::Aligner => run_worker(AlignerStage::default(), pipe, tick_interval),
        StageKind::Swapper => run_worker(SwapperStage::new(devices), pipe, tick_interval),
        StageKind::Merger => run_worker(MergerStage::default(), pipe, tick_interval),
        StageKind::Output => run_worker(OutputStage::default(), pipe, tick_interval),
    }
}
