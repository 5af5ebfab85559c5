//! Pipeline wiring: which stages an app runs, the shared memory they talk
//! through, and a supervisor per stage.
//!
//! ```text
//! source ─► detector ─► marker ─► aligner ─► swapper ─► merger ─► output ─► preview
//!    ▲                                                     │
//!    └──────────────────── reemit signal ◄─────────────────┘
//! ```
//!
//! The host process creates (and therefore owns) every block; workers only
//! attach to them by the names carried in their [`StageArgs`].

use crate::error::{StageError, StageResult};
use crate::frame::FrameRecord;
use crate::reemit::ReemitSignal;
use crate::stages::{
    AlignerControls, DetectorControls, MarkerControls, MergerControls, OutputControls, SourceControls,
    StageArgs, StageKind, SwapperControls,
};
use facelink_common::config::AppConfig;
use facelink_control::supervisor::Lifecycle;
use facelink_control::{ControlResult, ControlSheet, KvStore, ProcessLauncher, Supervisor, WorkerLauncher};
use facelink_shm::{Fetched, RingDirectory, RingOptions, ShmResult, WeakHeap};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const MB: usize = 1024 * 1024;

/// Name of the ring the final stage publishes on
pub const PREVIEW_RING: &str = "preview";

/// A runnable set of stages
#[derive(Debug, Clone, Copy)]
pub struct AppSpec {
    /// Name given on the command line
    pub name: &'static str,
    /// Stages in processing order
    pub stages: &'static [StageKind],
}

/// Every app the host can run
pub static APPS: [AppSpec; 2] = [
    AppSpec {
        name: "facelink",
        stages: &StageKind::ALL,
    },
    AppSpec {
        name: "passthrough",
        stages: &[StageKind::Source, StageKind::Output],
    },
];

/// Look up an app by name
pub fn find_app(name: &str) -> StageResult<&'static AppSpec> {
    APPS.iter()
        .find(|app| app.name == name)
        .ok_or_else(|| StageError::UnknownApp(name.to_string()))
}

/// Type-erased view of a [`Supervisor`], so one pipeline can hold stages with
/// different control sheets.
pub trait ManagedStage: Send {
    /// Stage name
    fn name(&self) -> &str;
    /// Current lifecycle
    fn lifecycle(&self) -> Lifecycle;
    /// Launch the worker
    fn start(&mut self) -> ControlResult<()>;
    /// Ask the worker to stop; `force` kills it immediately
    fn stop(&mut self, force: bool);
    /// Pump the worker's messages
    fn process_messages(&mut self) -> ControlResult<()>;
    /// True while the worker is busy
    fn is_busy(&self) -> bool;
    /// Error the last run ended with
    fn last_error(&self) -> Option<&str>;
    /// Whether the stage was running when the host last left it
    fn was_enabled(&self) -> bool;
    /// Remember whether the stage should run on the next launch
    fn set_enabled(&self, enabled: bool) -> ControlResult<()>;
}

impl<S: ControlSheet> ManagedStage for Supervisor<S> {
    fn name(&self) -> &str {
        self.stage()
    }

    fn lifecycle(&self) -> Lifecycle {
        Supervisor::lifecycle(self)
    }

    fn start(&mut self) -> ControlResult<()> {
        Supervisor::start(self)
    }

    fn stop(&mut self, force: bool) {
        Supervisor::stop(self, force)
    }

    fn process_messages(&mut self) -> ControlResult<()> {
        Supervisor::process_messages(self)
    }

    fn is_busy(&self) -> bool {
        Supervisor::is_busy(self)
    }

    fn last_error(&self) -> Option<&str> {
        Supervisor::last_error(self)
    }

    fn was_enabled(&self) -> bool {
        Supervisor::was_enabled(self)
    }

    fn set_enabled(&self, enabled: bool) -> ControlResult<()> {
        Supervisor::set_enabled(self, enabled)
    }
}

/// Launcher for every stage: this executable's hidden `worker` command
pub fn process_launchers(
    tick_interval: Duration,
    log_filter: String,
    json_logs: bool,
) -> impl FnMut(StageKind) -> StageResult<Box<dyn WorkerLauncher>> {
    move |_kind| {
        let mut launcher = ProcessLauncher::current_exe()?
            .env("RUST_LOG", &log_filter)
            .arg("worker")
            .arg("--tick-interval-ms")
            .arg(tick_interval.as_millis().to_string());
        if json_logs {
            launcher = launcher.arg("--json");
        }
        Ok(Box::new(launcher) as Box<dyn WorkerLauncher>)
    }
}

fn supervise<S: ControlSheet>(
    kind: StageKind,
    launcher: Box<dyn WorkerLauncher>,
    store: &Arc<Mutex<KvStore>>,
    args: &StageArgs,
) -> StageResult<Box<dyn ManagedStage>> {
    let supervisor = Supervisor::<S>::new(kind.name(), launcher, Arc::clone(store)).with_args(args)?;
    Ok(Box::new(supervisor))
}

/// Shared memory and supervisors of one running app
pub struct Pipeline {
    app: &'static AppSpec,
    heap: WeakHeap,
    rings: Vec<RingDirectory>,
    reemit: ReemitSignal,
    stages: Vec<Box<dyn ManagedStage>>,
    store: Arc<Mutex<KvStore>>,
    preview_seen: u64,
}

impl Pipeline {
    /// Create the shared memory of `app` and a stopped supervisor per stage.
    ///
    /// Block names are prefixed with `session` so several hosts can run side
    /// by side.
    pub fn build<L>(
        app: &str,
        session: &str,
        config: &AppConfig,
        store: Arc<Mutex<KvStore>>,
        mut launcher_for: L,
    ) -> StageResult<Self>
    where
        L: FnMut(StageKind) -> StageResult<Box<dyn WorkerLauncher>>,
    {
        let app = find_app(app)?;
        let pipeline_config = &config.pipeline;
        let block = |name: &str| format!("{session}{name}");

        let heap = WeakHeap::create(&block("images"), pipeline_config.image_heap_size_mb * MB)?;
        let reemit = ReemitSignal::create(&block("reemit"))?;
        let ring_options = RingOptions::new(pipeline_config.table_size, pipeline_config.ring_heap_size_mb * MB);

        let mut rings = Vec::with_capacity(app.stages.len());
        let mut stages = Vec::with_capacity(app.stages.len());
        let mut input = None;
        for (i, &kind) in app.stages.iter().enumerate() {
            let last = i + 1 == app.stages.len();
            let output = if last { block(PREVIEW_RING) } else { block(kind.name()) };
            rings.push(RingDirectory::create(&output, ring_options)?);

            let args = StageArgs {
                image_heap: heap.name().to_string(),
                input: input.replace(output.clone()),
                output,
                reemit: reemit.name().to_string(),
                read_timeout_ms: pipeline_config.read_timeout_ms,
                // Nobody consumes the preview ring in order
                buffer_slack: (!last).then_some(pipeline_config.buffer_slack),
                source: config.source.clone(),
            };
            let launcher = launcher_for(kind)?;
            let stage = match kind {
                StageKind::Source => supervise::<SourceControls>(kind, launcher, &store, &args),
                StageKind::Detector => supervise::<DetectorControls>(kind, launcher, &store, &args),
                StageKind::Marker => supervise::<MarkerControls>(kind, launcher, &store, &args),
                StageKind::Aligner => supervise::<AlignerControls>(kind, launcher, &store, &args),
                StageKind::Swapper => supervise::<SwapperControls>(kind, launcher, &store, &args),
                StageKind::Merger => supervise::<MergerControls>(kind, launcher, &store, &args),
                StageKind::Output => supervise::<OutputControls>(kind, launcher, &store, &args),
            }?;
            stages.push(stage);
        }

        info!(app = app.name, stages = stages.len(), "Pipeline built");
        Ok(Self {
            app,
            heap,
            rings,
            reemit,
            stages,
            store,
            preview_seen: 0,
        })
    }

    /// The app being run
    pub fn app(&self) -> &'static AppSpec {
        self.app
    }

    /// Supervised stages in processing order
    pub fn stages(&self) -> &[Box<dyn ManagedStage>] {
        &self.stages
    }

    /// Stage by name
    pub fn stage_mut(&mut self, name: &str) -> Option<&mut Box<dyn ManagedStage>> {
        self.stages.iter_mut().find(|s| s.name() == name)
    }

    /// Start every stage that was enabled when the host last exited
    pub fn start_enabled(&mut self) {
        for stage in &mut self.stages {
            if !stage.was_enabled() {
                info!(stage = stage.name(), "Stage left disabled");
                continue;
            }
            if let Err(e) = stage.start() {
                error!(stage = stage.name(), error = %e, "Stage failed to start");
            }
        }
    }

    /// Ask every running stage to stop
    pub fn stop_all(&mut self, force: bool) {
        for stage in &mut self.stages {
            stage.stop(force);
        }
    }

    /// Pump every stage and the store once
    pub fn process_messages(&mut self, now: Instant) {
        for stage in &mut self.stages {
            if let Err(e) = stage.process_messages() {
                warn!(stage = stage.name(), error = %e, "Stage message pump failed");
            }
        }
        if let Err(e) = self.store.lock().process_messages(now) {
            warn!(error = %e, "Saving the state store failed");
        }
    }

    /// True while any stage is starting or stopping
    pub fn is_transitioning(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s.lifecycle(), Lifecycle::Starting | Lifecycle::Stopping))
    }

    /// True when no stage has a worker
    pub fn all_stopped(&self) -> bool {
        self.stages.iter().all(|s| s.lifecycle() == Lifecycle::Stopped)
    }

    /// Ask the source to resend its last frame
    pub fn request_reemit(&self) -> ShmResult<()> {
        self.reemit.request()
    }

    /// The ring the final stage publishes on
    pub fn preview(&self) -> Option<&RingDirectory> {
        self.rings.last()
    }

    /// Newest record on the preview ring if it arrived since the last call
    pub fn take_preview(&mut self) -> Option<FrameRecord> {
        let ring = self.rings.last()?;
        let write_id = ring.get_write_id();
        if write_id == 0 || write_id == self.preview_seen {
            return None;
        }
        self.preview_seen = write_id;
        match ring.get_by_id(write_id - 1)? {
            Fetched::Fresh(bytes) => FrameRecord::decode(&bytes).ok(),
            Fetched::Stale => None,
        }
    }

    /// Image heap shared by every stage
    pub fn heap(&self) -> &WeakHeap {
        &self.heap
    }

    /// Flush the store to disk now
    pub fn finish_pending_jobs(&self) {
        if let Err(e) = self.store.lock().finish_pending_jobs() {
            error!(error = %e, "Final state save failed");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Workers first, then the blocks they are attached to
        self.stop_all(true);
        self.stages.clear();
    }
}
