//! The host process: loads configuration and persisted state, builds the
//! pipeline, and pumps every supervisor until the user interrupts.
//!
//! The first Ctrl+C stops the stages gracefully; the host keeps pumping
//! until every worker has reported its final stop. A second Ctrl+C kills
//! whatever is still running.

use crate::error::StageResult;
use crate::stages::StageKind;
use crate::wiring::Pipeline;
use facelink_common::config::AppConfig;
use facelink_common::consts::{CONFIG_FILE_NAME, STATE_FILE_NAME};
use facelink_common::tick::{Clock, SystemClock, run_loop};
use facelink_control::{KvStore, WorkerLauncher};
use facelink_shm::sweep_orphans;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PREVIEW_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// What the host was asked to run
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// App name
    pub app: String,
    /// Directory holding the config file and the state store
    pub userdata_dir: PathBuf,
}

/// Totals of one host run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostSummary {
    /// Preview records seen by the host
    pub previewed: u64,
    /// Whether the stop had to be forced
    pub forced: bool,
}

/// Configuration of a user data directory, defaults when it has none
pub fn load_config(userdata_dir: &Path) -> StageResult<AppConfig> {
    Ok(AppConfig::load_or_default(&userdata_dir.join(CONFIG_FILE_NAME))?)
}

/// Run the host until interrupted
pub fn run_host<L>(options: &HostOptions, config: &AppConfig, launcher_for: L) -> StageResult<HostSummary>
where
    L: FnMut(StageKind) -> StageResult<Box<dyn WorkerLauncher>>,
{
    std::fs::create_dir_all(&options.userdata_dir)?;

    let swept = sweep_orphans()?;
    if swept > 0 {
        info!(blocks = swept, "Removed shared memory left by dead sessions");
    }

    let store = KvStore::open(options.userdata_dir.join(STATE_FILE_NAME))?;
    let store = Arc::new(Mutex::new(store));
    let session = format!("h{}_", std::process::id());
    let mut pipeline = Pipeline::build(&options.app, &session, config, store, launcher_for)?;

    let interrupts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&interrupts);
    ctrlc::set_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })?;

    pipeline.start_enabled();
    info!(app = %options.app, "Host running, press Ctrl+C to stop");
    let summary = drive(&mut pipeline, &interrupts, &mut SystemClock, config.pipeline.host_interval());
    pipeline.finish_pending_jobs();
    info!(previewed = summary.previewed, forced = summary.forced, "Host stopped");
    Ok(summary)
}

/// Pump `pipeline` every `interval` until it has stopped after an interrupt.
///
/// `interrupts` counts Ctrl+C presses: one stops gracefully, two force.
pub fn drive<C: Clock>(
    pipeline: &mut Pipeline,
    interrupts: &AtomicUsize,
    clock: &mut C,
    interval: Duration,
) -> HostSummary {
    let mut summary = HostSummary::default();
    let mut stopping = false;
    let mut last_log: Option<Instant> = None;

    run_loop(clock, interval, |now| {
        pipeline.process_messages(now);

        if let Some(record) = pipeline.take_preview() {
            summary.previewed += 1;
            if last_log.is_none_or(|t| now.duration_since(t) >= PREVIEW_LOG_INTERVAL) {
                last_log = Some(now);
                info!(
                    frame = record.frame_num,
                    faces = record.faces.len(),
                    images = record.images.len(),
                    previewed = summary.previewed,
                    "Preview"
                );
            }
        }

        let presses = interrupts.load(Ordering::SeqCst);
        if presses >= 1 && !stopping {
            info!("Stopping stages");
            pipeline.stop_all(false);
            stopping = true;
        }
        if presses >= 2 && !summary.forced {
            warn!("Forcing stages down");
            pipeline.stop_all(true);
            summary.forced = true;
        }

        if stopping && !pipeline.is_transitioning() && pipeline.all_stopped() {
            debug!("All stages stopped");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });
    summary
}
