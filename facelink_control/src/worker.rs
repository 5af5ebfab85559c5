//! Worker side of a supervised stage.
//!
//! [`run_worker`] is the whole life of a worker: it waits for the boot
//! frame, runs the stage hooks in a cooperative loop, and always answers
//! with a final [`Envelope::Stop`] carrying the outcome. Errors and panics
//! from the hooks never escape; they become the stop message's `error`.

use crate::controls::Side;
use crate::error::{BoxError, ControlError, ControlResult};
use crate::message::{BootInfo, Envelope, PROTOCOL_VERSION};
use crate::pipe::MessagePipe;
use crate::sheet::ControlSheet;
use crate::store::WorkerState;
use facelink_common::consts::WORKER_BOOT_TIMEOUT_MS;
use facelink_common::tick::{SystemClock, run_loop};
use serde::de::DeserializeOwned;
use std::any::Any;
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Hooks of one pipeline stage, run inside the worker process.
pub trait StageWorker: Send + 'static {
    /// Controls this stage exposes
    type Sheet: ControlSheet;

    /// Called once before the loop starts
    fn on_start(&mut self, ctx: &mut WorkerContext<Self::Sheet>) -> Result<(), BoxError>;

    /// Called back-to-back while the worker runs
    fn on_tick(&mut self, ctx: &mut WorkerContext<Self::Sheet>) -> Result<(), BoxError>;

    /// Called once after the loop ends, whatever ended it
    fn on_stop(&mut self, _ctx: &mut WorkerContext<Self::Sheet>) {}
}

/// What a stage sees of its worker: controls, persisted state, start
/// arguments and the lifecycle requests it may make.
#[derive(Debug)]
pub struct WorkerContext<S> {
    stage: String,
    /// Host ends of the stage's controls
    pub controls: S,
    state: WorkerState,
    args: Vec<u8>,
    save_state: bool,
    busy: bool,
    busy_pending: Option<bool>,
    restart: bool,
    stop_requested: bool,
}

impl<S: ControlSheet> WorkerContext<S> {
    /// Context for a freshly booted worker
    pub fn new(boot: BootInfo) -> Self {
        Self {
            stage: boot.stage,
            controls: S::new(Side::Host),
            state: boot.state,
            args: boot.args,
            save_state: false,
            busy: false,
            busy_pending: None,
            restart: false,
            stop_requested: false,
        }
    }
}

impl<S> WorkerContext<S> {
    /// Stage name
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Persisted state as booted, plus local changes
    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Mutable state; call [`save_state`](Self::save_state) to persist it
    pub fn state_mut(&mut self) -> &mut WorkerState {
        &mut self.state
    }

    /// Send the current state to the supervisor at the end of this tick
    pub fn save_state(&mut self) {
        self.save_state = true;
    }

    /// Decode the start arguments; `None` when there are none or they do not decode
    pub fn args<T: DeserializeOwned>(&self) -> Option<T> {
        if self.args.is_empty() {
            return None;
        }
        bincode::deserialize(&self.args)
            .inspect_err(|e| warn!(stage = %self.stage, error = %e, "Undecodable start arguments"))
            .ok()
    }

    /// Mark the worker busy or idle
    pub fn set_busy(&mut self, busy: bool) {
        if self.busy != busy {
            self.busy = busy;
            self.busy_pending = Some(busy);
        }
    }

    /// Current busy flag
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Leave the loop and ask the supervisor to start a fresh worker
    pub fn restart(&mut self) {
        self.restart = true;
    }

    /// True once the supervisor asked this worker to stop
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    fn should_exit(&self) -> bool {
        self.stop_requested || self.restart
    }
}

/// Run a worker over `pipe` until it stops.
///
/// Returns an error only when the worker never booted; everything after the
/// boot frame is reported to the supervisor instead.
pub fn run_worker<W: StageWorker>(
    mut worker: W,
    mut pipe: MessagePipe,
    tick_interval: Duration,
) -> ControlResult<()> {
    let boot = match pipe.recv_timeout::<Envelope>(Duration::from_millis(WORKER_BOOT_TIMEOUT_MS))? {
        Some(Envelope::Boot(boot)) => boot,
        Some(other) => {
            return Err(ControlError::Protocol(format!(
                "expected boot, got {}",
                other.kind()
            )));
        }
        None => return Err(ControlError::Protocol("no boot message".into())),
    };
    if boot.protocol != PROTOCOL_VERSION {
        return Err(ControlError::Protocol(format!(
            "protocol version {} is not {}",
            boot.protocol, PROTOCOL_VERSION
        )));
    }

    let mut ctx = WorkerContext::<W::Sheet>::new(boot);
    info!(stage = %ctx.stage, "Worker booted");

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        run_stage(&mut worker, &mut ctx, &mut pipe, tick_interval)
    }));
    let mut error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(panic_message(payload.as_ref())),
    };

    if catch_unwind(AssertUnwindSafe(|| worker.on_stop(&mut ctx))).is_err() && error.is_none() {
        error = Some("panic in on_stop".to_string());
    }

    match &error {
        Some(e) => error!(stage = %ctx.stage, error = %e, "Worker failed"),
        None => info!(stage = %ctx.stage, restart = ctx.restart, "Worker stopped"),
    }

    // Whatever the hooks left queued still goes out before the final stop
    let stop = Envelope::Stop {
        error,
        restart: ctx.restart,
    };
    match flush(&mut ctx, &mut pipe).and_then(|_| pipe.send(&stop)) {
        Ok(()) | Err(ControlError::Disconnected) => Ok(()),
        Err(e) => Err(e),
    }
}

fn run_stage<W: StageWorker>(
    worker: &mut W,
    ctx: &mut WorkerContext<W::Sheet>,
    pipe: &mut MessagePipe,
    tick_interval: Duration,
) -> Result<(), BoxError> {
    worker.on_start(ctx)?;
    flush(ctx, pipe)?;
    pipe.send(&Envelope::Started)?;
    debug!(stage = %ctx.stage, "Worker loop entered");

    let mut clock = SystemClock;
    run_loop(&mut clock, tick_interval, |_| {
        let step = pump(ctx, pipe)
            .map_err(BoxError::from)
            .and_then(|_| {
                if ctx.should_exit() {
                    return Ok(true);
                }
                worker.on_tick(ctx)?;
                flush(ctx, pipe)?;
                Ok(ctx.should_exit())
            });
        match step {
            Ok(false) => ControlFlow::Continue(()),
            Ok(true) => ControlFlow::Break(Ok(())),
            Err(e) => ControlFlow::Break(Err(e)),
        }
    })
}

/// Apply everything the supervisor sent
fn pump<S: ControlSheet>(ctx: &mut WorkerContext<S>, pipe: &mut MessagePipe) -> ControlResult<()> {
    let drained = pipe.drain::<Envelope>()?;
    for envelope in drained.messages {
        match envelope {
            Envelope::Control(message) => {
                ctx.controls.dispatch(message);
            }
            Envelope::Stop { .. } => {
                debug!(stage = %ctx.stage, "Stop requested");
                ctx.stop_requested = true;
            }
            other => warn!(stage = %ctx.stage, kind = other.kind(), "Unexpected message in worker"),
        }
    }
    if drained.disconnected {
        warn!(stage = %ctx.stage, "Supervisor went away, stopping");
        ctx.stop_requested = true;
    }
    Ok(())
}

/// Send queued control messages, busy changes and state saves
fn flush<S: ControlSheet>(ctx: &mut WorkerContext<S>, pipe: &mut MessagePipe) -> ControlResult<()> {
    for message in ctx.controls.drain() {
        pipe.send(&Envelope::Control(message))?;
    }
    if let Some(busy) = ctx.busy_pending.take() {
        pipe.send(&Envelope::Busy(busy))?;
    }
    if std::mem::take(&mut ctx.save_state) {
        pipe.send(&Envelope::State(ctx.state.clone()))?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}
