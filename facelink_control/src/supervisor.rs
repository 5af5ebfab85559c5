//! Supervisor side of a stage: worker lifecycle, control mirror and state
//! persistence.
//!
//! ```text
//! Stopped --start()--> Starting --Started--> Started
//!    ^                    |                     |
//!    |                    +------stop()---------+--> Stopping
//!    +----------- finalize (Stop received, disconnect, death, force) <-+
//! ```
//!
//! Nothing here blocks: the owner calls [`Supervisor::process_messages`] on
//! a short steady interval and every transition happens from there.

use crate::controls::Side;
use crate::error::{ControlError, ControlResult};
use crate::message::{BootInfo, Envelope, PROTOCOL_VERSION};
use crate::pipe::MessagePipe;
use crate::sheet::ControlSheet;
use crate::store::{KvStore, WorkerState};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Worker lifecycle as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No worker
    Stopped,
    /// Boot sent, waiting for the worker to enter its loop
    Starting,
    /// Worker loop running
    Started,
    /// Stop requested, waiting for the worker's final stop
    Stopping,
}

/// A running worker, process or otherwise
pub trait WorkerProcess: Send {
    /// OS process id, if the worker is a process
    fn id(&self) -> Option<u32>;

    /// True while the worker has not exited
    fn is_alive(&mut self) -> bool;

    /// Ask the worker to die now
    fn terminate(&mut self);

    /// Wait for the worker to exit
    fn join(&mut self);
}

/// Starts workers for a supervisor.
pub trait WorkerLauncher: Send {
    /// Start a worker for `stage` and return it with the supervisor's pipe end
    fn launch(&mut self, stage: &str) -> ControlResult<(Box<dyn WorkerProcess>, MessagePipe)>;
}

/// Launches each worker as a fresh OS process talking over stdin/stdout.
///
/// The child runs `<program> <args...> --stage <stage>` in its own process
/// group, so a terminal Ctrl+C reaches only the host, which then stops the
/// workers gracefully.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    /// Launch `program`
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Launch the running executable again
    pub fn current_exe() -> ControlResult<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Append a fixed argument
    pub fn arg<A: Into<OsString>>(mut self, arg: A) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for every worker
    pub fn env<K: Into<OsString>, V: Into<OsString>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, stage: &str) -> ControlResult<(Box<dyn WorkerProcess>, MessagePipe)> {
        let spawn_failed = |reason: String| ControlError::SpawnFailed {
            stage: stage.to_string(),
            reason,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--stage")
            .arg(stage)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_failed("child stdio not captured".into()));
        };
        let pipe = MessagePipe::from_fds(OwnedFd::from(stdout), OwnedFd::from(stdin));
        debug!(stage, pid = child.id(), "Worker process spawned");
        Ok((Box::new(ChildWorker { child }), pipe))
    }
}

struct ChildWorker {
    child: Child,
}

impl WorkerProcess for ChildWorker {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        if !self.is_alive() {
            return;
        }
        if let Err(e) = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
            warn!(pid = self.child.id(), error = %e, "Failed to signal worker");
        }
    }

    fn join(&mut self) {
        if let Err(e) = self.child.wait() {
            warn!(pid = self.child.id(), error = %e, "Failed to reap worker");
        }
    }
}

/// Store key of a stage's persisted [`WorkerState`]
pub fn state_key(stage: &str) -> String {
    format!("{}.worker_state", stage)
}

/// Store key of a stage's last on/off choice
pub fn enabled_key(stage: &str) -> String {
    format!("{}.enabled", stage)
}

/// Owns one stage's worker and mirrors its controls.
pub struct Supervisor<S: ControlSheet> {
    stage: String,
    launcher: Box<dyn WorkerLauncher>,
    store: Arc<Mutex<KvStore>>,
    args: Vec<u8>,
    lifecycle: Lifecycle,
    busy: bool,
    process: Option<Box<dyn WorkerProcess>>,
    pipe: Option<MessagePipe>,
    controls: S,
    reset_pending: bool,
    restart_pending: bool,
    last_error: Option<String>,
}

impl<S: ControlSheet> Supervisor<S> {
    /// Supervisor for `stage`, initially stopped
    pub fn new(stage: &str, launcher: Box<dyn WorkerLauncher>, store: Arc<Mutex<KvStore>>) -> Self {
        Self {
            stage: stage.to_string(),
            launcher,
            store,
            args: Vec::new(),
            lifecycle: Lifecycle::Stopped,
            busy: false,
            process: None,
            pipe: None,
            controls: S::new(Side::Client),
            reset_pending: false,
            restart_pending: false,
            last_error: None,
        }
    }

    /// Start arguments handed to every worker this supervisor boots
    pub fn with_args<T: Serialize>(mut self, args: &T) -> ControlResult<Self> {
        self.args = bincode::serialize(args)?;
        Ok(self)
    }

    /// Stage name
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// True with no worker
    pub fn is_stopped(&self) -> bool {
        self.lifecycle == Lifecycle::Stopped
    }

    /// True between `start()` and the worker's `Started`
    pub fn is_starting(&self) -> bool {
        self.lifecycle == Lifecycle::Starting
    }

    /// True while the worker loop runs
    pub fn is_started(&self) -> bool {
        self.lifecycle == Lifecycle::Started
    }

    /// True between a graceful `stop()` and the worker's final stop
    pub fn is_stopping(&self) -> bool {
        self.lifecycle == Lifecycle::Stopping
    }

    /// Worker busy flag; always false unless started
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Error the last worker stopped with
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// OS process id of the current worker
    pub fn worker_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.id())
    }

    /// Client mirror of the worker's controls
    pub fn controls(&self) -> &S {
        &self.controls
    }

    /// Client mirror of the worker's controls, for proposing changes
    pub fn controls_mut(&mut self) -> &mut S {
        &mut self.controls
    }

    /// Persisted worker state, or the default when none is stored
    pub fn persisted_state(&self) -> WorkerState {
        self.store.lock().get(&state_key(&self.stage)).unwrap_or_default()
    }

    /// Last on/off choice remembered for this stage; stages start enabled
    pub fn was_enabled(&self) -> bool {
        self.store.lock().get(&enabled_key(&self.stage)).unwrap_or(true)
    }

    /// Remember the on/off choice for the next session
    pub fn set_enabled(&self, enabled: bool) -> ControlResult<()> {
        self.store.lock().set(&enabled_key(&self.stage), &enabled)
    }

    /// Boot a worker. Does nothing unless stopped.
    pub fn start(&mut self) -> ControlResult<()> {
        if !self.is_stopped() {
            return Ok(());
        }
        let boot = Envelope::Boot(BootInfo {
            protocol: PROTOCOL_VERSION,
            stage: self.stage.clone(),
            state: self.persisted_state(),
            args: self.args.clone(),
        });

        let (mut process, mut pipe) = self.launcher.launch(&self.stage)?;
        if let Err(e) = pipe.send(&boot) {
            drop(pipe);
            process.terminate();
            process.join();
            return Err(e);
        }

        self.controls.reset_all();
        self.process = Some(process);
        self.pipe = Some(pipe);
        self.last_error = None;
        self.lifecycle = Lifecycle::Starting;
        info!(stage = %self.stage, "Starting");
        Ok(())
    }

    /// Stop the worker.
    ///
    /// A graceful stop asks the worker and waits for its answer in
    /// [`process_messages`](Self::process_messages). A forced stop tears it
    /// down at once; a worker killed while holding a shared memory lock
    /// leaves that lock held for every other process.
    pub fn stop(&mut self, force: bool) {
        if self.is_stopped() {
            return;
        }
        if force {
            warn!(stage = %self.stage, "Forced stop");
            self.finalize();
            return;
        }
        if self.is_stopping() {
            return;
        }

        let sent = match self.pipe.as_mut() {
            Some(pipe) => pipe.send(&Envelope::stop_request()),
            None => Err(ControlError::Disconnected),
        };
        match sent {
            Ok(()) => {
                self.busy = false;
                self.lifecycle = Lifecycle::Stopping;
                info!(stage = %self.stage, "Stopping");
            }
            Err(e) => {
                warn!(stage = %self.stage, error = %e, "Stop request not delivered");
                self.finalize();
            }
        }
    }

    /// Stop, then start a fresh worker once the stop completes
    pub fn restart(&mut self) -> ControlResult<()> {
        if self.is_stopped() {
            return self.start();
        }
        self.restart_pending = true;
        self.stop(false);
        self.after_stop()
    }

    /// Forget the persisted worker state.
    ///
    /// A running worker is restarted and the state is dropped between its
    /// stop and the fresh start.
    pub fn reset_state(&mut self) -> ControlResult<()> {
        if self.is_stopped() {
            self.store.lock().remove(&state_key(&self.stage));
            info!(stage = %self.stage, "Worker state reset");
            return Ok(());
        }
        self.reset_pending = true;
        self.restart_pending = true;
        self.stop(false);
        self.after_stop()
    }

    /// Drain the pipe, apply what arrived and send queued control proposals.
    pub fn process_messages(&mut self) -> ControlResult<()> {
        let Some(pipe) = self.pipe.as_mut() else {
            return self.after_stop();
        };

        let mut finished = false;
        // A worker that stops on its own closes the pipe right after its
        // final Stop, so what was read before the close is still applied
        let (received, mut lost) = match pipe.drain::<Envelope>() {
            Ok(drained) => (drained.messages, drained.disconnected),
            Err(e) => {
                error!(stage = %self.stage, error = %e, "Worker pipe failed");
                (Vec::new(), true)
            }
        };

        for envelope in received {
            match envelope {
                Envelope::Started => {
                    if self.is_starting() {
                        self.lifecycle = Lifecycle::Started;
                        info!(stage = %self.stage, "Started");
                    }
                }
                Envelope::State(state) => {
                    if let Err(e) = self.store.lock().set(&state_key(&self.stage), &state) {
                        error!(stage = %self.stage, error = %e, "Worker state not saved");
                    }
                }
                Envelope::Busy(busy) => {
                    if self.is_started() && self.busy != busy {
                        self.busy = busy;
                        debug!(stage = %self.stage, busy, "Busy changed");
                    }
                }
                Envelope::Control(message) => {
                    self.controls.dispatch(message);
                }
                Envelope::Stop { error, restart } => {
                    if let Some(e) = error {
                        error!(stage = %self.stage, error = %e, "Worker error, discarding its state");
                        self.store.lock().remove(&state_key(&self.stage));
                        self.last_error = Some(e);
                    }
                    if restart {
                        info!(stage = %self.stage, "Worker requested restart");
                        self.restart_pending = true;
                    }
                    finished = true;
                }
                Envelope::Boot(_) => {
                    warn!(stage = %self.stage, "Unexpected boot from worker");
                }
            }
        }

        if !finished && !lost && !self.process.as_mut().is_none_or(|p| p.is_alive()) {
            error!(stage = %self.stage, "Worker died without stopping");
            lost = true;
        }

        if !finished && !lost {
            lost = self.send_proposals();
        }

        if finished || lost {
            self.finalize();
        }
        self.after_stop()
    }

    /// Forward client proposals. Returns true when the pipe is gone.
    fn send_proposals(&mut self) -> bool {
        let messages = self.controls.drain();
        if self.is_stopping() {
            return false;
        }
        let Some(pipe) = self.pipe.as_mut() else {
            return false;
        };
        for message in messages {
            if let Err(e) = pipe.send(&Envelope::Control(message)) {
                if !matches!(e, ControlError::Disconnected) {
                    error!(stage = %self.stage, error = %e, "Failed to send control message");
                }
                return true;
            }
        }
        false
    }

    /// Apply deferred resets and restarts once stopped
    fn after_stop(&mut self) -> ControlResult<()> {
        if !self.is_stopped() {
            return Ok(());
        }
        if std::mem::take(&mut self.reset_pending) {
            self.store.lock().remove(&state_key(&self.stage));
            info!(stage = %self.stage, "Worker state reset");
        }
        if std::mem::take(&mut self.restart_pending) {
            self.start()?;
        }
        Ok(())
    }

    fn finalize(&mut self) {
        // Closing the pipe first lets a cooperative worker notice and exit
        self.pipe = None;
        if let Some(mut process) = self.process.take() {
            process.terminate();
            process.join();
        }
        self.controls.reset_all();
        self.busy = false;
        self.lifecycle = Lifecycle::Stopped;
        info!(stage = %self.stage, "Stopped");
    }
}

impl<S: ControlSheet> Drop for Supervisor<S> {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.finalize();
        }
    }
}
