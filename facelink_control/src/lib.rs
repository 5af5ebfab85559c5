//! # facelink control channel
//!
//! Supervision of stage worker processes and the typed remote controls that
//! let a supervising process observe and change a worker's live parameters.
//!
//! ## Module Structure
//!
//! - [`pipe`] - Length-prefixed bincode frames over a descriptor pair
//! - [`message`] - The supervisor/worker [`Envelope`]
//! - [`controls`] - Mirrored control kinds (flag, number, switch, ...)
//! - [`sheet`] - Named sets of controls and the [`control_sheet!`] macro
//! - [`store`] - Debounced on-disk [`KvStore`] and per-stage [`WorkerState`]
//! - [`supervisor`] - [`Supervisor`] and the worker launch seam
//! - [`worker`] - [`StageWorker`] hooks and [`run_worker`]
//!
//! ## Roles
//!
//! The worker owns the authoritative (host) end of every control; the
//! supervisor owns a client mirror. Whenever a worker (re)starts, the mirror
//! returns to defaults and only reflects what the new worker sends.
//!
//! ```rust,no_run
//! use facelink_control::controls::{ControlState, Flag};
//! use facelink_control::{
//!     BoxError, KvStore, ProcessLauncher, StageWorker, Supervisor, WorkerContext,
//!     control_sheet,
//! };
//! use parking_lot::Mutex;
//! use std::sync::Arc;
//!
//! control_sheet! {
//!     pub struct PlayerControls {
//!         is_paused: Flag,
//!     }
//! }
//!
//! struct Player;
//!
//! impl StageWorker for Player {
//!     type Sheet = PlayerControls;
//!
//!     fn on_start(&mut self, ctx: &mut WorkerContext<PlayerControls>) -> Result<(), BoxError> {
//!         ctx.controls.is_paused.set_flag(Some(false));
//!         ctx.controls.is_paused.set_state(ControlState::Enabled);
//!         Ok(())
//!     }
//!
//!     fn on_tick(&mut self, _ctx: &mut WorkerContext<PlayerControls>) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(Mutex::new(KvStore::in_memory()));
//! let launcher = ProcessLauncher::current_exe()?.arg("worker");
//! let mut player = Supervisor::<PlayerControls>::new("player", Box::new(launcher), store);
//! player.start()?;
//! player.process_messages()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod controls;
pub mod error;
pub mod message;
pub mod pipe;
pub mod sheet;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use error::{BoxError, ControlError, ControlResult};
pub use message::{BootInfo, Envelope, PROTOCOL_VERSION};
pub use pipe::{Drained, MessagePipe};
pub use sheet::{ControlSheet, EmptySheet};
pub use store::{KvStore, WorkerState};
pub use supervisor::{
    Lifecycle, ProcessLauncher, Supervisor, WorkerLauncher, WorkerProcess, enabled_key, state_key,
};
pub use worker::{StageWorker, WorkerContext, run_worker};
