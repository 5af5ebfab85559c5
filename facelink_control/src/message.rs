//! Supervisor/worker message envelope.
//!
//! Every frame on a worker pipe is one [`Envelope`]. The first frame of a
//! fresh pipe is always [`Envelope::Boot`] from the supervisor.

use crate::controls::ControlMessage;
use crate::store::WorkerState;
use serde::{Deserialize, Serialize};

/// Version of the envelope layout, checked during boot
pub const PROTOCOL_VERSION: u16 = 1;

/// Everything a worker needs to start
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BootInfo {
    /// Envelope layout the supervisor speaks
    pub protocol: u16,
    /// Stage name
    pub stage: String,
    /// Last persisted worker state
    pub state: WorkerState,
    /// Bincode-encoded start arguments, empty when there are none
    pub args: Vec<u8>,
}

/// One message between a supervisor and its worker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Supervisor to worker, first frame only
    Boot(BootInfo),
    /// Worker entered its run loop
    Started,
    /// Supervisor: please stop. Worker: stopping now, with the outcome.
    Stop {
        /// Stringified failure that ended the worker
        error: Option<String>,
        /// Worker asks to be started again
        restart: bool,
    },
    /// Worker state to persist
    State(WorkerState),
    /// Worker busy flag
    Busy(bool),
    /// Control traffic in either direction
    Control(ControlMessage),
}

impl Envelope {
    /// A graceful stop request
    pub fn stop_request() -> Self {
        Envelope::Stop {
            error: None,
            restart: false,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Boot(_) => "boot",
            Envelope::Started => "start",
            Envelope::Stop { .. } => "stop",
            Envelope::State(_) => "state",
            Envelope::Busy(_) => "busy",
            Envelope::Control(_) => "control",
        }
    }
}
