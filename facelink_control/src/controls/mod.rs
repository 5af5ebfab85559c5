//! Mirrored remote controls.
//!
//! A control exists twice: a **host** endpoint owned by the worker process,
//! which holds the authoritative value, and a **client** endpoint owned by
//! the supervising process, which mirrors it and proposes changes. Only the
//! host changes a control's [`ControlState`]. Every accepted or rejected
//! client proposal is answered with the host's final value, so both ends
//! converge on what the host decided.
//!
//! Endpoints never touch the pipe themselves: they queue outgoing
//! [`ControlBody`] values, and the owning sheet drains them into
//! [`ControlMessage`]s.

mod error_label;
mod flag;
mod info;
mod number;
mod paths;
mod progress;
mod signal;
mod switch;
mod text;

pub use error_label::ErrorLabel;
pub use flag::Flag;
pub use info::InfoLabel;
pub use number::{Number, NumberConfig, NumberFlags};
pub use paths::{PathKind, Paths, PathsConfig};
pub use progress::Progress;
pub use signal::Signal;
pub use switch::{Choice, DynamicSingleSwitch};
pub use text::Text;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Interactivity of a control
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlState {
    /// Not usable
    #[default]
    Disabled,
    /// Visible but temporarily not interactive
    Frozen,
    /// Usable
    Enabled,
}

/// Which end of a control an endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Authoritative end, in the worker process
    Host,
    /// Mirroring end, in the supervising process
    Client,
}

/// Payload of one control message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlBody {
    /// New control state (host to client)
    State(ControlState),
    /// Return to boot defaults (applied by clients)
    Reset,
    /// One-shot event (client to host)
    Signal,
    /// Flag value
    Flag(Option<bool>),
    /// Number value
    Number(Option<f64>),
    /// Number constraints (host to client)
    NumberConfig(NumberConfig),
    /// Text value
    Text(Option<String>),
    /// Selected path
    Paths(Option<PathBuf>),
    /// Path picker semantics (host to client)
    PathsConfig(PathsConfig),
    /// Choice list (host to client); choices are bincode-encoded
    SwitchChoices {
        /// Encoded choices
        choices: Vec<Vec<u8>>,
        /// Display name per choice
        names: Vec<String>,
        /// Display name of the "nothing selected" entry, if selectable
        none_name: Option<String>,
    },
    /// Selected choice index
    SwitchSelect(Option<usize>),
    /// Progress value and title (host to client)
    Progress {
        /// Percentage, 0 to 100
        value: Option<u8>,
        /// Caption
        title: Option<String>,
    },
    /// Error text (host to client)
    Error(Option<String>),
    /// Info lines (host to client)
    Info(Vec<String>),
}

impl ControlBody {
    /// Sub-message name used in message keys
    pub fn sub_name(&self) -> &'static str {
        match self {
            ControlBody::State(_) => "state",
            ControlBody::Reset => "reset",
            ControlBody::Signal => "signal",
            ControlBody::Flag(_) => "flag",
            ControlBody::Number(_) => "number",
            ControlBody::NumberConfig(_) => "config",
            ControlBody::Text(_) => "text",
            ControlBody::Paths(_) => "paths",
            ControlBody::PathsConfig(_) => "config",
            ControlBody::SwitchChoices { .. } => "choices",
            ControlBody::SwitchSelect(_) => "selected",
            ControlBody::Progress { .. } => "progress",
            ControlBody::Error(_) => "error",
            ControlBody::Info(_) => "info",
        }
    }
}

/// A control message addressed by control name
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlMessage {
    /// Name of the control inside its sheet
    pub control: String,
    /// Message payload
    pub body: ControlBody,
}

impl ControlMessage {
    /// Wire key of the form `__{control}_{sub}__`
    pub fn key(&self) -> String {
        format!("__{}_{}__", self.control, self.body.sub_name())
    }
}

/// One end of a mirrored control.
pub trait ControlEndpoint: Send {
    /// Control name, unique within its sheet
    fn name(&self) -> &str;

    /// Which end this is
    fn side(&self) -> Side;

    /// Current state
    fn state(&self) -> ControlState;

    /// Apply a message from the other end. Returns false if it was ignored.
    fn handle(&mut self, body: ControlBody) -> bool;

    /// Take the queued outgoing messages
    fn take_outgoing(&mut self) -> Vec<ControlBody>;

    /// Return to boot defaults
    fn reset(&mut self);
}

/// State shared by every control kind.
#[derive(Debug)]
pub(crate) struct ControlCore {
    pub name: String,
    pub side: Side,
    pub state: ControlState,
    outbox: Vec<ControlBody>,
}

impl ControlCore {
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            name: name.to_string(),
            side,
            state: ControlState::Disabled,
            outbox: Vec::new(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.side == Side::Host
    }

    pub fn is_enabled(&self) -> bool {
        self.state == ControlState::Enabled
    }

    pub fn push(&mut self, body: ControlBody) {
        self.outbox.push(body);
    }

    pub fn take_outgoing(&mut self) -> Vec<ControlBody> {
        std::mem::take(&mut self.outbox)
    }

    /// Host-only state change, mirrored to the client
    pub fn set_state(&mut self, state: ControlState) {
        if !self.is_host() {
            tracing::warn!(control = %self.name, "Client endpoint cannot change control state");
            return;
        }
        if self.state != state {
            self.state = state;
            self.push(ControlBody::State(state));
        }
    }

    /// Handle the messages every kind understands.
    ///
    /// Returns `Some(reset)` when the body was consumed, where `reset` tells
    /// the kind to clear its value.
    pub fn handle_common(&mut self, body: &ControlBody) -> Option<bool> {
        match body {
            ControlBody::State(state) if !self.is_host() => {
                self.state = *state;
                Some(false)
            }
            ControlBody::Reset if !self.is_host() => {
                self.reset();
                Some(true)
            }
            ControlBody::State(_) | ControlBody::Reset => {
                tracing::debug!(control = %self.name, "Host endpoint ignores client state messages");
                Some(false)
            }
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.state = ControlState::Disabled;
        self.outbox.clear();
    }
}

/// Implements the [`ControlEndpoint`] plumbing shared by every kind.
///
/// The kind provides `handle_value(&mut self, body) -> bool` for its own
/// messages and `reset_value(&mut self)`.
macro_rules! impl_endpoint {
    (<$g:ident: $bound:path> $ty:ty) => {
        $crate::controls::impl_endpoint!(@impl [$g: $bound] $ty);
    };
    (@impl [$($gen:tt)*] $ty:ty) => {
        impl<$($gen)*> $crate::controls::ControlEndpoint for $ty {
            fn name(&self) -> &str {
                &self.core.name
            }

            fn side(&self) -> $crate::controls::Side {
                self.core.side
            }

            fn state(&self) -> $crate::controls::ControlState {
                self.core.state
            }

            fn handle(&mut self, body: $crate::controls::ControlBody) -> bool {
                match self.core.handle_common(&body) {
                    Some(true) => {
                        self.reset_value();
                        true
                    }
                    Some(false) => !self.core.is_host(),
                    None => self.handle_value(body),
                }
            }

            fn take_outgoing(&mut self) -> Vec<$crate::controls::ControlBody> {
                self.core.take_outgoing()
            }

            fn reset(&mut self) {
                self.core.reset();
                self.reset_value();
            }
        }
    };
    ($ty:ty) => {
        $crate::controls::impl_endpoint!(@impl [] $ty);
    };
}

pub(crate) use impl_endpoint;

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deliver everything `from` has queued to `to`
    pub fn deliver(from: &mut dyn ControlEndpoint, to: &mut dyn ControlEndpoint) -> usize {
        let outgoing = from.take_outgoing();
        let n = outgoing.len();
        for body in outgoing {
            to.handle(body);
        }
        n
    }

    /// Shuttle messages both ways until neither end has anything queued
    pub fn settle(host: &mut dyn ControlEndpoint, client: &mut dyn ControlEndpoint) {
        for _ in 0..8 {
            if deliver(host, client) + deliver(client, host) == 0 {
                return;
            }
        }
    }
}
