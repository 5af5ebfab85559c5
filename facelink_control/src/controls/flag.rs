//! Nullable boolean control

use super::{ControlBody, ControlCore, ControlState, Side, impl_endpoint};

/// Nullable boolean; either end may propose a value, the host decides.
#[derive(Debug)]
pub struct Flag {
    core: ControlCore,
    value: Option<bool>,
    changed: bool,
}

impl Flag {
    /// New endpoint with no value
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            core: ControlCore::new(name, side),
            value: None,
            changed: false,
        }
    }

    /// Current value
    pub fn get_flag(&self) -> Option<bool> {
        self.value
    }

    /// Set the value.
    ///
    /// On the host this always applies and is mirrored. On the client it is
    /// a proposal, refused unless the control is enabled.
    pub fn set_flag(&mut self, value: Option<bool>) -> bool {
        if !self.core.is_host() && !self.core.is_enabled() {
            return false;
        }
        self.value = value;
        self.core.push(ControlBody::Flag(value));
        true
    }

    /// Host: change the control state
    pub fn set_state(&mut self, state: ControlState) {
        self.core.set_state(state);
    }

    /// Host: take the value if the client changed it since the last call
    pub fn take_change(&mut self) -> Option<Option<bool>> {
        std::mem::take(&mut self.changed).then_some(self.value)
    }

    fn handle_value(&mut self, body: ControlBody) -> bool {
        let ControlBody::Flag(value) = body else {
            return false;
        };
        if !self.core.is_host() {
            self.value = value;
            return true;
        }

        let accepted = self.core.is_enabled();
        if accepted && self.value != value {
            self.value = value;
            self.changed = true;
        }
        self.core.push(ControlBody::Flag(self.value));
        accepted
    }

    fn reset_value(&mut self) {
        self.value = None;
        self.changed = false;
    }
}

impl_endpoint!(Flag);
