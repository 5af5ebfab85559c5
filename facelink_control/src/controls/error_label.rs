//! Error display control

use super::{ControlBody, ControlCore, ControlState, Side, impl_endpoint};

/// Nullable error text. Setting an error enables the control, clearing it
/// disables it.
#[derive(Debug)]
pub struct ErrorLabel {
    core: ControlCore,
    error: Option<String>,
}

impl ErrorLabel {
    /// New endpoint with no error
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            core: ControlCore::new(name, side),
            error: None,
        }
    }

    /// Current error text
    pub fn get_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Host: show or clear an error
    pub fn set_error(&mut self, error: Option<String>) {
        if !self.core.is_host() {
            return;
        }
        self.core.set_state(if error.is_some() {
            ControlState::Enabled
        } else {
            ControlState::Disabled
        });
        if self.error != error {
            self.error = error.clone();
            self.core.push(ControlBody::Error(error));
        }
    }

    fn handle_value(&mut self, body: ControlBody) -> bool {
        match body {
            ControlBody::Error(error) if !self.core.is_host() => {
                self.error = error;
                true
            }
            _ => false,
        }
    }

    fn reset_value(&mut self) {
        self.error = None;
    }
}

impl_endpoint!(ErrorLabel);
