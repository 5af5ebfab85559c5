//! Progress indicator

use super::{ControlBody, ControlCore, ControlState, Side, impl_endpoint};

/// Percentage and caption pushed by the host.
#[derive(Debug)]
pub struct Progress {
    core: ControlCore,
    value: Option<u8>,
    title: Option<String>,
}

impl Progress {
    /// New endpoint with no progress
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            core: ControlCore::new(name, side),
            value: None,
            title: None,
        }
    }

    /// Current percentage
    pub fn get_progress(&self) -> Option<u8> {
        self.value
    }

    /// Current caption
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Host: set the percentage (capped at 100)
    pub fn set_progress(&mut self, value: Option<u8>) {
        let value = value.map(|v| v.min(100));
        if !self.core.is_host() || self.value == value {
            return;
        }
        self.value = value;
        self.publish();
    }

    /// Host: set the caption
    pub fn set_title(&mut self, title: Option<String>) {
        if !self.core.is_host() || self.title == title {
            return;
        }
        self.title = title;
        self.publish();
    }

    /// Host: change the control state
    pub fn set_state(&mut self, state: ControlState) {
        self.core.set_state(state);
    }

    fn publish(&mut self) {
        self.core.push(ControlBody::Progress {
            value: self.value,
            title: self.title.clone(),
        });
    }

    fn handle_value(&mut self, body: ControlBody) -> bool {
        match body {
            ControlBody::Progress { value, title } if !self.core.is_host() => {
                self.value = value;
                self.title = title;
                true
            }
            _ => false,
        }
    }

    fn reset_value(&mut self) {
        self.value = None;
        self.title = None;
    }
}

impl_endpoint!(Progress);
