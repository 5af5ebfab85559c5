//! Static descriptive text

use super::{ControlBody, ControlCore, ControlState, Side, impl_endpoint};

/// Read-only lines of information pushed by the host.
#[derive(Debug)]
pub struct InfoLabel {
    core: ControlCore,
    lines: Vec<String>,
}

impl InfoLabel {
    /// New endpoint with no text
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            core: ControlCore::new(name, side),
            lines: Vec::new(),
        }
    }

    /// Current lines
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Host: replace the text
    pub fn set_info(&mut self, lines: Vec<String>) {
        if !self.core.is_host() || self.lines == lines {
            return;
        }
        self.lines = lines.clone();
        self.core.push(ControlBody::Info(lines));
    }

    /// Host: change the control state
    pub fn set_state(&mut self, state: ControlState) {
        self.core.set_state(state);
    }

    fn handle_value(&mut self, body: ControlBody) -> bool {
        match body {
            ControlBody::Info(lines) if !self.core.is_host() => {
                self.lines = lines;
                true
            }
            _ => false,
        }
    }

    fn reset_value(&mut self) {
        self.lines.clear();
    }
}

impl_endpoint!(InfoLabel);
