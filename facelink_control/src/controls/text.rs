//! Nullable text control

use super::{ControlBody, ControlCore, ControlState, Side, impl_endpoint};

/// Nullable string; the client proposes, the host decides and echoes.
#[derive(Debug)]
pub struct Text {
    core: ControlCore,
    value: Option<String>,
    changed: bool,
}

impl Text {
    /// New endpoint with no value
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            core: ControlCore::new(name, side),
            value: None,
            changed: false,
        }
    }

    /// Current value
    pub fn get_text(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Set the value; a client proposal is refused unless enabled.
    pub fn set_text(&mut self, value: Option<String>) -> bool {
        if !self.core.is_host() && !self.core.is_enabled() {
            return false;
        }
        self.value = value.clone();
        self.core.push(ControlBody::Text(value));
        true
    }

    /// Host: change the control state
    pub fn set_state(&mut self, state: ControlState) {
        self.core.set_state(state);
    }

    /// Host: take the value if the client changed it since the last call
    pub fn take_change(&mut self) -> Option<Option<String>> {
        std::mem::take(&mut self.changed).then(|| self.value.clone())
    }

    fn handle_value(&mut self, body: ControlBody) -> bool {
        let ControlBody::Text(value) = body else {
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
        self.core.push(ControlBody::Text(self.value.clone()));
        accepted
    }

    fn reset_value(&mut self) {
        self.value = None;
        self.changed = false;
    }
}

impl_endpoint!(Text);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::testing::settle;

    #[test]
    fn test_text_round_trip() {
        let mut host = Text::new("note", Side::Host);
        let mut client = Text::new("note", Side::Client);
        host.set_state(ControlState::Enabled);
        settle(&mut host, &mut client);

        assert!(client.set_text(Some("hello".into())));
        settle(&mut host, &mut client);
        assert_eq!(host.take_change(), Some(Some("hello".to_string())));
        assert_eq!(client.get_text(), Some("hello"));
    }
}
