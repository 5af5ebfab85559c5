//! One-shot event control

use super::{ControlBody, ControlCore, ControlState, Side, impl_endpoint};

/// Stateless event fired by the client and handled by the host.
#[derive(Debug)]
pub struct Signal {
    core: ControlCore,
    fired: bool,
}

impl Signal {
    /// New endpoint
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            core: ControlCore::new(name, side),
            fired: false,
        }
    }

    /// Client: fire the signal. Refused unless enabled.
    pub fn signal(&mut self) -> bool {
        if self.core.is_host() || !self.core.is_enabled() {
            return false;
        }
        self.core.push(ControlBody::Signal);
        true
    }

    /// Host: change the control state
    pub fn set_state(&mut self, state: ControlState) {
        self.core.set_state(state);
    }

    /// Host: true once per accepted fire
    pub fn take_fired(&mut self) -> bool {
        std::mem::take(&mut self.fired)
    }

    fn handle_value(&mut self, body: ControlBody) -> bool {
        if !matches!(body, ControlBody::Signal) || !self.core.is_host() {
            return false;
        }
        if !self.core.is_enabled() {
            return false;
        }
        self.fired = true;
        true
    }

    fn reset_value(&mut self) {
        self.fired = false;
    }
}

impl_endpoint!(Signal);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::testing::settle;

    #[test]
    fn test_signal_reaches_enabled_host_once() {
        let mut host = Signal::new("reset_counter", Side::Host);
        let mut client = Signal::new("reset_counter", Side::Client);
        assert!(!client.signal());

        host.set_state(ControlState::Enabled);
        settle(&mut host, &mut client);
        assert!(client.signal());
        settle(&mut host, &mut client);

        assert!(host.take_fired());
        assert!(!host.take_fired());
    }

    #[test]
    fn test_disabled_host_ignores_signal() {
        let mut host = Signal::new("s", Side::Host);
        use crate::controls::ControlEndpoint;
        assert!(!host.handle(ControlBody::Signal));
        assert!(!host.take_fired());
    }
}
