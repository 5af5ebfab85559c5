//! Numeric control with host-supplied constraints

use super::{ControlBody, ControlCore, ControlState, Side, impl_endpoint};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Behavior switches of a [`NumberConfig`]
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NumberFlags: u8 {
        /// Zero is a valid "automatic" value even when below `min`
        const ZERO_IS_AUTO = 0b001;
        /// UIs may send values while the user is still dragging
        const ALLOW_INSTANT_UPDATE = 0b010;
        /// The client may not propose values
        const READ_ONLY = 0b100;
    }
}

/// Constraints of a [`Number`] control
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct NumberConfig {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
    /// Granularity counted from `min`; zero disables snapping
    pub step: f64,
    /// Decimal places kept
    pub decimals: u8,
    /// Behavior switches
    pub flags: NumberFlags,
}

impl Default for NumberConfig {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 100.0,
            step: 1.0,
            decimals: 0,
            flags: NumberFlags::empty(),
        }
    }
}

impl NumberConfig {
    /// Integer-style range. Swapped bounds are put in order.
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
            step,
            ..Self::default()
        }
    }

    /// Bounds in ascending order; configs received off the wire are not
    /// guaranteed to be built through [`NumberConfig::new`]
    fn bounds(&self) -> (f64, f64) {
        if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        }
    }

    /// Keep `decimals` decimal places
    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = decimals;
        self
    }

    /// Add behavior switches
    pub fn with_flags(mut self, flags: NumberFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Bring `value` inside the constraints.
    pub fn clamp(&self, value: f64) -> f64 {
        if self.flags.contains(NumberFlags::ZERO_IS_AUTO) && value == 0.0 {
            return 0.0;
        }
        let (lo, hi) = self.bounds();
        if value.is_nan() {
            return lo;
        }

        // max/min instead of f64::clamp, which panics on NaN bounds
        let mut v = value.max(lo).min(hi);
        if self.step > 0.0 {
            v = (lo + ((v - lo) / self.step).round() * self.step).max(lo).min(hi);
        }
        let scale = 10f64.powi(i32::from(self.decimals));
        (v * scale).round() / scale
    }
}

/// Nullable number. The client clamps its proposals; the host clamps
/// again, applies and echoes.
#[derive(Debug)]
pub struct Number {
    core: ControlCore,
    value: Option<f64>,
    config: NumberConfig,
    changed: bool,
}

impl Number {
    /// New endpoint with the default configuration and no value
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            core: ControlCore::new(name, side),
            value: None,
            config: NumberConfig::default(),
            changed: false,
        }
    }

    /// Current value
    pub fn get_number(&self) -> Option<f64> {
        self.value
    }

    /// Current constraints
    pub fn config(&self) -> &NumberConfig {
        &self.config
    }

    /// Set the value after clamping.
    ///
    /// A client proposal is refused when the control is not enabled or is
    /// read-only.
    pub fn set_number(&mut self, value: Option<f64>) -> bool {
        if !self.core.is_host()
            && (!self.core.is_enabled() || self.config.flags.contains(NumberFlags::READ_ONLY))
        {
            return false;
        }
        let value = value.map(|v| self.config.clamp(v));
        self.value = value;
        self.core.push(ControlBody::Number(value));
        true
    }

    /// Host: replace the constraints, re-clamping the current value
    pub fn set_config(&mut self, config: NumberConfig) {
        if !self.core.is_host() {
            return;
        }
        self.config = config;
        self.core.push(ControlBody::NumberConfig(config));

        let clamped = self.value.map(|v| config.clamp(v));
        if clamped != self.value {
            self.value = clamped;
            self.core.push(ControlBody::Number(clamped));
        }
    }

    /// Host: change the control state
    pub fn set_state(&mut self, state: ControlState) {
        self.core.set_state(state);
    }

    /// Host: take the value if the client changed it since the last call
    pub fn take_change(&mut self) -> Option<Option<f64>> {
        std::mem::take(&mut self.changed).then_some(self.value)
    }

    fn handle_value(&mut self, body: ControlBody) -> bool {
        match body {
            ControlBody::NumberConfig(config) if !self.core.is_host() => {
                self.config = config;
                true
            }
            ControlBody::Number(value) if !self.core.is_host() => {
                self.value = value;
                true
            }
            ControlBody::Number(value) => {
                let accepted = self.core.is_enabled()
                    && !self.config.flags.contains(NumberFlags::READ_ONLY);
                let value = value.map(|v| self.config.clamp(v));
                if accepted && self.value != value {
                    self.value = value;
                    self.changed = true;
                }
                self.core.push(ControlBody::Number(self.value));
                accepted
            }
            _ => false,
        }
    }

    fn reset_value(&mut self) {
        self.value = None;
        self.config = NumberConfig::default();
        self.changed = false;
    }
}

impl_endpoint!(Number);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::ControlEndpoint;
    use crate::controls::testing::settle;

    #[test]
    fn test_clamp_rules() {
        let cfg = NumberConfig::new(0.0, 10.0, 1.0);
        assert_eq!(cfg.clamp(15.0), 10.0);
        assert_eq!(cfg.clamp(-3.0), 0.0);
        assert_eq!(cfg.clamp(4.4), 4.0);
        assert_eq!(cfg.clamp(f64::NAN), 0.0);

        let cfg = NumberConfig::new(1.0, 2.0, 0.25).with_decimals(2);
        assert_eq!(cfg.clamp(1.3), 1.25);

        let cfg = NumberConfig::new(5.0, 60.0, 1.0).with_flags(NumberFlags::ZERO_IS_AUTO);
        assert_eq!(cfg.clamp(0.0), 0.0);
        assert_eq!(cfg.clamp(1.0), 5.0);
    }

    #[test]
    fn test_inverted_bounds_do_not_panic() {
        let cfg = NumberConfig::new(10.0, 0.0, 1.0);
        assert_eq!((cfg.min, cfg.max), (0.0, 10.0));
        assert_eq!(cfg.clamp(12.0), 10.0);

        // Built field by field, as a decoded config would be
        let raw = NumberConfig {
            min: 5.0,
            max: 1.0,
            step: 0.0,
            ..NumberConfig::default()
        };
        assert_eq!(raw.clamp(0.0), 1.0);
        assert_eq!(raw.clamp(3.0), 3.0);
        assert_eq!(raw.clamp(9.0), 5.0);
    }

    #[test]
    fn test_client_proposal_is_clamped_before_host_sees_it() {
        let mut host = Number::new("threshold", Side::Host);
        let mut client = Number::new("threshold", Side::Client);
        host.set_config(NumberConfig::new(0.0, 10.0, 1.0));
        host.set_state(ControlState::Enabled);
        settle(&mut host, &mut client);

        assert!(client.set_number(Some(15.0)));
        assert_eq!(client.take_outgoing(), vec![ControlBody::Number(Some(10.0))]);

        // Host clamps independently of what the client sent
        assert!(host.handle(ControlBody::Number(Some(15.0))));
        assert_eq!(host.get_number(), Some(10.0));
        assert_eq!(host.take_change(), Some(Some(10.0)));
    }

    #[test]
    fn test_read_only_rejects_proposals() {
        let mut host = Number::new("n", Side::Host);
        let mut client = Number::new("n", Side::Client);
        host.set_config(NumberConfig::default().with_flags(NumberFlags::READ_ONLY));
        host.set_state(ControlState::Enabled);
        host.set_number(Some(3.0));
        settle(&mut host, &mut client);

        assert!(!client.set_number(Some(4.0)));
        assert!(!host.handle(ControlBody::Number(Some(4.0))));
        assert_eq!(host.get_number(), Some(3.0));
    }

    #[test]
    fn test_new_config_reclamps_value() {
        let mut host = Number::new("n", Side::Host);
        let mut client = Number::new("n", Side::Client);
        host.set_number(Some(50.0));
        host.set_config(NumberConfig::new(0.0, 20.0, 1.0));
        settle(&mut host, &mut client);
        assert_eq!(host.get_number(), Some(20.0));
        assert_eq!(client.get_number(), Some(20.0));
        assert_eq!(client.config().max, 20.0);
    }
}
