//! Single selection from a runtime-changeable list of choices

use super::{ControlBody, ControlCore, ControlState, Side, impl_endpoint};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A selectable value: comparable, encodable and displayable.
pub trait Choice: Clone + PartialEq + Serialize + DeserializeOwned + Send {
    /// Label shown to the user
    fn display_name(&self) -> String;
}

impl Choice for String {
    fn display_name(&self) -> String {
        self.clone()
    }
}

/// Index into a host-supplied choice list, with an optional "none" entry.
///
/// Out-of-range selections are refused and reported as `false`.
#[derive(Debug)]
pub struct DynamicSingleSwitch<T: Choice> {
    core: ControlCore,
    choices: Vec<T>,
    names: Vec<String>,
    none_name: Option<String>,
    selected: Option<usize>,
    changed: bool,
}

impl<T: Choice> DynamicSingleSwitch<T> {
    /// New endpoint with no choices
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            core: ControlCore::new(name, side),
            choices: Vec::new(),
            names: Vec::new(),
            none_name: None,
            selected: None,
            changed: false,
        }
    }

    /// Current choice list
    pub fn choices(&self) -> &[T] {
        &self.choices
    }

    /// Display names, parallel to [`choices`](Self::choices)
    pub fn choice_names(&self) -> &[String] {
        &self.names
    }

    /// Label of the "nothing selected" entry, when it is selectable
    pub fn none_name(&self) -> Option<&str> {
        self.none_name.as_deref()
    }

    /// Selected index
    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    /// Selected choice
    pub fn selected(&self) -> Option<&T> {
        self.selected.and_then(|i| self.choices.get(i))
    }

    /// Host: replace the choice list.
    ///
    /// The selection follows its value into the new list, or is cleared when
    /// the value is gone.
    pub fn set_choices(&mut self, choices: Vec<T>, none_name: Option<String>) {
        if !self.core.is_host() {
            return;
        }
        let previous = self.selected().cloned();

        let mut encoded = Vec::with_capacity(choices.len());
        for choice in &choices {
            match bincode::serialize(choice) {
                Ok(bytes) => encoded.push(bytes),
                Err(e) => {
                    tracing::error!(control = %self.core.name, error = %e, "Cannot encode choice");
                    return;
                }
            }
        }
        self.names = choices.iter().map(Choice::display_name).collect();
        self.choices = choices;
        self.none_name = none_name;
        self.core.push(ControlBody::SwitchChoices {
            choices: encoded,
            names: self.names.clone(),
            none_name: self.none_name.clone(),
        });

        self.selected = previous.and_then(|p| self.choices.iter().position(|c| *c == p));
        self.core.push(ControlBody::SwitchSelect(self.selected));
    }

    /// Select by index; `None` selects the "none" entry if there is one.
    ///
    /// A client proposal is also refused unless the control is enabled.
    pub fn select(&mut self, index: Option<usize>) -> bool {
        if !self.core.is_host() && !self.core.is_enabled() {
            return false;
        }
        if !self.is_valid(index) {
            return false;
        }
        self.selected = index;
        self.core.push(ControlBody::SwitchSelect(index));
        true
    }

    /// Select by value
    pub fn select_choice(&mut self, choice: &T) -> bool {
        match self.choices.iter().position(|c| c == choice) {
            Some(index) => self.select(Some(index)),
            None => false,
        }
    }

    /// Host: change the control state
    pub fn set_state(&mut self, state: ControlState) {
        self.core.set_state(state);
    }

    /// Host: take the selection if the client changed it since the last call
    pub fn take_change(&mut self) -> Option<Option<T>> {
        std::mem::take(&mut self.changed).then(|| self.selected().cloned())
    }

    fn is_valid(&self, index: Option<usize>) -> bool {
        match index {
            Some(i) => i < self.choices.len(),
            None => self.none_name.is_some(),
        }
    }

    fn handle_value(&mut self, body: ControlBody) -> bool {
        match body {
            ControlBody::SwitchChoices {
                choices,
                names,
                none_name,
            } if !self.core.is_host() => {
                let decoded: Result<Vec<T>, _> =
                    choices.iter().map(|bytes| bincode::deserialize(bytes)).collect();
                match decoded {
                    Ok(decoded) if decoded.len() == names.len() => {
                        self.choices = decoded;
                        self.names = names;
                        self.none_name = none_name;
                        true
                    }
                    _ => {
                        tracing::warn!(control = %self.core.name, "Dropping undecodable choice list");
                        false
                    }
                }
            }
            ControlBody::SwitchSelect(index) if !self.core.is_host() => {
                self.selected = index.filter(|&i| i < self.choices.len());
                true
            }
            ControlBody::SwitchSelect(index) => {
                let accepted = self.core.is_enabled() && self.is_valid(index);
                if accepted && self.selected != index {
                    self.selected = index;
                    self.changed = true;
                }
                self.core.push(ControlBody::SwitchSelect(self.selected));
                accepted
            }
            _ => false,
        }
    }

    fn reset_value(&mut self) {
        self.choices.clear();
        self.names.clear();
        self.none_name = None;
        self.selected = None;
        self.changed = false;
    }
}

impl_endpoint!(<T: Choice> DynamicSingleSwitch<T>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::ControlEndpoint;
    use crate::controls::testing::settle;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    enum Device {
        Cpu,
        Gpu(u32),
    }

    impl Choice for Device {
        fn display_name(&self) -> String {
            match self {
                Device::Cpu => "CPU".to_string(),
                Device::Gpu(i) => format!("GPU #{}", i),
            }
        }
    }

    fn pair() -> (DynamicSingleSwitch<Device>, DynamicSingleSwitch<Device>) {
        let mut host = DynamicSingleSwitch::new("device", Side::Host);
        let client = DynamicSingleSwitch::new("device", Side::Client);
        host.set_choices(vec![Device::Cpu, Device::Gpu(0)], Some("None".into()));
        host.set_state(ControlState::Enabled);
        (host, client)
    }

    #[test]
    fn test_choices_reach_client_with_names() {
        let (mut host, mut client) = pair();
        settle(&mut host, &mut client);
        assert_eq!(client.choices(), &[Device::Cpu, Device::Gpu(0)]);
        assert_eq!(client.choice_names(), &["CPU".to_string(), "GPU #0".to_string()]);
        assert_eq!(client.none_name(), Some("None"));
    }

    #[test]
    fn test_invalid_selection_reports_false() {
        let (mut host, mut client) = pair();
        settle(&mut host, &mut client);
        assert!(!client.select(Some(5)));
        assert!(!host.handle(ControlBody::SwitchSelect(Some(5))));
        assert!(!client.select_choice(&Device::Gpu(3)));
        assert_eq!(host.selected(), None);
    }

    #[test]
    fn test_client_selection_applies_on_host() {
        let (mut host, mut client) = pair();
        settle(&mut host, &mut client);
        assert!(client.select_choice(&Device::Gpu(0)));
        settle(&mut host, &mut client);
        assert_eq!(host.take_change(), Some(Some(Device::Gpu(0))));
        assert_eq!(client.selected(), Some(&Device::Gpu(0)));
    }

    #[test]
    fn test_selection_follows_value_into_new_list() {
        let (mut host, mut client) = pair();
        host.select(Some(1));
        host.set_choices(vec![Device::Gpu(1), Device::Gpu(0)], None);
        assert_eq!(host.selected_index(), Some(1));

        host.set_choices(vec![Device::Cpu], None);
        assert_eq!(host.selected(), None);
        settle(&mut host, &mut client);
        assert_eq!(client.selected(), None);
        assert!(!client.select(None));
    }
}
