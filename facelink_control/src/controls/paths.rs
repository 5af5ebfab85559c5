//! Filesystem path control

use super::{ControlBody, ControlCore, ControlState, Side, impl_endpoint};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What kind of path a picker should offer
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathKind {
    /// An existing file
    #[default]
    OpenFile,
    /// A file that may not exist yet
    SaveFile,
    /// An existing directory
    Directory,
}

/// Picker semantics of a [`Paths`] control
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PathsConfig {
    /// Picker mode
    pub kind: PathKind,
    /// Dialog caption
    pub caption: Option<String>,
    /// File name filter, e.g. `"Video (*.mp4 *.avi)"`
    pub filter: Option<String>,
}

/// Zero or one filesystem path.
#[derive(Debug)]
pub struct Paths {
    core: ControlCore,
    path: Option<PathBuf>,
    config: PathsConfig,
    changed: bool,
}

impl Paths {
    /// New endpoint with no path
    pub fn new(name: &str, side: Side) -> Self {
        Self {
            core: ControlCore::new(name, side),
            path: None,
            config: PathsConfig::default(),
            changed: false,
        }
    }

    /// Current path
    pub fn get_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current picker semantics
    pub fn config(&self) -> &PathsConfig {
        &self.config
    }

    /// Set the path; a client proposal is refused unless enabled.
    pub fn set_path(&mut self, path: Option<PathBuf>) -> bool {
        if !self.core.is_host() && !self.core.is_enabled() {
            return false;
        }
        self.path = path.clone();
        self.core.push(ControlBody::Paths(path));
        true
    }

    /// Host: replace the picker semantics
    pub fn set_config(&mut self, config: PathsConfig) {
        if !self.core.is_host() {
            return;
        }
        self.config = config.clone();
        self.core.push(ControlBody::PathsConfig(config));
    }

    /// Host: change the control state
    pub fn set_state(&mut self, state: ControlState) {
        self.core.set_state(state);
    }

    /// Host: take the path if the client changed it since the last call
    pub fn take_change(&mut self) -> Option<Option<PathBuf>> {
        std::mem::take(&mut self.changed).then(|| self.path.clone())
    }

    fn handle_value(&mut self, body: ControlBody) -> bool {
        match body {
            ControlBody::PathsConfig(config) if !self.core.is_host() => {
                self.config = config;
                true
            }
            ControlBody::Paths(path) if !self.core.is_host() => {
                self.path = path;
                true
            }
            ControlBody::Paths(path) => {
                let accepted = self.core.is_enabled();
                if accepted && self.path != path {
                    self.path = path;
                    self.changed = true;
                }
                self.core.push(ControlBody::Paths(self.path.clone()));
                accepted
            }
            _ => false,
        }
    }

    fn reset_value(&mut self) {
        self.path = None;
        self.config = PathsConfig::default();
        self.changed = false;
    }
}

impl_endpoint!(Paths);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::testing::settle;

    #[test]
    fn test_config_and_path_mirror() {
        let mut host = Paths::new("save_dir", Side::Host);
        let mut client = Paths::new("save_dir", Side::Client);
        host.set_config(PathsConfig {
            kind: PathKind::Directory,
            caption: Some("Output directory".into()),
            filter: None,
        });
        host.set_state(ControlState::Enabled);
        settle(&mut host, &mut client);
        assert_eq!(client.config().kind, PathKind::Directory);

        assert!(client.set_path(Some(PathBuf::from("/tmp/out"))));
        settle(&mut host, &mut client);
        assert_eq!(host.take_change(), Some(Some(PathBuf::from("/tmp/out"))));
        assert_eq!(client.get_path(), Some(Path::new("/tmp/out")));
    }
}
