//! Server lifecycle state

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the supervised server process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// No process is running
    #[default]
    Down,
    /// Process launched, bridge resource has not signalled `ready` yet
    Booting,
    /// Bridge resource is up and the IPC peer is usable
    Up,
}

impl ServerState {
    /// Wire name used in control events
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Down => "down",
            ServerState::Booting => "booting",
            ServerState::Up => "up",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
