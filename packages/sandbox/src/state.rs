// ABOUTME: Sandbox lifecycle states and the table of permitted transitions
// ABOUTME: Every state change in the registry is checked against this table

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Requested,
    Provisioning,
    Starting,
    Running,
    Stopping,
    Stopped,
    Reclaiming,
    Removed,
    Errored,
}

impl SandboxState {
    pub const ALL: [SandboxState; 9] = [
        Self::Requested,
        Self::Provisioning,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Reclaiming,
        Self::Removed,
        Self::Errored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Reclaiming => "reclaiming",
            Self::Removed => "removed",
            Self::Errored => "errored",
        }
    }

    /// No further lifecycle progress happens from a terminal state.
    /// An errored sandbox can still be reclaimed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Removed | Self::Errored)
    }

    /// States a caller waiting on provisioning can stop waiting at.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Stopped | Self::Errored | Self::Removed
        )
    }

    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;

        if next == Errored {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Provisioning, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Reclaiming)
                | (Errored, Reclaiming)
                | (Reclaiming, Removed)
        )
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown sandbox state: {}", s))
    }
}
