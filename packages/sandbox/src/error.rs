// ABOUTME: Public error taxonomy for orchestrator, session and transfer operations
// ABOUTME: Errors carry the sandbox's last known state wherever one is available

use crate::engine::EngineError;
use crate::ids::{SandboxId, SessionId, TransferId};
use crate::state::SandboxState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Template '{name}' is invalid: {reason}")]
    TemplateInvalid { name: String, reason: String },

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(SandboxId),

    #[error("Invalid state transition for sandbox {id}: cannot go from {from} to {attempted}")]
    InvalidTransition {
        id: SandboxId,
        from: SandboxState,
        attempted: SandboxState,
    },

    #[error("Sandbox {id} is not running (state: {state})")]
    SandboxNotRunning { id: SandboxId, state: SandboxState },

    #[error(
        "Sandbox {id} is busy with {sessions} active session(s) and {transfers} active transfer(s) (state: {state})"
    )]
    SandboxBusy {
        id: SandboxId,
        state: SandboxState,
        sessions: usize,
        transfers: usize,
    },

    #[error("Sandbox {id} was modified concurrently: expected {expected}, found {actual}")]
    ConcurrentModification {
        id: SandboxId,
        expected: SandboxState,
        actual: SandboxState,
    },

    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Output of session {0} is already being consumed")]
    OutputAlreadyTaken(SessionId),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    #[error("Transfer incomplete after {entries_written} entries: {reason}")]
    TransferIncomplete { entries_written: u64, reason: String },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    #[error("Timed out after {waited:?} waiting for sandbox {id} to settle (state: {state})")]
    WaitTimeout {
        id: SandboxId,
        state: SandboxState,
        waited: std::time::Duration,
    },

    #[error("Engine failure (last known state: {}): {source}", display_state(.state))]
    EngineFailure {
        state: Option<SandboxState>,
        #[source]
        source: EngineError,
    },
}

pub type Result<T> = std::result::Result<T, SandboxError>;

fn display_state(state: &Option<SandboxState>) -> &'static str {
    state.map(|s| s.as_str()).unwrap_or("unknown")
}

impl SandboxError {
    pub(crate) fn engine(state: SandboxState, source: EngineError) -> Self {
        Self::EngineFailure {
            state: Some(state),
            source,
        }
    }

    /// The sandbox state observed when the error was raised, if the error concerns a sandbox.
    pub fn last_known_state(&self) -> Option<SandboxState> {
        match self {
            Self::InvalidTransition { from, .. } => Some(*from),
            Self::SandboxNotRunning { state, .. } | Self::SandboxBusy { state, .. } => Some(*state),
            Self::ConcurrentModification { actual, .. } => Some(*actual),
            Self::WaitTimeout { state, .. } => Some(*state),
            Self::EngineFailure { state, .. } => *state,
            _ => None,
        }
    }

    /// Whether repeating the same call right away can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

impl From<EngineError> for SandboxError {
    fn from(source: EngineError) -> Self {
        Self::EngineFailure {
            state: None,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_known_state() {
        let err = SandboxError::InvalidTransition {
            id: SandboxId::from("sbx-1"),
            from: SandboxState::Running,
            attempted: SandboxState::Reclaiming,
        };
        assert_eq!(err.last_known_state(), Some(SandboxState::Running));
        assert!(err.to_string().contains("running"));
        assert!(err.to_string().contains("reclaiming"));

        let err = SandboxError::UnknownTemplate("cobol".to_string());
        assert_eq!(err.last_known_state(), None);
    }

    #[test]
    fn test_engine_failure_message_includes_state() {
        let err = SandboxError::engine(
            SandboxState::Errored,
            EngineError::ContainerError("daemon went away".to_string()),
        );
        let message = err.to_string();
        assert!(message.contains("errored"), "{}", message);
        assert!(message.contains("daemon went away"), "{}", message);
    }

    #[test]
    fn test_only_concurrent_modification_is_retryable() {
        let conflict = SandboxError::ConcurrentModification {
            id: SandboxId::from("sbx-1"),
            expected: SandboxState::Running,
            actual: SandboxState::Stopping,
        };
        assert!(conflict.is_retryable());
        assert!(!SandboxError::SessionClosed(SessionId::from("ses-1")).is_retryable());
    }
}
