// ABOUTME: Orchestrator tuning knobs with environment variable overrides
// ABOUTME: Timeouts, buffer sizes and the optional idle-stop policy

use crate::registry::DEFAULT_TOMBSTONE_CAPACITY;
use sandpit_config::constants::*;
use sandpit_config::{
    parse_env_duration_secs, parse_env_optional, parse_env_or_default,
    parse_env_or_default_with_validation,
};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound for provision + start before the sandbox is marked errored
    pub provision_timeout: Duration,
    /// Grace period handed to the engine's stop primitive
    pub stop_timeout: Duration,
    /// Upper bound for the whole `Stopping -> Stopped` transition
    pub stop_confirm_timeout: Duration,
    /// Output chunks buffered per exec session before backpressure applies
    pub session_buffer: usize,
    /// How long closing a session waits for its output pump to wind down
    pub session_close_timeout: Duration,
    /// Idle threshold for automatic stop; `None` disables the idle reaper
    pub idle_timeout: Option<Duration>,
    pub reaper_interval: Duration,
    /// Reclaim sandboxes after the idle reaper stops them
    pub reclaim_idle: bool,
    /// Capacity of the state change broadcast channel
    pub event_capacity: usize,
    /// Reclaimed ids remembered so a late stop still answers `Removed`
    pub tombstone_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(10),
            stop_confirm_timeout: Duration::from_secs(30),
            session_buffer: 256,
            session_close_timeout: Duration::from_secs(5),
            idle_timeout: None,
            reaper_interval: Duration::from_secs(60),
            reclaim_idle: false,
            event_capacity: 1024,
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from `SANDPIT_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let stop_timeout = parse_env_duration_secs(SANDPIT_STOP_TIMEOUT_SECS, defaults.stop_timeout);
        let mut stop_confirm_timeout =
            parse_env_duration_secs(SANDPIT_STOP_CONFIRM_SECS, defaults.stop_confirm_timeout);
        if stop_confirm_timeout <= stop_timeout {
            tracing::warn!(
                "{} ({:?}) must exceed {} ({:?}); extending it",
                SANDPIT_STOP_CONFIRM_SECS,
                stop_confirm_timeout,
                SANDPIT_STOP_TIMEOUT_SECS,
                stop_timeout
            );
            stop_confirm_timeout = stop_timeout + Duration::from_secs(5);
        }

        Self {
            provision_timeout: parse_env_duration_secs(
                SANDPIT_PROVISION_TIMEOUT_SECS,
                defaults.provision_timeout,
            ),
            stop_timeout,
            stop_confirm_timeout,
            session_buffer: parse_env_or_default_with_validation(
                SANDPIT_SESSION_BUFFER,
                defaults.session_buffer,
                |v| v > 0,
            ),
            idle_timeout: parse_env_optional::<u64>(SANDPIT_IDLE_TIMEOUT_SECS)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            reaper_interval: parse_env_duration_secs(
                SANDPIT_REAPER_INTERVAL_SECS,
                defaults.reaper_interval,
            ),
            reclaim_idle: parse_env_or_default(SANDPIT_RECLAIM_IDLE, defaults.reclaim_idle),
            ..defaults
        }
    }
}
