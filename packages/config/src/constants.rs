// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Sandpit

// Lifecycle timeouts
pub const SANDPIT_PROVISION_TIMEOUT_SECS: &str = "SANDPIT_PROVISION_TIMEOUT_SECS";
pub const SANDPIT_STOP_TIMEOUT_SECS: &str = "SANDPIT_STOP_TIMEOUT_SECS";
pub const SANDPIT_STOP_CONFIRM_SECS: &str = "SANDPIT_STOP_CONFIRM_SECS";

// Exec sessions
pub const SANDPIT_SESSION_BUFFER: &str = "SANDPIT_SESSION_BUFFER";

// Idle reaping (disabled unless SANDPIT_IDLE_TIMEOUT_SECS is set)
pub const SANDPIT_IDLE_TIMEOUT_SECS: &str = "SANDPIT_IDLE_TIMEOUT_SECS";
pub const SANDPIT_REAPER_INTERVAL_SECS: &str = "SANDPIT_REAPER_INTERVAL_SECS";
pub const SANDPIT_RECLAIM_IDLE: &str = "SANDPIT_RECLAIM_IDLE";

// Docker engine
pub const SANDPIT_DOCKER_PULL_TIMEOUT_SECS: &str = "SANDPIT_DOCKER_PULL_TIMEOUT_SECS";
pub const SANDPIT_LABEL_PREFIX: &str = "SANDPIT_LABEL_PREFIX";

// Template catalog override
pub const SANDPIT_TEMPLATES_FILE: &str = "SANDPIT_TEMPLATES_FILE";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
