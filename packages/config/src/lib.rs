// ABOUTME: Shared configuration helpers for Sandpit crates
// ABOUTME: Exposes environment variable names and typed parsing helpers

pub mod constants;
pub mod env;

pub use env::{
    parse_env_duration_secs, parse_env_optional, parse_env_or_default,
    parse_env_or_default_with_validation,
};
