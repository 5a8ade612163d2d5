// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed readers that fall back to defaults and warn about malformed values

use std::str::FromStr;
use std::time::Duration;

/// Parse an environment variable, returning `default` when it is unset or unparseable.
pub fn parse_env_or_default<T>(var_name: &str, default: T) -> T
where
    T: FromStr,
{
    parse_env_optional(var_name).unwrap_or(default)
}

/// Parse an environment variable that has no default.
///
/// Unset and empty variables yield `None` silently; a value that fails to parse
/// yields `None` with a warning so misconfiguration is visible in the logs.
pub fn parse_env_optional<T>(var_name: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = std::env::var(var_name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(
                "Environment variable {} has unparseable value '{}', ignoring it",
                var_name,
                raw
            );
            None
        }
    }
}

/// Parse an environment variable and keep it only if `validator` accepts it.
pub fn parse_env_or_default_with_validation<T, F>(var_name: &str, default: T, validator: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(T) -> bool,
{
    match parse_env_optional::<T>(var_name) {
        Some(value) if validator(value) => value,
        Some(value) => {
            tracing::warn!(
                "Environment variable {} has invalid value '{}', using default: {}",
                var_name,
                value,
                default
            );
            default
        }
        None => default,
    }
}

/// Read a whole number of seconds as a `Duration`. Zero is rejected.
pub fn parse_env_duration_secs(var_name: &str, default: Duration) -> Duration {
    let secs = parse_env_or_default_with_validation(var_name, default.as_secs(), |v| v > 0);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_or_default_not_set() {
        std::env::remove_var("SANDPIT_TEST_NOT_SET");
        let result: i32 = parse_env_or_default("SANDPIT_TEST_NOT_SET", 42);
        assert_eq!(result, 42);
    }

    #[test]
    fn test_parse_env_or_default_set() {
        std::env::set_var("SANDPIT_TEST_SET", "100");
        let result: i32 = parse_env_or_default("SANDPIT_TEST_SET", 42);
        assert_eq!(result, 100);
        std::env::remove_var("SANDPIT_TEST_SET");
    }

    #[test]
    fn test_parse_env_or_default_invalid() {
        std::env::set_var("SANDPIT_TEST_INVALID", "not_a_number");
        let result: i32 = parse_env_or_default("SANDPIT_TEST_INVALID", 42);
        assert_eq!(result, 42);
        std::env::remove_var("SANDPIT_TEST_INVALID");
    }

    #[test]
    fn test_parse_env_optional_blank_is_none() {
        std::env::set_var("SANDPIT_TEST_BLANK", "   ");
        let result: Option<u64> = parse_env_optional("SANDPIT_TEST_BLANK");
        assert_eq!(result, None);
        std::env::remove_var("SANDPIT_TEST_BLANK");
    }

    #[test]
    fn test_parse_env_optional_trims() {
        std::env::set_var("SANDPIT_TEST_TRIM", " 15 ");
        let result: Option<u64> = parse_env_optional("SANDPIT_TEST_TRIM");
        assert_eq!(result, Some(15));
        std::env::remove_var("SANDPIT_TEST_TRIM");
    }

    #[test]
    fn test_parse_env_with_validation_fails() {
        std::env::set_var("SANDPIT_TEST_VALIDATION_FAIL", "300");
        let result =
            parse_env_or_default_with_validation("SANDPIT_TEST_VALIDATION_FAIL", 100, |v| {
                v > 0 && v <= 200
            });
        assert_eq!(result, 100);
        std::env::remove_var("SANDPIT_TEST_VALIDATION_FAIL");
    }

    #[test]
    fn test_duration_rejects_zero() {
        std::env::set_var("SANDPIT_TEST_DURATION_ZERO", "0");
        let result = parse_env_duration_secs("SANDPIT_TEST_DURATION_ZERO", Duration::from_secs(7));
        assert_eq!(result, Duration::from_secs(7));
        std::env::remove_var("SANDPIT_TEST_DURATION_ZERO");
    }

    #[test]
    fn test_duration_parses_seconds() {
        std::env::set_var("SANDPIT_TEST_DURATION", "45");
        let result = parse_env_duration_secs("SANDPIT_TEST_DURATION", Duration::from_secs(7));
        assert_eq!(result, Duration::from_secs(45));
        std::env::remove_var("SANDPIT_TEST_DURATION");
    }
}
