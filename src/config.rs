//! Environment configuration helpers.
//!
//! Every numeric knob goes through [`env_parse`], so a missing or bad
//! value degrades to its documented default instead of failing startup.

use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

/// Read an environment variable and parse it, falling back to `default`
/// when the variable is unset or unparsable. Both fallbacks log at warn
/// so a misconfigured deployment is visible without being fatal.
pub fn env_parse<T: FromStr + Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = name, value = %raw, %default, "unparsable value; using default");
                default
            }
        },
        Err(_) => {
            warn!(var = name, %default, "not set; using default");
            default
        }
    }
}
