// ikewarden-config/src/validation.rs
//! Custom validation functions for configuration.
//!
//! Provides shared validation logic used across multiple configuration modules.

use validator::ValidationError;

/// Validate that a connection name is usable as a lookup key and in log lines.
pub fn validate_connection_name(name: &str) -> Result<(), ValidationError> {
    let re = regex::Regex::new("^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$")
        .map_err(|_| ValidationError::new("invalid_regex"))?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_connection_name"))
    }
}

/// Validate a list of connection names: each well-formed, none repeated.
pub fn validate_connection_names(names: &[String]) -> Result<(), ValidationError> {
    for (i, name) in names.iter().enumerate() {
        validate_connection_name(name)?;
        if names[..i].contains(name) {
            return Err(ValidationError::new("duplicate_connection_name"));
        }
    }
    Ok(())
}

/// Validate log level.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = ["trace", "debug", "info", "warn", "error"]
        .contains(&level.to_lowercase().as_str());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}
