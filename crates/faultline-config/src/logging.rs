//! Structured logging utilities for Faultline components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use faultline_config::logging::*;
//!
//! log_register_info!("Handler installed", port = 0x1503);
//! log_intercept_debug!("State transition", state = "waiting");
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::ConfigError;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const REGISTER: &'static str = "REGISTER";
    pub const INTERCEPT: &'static str = "INTERCEPT";
    pub const FORWARD: &'static str = "FORWARD";
    pub const RESTORE: &'static str = "RESTORE";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ConfigError::UnknownLogLevel(s.to_string())),
        }
    }
}

// === REGISTER logging macros ===

#[macro_export]
macro_rules! log_register_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "REGISTER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_register_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "REGISTER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_register_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "REGISTER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_register_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "REGISTER", $($key = $value,)* $msg)
    };
}

// === INTERCEPT logging macros ===

#[macro_export]
macro_rules! log_intercept_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "INTERCEPT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_intercept_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "INTERCEPT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_intercept_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "INTERCEPT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_intercept_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "INTERCEPT", $($key = $value,)* $msg)
    };
}

// === FORWARD logging macros ===

#[macro_export]
macro_rules! log_forward_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "FORWARD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_forward_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "FORWARD", $($key = $value,)* $msg)
    };
}

// === RESTORE logging macros ===

#[macro_export]
macro_rules! log_restore_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "RESTORE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_restore_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "RESTORE", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    // try_init: a host application may already own the global subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::REGISTER, "REGISTER");
        assert_eq!(Component::INTERCEPT, "INTERCEPT");
        assert_eq!(Component::FORWARD, "FORWARD");
        assert_eq!(Component::RESTORE, "RESTORE");
    }

    #[test]
    fn test_component_macros_expand() {
        let port = 0x1503u32;
        log_register_warn!("register", port = port);
        log_intercept_warn!("intercept", port = port);
        log_forward_warn!("forward", error = tracing::field::display("x"));
        log_restore_warn!("restore");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
