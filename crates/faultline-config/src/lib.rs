//! # faultline-config
//!
//! Configuration management for Faultline.
//!
//! Loads configuration from:
//! 1. `~/.faultline/config.toml` (global)
//! 2. `.faultline/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

pub use logging::LogLevel;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    // A poisoned lock still holds a fully written Config.
    CONFIG.read().unwrap_or_else(|e| e.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|e| e.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unknown exception class: {0}")]
    UnknownException(String),
    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub intercept: InterceptConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config = Self::load_from(global.as_deref(), Some(Path::new(".faultline/config.toml")))?;
        config.apply_overrides_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from explicit global and project files, without environment overrides.
    /// Missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut table = toml::Table::new();

        if let Some(global_path) = global {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(global_path)?;
                table = toml::from_str(&contents)?;
            }
        }

        if let Some(project_path) = project {
            if project_path.exists() {
                debug!("Loading project config from {:?}", project_path);
                let contents = std::fs::read_to_string(project_path)?;
                let project_table: toml::Table = toml::from_str(&contents)?;
                merge_tables(&mut table, project_table);
            }
        }

        Ok(toml::Value::Table(table).try_into()?)
    }

    /// Global config path: ~/.faultline/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".faultline/config.toml"))
    }

    /// Apply overrides from an environment-like lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(list) = lookup("FAULTLINE_EXCEPTIONS") {
            let names: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !names.is_empty() {
                self.intercept.exceptions = names;
            }
        }
        if let Some(forward) = lookup("FAULTLINE_FORWARD") {
            match forward.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.intercept.forward_to_previous = true,
                "0" | "false" | "no" | "off" => self.intercept.forward_to_previous = false,
                _ => debug!("Ignoring FAULTLINE_FORWARD={:?}", forward),
            }
        }
        if let Some(level) = lookup("FAULTLINE_LOG_LEVEL") {
            match level.parse() {
                Ok(level) => self.logging.level = level,
                Err(_) => debug!("Ignoring FAULTLINE_LOG_LEVEL={:?}", level),
            }
        }
        if let Some(name) = lookup("FAULTLINE_THREAD_NAME") {
            if !name.is_empty() {
                self.intercept.thread_name = name;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Lay `overlay` over `base`. Keys present in `overlay` win; nested tables
/// are merged key by key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(nested) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, nested);
                continue;
            }
            base.insert(key, toml::Value::Table(nested));
        } else {
            base.insert(key, value);
        }
    }
}

/// Exception interception settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Exception classes to intercept, by name (`bad_access`, `breakpoint`, ...).
    /// `resource`, `guard` and `corpse_notify` cannot be forwarded and are refused.
    pub exceptions: Vec<String>,
    /// Re-deliver intercepted exceptions to the previously installed handler
    pub forward_to_previous: bool,
    /// Name of the receiver thread
    pub thread_name: String,
    /// Receiver thread stack size in bytes (None = platform default)
    pub stack_size: Option<usize>,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            exceptions: vec![
                "bad_access".to_string(),
                "bad_instruction".to_string(),
                "arithmetic".to_string(),
                "breakpoint".to_string(),
            ],
            forward_to_previous: true,
            thread_name: "faultline-exc".to_string(),
            stack_size: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.intercept.exceptions.len(), 4);
        assert!(config.intercept.forward_to_previous);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[intercept]"));
        assert!(toml_str.contains("[logging]"));
        assert!(toml_str.contains("bad_access"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FAULTLINE_EXCEPTIONS", "bad_access, breakpoint"),
            ("FAULTLINE_FORWARD", "off"),
            ("FAULTLINE_LOG_LEVEL", "trace"),
        ]);
        let mut config = Config::default();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.intercept.exceptions, vec!["bad_access", "breakpoint"]);
        assert!(!config.intercept.forward_to_previous);
        assert_eq!(config.logging.level, LogLevel::Trace);
        assert_eq!(config.intercept.thread_name, "faultline-exc");
    }

    #[test]
    fn test_merge_tables_is_key_wise() {
        let mut base: toml::Table =
            toml::from_str("[intercept]\nforward_to_previous = false\nthread_name = \"a\"").unwrap();
        let overlay: toml::Table = toml::from_str("[intercept]\nforward_to_previous = true").unwrap();
        merge_tables(&mut base, overlay);

        let intercept = base["intercept"].as_table().unwrap();
        assert_eq!(intercept["forward_to_previous"].as_bool(), Some(true));
        assert_eq!(intercept["thread_name"].as_str(), Some("a"));
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides_from(|k| match k {
            "FAULTLINE_FORWARD" => Some("maybe".to_string()),
            "FAULTLINE_LOG_LEVEL" => Some("loud".to_string()),
            "FAULTLINE_EXCEPTIONS" => Some(" , ".to_string()),
            _ => None,
        });
        assert!(config.intercept.forward_to_previous);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.intercept.exceptions.len(), 4);
    }
}
