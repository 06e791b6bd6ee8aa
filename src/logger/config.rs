//! Logger configuration built from command-line arguments
//!
//! Scans argv once at init time for --debug-<module> and --verbose flags and
//! keeps the result in a global read-mostly config.

use super::levels::LogLevel;
use super::tags::LogTag;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashSet;

use crate::arguments;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum level threshold; messages above it are dropped
    pub min_level: LogLevel,
    /// Module keys with --debug-<key> enabled
    pub debug_modules: HashSet<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            debug_modules: HashSet::new(),
        }
    }
}

static LOGGER_CONFIG: Lazy<RwLock<LoggerConfig>> = Lazy::new(|| RwLock::new(LoggerConfig::default()));

/// Initialize logger configuration from command-line arguments
pub fn init_from_args() {
    let mut config = LoggerConfig::default();

    for arg in arguments::get_cmd_args() {
        if let Some(module) = arg.strip_prefix("--debug-") {
            config.debug_modules.insert(module.to_string());
        }
    }

    if arguments::is_verbose_enabled() {
        config.min_level = LogLevel::Verbose;
    } else if !config.debug_modules.is_empty() {
        config.min_level = LogLevel::Debug;
    }

    *LOGGER_CONFIG.write() = config;
}

/// Get a snapshot of the current logger configuration
pub fn get_logger_config() -> LoggerConfig {
    LOGGER_CONFIG.read().clone()
}

/// Check if debug output is enabled for a specific tag
pub fn is_debug_enabled_for_tag(tag: &LogTag) -> bool {
    LOGGER_CONFIG.read().debug_modules.contains(&tag.to_debug_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_enables_tag() {
        crate::arguments::set_cmd_args(vec![
            "dcabot".to_string(),
            "--debug-gate".to_string(),
        ]);
        init_from_args();
        assert!(is_debug_enabled_for_tag(&LogTag::Gate));
        assert!(!is_debug_enabled_for_tag(&LogTag::Signal));
        crate::arguments::set_cmd_args(vec!["dcabot".to_string()]);
        init_from_args();
    }
}
