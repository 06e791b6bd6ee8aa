//! Centralized path resolution for DcaBot
//!
//! All file and directory paths are resolved through this module to ensure consistent
//! behavior across different execution contexts and platforms.
//!
//! ## Path Strategy
//!
//! Both terminal and service execution use the same base directory following
//! platform standards:
//! - **macOS**: `~/Library/Application Support/DcaBot/`
//! - **Windows**: `%LOCALAPPDATA%\DcaBot\`
//! - **Linux**: `$XDG_DATA_HOME/DcaBot/` (fallback `~/.local/share/DcaBot/`)
//!
//! ## Directory Structure
//!
//! ```text
//! ~/DcaBot/
//! ├── data/
//! │ ├── config.toml
//! │ └── *.db (databases)
//! └── logs/
//!   └── dcabot_*.log
//! ```

use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

// =============================================================================
// BASE DIRECTORY RESOLUTION
// =============================================================================

/// Tracks whether initialization logging has been done
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Lazy-initialized base directory (thread-safe)
static BASE_DIRECTORY: Lazy<PathBuf> = Lazy::new(|| {
    let base_dir = resolve_base_directory();
    INITIALIZED.store(true, Ordering::SeqCst);
    base_dir
});

/// Resolves the base directory for all DcaBot data
///
/// Uses platform-specific application data locations:
/// - macOS: ~/Library/Application Support/DcaBot
/// - Windows: %LOCALAPPDATA%\DcaBot
/// - Linux: $XDG_DATA_HOME/DcaBot (fallback ~/.local/share/DcaBot)
fn resolve_base_directory() -> PathBuf {
    const APP_DIR: &str = "DcaBot";

    if let Ok(dir) = std::env::var("DCABOT_HOME") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Some(dir) = dirs::data_local_dir() {
        return dir.join(APP_DIR);
    }

    if let Some(dir) = dirs::data_dir() {
        return dir.join(APP_DIR);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(APP_DIR);
    }

    PathBuf::from(APP_DIR)
}

// =============================================================================
// PRIMARY DIRECTORY ACCESSORS
// =============================================================================

/// Returns the base directory for all DcaBot data
pub fn get_base_directory() -> PathBuf {
    BASE_DIRECTORY.clone()
}

/// Returns the data directory path
///
/// Contains databases and the config file.
pub fn get_data_directory() -> PathBuf {
    BASE_DIRECTORY.join("data")
}

/// Returns the logs directory path
pub fn get_logs_directory() -> PathBuf {
    BASE_DIRECTORY.join("logs")
}

// =============================================================================
// CONFIGURATION FILE PATHS
// =============================================================================

/// Returns the main configuration file path
pub fn get_config_path() -> PathBuf {
    get_data_directory().join("config.toml")
}

// =============================================================================
// DATABASE FILE PATHS
// =============================================================================

/// Returns the strategy database path
///
/// Holds strategy state, the reserve ledger and fired-slot markers. State and
/// ledger live in the same file so a reserve mutation commits as one
/// transaction.
pub fn get_strategy_db_path() -> PathBuf {
    get_data_directory().join("strategy.db")
}

/// Returns the execution records database path
pub fn get_executions_db_path() -> PathBuf {
    get_data_directory().join("executions.db")
}

/// Returns the schedule registry database path
///
/// The schedules table is owned by the external admin surface; the core only
/// reads it.
pub fn get_schedules_db_path() -> PathBuf {
    get_data_directory().join("schedules.db")
}

// =============================================================================
// DIRECTORY CREATION
// =============================================================================

/// Ensures all required directories exist, creating them if necessary
///
/// Must be called before logger initialization so log files have a home.
pub fn ensure_all_directories() -> Result<(), String> {
    let directories = [get_base_directory(), get_data_directory(), get_logs_directory()];

    for dir in &directories {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create directory {}: {}", dir.display(), e))?;
    }

    Ok(())
}
