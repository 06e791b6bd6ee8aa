/// Centralized argument handling system for DcaBot
///
/// This module consolidates all command-line argument parsing and debug flag checking
/// functionality so the rest of the codebase never touches `env::args` directly.
///
/// Features:
/// - Centralized CMD_ARGS storage with thread-safe access
/// - Debug flag checking functions for all modules
/// - Unified argument parsing utilities
/// - Support for both binary-specific and main application arguments
use once_cell::sync::Lazy;
use std::env;
use std::sync::Mutex;

/// Global command-line arguments storage
/// Thread-safe singleton that stores arguments for access throughout the application
pub static CMD_ARGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(env::args().collect()));

/// Sets the global command-line arguments
/// Used by binaries and tests to override the default env::args() collection
pub fn set_cmd_args(args: Vec<String>) {
    if let Ok(mut cmd_args) = CMD_ARGS.lock() {
        *cmd_args = args;
    }
}

/// Gets a copy of the current command-line arguments
/// Returns a vector clone to avoid holding the mutex lock
pub fn get_cmd_args() -> Vec<String> {
    match CMD_ARGS.lock() {
        Ok(args) => args.clone(),
        Err(_) => {
            // Fallback to env::args if mutex is poisoned
            env::args().collect()
        }
    }
}

/// Checks if a specific argument is present in the command line
pub fn has_arg(arg: &str) -> bool {
    get_cmd_args().iter().any(|a| a == arg)
}

/// Gets the value of a command-line argument that follows a flag
/// Returns None if the flag is not found or has no value
pub fn get_arg_value(flag: &str) -> Option<String> {
    let args = get_cmd_args();
    for (i, arg) in args.iter().enumerate() {
        if arg == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

// =============================================================================
// RUNTIME MODE FLAGS
// =============================================================================

/// Paper trading mode: fabricate fills, never submit live orders
pub fn is_paper_enabled() -> bool {
    has_arg("--paper")
}

/// Help requested
pub fn is_help_requested() -> bool {
    has_arg("--help") || has_arg("-h")
}

// =============================================================================
// DEBUG FLAG CHECKING FUNCTIONS
// These functions check for specific debug flags in the command-line arguments
// =============================================================================

/// Scheduler loop debug mode
pub fn is_debug_scheduler_enabled() -> bool {
    has_arg("--debug-scheduler")
}

/// Signal engine debug mode
pub fn is_debug_signal_enabled() -> bool {
    has_arg("--debug-signal")
}

/// Gate decision debug mode
pub fn is_debug_gate_enabled() -> bool {
    has_arg("--debug-gate")
}

/// Transition executor debug mode
pub fn is_debug_transition_enabled() -> bool {
    has_arg("--debug-transition")
}

/// Exchange adapter debug mode
pub fn is_debug_exchange_enabled() -> bool {
    has_arg("--debug-exchange")
}

/// Reserve ledger debug mode
pub fn is_debug_ledger_enabled() -> bool {
    has_arg("--debug-ledger")
}

/// Verbose tracing for all modules
pub fn is_verbose_enabled() -> bool {
    has_arg("--verbose")
}

/// Prints usage information for the main binary
pub fn print_help() {
    println!("DcaBot - CDC-gated DCA scheduler");
    println!();
    println!("USAGE:");
    println!("  dcabot [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  --paper               Paper trading: fabricate fills, never submit orders");
    println!("  --debug-scheduler     Show scheduler tick diagnostics");
    println!("  --debug-signal        Show signal engine diagnostics");
    println!("  --debug-gate          Show gate decision diagnostics");
    println!("  --debug-transition    Show transition executor diagnostics");
    println!("  --debug-exchange      Show exchange adapter diagnostics");
    println!("  --debug-ledger        Show reserve ledger diagnostics");
    println!("  --verbose             Show all verbose trace output");
    println!("  -h, --help            Print this help message");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_value_extraction() {
        set_cmd_args(vec![
            "dcabot".to_string(),
            "--paper".to_string(),
            "--config".to_string(),
            "/tmp/config.toml".to_string(),
        ]);
        assert!(is_paper_enabled());
        assert_eq!(get_arg_value("--config"), Some("/tmp/config.toml".to_string()));
        assert_eq!(get_arg_value("--missing"), None);
        set_cmd_args(vec!["dcabot".to_string()]);
    }
}
