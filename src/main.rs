use dcabot::{
    arguments::{is_help_requested, is_paper_enabled, print_help},
    logger::{self, LogTag},
};

/// Main entry point for DcaBot
///
/// Headless scheduler service: refreshes the schedule registry, watches the
/// trend signal and gates every scheduled purchase through the decision
/// engine. Stop with ctrl-c.
#[tokio::main]
async fn main() {
    // Ensure all directories exist BEFORE logger initialization
    // (Logger needs the logs directory to create log files)
    if let Err(e) = dcabot::paths::ensure_all_directories() {
        eprintln!("Failed to create required directories: {}", e);
        std::process::exit(1);
    }

    // Initialize logger system (now safe to create log files)
    logger::init();

    // Check for help request first (before any other processing)
    if is_help_requested() {
        print_help();
        std::process::exit(0);
    }

    logger::info(LogTag::System, "DcaBot starting up...");
    if is_paper_enabled() {
        logger::info(LogTag::System, "--paper flag set");
    }

    match dcabot::run::run_bot().await {
        Ok(_) => {
            logger::info(LogTag::System, "DcaBot stopped");
        }
        Err(e) => {
            logger::error(LogTag::System, &format!("DcaBot failed: {}", e));
            std::process::exit(1);
        }
    }
}
