//! Bot lifecycle: wire stores, services and shutdown together

use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::executions::EXECUTIONS_DB;
use crate::logger::{self, LogTag};
use crate::scheduler::SchedulerService;
use crate::schedules::SCHEDULES_DB;
use crate::services::ServiceManager;
use crate::settings::SETTINGS;
use crate::state::STRATEGY_DB;

/// Main bot execution function - runs until ctrl-c
pub async fn run_bot() -> Result<(), String> {
    // 1. Ensure all required directories exist (safety backup, already done in main.rs)
    crate::paths::ensure_all_directories()?;

    // 2. Open databases up front so schema problems surface before services start
    Lazy::force(&STRATEGY_DB);
    Lazy::force(&EXECUTIONS_DB);
    Lazy::force(&SCHEDULES_DB);
    logger::info(LogTag::System, "Databases initialized");

    if SETTINGS.is_paper_mode() {
        logger::info(
            LogTag::System,
            "PAPER MODE: fills are fabricated, no orders reach any venue",
        );
    }

    // 3. Default notification consumer (external formatters subscribe the same way)
    tokio::spawn(crate::notifications::run_log_subscriber());

    // 4. Start services
    let mut manager = ServiceManager::new();
    manager.register(Box::new(SchedulerService));
    manager.start_all().await?;

    // 5. Wait for ctrl-c, then stop cleanly
    let shutdown_requested = Arc::new(Notify::new());
    {
        let notify = shutdown_requested.clone();
        ctrlc::set_handler(move || {
            notify.notify_one();
        })
        .map_err(|e| format!("Failed to install ctrl-c handler: {}", e))?;
    }

    logger::info(LogTag::System, "DcaBot running - press ctrl-c to stop");
    shutdown_requested.notified().await;

    logger::info(LogTag::System, "Shutdown requested");
    manager.stop_all().await;
    logger::flush();
    Ok(())
}
