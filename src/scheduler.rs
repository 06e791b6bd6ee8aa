//! Scheduler loop: the top-level driver
//!
//! Ticks on a short fixed interval. Each tick refreshes the schedule cache
//! when stale, runs the transition check on its own slower cadence, and
//! evaluates every cached schedule against the wall clock. Firings are
//! guarded by the persisted fired-slot marker, so a tick storm, a restart
//! inside the tolerance window, or overlapping evaluations can never fire a
//! slot twice.
//!
//! Everything runs cooperatively inside one task: the tick sleep is a
//! `select!` against the shutdown Notify, so the process stops cleanly
//! without abandoning in-flight work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::candles::BinanceCandleSource;
use crate::exchanges::{AdapterFactory, LiveAdapterFactory};
use crate::executions::{ExecutionsDb, EXECUTIONS_DB};
use crate::gate::{self, GateContext};
use crate::logger::{self, LogTag};
use crate::schedules::{ScheduleCache, SchedulesDb, SCHEDULES_DB};
use crate::services::Service;
use crate::settings::SETTINGS;
use crate::signal::{SignalEngine, SignalProvider};
use crate::state::{StrategyDb, STRATEGY_DB};
use crate::transition::{self, TransitionContext};
use crate::utils::check_shutdown_or_delay;

/// Heartbeat cadence in ticks (10s ticks -> every 10 minutes)
const HEARTBEAT_EVERY_TICKS: u64 = 60;

/// Shared references the loop operates on; injected so tests can drive
/// individual ticks against in-memory stores
pub struct SchedulerDeps<'a> {
    pub strategy_db: &'a StrategyDb,
    pub executions_db: &'a ExecutionsDb,
    pub schedules_db: &'a SchedulesDb,
    pub adapters: &'a dyn AdapterFactory,
    pub signal: &'a dyn SignalProvider,
}

impl<'a> SchedulerDeps<'a> {
    fn gate_ctx(&self) -> GateContext<'a> {
        GateContext {
            strategy_db: self.strategy_db,
            executions_db: self.executions_db,
            adapters: self.adapters,
            signal: self.signal,
        }
    }

    fn transition_ctx(&self) -> TransitionContext<'a> {
        TransitionContext {
            strategy_db: self.strategy_db,
            executions_db: self.executions_db,
            adapters: self.adapters,
            signal: self.signal,
        }
    }
}

/// Evaluate every cached schedule against `now`; fire each unfired matching
/// slot through the gate. Returns how many schedules fired.
pub async fn evaluate_due_schedules(
    deps: &SchedulerDeps<'_>,
    cache: &ScheduleCache,
    now: DateTime<Tz>,
) -> usize {
    let tolerance = SETTINGS.scheduler.fire_tolerance_secs;
    let mut fired = 0;

    for entry in cache.entries() {
        let Some(slot) = entry.matching_slot(now, tolerance) else {
            continue;
        };

        // Claim the slot before evaluating: at-most-once beats at-least-once
        // for order placement, and the dedupe keys cover genuine retries.
        match deps.strategy_db.mark_slot_fired(entry.id, &slot) {
            Ok(true) => {}
            Ok(false) => {
                logger::debug(
                    LogTag::Scheduler,
                    &format!("schedule {} already fired for slot '{}'", entry.id, slot),
                );
                continue;
            }
            Err(e) => {
                logger::error(
                    LogTag::Scheduler,
                    &format!("failed to claim slot '{}' for schedule {}: {}", slot, entry.id, e),
                );
                continue;
            }
        }

        match gate::gate_weekly_dca(&deps.gate_ctx(), entry, &slot).await {
            Ok(outcome) => {
                fired += 1;
                logger::info(
                    LogTag::Scheduler,
                    &format!(
                        "schedule {} evaluated ({}, {} leg(s))",
                        entry.id,
                        outcome.status_label,
                        outcome.results.len()
                    ),
                );
            }
            Err(e) => {
                logger::error(
                    LogTag::Scheduler,
                    &format!("gate evaluation failed for schedule {}: {}", entry.id, e),
                );
            }
        }
    }
    fired
}

/// One full scheduler tick: cache refresh, transition check, schedule sweep
pub async fn run_tick(
    deps: &SchedulerDeps<'_>,
    cache: &mut ScheduleCache,
    last_transition_check: &mut Option<Instant>,
) {
    // (a) refresh the schedule cache when stale; keep serving the old one on
    // failure (a stale cache up to the refresh interval is accepted)
    if cache.is_stale(Duration::from_secs(SETTINGS.scheduler.cache_refresh_secs)) {
        if let Err(e) = cache.refresh(deps.schedules_db) {
            logger::warning(
                LogTag::Scheduler,
                &format!("schedule cache refresh failed: {}", e),
            );
        }
    }

    // (b) transition check on its own cadence
    let check_due = last_transition_check
        .map(|at| at.elapsed() >= Duration::from_secs(SETTINGS.scheduler.transition_check_secs))
        .unwrap_or(true);
    if check_due {
        *last_transition_check = Some(Instant::now());
        if let Err(e) = transition::check_transition_and_act(&deps.transition_ctx()).await {
            logger::error(LogTag::Scheduler, &format!("transition check error: {}", e));
        }
    }

    // (c)+(d) evaluate due schedules against the configured timezone's clock
    let now = Utc::now().with_timezone(&SETTINGS.timezone());
    evaluate_due_schedules(deps, cache, now).await;
}

// =============================================================================
// SERVICE WRAPPER
// =============================================================================

/// Scheduler packaged as a managed service over the global stores
pub struct SchedulerService;

#[async_trait]
impl Service for SchedulerService {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn priority(&self) -> i32 {
        50
    }

    async fn start(&mut self, shutdown: Arc<Notify>) -> Result<Vec<JoinHandle<()>>, String> {
        let handle = tokio::spawn(async move {
            let adapters = LiveAdapterFactory;
            let signal = SignalEngine::new(Box::new(BinanceCandleSource::new()));
            let deps = SchedulerDeps {
                strategy_db: &STRATEGY_DB,
                executions_db: &EXECUTIONS_DB,
                schedules_db: &SCHEDULES_DB,
                adapters: &adapters,
                signal: &signal,
            };

            let mut cache = ScheduleCache::new();
            let mut last_transition_check: Option<Instant> = None;
            let tick = Duration::from_secs(SETTINGS.scheduler.tick_secs.max(1));
            let mut tick_count: u64 = 0;

            logger::info(
                LogTag::Scheduler,
                &format!(
                    "Scheduler started (tick {}s, tz {})",
                    SETTINGS.scheduler.tick_secs, SETTINGS.strategy.timezone
                ),
            );

            loop {
                run_tick(&deps, &mut cache, &mut last_transition_check).await;

                tick_count += 1;
                if tick_count % HEARTBEAT_EVERY_TICKS == 0 {
                    logger::info(
                        LogTag::Scheduler,
                        &format!(
                            "heartbeat: {} ticks, {} cached schedule(s)",
                            tick_count,
                            cache.entries().len()
                        ),
                    );
                }

                if check_shutdown_or_delay(&shutdown, tick).await {
                    break;
                }
            }
            logger::info(LogTag::Scheduler, "Scheduler stopped");
        });

        Ok(vec![handle])
    }
}
