//! Gate/decision engine for scheduled purchases ("weekly DCA")
//!
//! Consumes one due schedule firing plus the current strategy state and trend
//! classification, then routes the scheduled amount to exactly one of two
//! paths per exchange: the purchase path (market buy through the execution
//! recorder) or the reserve path (ledger credit with reason `weekly_skip`).
//! Never both, never neither: the branch below is the only place the choice
//! is made.

use crate::errors::DcaBotError;
use crate::exchanges::{AdapterFactory, ExchangeAdapter, ExchangeKind, OrderResult};
use crate::executions::{
    execute_once, ExecutionOutcome, ExecutionRecord, ExecutionsDb, OrderSide,
};
use crate::ledger::{self, ReserveReason};
use crate::logger::{self, LogTag};
use crate::notifications::{notify, NotificationEvent};
use crate::schedules::{RoutingMode, ScheduleEntry};
use crate::settings::SETTINGS;
use crate::signal::{CdcStatus, SignalProvider};
use crate::state::StrategyDb;

/// Everything a gate evaluation needs, injected for testability
pub struct GateContext<'a> {
    pub strategy_db: &'a StrategyDb,
    pub executions_db: &'a ExecutionsDb,
    pub adapters: &'a dyn AdapterFactory,
    pub signal: &'a dyn SignalProvider,
}

/// What happened on one exchange leg of a firing
#[derive(Debug)]
pub enum GateDecision {
    Purchased {
        exchange: ExchangeKind,
        symbol: String,
        amount: f64,
        order: OrderResult,
    },
    /// The dedupe key was already handled; idempotent success
    PurchaseDeduplicated {
        exchange: ExchangeKind,
        record: ExecutionRecord,
    },
    Reserved {
        exchange: ExchangeKind,
        amount: f64,
        reserve_after: f64,
    },
    /// This leg failed; other legs keep going
    Failed {
        exchange: ExchangeKind,
        error: String,
    },
}

/// Outcome of one schedule firing
#[derive(Debug)]
pub struct GateOutcome {
    pub schedule_id: i64,
    /// "disabled", "bullish" or "bearish" as evaluated for this firing
    pub status_label: &'static str,
    pub results: Vec<GateDecision>,
}

/// The deployment's default venue for "global" routing
pub fn default_exchange() -> ExchangeKind {
    ExchangeKind::from_str(&SETTINGS.strategy.default_exchange).unwrap_or(ExchangeKind::Binance)
}

/// Resolve the trend classification this firing acts on.
///
/// Gating disabled short-circuits to the purchase path. A failed market-data
/// fetch falls back to the last observed classification; with no history at
/// all the amount is parked rather than bought blind.
async fn effective_status(
    ctx: &GateContext<'_>,
    cdc_enabled: bool,
    last_signal: CdcStatus,
) -> (CdcStatus, &'static str) {
    if !cdc_enabled {
        return (CdcStatus::Bullish, "disabled");
    }
    match ctx.signal.current_status().await {
        Ok(CdcStatus::Bullish) => (CdcStatus::Bullish, "bullish"),
        Ok(CdcStatus::Bearish) | Ok(CdcStatus::Unknown) => (CdcStatus::Bearish, "bearish"),
        Err(e) => {
            logger::warning(
                LogTag::Gate,
                &format!("signal unavailable, falling back to last classification: {}", e),
            );
            match last_signal {
                CdcStatus::Bullish => (CdcStatus::Bullish, "bullish"),
                _ => (CdcStatus::Bearish, "bearish"),
            }
        }
    }
}

/// Split the scheduled amount into per-exchange legs
fn resolve_legs(entry: &ScheduleEntry) -> Vec<(ExchangeKind, f64)> {
    match entry.routing {
        RoutingMode::Global => vec![(default_exchange(), entry.amount)],
        RoutingMode::Named(exchange) => vec![(exchange, entry.amount)],
        RoutingMode::Split { binance_pct } => {
            let binance_amount = entry.amount * binance_pct as f64 / 100.0;
            let okx_amount = entry.amount - binance_amount;
            let mut legs = Vec::new();
            if binance_amount > 0.0 {
                legs.push((ExchangeKind::Binance, binance_amount));
            }
            if okx_amount > 0.0 {
                legs.push((ExchangeKind::Okx, okx_amount));
            }
            legs
        }
        RoutingMode::AutoAsset(exchange) => vec![(exchange, entry.amount)],
    }
}

/// Pick the symbol an auto-asset purchase should buy into: whichever of the
/// two candidate assets is currently held at the venue (by notional value),
/// defaulting to the first candidate (BTC) when flat. Holdings come from the
/// venue's balance query, not from strategy state.
async fn resolve_auto_asset_symbol(
    adapter: &dyn ExchangeAdapter,
    exchange: ExchangeKind,
) -> String {
    let candidates = exchange.auto_asset_candidates();
    let mut best_symbol = candidates[0].1;
    let mut best_notional = -1.0f64;

    for (asset, symbol) in candidates {
        let balance = adapter.get_free_balance(asset).await.unwrap_or(0.0);
        let price = adapter
            .get_price_and_filters(symbol)
            .await
            .map(|f| f.price)
            .unwrap_or(0.0);
        let notional = balance * price;
        if notional > best_notional {
            best_notional = notional;
            best_symbol = symbol;
        }
    }

    logger::debug(
        LogTag::Gate,
        &format!("auto-asset on {} resolved to {}", exchange, best_symbol),
    );
    best_symbol.to_string()
}

/// Evaluate one due schedule firing.
///
/// `slot` is the persisted firing-slot key; it anchors the deduplication keys
/// so a retried tick or a restart inside the window cannot double-execute.
pub async fn gate_weekly_dca(
    ctx: &GateContext<'_>,
    entry: &ScheduleEntry,
    slot: &str,
) -> Result<GateOutcome, DcaBotError> {
    let state = ctx.strategy_db.load_state()?;
    let (status, status_label) =
        effective_status(ctx, state.cdc_enabled, state.last_signal).await;

    logger::info(
        LogTag::Gate,
        &format!(
            "schedule {} firing for slot '{}' with status {} ({:.2} USDT)",
            entry.id, slot, status_label, entry.amount
        ),
    );

    let mut results = Vec::new();
    for (exchange, amount) in resolve_legs(entry) {
        let decision = if status == CdcStatus::Bullish {
            run_purchase_leg(ctx, entry, slot, exchange, amount).await
        } else {
            run_reserve_leg(ctx, entry, exchange, amount)
        };
        results.push(decision);
    }

    Ok(GateOutcome {
        schedule_id: entry.id,
        status_label,
        results,
    })
}

async fn run_purchase_leg(
    ctx: &GateContext<'_>,
    entry: &ScheduleEntry,
    slot: &str,
    exchange: ExchangeKind,
    amount: f64,
) -> GateDecision {
    let adapter = ctx.adapters.adapter(exchange);
    let symbol = match entry.routing {
        RoutingMode::AutoAsset(_) => resolve_auto_asset_symbol(adapter.as_ref(), exchange).await,
        _ => exchange.trade_symbol().to_string(),
    };

    let dedupe_key = format!("weekly-dca:{}:{}:{}", entry.id, slot, exchange);
    let order_symbol = symbol.clone();
    let order_adapter = adapter.clone();
    let outcome = execute_once(
        ctx.executions_db,
        &dedupe_key,
        exchange,
        OrderSide::Buy,
        &symbol,
        amount,
        move || async move {
            order_adapter
                .place_market_buy_by_quote(&order_symbol, amount)
                .await
        },
    )
    .await;

    match outcome {
        Ok(ExecutionOutcome::Executed(order)) => {
            notify(NotificationEvent::ScheduleFired {
                schedule_id: entry.id,
                exchange,
                amount,
                filled_quantity: order.filled_quantity,
                avg_price: order.avg_price,
                order_id: order.order_id.clone(),
            });
            GateDecision::Purchased {
                exchange,
                symbol,
                amount,
                order,
            }
        }
        Ok(ExecutionOutcome::AlreadyHandled(record)) => {
            GateDecision::PurchaseDeduplicated { exchange, record }
        }
        Err(e) => {
            if let DcaBotError::Exchange(exchange_error) = &e {
                if exchange_error.is_auth_failure() {
                    notify(NotificationEvent::ExchangeUnhealthy {
                        exchange,
                        message: exchange_error.to_string(),
                    });
                }
            }
            logger::error(
                LogTag::Gate,
                &format!("purchase leg failed on {}: {}", exchange, e),
            );
            GateDecision::Failed {
                exchange,
                error: e.to_string(),
            }
        }
    }
}

fn run_reserve_leg(
    ctx: &GateContext<'_>,
    entry: &ScheduleEntry,
    exchange: ExchangeKind,
    amount: f64,
) -> GateDecision {
    let correlation_id = format!("schedule-{}", entry.id);
    match ledger::increment_reserve(
        ctx.strategy_db,
        exchange,
        amount,
        ReserveReason::WeeklySkip,
        "Scheduled purchase skipped while bearish",
        Some(&correlation_id),
    ) {
        Ok(state) => {
            let reserve_after = *state.reserve.get(exchange);
            notify(NotificationEvent::ScheduleSkipped {
                schedule_id: entry.id,
                exchange,
                amount,
                reserve_after,
            });
            GateDecision::Reserved {
                exchange,
                amount,
                reserve_after,
            }
        }
        Err(e) => {
            logger::error(
                LogTag::Gate,
                &format!("reserve leg failed on {}: {}", exchange, e),
            );
            GateDecision::Failed {
                exchange,
                error: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::MockAdapterFactory;
    use crate::ledger::recent_entries;
    use crate::schedules::RoutingMode;
    use crate::signal::testkit::FixedSignal;
    use chrono::NaiveTime;

    fn schedule(routing: RoutingMode, amount: f64) -> ScheduleEntry {
        ScheduleEntry {
            id: 7,
            days: vec![chrono::Weekday::Fri],
            time: NaiveTime::parse_from_str("09:00", "%H:%M").unwrap(),
            amount,
            routing,
        }
    }

    struct Harness {
        strategy_db: StrategyDb,
        executions_db: ExecutionsDb,
        adapters: MockAdapterFactory,
        signal: FixedSignal,
    }

    impl Harness {
        fn new(signal: FixedSignal) -> Self {
            Self {
                strategy_db: StrategyDb::open_in_memory().unwrap(),
                executions_db: ExecutionsDb::open_in_memory().unwrap(),
                adapters: MockAdapterFactory::funded(50_000.0, 100_000.0),
                signal,
            }
        }

        fn ctx(&self) -> GateContext<'_> {
            GateContext {
                strategy_db: &self.strategy_db,
                executions_db: &self.executions_db,
                adapters: &self.adapters,
                signal: &self.signal,
            }
        }
    }

    #[tokio::test]
    async fn test_disabled_gate_always_purchases() {
        let h = Harness::new(FixedSignal::bearish());
        h.strategy_db.set_cdc_enabled(false).unwrap();

        let outcome = gate_weekly_dca(&h.ctx(), &schedule(RoutingMode::Global, 100.0), "s1")
            .await
            .unwrap();

        assert_eq!(outcome.status_label, "disabled");
        assert!(matches!(outcome.results[0], GateDecision::Purchased { .. }));
        assert_eq!(h.adapters.binance.order_count(), 1);
        // Reserve untouched
        assert_eq!(h.strategy_db.load_state().unwrap().reserve.binance, 0.0);
    }

    #[tokio::test]
    async fn test_bullish_routes_to_purchase() {
        let h = Harness::new(FixedSignal::bullish());
        let outcome = gate_weekly_dca(
            &h.ctx(),
            &schedule(RoutingMode::Named(ExchangeKind::Okx), 80.0),
            "s1",
        )
        .await
        .unwrap();

        assert_eq!(outcome.status_label, "bullish");
        match &outcome.results[0] {
            GateDecision::Purchased { exchange, amount, .. } => {
                assert_eq!(*exchange, ExchangeKind::Okx);
                assert_eq!(*amount, 80.0);
            }
            other => panic!("expected purchase, got {:?}", other),
        }
        assert_eq!(h.adapters.okx.order_count(), 1);
        assert_eq!(h.adapters.binance.order_count(), 0);
    }

    #[tokio::test]
    async fn test_bearish_reserves_instead_of_buying() {
        let h = Harness::new(FixedSignal::bearish());
        let outcome = gate_weekly_dca(
            &h.ctx(),
            &schedule(RoutingMode::Named(ExchangeKind::Binance), 80.0),
            "s1",
        )
        .await
        .unwrap();

        match &outcome.results[0] {
            GateDecision::Reserved {
                amount,
                reserve_after,
                ..
            } => {
                assert_eq!(*amount, 80.0);
                assert_eq!(*reserve_after, 80.0);
            }
            other => panic!("expected reserve, got {:?}", other),
        }
        // No order placed on either venue
        assert_eq!(h.adapters.binance.order_count(), 0);
        assert_eq!(h.adapters.okx.order_count(), 0);

        let entries = recent_entries(&h.strategy_db, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "weekly_skip");
    }

    #[tokio::test]
    async fn test_exclusive_routing_never_both() {
        for signal in [FixedSignal::bullish(), FixedSignal::bearish()] {
            let h = Harness::new(signal);
            gate_weekly_dca(&h.ctx(), &schedule(RoutingMode::Global, 100.0), "s1")
                .await
                .unwrap();

            let orders = h.adapters.binance.order_count();
            let ledger_rows = recent_entries(&h.strategy_db, 10).unwrap().len();
            assert_eq!(
                orders + ledger_rows,
                1,
                "exactly one of purchase/reserve must happen"
            );
        }
    }

    #[tokio::test]
    async fn test_split_routing_divides_by_ratio() {
        let h = Harness::new(FixedSignal::bullish());
        let outcome = gate_weekly_dca(
            &h.ctx(),
            &schedule(RoutingMode::Split { binance_pct: 70 }, 200.0),
            "s1",
        )
        .await
        .unwrap();

        assert_eq!(outcome.results.len(), 2);
        let binance_orders = h.adapters.binance.orders.lock().clone();
        let okx_orders = h.adapters.okx.orders.lock().clone();
        assert_eq!(binance_orders[0].amount, 140.0);
        assert_eq!(okx_orders[0].amount, 60.0);
    }

    #[tokio::test]
    async fn test_split_all_to_one_side_skips_empty_leg() {
        let h = Harness::new(FixedSignal::bullish());
        let outcome = gate_weekly_dca(
            &h.ctx(),
            &schedule(RoutingMode::Split { binance_pct: 100 }, 200.0),
            "s1",
        )
        .await
        .unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(h.adapters.okx.order_count(), 0);
    }

    #[tokio::test]
    async fn test_replayed_slot_does_not_double_order() {
        let h = Harness::new(FixedSignal::bullish());
        let entry = schedule(RoutingMode::Global, 100.0);

        gate_weekly_dca(&h.ctx(), &entry, "s1").await.unwrap();
        let outcome = gate_weekly_dca(&h.ctx(), &entry, "s1").await.unwrap();

        assert!(matches!(
            outcome.results[0],
            GateDecision::PurchaseDeduplicated { .. }
        ));
        assert_eq!(h.adapters.binance.order_count(), 1);
    }

    #[tokio::test]
    async fn test_auto_asset_buys_held_candidate() {
        let h = Harness::new(FixedSignal::bullish());
        // Holding gold at the venue: the buy must follow it
        h.adapters.binance.set_balance("PAXG", 2.0);

        gate_weekly_dca(
            &h.ctx(),
            &schedule(RoutingMode::AutoAsset(ExchangeKind::Binance), 100.0),
            "s1",
        )
        .await
        .unwrap();

        let orders = h.adapters.binance.orders.lock().clone();
        assert_eq!(orders[0].symbol, "PAXGUSDT");
    }

    #[tokio::test]
    async fn test_auto_asset_defaults_to_btc_when_flat() {
        let h = Harness::new(FixedSignal::bullish());
        gate_weekly_dca(
            &h.ctx(),
            &schedule(RoutingMode::AutoAsset(ExchangeKind::Binance), 100.0),
            "s1",
        )
        .await
        .unwrap();

        let orders = h.adapters.binance.orders.lock().clone();
        assert_eq!(orders[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_signal_failure_with_no_history_reserves() {
        let h = Harness::new(FixedSignal::failing());
        let outcome = gate_weekly_dca(&h.ctx(), &schedule(RoutingMode::Global, 100.0), "s1")
            .await
            .unwrap();
        assert!(matches!(outcome.results[0], GateDecision::Reserved { .. }));
    }

    #[tokio::test]
    async fn test_signal_failure_keeps_previous_bullish() {
        let h = Harness::new(FixedSignal::failing());
        h.strategy_db
            .update_state(|s| s.last_signal = CdcStatus::Bullish)
            .unwrap();

        let outcome = gate_weekly_dca(&h.ctx(), &schedule(RoutingMode::Global, 100.0), "s1")
            .await
            .unwrap();
        assert!(matches!(outcome.results[0], GateDecision::Purchased { .. }));
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_leg_without_ledger_mutation() {
        let h = Harness::new(FixedSignal::bullish());
        h.adapters.binance.set_balance("USDT", 5.0);

        let outcome = gate_weekly_dca(&h.ctx(), &schedule(RoutingMode::Global, 100.0), "s1")
            .await
            .unwrap();

        assert!(matches!(outcome.results[0], GateDecision::Failed { .. }));
        assert!(recent_entries(&h.strategy_db, 10).unwrap().is_empty());
        assert_eq!(h.adapters.binance.order_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_marks_leg_failed_and_continues() {
        let h = Harness::new(FixedSignal::bullish());
        h.adapters.binance.set_fail_auth(true);

        let outcome = gate_weekly_dca(
            &h.ctx(),
            &schedule(RoutingMode::Split { binance_pct: 50 }, 200.0),
            "s1",
        )
        .await
        .unwrap();

        assert!(matches!(outcome.results[0], GateDecision::Failed { .. }));
        // The healthy venue still executed its leg
        assert!(matches!(outcome.results[1], GateDecision::Purchased { .. }));
        assert_eq!(h.adapters.okx.order_count(), 1);
    }
}
