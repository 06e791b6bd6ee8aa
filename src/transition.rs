//! Transition action executor
//!
//! Reacts to a trend flip, never to schedule timing. A bullish-to-bearish
//! flip liquidates the configured fraction of each venue's holding into that
//! venue's reserve; a bearish-to-bullish flip redeploys each reserve into a
//! market purchase capped by the per-exchange order cap and the free balance.
//!
//! The state machine is {unknown, bullish/epoch-inactive, bearish/epoch-active}
//! with no terminal state. `red_epoch_active` debounces the bearish side:
//! repeated bearish ticks while the epoch is active never sell twice. The
//! flag flips atomically with the first ledger mutation of the transition, so
//! a crash in between cannot re-arm the liquidation.

use chrono::Utc;

use crate::errors::DcaBotError;
use crate::exchanges::{AdapterFactory, ExchangeError, ExchangeKind};
use crate::executions::{execute_once, ExecutionOutcome, ExecutionsDb, OrderSide};
use crate::ledger::{self, ReserveReason};
use crate::logger::{self, LogTag};
use crate::notifications::{notify, NotificationEvent};
use crate::signal::{CdcStatus, SignalProvider};
use crate::state::{StrategyDb, StrategyState};

/// Everything a transition check needs, injected for testability
pub struct TransitionContext<'a> {
    pub strategy_db: &'a StrategyDb,
    pub executions_db: &'a ExecutionsDb,
    pub adapters: &'a dyn AdapterFactory,
    pub signal: &'a dyn SignalProvider,
}

/// What a detected transition did
#[derive(Debug, Default)]
pub struct TransitionOutcome {
    pub previous: CdcStatus,
    pub current: CdcStatus,
    /// (exchange, proceeds credited) per executed liquidation
    pub half_sells: Vec<(ExchangeKind, f64)>,
    /// (exchange, amount spent) per executed redeploy
    pub redeploys: Vec<(ExchangeKind, f64)>,
    /// (exchange, why) per skipped leg
    pub skipped: Vec<(ExchangeKind, String)>,
}

/// Detect a trend flip against the stored classification and act on it.
/// Returns None when nothing changed or the signal is unavailable.
pub async fn check_transition_and_act(
    ctx: &TransitionContext<'_>,
) -> Result<Option<TransitionOutcome>, DcaBotError> {
    let state = ctx.strategy_db.load_state()?;
    if !state.cdc_enabled {
        return Ok(None);
    }

    let current = match ctx.signal.current_status().await {
        Ok(status) => status,
        Err(e) => {
            // Market data failure is not fatal: keep the previous
            // classification and try again next check
            logger::warning(LogTag::Transition, &format!("signal unavailable: {}", e));
            return Ok(None);
        }
    };
    let previous = state.last_signal;
    if previous == current {
        return Ok(None);
    }

    logger::info(
        LogTag::Transition,
        &format!("trend transition detected: {} -> {}", previous, current),
    );
    notify(NotificationEvent::TransitionDetected {
        previous: previous.to_string(),
        current: current.to_string(),
    });

    let mut outcome = TransitionOutcome {
        previous,
        current,
        ..Default::default()
    };

    match current {
        CdcStatus::Bearish => {
            if state.red_epoch_active {
                // Already liquidated this epoch; just record the signal
                logger::info(
                    LogTag::Transition,
                    "red epoch already active, skipping liquidation",
                );
            } else {
                run_half_sells(ctx, &state, previous, &mut outcome).await;
            }
            finalize_flags(ctx.strategy_db, CdcStatus::Bearish, true)?;
        }
        CdcStatus::Bullish => {
            run_redeploys(ctx, &state, previous, &mut outcome).await;
            finalize_flags(ctx.strategy_db, CdcStatus::Bullish, false)?;
        }
        CdcStatus::Unknown => {}
    }

    Ok(Some(outcome))
}

/// Ensure the signal/epoch flags reflect the transition even when no leg
/// produced a ledger mutation (every ledger mutation already set them).
fn finalize_flags(
    db: &StrategyDb,
    signal: CdcStatus,
    epoch_active: bool,
) -> Result<(), DcaBotError> {
    db.update_state(|s| {
        s.last_signal = signal;
        s.red_epoch_active = epoch_active;
        s.last_transition_at = Some(Utc::now());
    })?;
    Ok(())
}

// =============================================================================
// BULLISH -> BEARISH: PARTIAL LIQUIDATION
// =============================================================================

async fn run_half_sells(
    ctx: &TransitionContext<'_>,
    state: &StrategyState,
    previous: CdcStatus,
    outcome: &mut TransitionOutcome,
) {
    let transition_tag = format!(
        "{}->{}:{}",
        previous.as_str(),
        CdcStatus::Bearish.as_str(),
        Utc::now().format("%Y-%m-%d")
    );

    // Venue calls fan out; ledger commits serialize on the strategy db
    let legs = ExchangeKind::ALL.map(|exchange| {
        let tag = transition_tag.clone();
        let pct = *state.sell_fraction_pct.get(exchange);
        async move {
            if pct == 0 {
                return (exchange, Ok(None));
            }
            (exchange, half_sell_exchange(ctx, exchange, pct, &tag).await)
        }
    });

    for (exchange, result) in futures::future::join_all(legs).await {
        match result {
            Ok(Some(proceeds)) => outcome.half_sells.push((exchange, proceeds)),
            Ok(None) => outcome
                .skipped
                .push((exchange, "nothing to liquidate".to_string())),
            Err(e) => {
                if e.is_auth_failure() {
                    notify(NotificationEvent::ExchangeUnhealthy {
                        exchange,
                        message: e.to_string(),
                    });
                }
                logger::error(
                    LogTag::Transition,
                    &format!("half-sell failed on {}: {}", exchange, e),
                );
                outcome.skipped.push((exchange, e.to_string()));
            }
        }
    }
}

/// Sell `pct` percent of the venue's holding and credit the proceeds.
/// Returns the credited proceeds, or None when there was nothing tradable.
async fn half_sell_exchange(
    ctx: &TransitionContext<'_>,
    exchange: ExchangeKind,
    pct: u32,
    transition_tag: &str,
) -> Result<Option<f64>, ExchangeError> {
    let adapter = ctx.adapters.adapter(exchange);
    let symbol = exchange.trade_symbol();

    // Quantity comes from the venue's balance, never from the ledger
    let held = adapter.get_free_balance(exchange.base_asset()).await?;
    let quantity = held * pct as f64 / 100.0;
    if quantity <= 0.0 {
        return Ok(None);
    }

    let dedupe_key = format!("transition-sell:{}:{}", transition_tag, exchange);

    // Recovery: a fill recorded earlier without its ledger row still needs
    // the credit; a fill with its ledger row is fully done.
    let sell_adapter = adapter.clone();
    let sell_symbol = symbol.to_string();
    let result = execute_once(
        ctx.executions_db,
        &dedupe_key,
        exchange,
        OrderSide::Sell,
        symbol,
        quantity,
        move || async move {
            sell_adapter
                .place_market_sell_by_quantity(&sell_symbol, quantity)
                .await
        },
    )
    .await;

    let (proceeds, sold_quantity, avg_price, order_id) = match result {
        Ok(ExecutionOutcome::Executed(order)) => (
            order.filled_quote,
            order.filled_quantity,
            order.avg_price,
            order.order_id,
        ),
        Ok(ExecutionOutcome::AlreadyHandled(record)) => {
            let already_credited = ledger::has_correlation(ctx.strategy_db, &dedupe_key)
                .unwrap_or(true);
            if already_credited || record.filled_quantity.is_none() {
                return Ok(None);
            }
            (
                record.filled_quantity.unwrap_or(0.0) * record.avg_price.unwrap_or(0.0),
                record.filled_quantity.unwrap_or(0.0),
                record.avg_price.unwrap_or(0.0),
                record.order_id.unwrap_or_default(),
            )
        }
        Err(DcaBotError::Exchange(ExchangeError::AmountTooSmall { .. })) => return Ok(None),
        Err(DcaBotError::Exchange(e)) => return Err(e),
        Err(e) => {
            return Err(ExchangeError::Venue {
                exchange: exchange.as_str().to_string(),
                message: e.to_string(),
            })
        }
    };

    // Credit proceeds and flip the epoch flags in one commit
    let state = ledger::increment_reserve_with(
        ctx.strategy_db,
        exchange,
        proceeds,
        ReserveReason::TransitionSell,
        "Bearish flip liquidation proceeds",
        Some(&dedupe_key),
        |s| {
            s.last_signal = CdcStatus::Bearish;
            s.red_epoch_active = true;
            s.last_transition_at = Some(Utc::now());
        },
    )
    .map_err(|e| ExchangeError::Venue {
        exchange: exchange.as_str().to_string(),
        message: format!("ledger credit failed: {}", e),
    })?;

    notify(NotificationEvent::HalfSellExecuted {
        exchange,
        sold_quantity,
        proceeds,
        avg_price,
        reserve_after: *state.reserve.get(exchange),
        order_id,
    });
    Ok(Some(proceeds))
}

// =============================================================================
// BEARISH -> BULLISH: RESERVE REDEPLOYMENT
// =============================================================================

async fn run_redeploys(
    ctx: &TransitionContext<'_>,
    state: &StrategyState,
    previous: CdcStatus,
    outcome: &mut TransitionOutcome,
) {
    let transition_tag = format!(
        "{}->{}:{}",
        previous.as_str(),
        CdcStatus::Bullish.as_str(),
        Utc::now().format("%Y-%m-%d")
    );

    // Venue calls fan out; ledger commits serialize on the strategy db
    let legs = ExchangeKind::ALL.map(|exchange| {
        let tag = transition_tag.clone();
        let reserve = *state.reserve.get(exchange);
        let cap = *state.max_order_cap.get(exchange);
        async move {
            if reserve <= 0.0 {
                return (exchange, reserve, Ok(None));
            }
            (
                exchange,
                reserve,
                redeploy_exchange(ctx, exchange, reserve, cap, &tag).await,
            )
        }
    });

    for (exchange, reserve, result) in futures::future::join_all(legs).await {
        match result {
            Ok(Some(spent)) => outcome.redeploys.push((exchange, spent)),
            Ok(None) if reserve <= 0.0 => {
                outcome.skipped.push((exchange, "reserve is empty".to_string()));
            }
            Ok(None) => {
                notify(NotificationEvent::ReserveRedeploySkipped {
                    exchange,
                    reserve,
                    reason: "below venue minimum".to_string(),
                });
                outcome
                    .skipped
                    .push((exchange, "reserve below venue minimum".to_string()));
            }
            Err(e) => {
                if e.is_auth_failure() {
                    notify(NotificationEvent::ExchangeUnhealthy {
                        exchange,
                        message: e.to_string(),
                    });
                }
                logger::error(
                    LogTag::Transition,
                    &format!("reserve redeploy failed on {}: {}", exchange, e),
                );
                outcome.skipped.push((exchange, e.to_string()));
            }
        }
    }
}

/// Spend up to min(reserve, order cap, free balance) on a market buy and
/// debit the reserve by the executed amount. Returns the spent amount, or
/// None when the spendable amount is below the venue minimum.
async fn redeploy_exchange(
    ctx: &TransitionContext<'_>,
    exchange: ExchangeKind,
    reserve: f64,
    order_cap: f64,
    transition_tag: &str,
) -> Result<Option<f64>, ExchangeError> {
    let adapter = ctx.adapters.adapter(exchange);
    let symbol = exchange.trade_symbol();

    let filters = adapter.get_price_and_filters(symbol).await?;
    let free_quote = adapter.get_free_balance(exchange.quote_asset()).await?;

    let mut spend = reserve.min(free_quote);
    if order_cap > 0.0 {
        spend = spend.min(order_cap);
    }
    // Insufficient reserve is not a failure, just nothing to do here
    if spend < filters.min_notional {
        return Ok(None);
    }

    let dedupe_key = format!("transition-buy:{}:{}", transition_tag, exchange);

    let buy_adapter = adapter.clone();
    let buy_symbol = symbol.to_string();
    let result = execute_once(
        ctx.executions_db,
        &dedupe_key,
        exchange,
        OrderSide::Buy,
        symbol,
        spend,
        move || async move {
            buy_adapter
                .place_market_buy_by_quote(&buy_symbol, spend)
                .await
        },
    )
    .await;

    let (spent, filled_quantity, avg_price, order_id) = match result {
        Ok(ExecutionOutcome::Executed(order)) => {
            let spent = if order.filled_quote > 0.0 {
                order.filled_quote
            } else {
                spend
            };
            (spent, order.filled_quantity, order.avg_price, order.order_id)
        }
        Ok(ExecutionOutcome::AlreadyHandled(record)) => {
            let already_debited =
                ledger::has_correlation(ctx.strategy_db, &dedupe_key).unwrap_or(true);
            if already_debited || record.filled_quantity.is_none() {
                return Ok(None);
            }
            let qty = record.filled_quantity.unwrap_or(0.0);
            let price = record.avg_price.unwrap_or(0.0);
            (qty * price, qty, price, record.order_id.unwrap_or_default())
        }
        Err(DcaBotError::Exchange(ExchangeError::AmountTooSmall { .. })) => return Ok(None),
        Err(DcaBotError::Exchange(e)) => return Err(e),
        Err(e) => {
            return Err(ExchangeError::Venue {
                exchange: exchange.as_str().to_string(),
                message: e.to_string(),
            })
        }
    };

    // The debit cannot exceed what the reserve held; fills never exceed the
    // requested quote, but float residue is clamped anyway
    let debit = spent.min(reserve);
    let state = ledger::decrement_reserve_with(
        ctx.strategy_db,
        exchange,
        debit,
        ReserveReason::TransitionBuy,
        "Bullish flip reserve redeployment",
        Some(&dedupe_key),
        |s| {
            s.last_signal = CdcStatus::Bullish;
            s.red_epoch_active = false;
            s.last_transition_at = Some(Utc::now());
        },
    )
    .map_err(|e| ExchangeError::Venue {
        exchange: exchange.as_str().to_string(),
        message: format!("ledger debit failed: {}", e),
    })?;

    notify(NotificationEvent::ReserveRedeployed {
        exchange,
        spent: debit,
        filled_quantity,
        avg_price,
        reserve_after: *state.reserve.get(exchange),
        order_id,
    });
    Ok(Some(debit))
}
