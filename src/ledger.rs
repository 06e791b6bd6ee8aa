//! Reserve ledger: the append-only audit trail behind the reserve balances
//!
//! Every reserve mutation commits as one SQLite transaction that appends the
//! ledger row, rewrites the cached balance and bumps the state version. A
//! crash can therefore never leave the ledger and the balance disagreeing,
//! and `reserve[exchange]` always equals the sum of that exchange's deltas.
//!
//! Non-positive amounts are accepted as no-ops; a decrement that would push a
//! balance below zero is rejected before commit.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::errors::{DatabaseError, DcaBotError, StateError};
use crate::exchanges::ExchangeKind;
use crate::logger::{self, LogTag};
use crate::settings::SETTINGS;
use crate::state::{StrategyDb, StrategyState};

// =============================================================================
// REASON CODES
// =============================================================================

/// Why a reserve balance moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveReason {
    /// Scheduled purchase skipped while bearish; amount parked instead
    WeeklySkip,
    /// Proceeds of a bearish-flip liquidation
    TransitionSell,
    /// Redeployment of reserve on a bullish flip
    TransitionBuy,
    /// Operator-initiated adjustment through the admin surface
    ManualTransfer,
}

impl ReserveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReserveReason::WeeklySkip => "weekly_skip",
            ReserveReason::TransitionSell => "transition_sell",
            ReserveReason::TransitionBuy => "transition_buy",
            ReserveReason::ManualTransfer => "manual_transfer",
        }
    }

    pub fn from_str(s: &str) -> Option<ReserveReason> {
        match s {
            "weekly_skip" => Some(ReserveReason::WeeklySkip),
            "transition_sell" => Some(ReserveReason::TransitionSell),
            "transition_buy" => Some(ReserveReason::TransitionBuy),
            "manual_transfer" => Some(ReserveReason::ManualTransfer),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReserveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One append-only ledger row
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveLedgerEntry {
    pub id: i64,
    pub event_time: DateTime<Utc>,
    pub exchange: ExchangeKind,
    pub delta: f64,
    pub reserve_after: f64,
    pub reason: String,
    pub note: Option<String>,
    pub correlation_id: Option<String>,
}

// =============================================================================
// LEDGER OPERATIONS
// =============================================================================

/// Credit an exchange's reserve. Non-positive amounts are accepted as no-ops.
pub fn increment_reserve(
    db: &StrategyDb,
    exchange: ExchangeKind,
    amount: f64,
    reason: ReserveReason,
    note: &str,
    correlation_id: Option<&str>,
) -> Result<StrategyState, DcaBotError> {
    increment_reserve_with(db, exchange, amount, reason, note, correlation_id, |_| {})
}

/// Credit a reserve and apply a further state mutation in the SAME commit.
/// The transition executor uses this to flip `red_epoch_active`/`last_signal`
/// atomically with the ledger row, closing the crash window that would
/// otherwise allow a second liquidation.
pub fn increment_reserve_with<F>(
    db: &StrategyDb,
    exchange: ExchangeKind,
    amount: f64,
    reason: ReserveReason,
    note: &str,
    correlation_id: Option<&str>,
    mutate: F,
) -> Result<StrategyState, DcaBotError>
where
    F: Fn(&mut StrategyState),
{
    if amount <= 0.0 {
        return db.load_state();
    }
    apply_delta(db, exchange, amount, reason, note, correlation_id, mutate)
}

/// Debit an exchange's reserve. Non-positive amounts are accepted as no-ops;
/// an amount that would push the balance below zero is rejected before
/// commit. Used only by paths that computed the exact spend first.
pub fn decrement_reserve(
    db: &StrategyDb,
    exchange: ExchangeKind,
    amount: f64,
    reason: ReserveReason,
    note: &str,
    correlation_id: Option<&str>,
) -> Result<StrategyState, DcaBotError> {
    decrement_reserve_with(db, exchange, amount, reason, note, correlation_id, |_| {})
}

/// Debit a reserve and apply a further state mutation in the SAME commit
pub fn decrement_reserve_with<F>(
    db: &StrategyDb,
    exchange: ExchangeKind,
    amount: f64,
    reason: ReserveReason,
    note: &str,
    correlation_id: Option<&str>,
    mutate: F,
) -> Result<StrategyState, DcaBotError>
where
    F: Fn(&mut StrategyState),
{
    if amount <= 0.0 {
        return db.load_state();
    }
    apply_delta(db, exchange, -amount, reason, note, correlation_id, mutate)
}

/// Commit one signed reserve delta atomically with the state row.
fn apply_delta<F>(
    db: &StrategyDb,
    exchange: ExchangeKind,
    delta: f64,
    reason: ReserveReason,
    note: &str,
    correlation_id: Option<&str>,
    mutate: F,
) -> Result<StrategyState, DcaBotError>
where
    F: Fn(&mut StrategyState),
{
    if delta == 0.0 {
        return db.load_state();
    }

    let max_attempts = SETTINGS.execution.state_update_max_attempts.max(1);
    for _attempt in 1..=max_attempts {
        let mut conn = db.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| DcaBotError::from(e))?;

        let mut state = StrategyDb::read_state_conn(&tx)?;
        let expected_version = state.version;
        let balance = *state.reserve.get(exchange);
        let new_balance = balance + delta;
        if new_balance < 0.0 {
            return Err(DcaBotError::Database(DatabaseError::ReserveWouldGoNegative {
                exchange: exchange.as_str().to_string(),
                balance,
                requested: -delta,
            }));
        }
        *state.reserve.get_mut(exchange) = new_balance;
        mutate(&mut state);

        if !StrategyDb::try_write_state(&tx, &state, expected_version)? {
            // External writer slipped in between read and write; retry whole cycle
            drop(tx);
            continue;
        }

        tx.execute(
            "INSERT INTO reserve_ledger
                (event_time, exchange, delta, reserve_after, reason, note, correlation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Utc::now().to_rfc3339(),
                exchange.as_str(),
                delta,
                new_balance,
                reason.as_str(),
                note,
                correlation_id,
            ],
        )?;
        tx.commit().map_err(DcaBotError::from)?;

        logger::info(
            LogTag::Ledger,
            &format!(
                "{} reserve {} {:+.2} -> {:.2} ({})",
                exchange,
                reason,
                delta,
                new_balance,
                note
            ),
        );
        state.version = expected_version + 1;
        return Ok(state);
    }

    Err(DcaBotError::State(StateError::VersionConflict {
        attempts: max_attempts,
    }))
}

/// Admin-facing manual transfer: positive amounts park quote into the
/// reserve, negative amounts release it. Same atomic path as everything else.
pub fn manual_transfer(
    db: &StrategyDb,
    exchange: ExchangeKind,
    signed_amount: f64,
    note: &str,
) -> Result<StrategyState, DcaBotError> {
    if signed_amount >= 0.0 {
        increment_reserve(db, exchange, signed_amount, ReserveReason::ManualTransfer, note, None)
    } else {
        decrement_reserve(db, exchange, -signed_amount, ReserveReason::ManualTransfer, note, None)
    }
}

// =============================================================================
// LEDGER QUERIES (read-only, for dashboards/exports)
// =============================================================================

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<ReserveLedgerEntry> {
    let event_time: String = row.get("event_time")?;
    let exchange: String = row.get("exchange")?;
    Ok(ReserveLedgerEntry {
        id: row.get("id")?,
        event_time: DateTime::parse_from_rfc3339(&event_time)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        exchange: ExchangeKind::from_str(&exchange).unwrap_or(ExchangeKind::Binance),
        delta: row.get("delta")?,
        reserve_after: row.get("reserve_after")?,
        reason: row.get("reason")?,
        note: row.get("note")?,
        correlation_id: row.get("correlation_id")?,
    })
}

/// Most recent ledger entries, newest first
pub fn recent_entries(db: &StrategyDb, limit: usize) -> Result<Vec<ReserveLedgerEntry>, DcaBotError> {
    let conn = db.conn.lock();
    let mut stmt = conn.prepare(
        "SELECT * FROM reserve_ledger ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], row_to_entry)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

/// Whether a ledger row with this correlation id was already committed.
/// Recovery paths use this to decide if a recorded fill still needs its
/// ledger mutation applied.
pub fn has_correlation(db: &StrategyDb, correlation_id: &str) -> Result<bool, DcaBotError> {
    let conn = db.conn.lock();
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM reserve_ledger WHERE correlation_id = ?1",
        params![correlation_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Sum of all ledger deltas for one exchange
pub fn sum_deltas(db: &StrategyDb, exchange: ExchangeKind) -> Result<f64, DcaBotError> {
    let conn = db.conn.lock();
    let sum: f64 = conn.query_row(
        "SELECT COALESCE(SUM(delta), 0) FROM reserve_ledger WHERE exchange = ?1",
        params![exchange.as_str()],
        |row| row.get(0),
    )?;
    Ok(sum)
}

/// Verify ledger-balance consistency for every exchange.
/// Returns (exchange, ledger_sum, cached_balance) triples.
pub fn audit(db: &StrategyDb) -> Result<Vec<(ExchangeKind, f64, f64)>, DcaBotError> {
    let state = db.load_state()?;
    let mut report = Vec::new();
    for kind in ExchangeKind::ALL {
        let ledger_sum = sum_deltas(db, kind)?;
        report.push((kind, ledger_sum, *state.reserve.get(kind)));
    }
    Ok(report)
}
