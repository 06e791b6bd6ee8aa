//! Execution recorder: at-most-once order placement
//!
//! Every order attempt is keyed by a deduplication identifier that is
//! deterministic in its inputs (schedule id + firing slot, or transition +
//! exchange + direction). The record is written `pending` BEFORE the order
//! goes out and updated to `filled`/`failed` after. Reserve-then-execute is
//! what makes a retried tick or a process restart unable to double-place.
//!
//! A key collision is success, not an error: the existing record's outcome is
//! returned, no order is placed, and no ledger mutation happens downstream.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::future::Future;
use std::path::Path;

use crate::errors::DcaBotError;
use crate::exchanges::{ExchangeError, ExchangeKind, OrderResult};
use crate::logger::{self, LogTag};
use crate::paths;

// =============================================================================
// DATABASE SCHEMA DEFINITIONS
// =============================================================================

const SCHEMA_EXECUTION_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS execution_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dedupe_key TEXT NOT NULL UNIQUE,
    exchange TEXT NOT NULL,
    side TEXT NOT NULL, -- 'buy' or 'sell'
    symbol TEXT NOT NULL,
    requested_amount REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending', -- 'pending', 'filled', 'failed'
    order_id TEXT,
    filled_quantity REAL,
    avg_price REAL,
    fee REAL,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_execution_records_status ON execution_records(status, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_execution_records_exchange ON execution_records(exchange, created_at DESC);
"#;

// =============================================================================
// DATA STRUCTURES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Filled,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Filled => "filled",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> ExecutionStatus {
        match s {
            "filled" => ExecutionStatus::Filled,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// One attempted order
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: i64,
    pub dedupe_key: String,
    pub exchange: ExchangeKind,
    pub side: String,
    pub symbol: String,
    pub requested_amount: f64,
    pub status: ExecutionStatus,
    pub order_id: Option<String>,
    pub filled_quantity: Option<f64>,
    pub avg_price: Option<f64>,
    pub fee: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an at-most-once execution attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The order was placed by this call
    Executed(OrderResult),
    /// The dedupe key was already handled; here is what happened then
    AlreadyHandled(ExecutionRecord),
}

// =============================================================================
// EXECUTIONS DATABASE
// =============================================================================

/// Global execution records database handle
pub static EXECUTIONS_DB: Lazy<ExecutionsDb> = Lazy::new(|| {
    ExecutionsDb::open(paths::get_executions_db_path())
        .expect("Failed to open executions database")
});

pub struct ExecutionsDb {
    conn: Mutex<Connection>,
}

impl ExecutionsDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| format!("Failed to open executions db: {}", e))?;
        Self::init(conn)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open in-memory executions db: {}", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 30000;
        ",
        )
        .map_err(|e| format!("Failed to set pragmas: {}", e))?;
        conn.execute_batch(SCHEMA_EXECUTION_RECORDS)
            .map_err(|e| format!("Failed to create execution_records table: {}", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Reserve a dedupe key. Returns None when the insert won (this caller
    /// should proceed to place the order), or the existing record when the
    /// key was already taken.
    pub fn try_begin(
        &self,
        dedupe_key: &str,
        exchange: ExchangeKind,
        side: OrderSide,
        symbol: &str,
        requested_amount: f64,
    ) -> Result<Option<ExecutionRecord>, DcaBotError> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO execution_records
                (dedupe_key, exchange, side, symbol, requested_amount, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
            params![
                dedupe_key,
                exchange.as_str(),
                side.as_str(),
                symbol,
                requested_amount,
                now,
            ],
        )?;
        if inserted == 1 {
            return Ok(None);
        }
        let existing = Self::get_conn(&conn, dedupe_key)?;
        Ok(existing)
    }

    /// Mark a pending record as filled with the venue's fill details
    pub fn mark_filled(&self, dedupe_key: &str, order: &OrderResult) -> Result<(), DcaBotError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE execution_records SET
                status = 'filled',
                order_id = ?2,
                filled_quantity = ?3,
                avg_price = ?4,
                fee = ?5,
                updated_at = ?6
             WHERE dedupe_key = ?1",
            params![
                dedupe_key,
                order.order_id,
                order.filled_quantity,
                order.avg_price,
                order.fee,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Mark a pending record as failed with the error text
    pub fn mark_failed(&self, dedupe_key: &str, error: &str) -> Result<(), DcaBotError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE execution_records SET
                status = 'failed',
                error = ?2,
                updated_at = ?3
             WHERE dedupe_key = ?1",
            params![dedupe_key, error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ExecutionRecord> {
        let status: String = row.get("status")?;
        let exchange: String = row.get("exchange")?;
        let created_at: String = row.get("created_at")?;
        Ok(ExecutionRecord {
            id: row.get("id")?,
            dedupe_key: row.get("dedupe_key")?,
            exchange: ExchangeKind::from_str(&exchange).unwrap_or(ExchangeKind::Binance),
            side: row.get("side")?,
            symbol: row.get("symbol")?,
            requested_amount: row.get("requested_amount")?,
            status: ExecutionStatus::from_str(&status),
            order_id: row.get("order_id")?,
            filled_quantity: row.get("filled_quantity")?,
            avg_price: row.get("avg_price")?,
            fee: row.get("fee")?,
            error: row.get("error")?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    fn get_conn(conn: &Connection, dedupe_key: &str) -> Result<Option<ExecutionRecord>, DcaBotError> {
        let record = conn
            .query_row(
                "SELECT * FROM execution_records WHERE dedupe_key = ?1",
                params![dedupe_key],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Look up a record by dedupe key
    pub fn get(&self, dedupe_key: &str) -> Result<Option<ExecutionRecord>, DcaBotError> {
        let conn = self.conn.lock();
        Self::get_conn(&conn, dedupe_key)
    }

    /// Most recent records, newest first (dashboards/export)
    pub fn recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>, DcaBotError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM execution_records ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

// =============================================================================
// AT-MOST-ONCE EXECUTION WRAPPER
// =============================================================================

/// Place an order at most once for a dedupe key.
///
/// The pending record is written first; only the caller that wins that write
/// talks to the venue. Everyone else gets `AlreadyHandled` with the recorded
/// outcome, including `failed` ones, which stay terminal for their key.
pub async fn execute_once<F, Fut>(
    db: &ExecutionsDb,
    dedupe_key: &str,
    exchange: ExchangeKind,
    side: OrderSide,
    symbol: &str,
    requested_amount: f64,
    place_order: F,
) -> Result<ExecutionOutcome, DcaBotError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<OrderResult, ExchangeError>>,
{
    if let Some(existing) =
        db.try_begin(dedupe_key, exchange, side, symbol, requested_amount)?
    {
        logger::info(
            LogTag::Executor,
            &format!(
                "dedupe hit for {} ({}), returning recorded outcome",
                dedupe_key,
                existing.status.as_str()
            ),
        );
        return Ok(ExecutionOutcome::AlreadyHandled(existing));
    }

    match place_order().await {
        Ok(order) => {
            db.mark_filled(dedupe_key, &order)?;
            logger::info(
                LogTag::Executor,
                &format!(
                    "{} {} {} filled: qty={:.8} avg={:.2} (key {})",
                    exchange,
                    side.as_str(),
                    symbol,
                    order.filled_quantity,
                    order.avg_price,
                    dedupe_key
                ),
            );
            Ok(ExecutionOutcome::Executed(order))
        }
        Err(e) => {
            db.mark_failed(dedupe_key, &e.to_string())?;
            logger::error(
                LogTag::Executor,
                &format!("{} {} {} failed (key {}): {}", exchange, side.as_str(), symbol, dedupe_key, e),
            );
            Err(DcaBotError::Exchange(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> ExecutionsDb {
        ExecutionsDb::open_in_memory().unwrap()
    }

    fn fill() -> OrderResult {
        OrderResult {
            order_id: "42".to_string(),
            filled_quantity: 0.002,
            filled_quote: 100.0,
            avg_price: 50_000.0,
            fee: 0.1,
        }
    }

    #[test]
    fn test_try_begin_wins_once() {
        let db = db();
        let first = db
            .try_begin("k1", ExchangeKind::Binance, OrderSide::Buy, "BTCUSDT", 100.0)
            .unwrap();
        assert!(first.is_none());

        let second = db
            .try_begin("k1", ExchangeKind::Binance, OrderSide::Buy, "BTCUSDT", 100.0)
            .unwrap();
        let record = second.expect("second begin must observe the existing record");
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.requested_amount, 100.0);
    }

    #[tokio::test]
    async fn test_execute_once_places_single_order() {
        let db = db();
        let mut placements = 0;

        for _ in 0..3 {
            let outcome = execute_once(
                &db,
                "weekly-dca:7:2026-08-07:binance",
                ExchangeKind::Binance,
                OrderSide::Buy,
                "BTCUSDT",
                100.0,
                || {
                    placements += 1;
                    async { Ok(fill()) }
                },
            )
            .await
            .unwrap();

            match outcome {
                ExecutionOutcome::Executed(order) => assert_eq!(order.order_id, "42"),
                ExecutionOutcome::AlreadyHandled(record) => {
                    assert_eq!(record.status, ExecutionStatus::Filled);
                    assert_eq!(record.order_id.as_deref(), Some("42"));
                }
            }
        }
        assert_eq!(placements, 1, "replays must not place more orders");
    }

    #[tokio::test]
    async fn test_failed_outcome_is_terminal_for_key() {
        let db = db();
        let err = execute_once(
            &db,
            "k-fail",
            ExchangeKind::Okx,
            OrderSide::Buy,
            "BTC-USDT",
            50.0,
            || async {
                Err(ExchangeError::Venue {
                    exchange: "okx".to_string(),
                    message: "rejected".to_string(),
                })
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DcaBotError::Exchange(_)));

        // Retry with the same key: recorded failure comes back, closure not called
        let outcome = execute_once(
            &db,
            "k-fail",
            ExchangeKind::Okx,
            OrderSide::Buy,
            "BTC-USDT",
            50.0,
            || async { panic!("must not place a second order") },
        )
        .await
        .unwrap();
        match outcome {
            ExecutionOutcome::AlreadyHandled(record) => {
                assert_eq!(record.status, ExecutionStatus::Failed);
                assert!(record.error.unwrap().contains("rejected"));
            }
            other => panic!("expected AlreadyHandled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_record_blocks_retry_after_crash() {
        // Simulates a crash between order placement and the filled update:
        // the pending record survives and the retry is treated as handled.
        let db = db();
        db.try_begin("k-crash", ExchangeKind::Binance, OrderSide::Sell, "BTCUSDT", 0.05)
            .unwrap();

        let outcome = execute_once(
            &db,
            "k-crash",
            ExchangeKind::Binance,
            OrderSide::Sell,
            "BTCUSDT",
            0.05,
            || async { panic!("must not re-place an in-flight order") },
        )
        .await
        .unwrap();
        match outcome {
            ExecutionOutcome::AlreadyHandled(record) => {
                assert_eq!(record.status, ExecutionStatus::Pending)
            }
            other => panic!("expected AlreadyHandled, got {:?}", other),
        }
    }

    #[test]
    fn test_recent_returns_newest_first() {
        let db = db();
        for i in 0..5 {
            db.try_begin(
                &format!("k{}", i),
                ExchangeKind::Binance,
                OrderSide::Buy,
                "BTCUSDT",
                10.0 * i as f64,
            )
            .unwrap();
        }
        let recent = db.recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].dedupe_key, "k4");
    }
}
