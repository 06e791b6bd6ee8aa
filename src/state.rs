//! Strategy state: the versioned singleton aggregate
//!
//! One row holds the trend gate's switches, the last observed signal, the
//! red-epoch guard and the per-exchange reserve/risk settings. Every mutation
//! goes through compare-and-swap on the row version: a writer reads the
//! current state, computes the new one, and commits only if nobody else wrote
//! in between. The admin surface shares this path, so a manual toggle racing
//! the scheduler costs a retry, never a lost update.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::errors::{DcaBotError, StateError};
use crate::exchanges::ExchangeKind;
use crate::logger::{self, LogTag};
use crate::paths;
use crate::settings::SETTINGS;
use crate::signal::CdcStatus;

// =============================================================================
// DATABASE SCHEMA DEFINITIONS
// =============================================================================

const SCHEMA_STRATEGY_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS strategy_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL DEFAULT 0,
    cdc_enabled INTEGER NOT NULL DEFAULT 1,
    last_signal TEXT NOT NULL DEFAULT 'unknown',
    red_epoch_active INTEGER NOT NULL DEFAULT 0,
    reserve_binance REAL NOT NULL DEFAULT 0,
    reserve_okx REAL NOT NULL DEFAULT 0,
    sell_fraction_binance INTEGER NOT NULL DEFAULT 50,
    sell_fraction_okx INTEGER NOT NULL DEFAULT 50,
    max_order_cap_binance REAL NOT NULL DEFAULT 0,
    max_order_cap_okx REAL NOT NULL DEFAULT 0,
    last_transition_at TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

const SCHEMA_RESERVE_LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS reserve_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_time TEXT NOT NULL,
    exchange TEXT NOT NULL,
    delta REAL NOT NULL,
    reserve_after REAL NOT NULL,
    reason TEXT NOT NULL,
    note TEXT,
    correlation_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_reserve_ledger_exchange ON reserve_ledger(exchange, event_time DESC);
"#;

const SCHEMA_FIRED_SLOTS: &str = r#"
CREATE TABLE IF NOT EXISTS fired_slots (
    schedule_id INTEGER NOT NULL,
    slot TEXT NOT NULL,
    fired_at TEXT NOT NULL,
    PRIMARY KEY (schedule_id, slot)
);
"#;

// =============================================================================
// DATA STRUCTURES
// =============================================================================

/// A value held once per supported venue
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PerExchange<T> {
    pub binance: T,
    pub okx: T,
}

impl<T> PerExchange<T> {
    pub fn get(&self, kind: ExchangeKind) -> &T {
        match kind {
            ExchangeKind::Binance => &self.binance,
            ExchangeKind::Okx => &self.okx,
        }
    }

    pub fn get_mut(&mut self, kind: ExchangeKind) -> &mut T {
        match kind {
            ExchangeKind::Binance => &mut self.binance,
            ExchangeKind::Okx => &mut self.okx,
        }
    }
}

/// The singleton strategy aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyState {
    /// Monotonically increasing row version for optimistic concurrency
    pub version: i64,
    /// Master switch: false means every scheduled purchase executes in full
    pub cdc_enabled: bool,
    /// Last observed trend classification
    pub last_signal: CdcStatus,
    /// Guards against re-liquidating while the signal stays bearish
    pub red_epoch_active: bool,
    /// Cached per-exchange reserve balances; the ledger is the audit trail
    pub reserve: PerExchange<f64>,
    /// Percentage of held base asset liquidated on a bearish flip (0-100)
    pub sell_fraction_pct: PerExchange<u32>,
    /// Per-order quote cap for reserve redeployment; 0 disables the cap
    pub max_order_cap: PerExchange<f64>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl Default for StrategyState {
    fn default() -> Self {
        Self {
            version: 0,
            cdc_enabled: true,
            last_signal: CdcStatus::Unknown,
            red_epoch_active: false,
            reserve: PerExchange::default(),
            sell_fraction_pct: PerExchange {
                binance: 50,
                okx: 50,
            },
            max_order_cap: PerExchange::default(),
            last_transition_at: None,
        }
    }
}

// =============================================================================
// STRATEGY DATABASE
// =============================================================================

/// Global strategy database handle
pub static STRATEGY_DB: Lazy<StrategyDb> = Lazy::new(|| {
    StrategyDb::open(paths::get_strategy_db_path()).expect("Failed to open strategy database")
});

/// Handle over strategy.db: state row, reserve ledger and fired-slot markers.
///
/// The connection mutex serializes every mutation in-process; the version CAS
/// protects against the external admin surface writing the same file.
pub struct StrategyDb {
    pub(crate) conn: Mutex<Connection>,
}

impl StrategyDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| format!("Failed to open strategy db: {}", e))?;
        Self::init(conn)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open in-memory strategy db: {}", e))?;
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

        conn.execute_batch(SCHEMA_STRATEGY_STATE)
            .map_err(|e| format!("Failed to create strategy_state table: {}", e))?;
        conn.execute_batch(SCHEMA_RESERVE_LEDGER)
            .map_err(|e| format!("Failed to create reserve_ledger table: {}", e))?;
        conn.execute_batch(SCHEMA_FIRED_SLOTS)
            .map_err(|e| format!("Failed to create fired_slots table: {}", e))?;

        // Seed the singleton row so CAS updates always have something to match
        conn.execute(
            "INSERT OR IGNORE INTO strategy_state (id) VALUES (1)",
            [],
        )
        .map_err(|e| format!("Failed to seed strategy_state: {}", e))?;

        logger::debug(LogTag::Database, "Strategy database initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<StrategyState> {
        let last_signal: String = row.get("last_signal")?;
        let last_transition_at: Option<String> = row.get("last_transition_at")?;
        Ok(StrategyState {
            version: row.get("version")?,
            cdc_enabled: row.get::<_, i64>("cdc_enabled")? != 0,
            last_signal: CdcStatus::from_str(&last_signal),
            red_epoch_active: row.get::<_, i64>("red_epoch_active")? != 0,
            reserve: PerExchange {
                binance: row.get("reserve_binance")?,
                okx: row.get("reserve_okx")?,
            },
            sell_fraction_pct: PerExchange {
                binance: row.get::<_, i64>("sell_fraction_binance")?.max(0) as u32,
                okx: row.get::<_, i64>("sell_fraction_okx")?.max(0) as u32,
            },
            max_order_cap: PerExchange {
                binance: row.get("max_order_cap_binance")?,
                okx: row.get("max_order_cap_okx")?,
            },
            last_transition_at: last_transition_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    /// Load the current strategy state
    pub fn load_state(&self) -> Result<StrategyState, DcaBotError> {
        let conn = self.conn.lock();
        Self::read_state_conn(&conn)
    }

    /// Read the state row through an existing connection/transaction
    pub(crate) fn read_state_conn(conn: &Connection) -> Result<StrategyState, DcaBotError> {
        let state = conn
            .query_row("SELECT * FROM strategy_state WHERE id = 1", [], Self::row_to_state)
            .optional()?;
        state.ok_or(DcaBotError::State(StateError::NotInitialized))
    }

    /// Write `state` conditionally on `expected_version` still being current.
    /// Returns false when another writer won the race.
    pub(crate) fn try_write_state(
        conn: &Connection,
        state: &StrategyState,
        expected_version: i64,
    ) -> Result<bool, DcaBotError> {
        let updated = conn.execute(
            "UPDATE strategy_state SET
                version = version + 1,
                cdc_enabled = ?1,
                last_signal = ?2,
                red_epoch_active = ?3,
                reserve_binance = ?4,
                reserve_okx = ?5,
                sell_fraction_binance = ?6,
                sell_fraction_okx = ?7,
                max_order_cap_binance = ?8,
                max_order_cap_okx = ?9,
                last_transition_at = ?10,
                updated_at = datetime('now')
             WHERE id = 1 AND version = ?11",
            params![
                state.cdc_enabled as i64,
                state.last_signal.as_str(),
                state.red_epoch_active as i64,
                state.reserve.binance,
                state.reserve.okx,
                state.sell_fraction_pct.binance as i64,
                state.sell_fraction_pct.okx as i64,
                state.max_order_cap.binance,
                state.max_order_cap.okx,
                state.last_transition_at.map(|dt| dt.to_rfc3339()),
                expected_version,
            ],
        )?;
        Ok(updated == 1)
    }

    /// Apply `mutate` to the current state under optimistic concurrency.
    ///
    /// On a version conflict the whole read-mutate-write cycle is retried a
    /// bounded number of times, then surfaced as an error.
    pub fn update_state<F>(&self, mutate: F) -> Result<StrategyState, DcaBotError>
    where
        F: Fn(&mut StrategyState),
    {
        let max_attempts = SETTINGS.execution.state_update_max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let mut state = self.load_state()?;
            let expected_version = state.version;
            mutate(&mut state);

            let conn = self.conn.lock();
            if Self::try_write_state(&conn, &state, expected_version)? {
                state.version = expected_version + 1;
                return Ok(state);
            }
            drop(conn);

            logger::debug(
                LogTag::Database,
                &format!(
                    "strategy_state version conflict (attempt {}/{})",
                    attempt, max_attempts
                ),
            );
        }
        Err(DcaBotError::State(StateError::VersionConflict {
            attempts: max_attempts,
        }))
    }

    // =========================================================================
    // ADMIN SURFACE OPERATIONS
    // All external toggles go through the same CAS path as the scheduler.
    // =========================================================================

    /// Toggle trend gating on or off
    pub fn set_cdc_enabled(&self, enabled: bool) -> Result<StrategyState, DcaBotError> {
        self.update_state(|s| s.cdc_enabled = enabled)
    }

    /// Adjust the liquidation fraction for one exchange (clamped to 0-100)
    pub fn set_sell_fraction(
        &self,
        exchange: ExchangeKind,
        pct: u32,
    ) -> Result<StrategyState, DcaBotError> {
        let pct = pct.min(100);
        self.update_state(move |s| *s.sell_fraction_pct.get_mut(exchange) = pct)
    }

    /// Adjust the per-order redeploy cap for one exchange (0 = uncapped)
    pub fn set_max_order_cap(
        &self,
        exchange: ExchangeKind,
        cap: f64,
    ) -> Result<StrategyState, DcaBotError> {
        let cap = cap.max(0.0);
        self.update_state(move |s| *s.max_order_cap.get_mut(exchange) = cap)
    }

    // =========================================================================
    // FIRED SLOT MARKERS
    // =========================================================================

    /// Record a schedule firing for a slot. Returns true exactly once per
    /// (schedule, slot): the marker is persisted, so a restart within the
    /// same slot cannot re-fire.
    pub fn mark_slot_fired(&self, schedule_id: i64, slot: &str) -> Result<bool, DcaBotError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO fired_slots (schedule_id, slot, fired_at) VALUES (?1, ?2, ?3)",
            params![schedule_id, slot, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted == 1)
    }

    /// Check whether a slot has already fired
    pub fn was_slot_fired(&self, schedule_id: i64, slot: &str) -> Result<bool, DcaBotError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fired_slots WHERE schedule_id = ?1 AND slot = ?2",
            params![schedule_id, slot],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state_has_defaults() {
        let db = StrategyDb::open_in_memory().unwrap();
        let state = db.load_state().unwrap();
        assert_eq!(state.version, 0);
        assert!(state.cdc_enabled);
        assert_eq!(state.last_signal, CdcStatus::Unknown);
        assert!(!state.red_epoch_active);
        assert_eq!(state.reserve.binance, 0.0);
        assert_eq!(state.sell_fraction_pct.okx, 50);
    }

    #[test]
    fn test_update_state_bumps_version() {
        let db = StrategyDb::open_in_memory().unwrap();
        let updated = db.update_state(|s| s.cdc_enabled = false).unwrap();
        assert_eq!(updated.version, 1);
        assert!(!updated.cdc_enabled);

        let reloaded = db.load_state().unwrap();
        assert_eq!(reloaded.version, 1);
        assert!(!reloaded.cdc_enabled);
    }

    #[test]
    fn test_stale_version_write_is_rejected() {
        let db = StrategyDb::open_in_memory().unwrap();
        let state = db.load_state().unwrap();

        // Another writer commits first
        db.update_state(|s| s.red_epoch_active = true).unwrap();

        let conn = db.conn.lock();
        let wrote = StrategyDb::try_write_state(&conn, &state, state.version).unwrap();
        assert!(!wrote, "write against a stale version must be rejected");
    }

    #[test]
    fn test_cas_retries_through_interference() {
        // update_state re-reads on conflict, so a mutation applied on top of
        // someone else's commit still lands
        let db = StrategyDb::open_in_memory().unwrap();
        db.update_state(|s| *s.reserve.get_mut(ExchangeKind::Binance) = 75.0)
            .unwrap();
        db.update_state(|s| s.cdc_enabled = false).unwrap();

        let state = db.load_state().unwrap();
        assert_eq!(state.reserve.binance, 75.0);
        assert!(!state.cdc_enabled);
        assert_eq!(state.version, 2);
    }

    #[test]
    fn test_admin_setters_clamp_inputs() {
        let db = StrategyDb::open_in_memory().unwrap();
        let state = db.set_sell_fraction(ExchangeKind::Okx, 150).unwrap();
        assert_eq!(state.sell_fraction_pct.okx, 100);

        let state = db.set_max_order_cap(ExchangeKind::Binance, -5.0).unwrap();
        assert_eq!(state.max_order_cap.binance, 0.0);
    }

    #[test]
    fn test_slot_fires_at_most_once() {
        let db = StrategyDb::open_in_memory().unwrap();
        assert!(db.mark_slot_fired(7, "2026-08-07 09:00").unwrap());
        assert!(!db.mark_slot_fired(7, "2026-08-07 09:00").unwrap());
        assert!(db.was_slot_fired(7, "2026-08-07 09:00").unwrap());

        // A different slot for the same schedule fires independently
        assert!(db.mark_slot_fired(7, "2026-08-14 09:00").unwrap());
    }

    #[test]
    fn test_last_signal_round_trips() {
        let db = StrategyDb::open_in_memory().unwrap();
        db.update_state(|s| s.last_signal = CdcStatus::Bearish).unwrap();
        assert_eq!(db.load_state().unwrap().last_signal, CdcStatus::Bearish);
    }

    #[test]
    fn test_fired_slots_survive_reopen() {
        // Process restart within the same slot must not allow a re-fire
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("strategy.db");

        {
            let db = StrategyDb::open(&path).unwrap();
            assert!(db.mark_slot_fired(3, "2026-08-07 09:00").unwrap());
            db.update_state(|s| s.red_epoch_active = true).unwrap();
        }

        let reopened = StrategyDb::open(&path).unwrap();
        assert!(!reopened.mark_slot_fired(3, "2026-08-07 09:00").unwrap());
        assert!(reopened.load_state().unwrap().red_epoch_active);
    }
}
