//! Schedule registry: cadence entries owned by the external admin surface
//!
//! The core reads active entries into an in-memory cache refreshed every few
//! minutes and never writes them (marking fired slots lives in the strategy
//! database, not here). Entries are immutable during a firing evaluation:
//! the cache hands out clones.

use chrono::{DateTime, NaiveTime, Weekday};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::errors::DcaBotError;
use crate::exchanges::ExchangeKind;
use crate::logger::{self, LogTag};
use crate::paths;

// =============================================================================
// DATABASE SCHEMA DEFINITIONS
// =============================================================================

const SCHEMA_SCHEDULES: &str = r#"
CREATE TABLE IF NOT EXISTS schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_day TEXT NOT NULL, -- comma-separated weekday names
    schedule_time TEXT NOT NULL, -- 'HH:MM' in the configured timezone
    amount REAL NOT NULL,
    routing_mode TEXT NOT NULL DEFAULT 'global', -- 'global', 'binance', 'okx', 'split', 'auto_asset'
    split_binance_pct INTEGER, -- split mode: percentage routed to binance
    auto_asset_exchange TEXT, -- auto_asset mode: target venue
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

// =============================================================================
// DATA STRUCTURES
// =============================================================================

/// How a schedule's quote amount reaches the market
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoutingMode {
    /// The deployment's configured default exchange
    Global,
    /// An explicitly named exchange
    Named(ExchangeKind),
    /// Split across both venues; `binance_pct` percent to Binance, rest to OKX
    Split { binance_pct: u32 },
    /// Buy whichever candidate asset is currently held at the target venue
    AutoAsset(ExchangeKind),
}

/// One cadence entry: fire on the listed weekdays at the configured time
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub id: i64,
    pub days: Vec<Weekday>,
    pub time: NaiveTime,
    pub amount: f64,
    pub routing: RoutingMode,
}

impl ScheduleEntry {
    /// Return the slot key when `now` falls within the tolerance window of
    /// this entry's firing time on a configured weekday.
    ///
    /// The key ("YYYY-MM-DD HH:MM") names the scheduled slot, not the tick
    /// that matched it, so every tick inside the window maps to the same key.
    pub fn matching_slot(&self, now: DateTime<Tz>, tolerance_secs: i64) -> Option<String> {
        use chrono::{Datelike, Timelike};

        if !self.days.contains(&now.weekday()) {
            return None;
        }

        let now_secs = now.time().num_seconds_from_midnight() as i64;
        let slot_secs = self.time.num_seconds_from_midnight() as i64;
        let raw_diff = (now_secs - slot_secs).abs();
        let diff = raw_diff.min(86_400 - raw_diff);
        if diff > tolerance_secs {
            return None;
        }

        Some(format!(
            "{:04}-{:02}-{:02} {}",
            now.year(),
            now.month(),
            now.day(),
            self.time.format("%H:%M")
        ))
    }
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.trim().to_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

// =============================================================================
// SCHEDULES DATABASE
// =============================================================================

/// Global schedule registry handle
pub static SCHEDULES_DB: Lazy<SchedulesDb> = Lazy::new(|| {
    SchedulesDb::open(paths::get_schedules_db_path()).expect("Failed to open schedules database")
});

pub struct SchedulesDb {
    conn: Mutex<Connection>,
}

impl SchedulesDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| format!("Failed to open schedules db: {}", e))?;
        Self::init(conn)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open in-memory schedules db: {}", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 30000;
        ",
        )
        .map_err(|e| format!("Failed to set pragmas: {}", e))?;
        conn.execute_batch(SCHEMA_SCHEDULES)
            .map_err(|e| format!("Failed to create schedules table: {}", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Load every active schedule entry, skipping rows the admin surface
    /// saved with an unparseable day list or time.
    pub fn active_schedules(&self) -> Result<Vec<ScheduleEntry>, DcaBotError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, schedule_day, schedule_time, amount, routing_mode,
                    split_binance_pct, auto_asset_exchange
             FROM schedules WHERE is_active = 1 ORDER BY id",
        )?;

        let mut entries = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let day_list: String = row.get(1)?;
            let time_str: String = row.get(2)?;
            let amount: f64 = row.get(3)?;
            let mode: String = row.get(4)?;
            let split_pct: Option<i64> = row.get(5)?;
            let auto_exchange: Option<String> = row.get(6)?;

            let days: Vec<Weekday> = day_list.split(',').filter_map(parse_weekday).collect();
            let time = NaiveTime::parse_from_str(time_str.trim(), "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(time_str.trim(), "%H:%M:%S"))
                .ok();

            let routing = match mode.as_str() {
                "global" => Some(RoutingMode::Global),
                "binance" => Some(RoutingMode::Named(ExchangeKind::Binance)),
                "okx" => Some(RoutingMode::Named(ExchangeKind::Okx)),
                "split" => Some(RoutingMode::Split {
                    binance_pct: split_pct.unwrap_or(50).clamp(0, 100) as u32,
                }),
                "auto_asset" => Some(RoutingMode::AutoAsset(
                    auto_exchange
                        .as_deref()
                        .and_then(ExchangeKind::from_str)
                        .unwrap_or(ExchangeKind::Binance),
                )),
                _ => None,
            };

            match (days.is_empty(), time, routing) {
                (false, Some(time), Some(routing)) if amount > 0.0 => {
                    entries.push(ScheduleEntry {
                        id,
                        days,
                        time,
                        amount,
                        routing,
                    });
                }
                _ => {
                    logger::warning(
                        LogTag::Scheduler,
                        &format!(
                            "Skipping malformed schedule {} (days='{}', time='{}', mode='{}')",
                            id, day_list, time_str, mode
                        ),
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Insert a schedule row (admin tooling and tests; the core never calls this)
    pub fn insert_schedule(
        &self,
        days: &str,
        time: &str,
        amount: f64,
        routing_mode: &str,
        split_binance_pct: Option<u32>,
        auto_asset_exchange: Option<&str>,
    ) -> Result<i64, DcaBotError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO schedules
                (schedule_day, schedule_time, amount, routing_mode, split_binance_pct, auto_asset_exchange)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                days,
                time,
                amount,
                routing_mode,
                split_binance_pct.map(|p| p as i64),
                auto_asset_exchange,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

// =============================================================================
// IN-MEMORY REGISTRY CACHE
// =============================================================================

/// Periodically refreshed view of the active schedules.
///
/// A stale cache for up to the refresh interval is accepted; a failed refresh
/// keeps serving the previous entries.
pub struct ScheduleCache {
    entries: Vec<ScheduleEntry>,
    refreshed_at: Option<Instant>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            refreshed_at: None,
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        match self.refreshed_at {
            Some(at) => at.elapsed() >= ttl,
            None => true,
        }
    }

    pub fn refresh(&mut self, db: &SchedulesDb) -> Result<(), DcaBotError> {
        let entries = db.active_schedules()?;
        logger::info(
            LogTag::Scheduler,
            &format!("Schedule cache refreshed - {} active schedules", entries.len()),
        );
        self.entries = entries;
        self.refreshed_at = Some(Instant::now());
        Ok(())
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(days: Vec<Weekday>, time: &str) -> ScheduleEntry {
        ScheduleEntry {
            id: 1,
            days,
            time: NaiveTime::parse_from_str(time, "%H:%M").unwrap(),
            amount: 100.0,
            routing: RoutingMode::Global,
        }
    }

    fn bangkok(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Tz> {
        chrono_tz::Asia::Bangkok
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_slot_matches_within_tolerance() {
        // 2026-08-07 is a Friday
        let e = entry(vec![Weekday::Fri], "09:00");
        let slot = e.matching_slot(bangkok(2026, 8, 7, 9, 0, 12), 15);
        assert_eq!(slot.as_deref(), Some("2026-08-07 09:00"));
    }

    #[test]
    fn test_slot_rejects_outside_tolerance() {
        let e = entry(vec![Weekday::Fri], "09:00");
        assert!(e.matching_slot(bangkok(2026, 8, 7, 9, 0, 16), 15).is_none());
        assert!(e.matching_slot(bangkok(2026, 8, 7, 8, 59, 30), 15).is_none());
    }

    #[test]
    fn test_slot_rejects_wrong_weekday() {
        let e = entry(vec![Weekday::Mon], "09:00");
        assert!(e.matching_slot(bangkok(2026, 8, 7, 9, 0, 0), 15).is_none());
    }

    #[test]
    fn test_slot_key_is_stable_across_ticks_in_window() {
        let e = entry(vec![Weekday::Fri], "09:00");
        let a = e.matching_slot(bangkok(2026, 8, 7, 9, 0, 2), 15);
        let b = e.matching_slot(bangkok(2026, 8, 7, 9, 0, 12), 15);
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn test_midnight_wraparound_matches() {
        // Saturday 00:00:05 is within tolerance of a Saturday 00:00 slot
        let e = entry(vec![Weekday::Sat], "00:00");
        assert!(e.matching_slot(bangkok(2026, 8, 8, 0, 0, 5), 15).is_some());
    }

    #[test]
    fn test_active_schedules_parses_all_modes() {
        let db = SchedulesDb::open_in_memory().unwrap();
        db.insert_schedule("friday", "09:00", 100.0, "global", None, None).unwrap();
        db.insert_schedule("monday,thursday", "12:30", 80.0, "okx", None, None).unwrap();
        db.insert_schedule("sunday", "21:00", 200.0, "split", Some(70), None).unwrap();
        db.insert_schedule("tuesday", "08:15", 50.0, "auto_asset", None, Some("okx")).unwrap();

        let entries = db.active_schedules().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].routing, RoutingMode::Global);
        assert_eq!(entries[1].routing, RoutingMode::Named(ExchangeKind::Okx));
        assert_eq!(entries[1].days, vec![Weekday::Mon, Weekday::Thu]);
        assert_eq!(entries[2].routing, RoutingMode::Split { binance_pct: 70 });
        assert_eq!(entries[3].routing, RoutingMode::AutoAsset(ExchangeKind::Okx));
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let db = SchedulesDb::open_in_memory().unwrap();
        db.insert_schedule("someday", "09:00", 100.0, "global", None, None).unwrap();
        db.insert_schedule("friday", "not-a-time", 100.0, "global", None, None).unwrap();
        db.insert_schedule("friday", "09:00", 0.0, "global", None, None).unwrap();
        db.insert_schedule("friday", "09:00", 100.0, "kraken", None, None).unwrap();
        assert!(db.active_schedules().unwrap().is_empty());
    }

    #[test]
    fn test_cache_staleness_and_refresh() {
        let db = SchedulesDb::open_in_memory().unwrap();
        db.insert_schedule("friday", "09:00", 100.0, "global", None, None).unwrap();

        let mut cache = ScheduleCache::new();
        assert!(cache.is_stale(Duration::from_secs(300)));
        cache.refresh(&db).unwrap();
        assert!(!cache.is_stale(Duration::from_secs(300)));
        assert_eq!(cache.entries().len(), 1);
    }
}
