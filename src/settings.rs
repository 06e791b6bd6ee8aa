//! Runtime configuration loaded from config.toml
//!
//! Follows the same shape as the rest of the data directory: the file lives at
//! `<data>/config.toml` and is read once into a lazy static. Exchange
//! credentials can be supplied in the file or overridden through environment
//! variables (`BINANCE_API_KEY`, `OKX_API_KEY`, ...), which always win.

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::paths;

/// Global settings singleton, loaded on first access
pub static SETTINGS: Lazy<Settings> = Lazy::new(|| Settings::load());

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub strategy: StrategySettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub binance: ExchangeCredentials,
    #[serde(default)]
    pub okx: ExchangeCredentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategySettings {
    /// Trading pair the signal engine watches
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Candle interval for the trend signal
    #[serde(default = "default_interval")]
    pub candle_interval: String,
    /// Number of candles fetched per signal evaluation
    #[serde(default = "default_lookback")]
    pub candle_lookback: usize,
    /// IANA timezone name for schedule matching (the admin surface configures
    /// schedule times in this zone)
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Venue used by schedules in "global" routing mode
    #[serde(default = "default_exchange")]
    pub default_exchange: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Scheduler tick interval (seconds)
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Schedule registry cache refresh interval (seconds)
    #[serde(default = "default_cache_refresh_secs")]
    pub cache_refresh_secs: u64,
    /// Trend transition check interval (seconds)
    #[serde(default = "default_transition_check_secs")]
    pub transition_check_secs: u64,
    /// Firing tolerance window around a schedule's configured time (seconds)
    #[serde(default = "default_fire_tolerance_secs")]
    pub fire_tolerance_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSettings {
    /// Paper trading: fabricate fills at the live price, never submit orders.
    /// The --paper command-line flag also enables this.
    #[serde(default)]
    pub paper: bool,
    /// HTTP timeout for exchange calls (seconds)
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Bounded retry attempts for exchange calls
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Bounded retry attempts for strategy-state version conflicts
    #[serde(default = "default_state_update_attempts")]
    pub state_update_max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExchangeCredentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// OKX-only API passphrase
    #[serde(default)]
    pub passphrase: String,
    /// Route orders to the venue's demo/testnet environment
    #[serde(default)]
    pub testnet: bool,
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}
fn default_interval() -> String {
    "1d".to_string()
}
fn default_lookback() -> usize {
    300
}
fn default_timezone() -> String {
    "Asia/Bangkok".to_string()
}
fn default_exchange() -> String {
    "binance".to_string()
}
fn default_tick_secs() -> u64 {
    10
}
fn default_cache_refresh_secs() -> u64 {
    300
}
fn default_transition_check_secs() -> u64 {
    60
}
fn default_fire_tolerance_secs() -> i64 {
    15
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_state_update_attempts() -> u32 {
    5
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            candle_interval: default_interval(),
            candle_lookback: default_lookback(),
            timezone: default_timezone(),
            default_exchange: default_exchange(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            cache_refresh_secs: default_cache_refresh_secs(),
            transition_check_secs: default_transition_check_secs(),
            fire_tolerance_secs: default_fire_tolerance_secs(),
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            paper: false,
            http_timeout_secs: default_http_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            state_update_max_attempts: default_state_update_attempts(),
        }
    }
}

impl Settings {
    /// Load settings from config.toml, falling back to defaults when the file
    /// is absent or unreadable. Malformed files are an error the operator has
    /// to see, not something to silently paper over.
    fn load() -> Settings {
        let path = paths::get_config_path();
        let mut settings = match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str::<Settings>(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    eprintln!("Failed to parse {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            },
            Err(_) => Settings::default(),
        };
        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BINANCE_API_KEY") {
            self.binance.api_key = v;
        }
        if let Ok(v) = std::env::var("BINANCE_API_SECRET") {
            self.binance.api_secret = v;
        }
        if let Ok(v) = std::env::var("OKX_API_KEY") {
            self.okx.api_key = v;
        }
        if let Ok(v) = std::env::var("OKX_API_SECRET") {
            self.okx.api_secret = v;
        }
        if let Ok(v) = std::env::var("OKX_PASSPHRASE") {
            self.okx.passphrase = v;
        }
    }

    /// Paper mode is on when either the config file or the --paper flag says so
    pub fn is_paper_mode(&self) -> bool {
        self.execution.paper || crate::arguments::is_paper_enabled()
    }

    /// Resolve the configured timezone, falling back to UTC on a bad name
    pub fn timezone(&self) -> chrono_tz::Tz {
        self.strategy.timezone.parse().unwrap_or(chrono_tz::Tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_cadences() {
        let s = Settings::default();
        assert_eq!(s.scheduler.tick_secs, 10);
        assert_eq!(s.scheduler.cache_refresh_secs, 300);
        assert_eq!(s.scheduler.transition_check_secs, 60);
        assert_eq!(s.scheduler.fire_tolerance_secs, 15);
        assert_eq!(s.strategy.candle_lookback, 300);
        assert_eq!(s.strategy.symbol, "BTCUSDT");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: Settings = toml::from_str(
            r#"
            [strategy]
            symbol = "ETHUSDT"

            [execution]
            paper = true
            "#,
        )
        .expect("partial config should parse");
        assert_eq!(parsed.strategy.symbol, "ETHUSDT");
        assert_eq!(parsed.strategy.candle_lookback, 300);
        assert!(parsed.execution.paper);
        assert_eq!(parsed.execution.http_timeout_secs, 30);
    }

    #[test]
    fn test_bad_timezone_falls_back_to_utc() {
        let mut s = Settings::default();
        s.strategy.timezone = "Not/AZone".to_string();
        assert_eq!(s.timezone(), chrono_tz::Tz::UTC);
    }
}
