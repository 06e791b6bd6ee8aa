//! Closed-candle market data source for the signal engine
//!
//! One narrow fetch contract: return the most recent window of OHLC candles
//! for a symbol/interval. The live implementation reads Binance's public
//! klines endpoint; tests feed fixed windows straight into the signal engine.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::errors::{DataError, DcaBotError};
use crate::logger::{self, LogTag};
use crate::settings::SETTINGS;

/// One OHLC candle for a symbol+interval
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A candle is closed once its close time has passed
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.close_time <= now
    }
}

/// Narrow market-data fetch contract
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch the most recent `limit` candles, oldest first
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, DcaBotError>;
}

/// Drop the trailing candle when it has not closed yet.
///
/// The signal must never repaint: classifying a still-forming candle would
/// give different answers within the same bar.
pub fn drop_unclosed(mut candles: Vec<Candle>, now: DateTime<Utc>) -> Vec<Candle> {
    if let Some(last) = candles.last() {
        if !last.is_closed(now) {
            candles.pop();
        }
    }
    candles
}

// =============================================================================
// BINANCE PUBLIC KLINES SOURCE
// =============================================================================

/// Candle source backed by Binance's public market-data API (no auth needed)
pub struct BinanceCandleSource {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceCandleSource {
    pub fn new() -> Self {
        let timeout = Duration::from_secs(SETTINGS.execution.http_timeout_secs);
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: "https://api.binance.com".to_string(),
        }
    }

    /// Override the endpoint (testnet, local stub)
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let mut source = Self::new();
        source.base_url = base_url.into();
        source
    }

    fn parse_kline_row(row: &Value) -> Result<Candle, DcaBotError> {
        let arr = row.as_array().ok_or_else(|| {
            DcaBotError::Data(DataError::ParseError {
                data_type: "kline row".to_string(),
                error: "expected array".to_string(),
            })
        })?;
        if arr.len() < 7 {
            return Err(DcaBotError::Data(DataError::ParseError {
                data_type: "kline row".to_string(),
                error: format!("expected at least 7 fields, got {}", arr.len()),
            }));
        }

        let ms = |v: &Value| v.as_i64().unwrap_or(0);
        let num = |v: &Value| -> f64 {
            v.as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .or_else(|| v.as_f64())
                .unwrap_or(0.0)
        };

        Ok(Candle {
            open_time: Utc
                .timestamp_millis_opt(ms(&arr[0]))
                .single()
                .unwrap_or_else(|| Utc::now()),
            open: num(&arr[1]),
            high: num(&arr[2]),
            low: num(&arr[3]),
            close: num(&arr[4]),
            volume: num(&arr[5]),
            close_time: Utc
                .timestamp_millis_opt(ms(&arr[6]))
                .single()
                .unwrap_or_else(|| Utc::now()),
        })
    }
}

#[async_trait]
impl CandleSource for BinanceCandleSource {
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, DcaBotError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("interval", interval),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| DcaBotError::network_error(format!("klines request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DcaBotError::Network(crate::errors::NetworkError::HttpStatusError {
                endpoint: url.clone(),
                status: response.status().as_u16(),
            }));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| DcaBotError::Data(DataError::ParseError {
                data_type: "klines body".to_string(),
                error: e.to_string(),
            }))?;

        let rows = body.as_array().ok_or_else(|| {
            DcaBotError::Data(DataError::ParseError {
                data_type: "klines body".to_string(),
                error: "expected top-level array".to_string(),
            })
        })?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(Self::parse_kline_row(row)?);
        }

        logger::debug(
            LogTag::Signal,
            &format!("Fetched {} {} candles for {}", candles.len(), interval, symbol),
        );
        Ok(candles)
    }
}

#[cfg(test)]
pub mod testkit {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Candle source serving a fixed window, counting fetches
    pub struct FixedCandleSource {
        pub candles: Vec<Candle>,
        pub fetch_count: AtomicUsize,
    }

    impl FixedCandleSource {
        pub fn new(candles: Vec<Candle>) -> Self {
            Self {
                candles,
                fetch_count: AtomicUsize::new(0),
            }
        }

        pub fn fetches(&self) -> usize {
            self.fetch_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CandleSource for FixedCandleSource {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            _interval: &str,
            _limit: usize,
        ) -> Result<Vec<Candle>, DcaBotError> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            Ok(self.candles.clone())
        }
    }

    /// Build a daily candle series from close prices, ending `now`-aligned
    /// with every candle closed.
    pub fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let now = Utc::now();
        let n = closes.len() as i64;
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open_time = now - ChronoDuration::days(n - i as i64 + 1);
                Candle {
                    open_time,
                    close_time: open_time + ChronoDuration::days(1),
                    open: close,
                    high: close * 1.01,
                    low: close * 0.99,
                    close,
                    volume: 1.0,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_parse_kline_row_numeric_strings() {
        let row = serde_json::json!([
            1700000000000i64,
            "35000.10",
            "35500.00",
            "34800.00",
            "35210.55",
            "1234.5",
            1700086399999i64
        ]);
        let candle = BinanceCandleSource::parse_kline_row(&row).expect("row should parse");
        assert_eq!(candle.open, 35000.10);
        assert_eq!(candle.close, 35210.55);
        assert!(candle.close_time > candle.open_time);
    }

    #[test]
    fn test_parse_kline_row_rejects_short_rows() {
        let row = serde_json::json!([1700000000000i64, "1", "2"]);
        assert!(BinanceCandleSource::parse_kline_row(&row).is_err());
    }

    #[test]
    fn test_drop_unclosed_removes_forming_candle() {
        let now = Utc::now();
        let mut candles = testkit::candles_from_closes(&[1.0, 2.0, 3.0]);
        // Push a candle whose close time is in the future
        candles.push(Candle {
            open_time: now,
            close_time: now + ChronoDuration::days(1),
            open: 4.0,
            high: 4.0,
            low: 4.0,
            close: 4.0,
            volume: 1.0,
        });

        let closed = drop_unclosed(candles, now);
        assert_eq!(closed.len(), 3);
        assert_eq!(closed.last().unwrap().close, 3.0);
    }

    #[test]
    fn test_drop_unclosed_keeps_closed_series() {
        let now = Utc::now();
        let candles = testkit::candles_from_closes(&[1.0, 2.0, 3.0]);
        let closed = drop_unclosed(candles.clone(), now);
        assert_eq!(closed, candles);
    }
}
