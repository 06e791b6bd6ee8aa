//! Trend signal engine (CDC fast/slow EMA crossover)
//!
//! Computes the canonical bullish/bearish classification from a window of
//! closed candles. The computation is pure: the same candle window always
//! yields the same classification, and the engine keeps no state of its own.
//! Transition detection is the caller's job (compare against
//! `StrategyState.last_signal`).

use chrono::Utc;
use parking_lot::RwLock;
use std::time::{Duration, Instant};

use crate::candles::{drop_unclosed, Candle, CandleSource};
use crate::errors::{DataError, DcaBotError};
use crate::logger::{self, LogTag};
use crate::settings::SETTINGS;

// =============================================================================
// SIGNAL CONFIGURATION CONSTANTS
// =============================================================================

/// Pre-smoothing EMA period. A period of 1 is a near-identity transform; the
/// two-stage structure is kept for parity with the reference signal trace.
pub const SMOOTHING_PERIOD: usize = 1;

/// Fast EMA period
pub const FAST_PERIOD: usize = 12;

/// Slow EMA period
pub const SLOW_PERIOD: usize = 26;

/// Minimum closed candles required for a meaningful classification
pub const MIN_CANDLES: usize = 50;

/// How long a fetched classification stays fresh before refetching
const STATUS_CACHE_TTL: Duration = Duration::from_secs(60);

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Trend classification on the last closed candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CdcStatus {
    Bullish,
    Bearish,
    /// No classification observed yet (fresh deployment)
    #[default]
    Unknown,
}

impl CdcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CdcStatus::Bullish => "bullish",
            CdcStatus::Bearish => "bearish",
            CdcStatus::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> CdcStatus {
        match s {
            "bullish" => CdcStatus::Bullish,
            "bearish" => CdcStatus::Bearish,
            _ => CdcStatus::Unknown,
        }
    }
}

impl std::fmt::Display for CdcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exponential moving average over a series, seeded with the first value.
///
/// A period <= 1 returns the series unchanged.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    if period <= 1 {
        return values.to_vec();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    out.push(prev);
    for &x in &values[1..] {
        prev = x * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

/// Classify a window of closed candles.
///
/// Bullish iff the fast EMA is above the slow EMA on the last candle.
/// Too-short windows are an error so the caller keeps its previous
/// classification instead of acting on noise.
pub fn classify(candles: &[Candle]) -> Result<CdcStatus, DcaBotError> {
    if candles.len() < MIN_CANDLES {
        return Err(DcaBotError::Data(DataError::Generic {
            message: format!(
                "signal window too short: {} candles, need {}",
                candles.len(),
                MIN_CANDLES
            ),
        }));
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let smoothed = ema(&closes, SMOOTHING_PERIOD);
    let fast = ema(&smoothed, FAST_PERIOD);
    let slow = ema(&smoothed, SLOW_PERIOD);

    let last = closes.len() - 1;
    let status = if fast[last] > slow[last] {
        CdcStatus::Bullish
    } else {
        CdcStatus::Bearish
    };

    logger::debug(
        LogTag::Signal,
        &format!(
            "classified {}: fast={:.2} slow={:.2} over {} candles",
            status, fast[last], slow[last], closes.len()
        ),
    );
    Ok(status)
}

// =============================================================================
// SIGNAL PROVIDER
// =============================================================================

/// Source of the current trend classification, seam for tests
#[async_trait::async_trait]
pub trait SignalProvider: Send + Sync {
    async fn current_status(&self) -> Result<CdcStatus, DcaBotError>;
}

struct CachedStatus {
    status: CdcStatus,
    fetched_at: Instant,
}

/// Live signal engine: fetches candles and classifies, serving a cached
/// result while it is younger than the cache TTL so the gate and the
/// transition check within the same minute share one market-data fetch. The
/// cache never feeds back into the classification itself.
pub struct SignalEngine {
    source: Box<dyn CandleSource>,
    cache: RwLock<Option<CachedStatus>>,
}

impl SignalEngine {
    pub fn new(source: Box<dyn CandleSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
        }
    }

    /// Drop the cached classification (manual refresh)
    pub fn invalidate_cache(&self) {
        *self.cache.write() = None;
    }
}

#[async_trait::async_trait]
impl SignalProvider for SignalEngine {
    async fn current_status(&self) -> Result<CdcStatus, DcaBotError> {
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.fetched_at.elapsed() < STATUS_CACHE_TTL {
                return Ok(cached.status);
            }
        }

        let candles = self
            .source
            .fetch_candles(
                &SETTINGS.strategy.symbol,
                &SETTINGS.strategy.candle_interval,
                SETTINGS.strategy.candle_lookback,
            )
            .await?;
        let closed = drop_unclosed(candles, Utc::now());
        let status = classify(&closed)?;

        *self.cache.write() = Some(CachedStatus {
            status,
            fetched_at: Instant::now(),
        });
        Ok(status)
    }
}

#[cfg(test)]
pub mod testkit {
    use super::*;

    /// Fixed classification, or a forced fetch failure
    pub struct FixedSignal(pub Result<CdcStatus, String>);

    impl FixedSignal {
        pub fn bullish() -> Self {
            FixedSignal(Ok(CdcStatus::Bullish))
        }

        pub fn bearish() -> Self {
            FixedSignal(Ok(CdcStatus::Bearish))
        }

        pub fn failing() -> Self {
            FixedSignal(Err("market data unavailable".to_string()))
        }
    }

    #[async_trait::async_trait]
    impl SignalProvider for FixedSignal {
        async fn current_status(&self) -> Result<CdcStatus, DcaBotError> {
            self.0.clone().map_err(DcaBotError::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::testkit::candles_from_closes;

    fn rising_closes(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    fn falling_closes(n: usize) -> Vec<f64> {
        (0..n).map(|i| 1000.0 - 5.0 * i as f64).collect()
    }

    #[test]
    fn test_ema_period_one_is_identity() {
        let values = vec![3.0, 1.0, 4.0, 1.5, 9.2];
        assert_eq!(ema(&values, 1), values);
    }

    #[test]
    fn test_ema_smooths_towards_recent_values() {
        let values = vec![10.0; 20]
            .into_iter()
            .chain(vec![20.0; 20])
            .collect::<Vec<f64>>();
        let smoothed = ema(&values, 12);
        let last = *smoothed.last().unwrap();
        assert!(last > 15.0 && last < 20.0, "last={}", last);
    }

    #[test]
    fn test_rising_market_classifies_bullish() {
        let candles = candles_from_closes(&rising_closes(300));
        assert_eq!(classify(&candles).unwrap(), CdcStatus::Bullish);
    }

    #[test]
    fn test_falling_market_classifies_bearish() {
        let candles = candles_from_closes(&falling_closes(300));
        assert_eq!(classify(&candles).unwrap(), CdcStatus::Bearish);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let mut closes = rising_closes(150);
        closes.extend(falling_closes(150));
        let candles = candles_from_closes(&closes);
        let first = classify(&candles).unwrap();
        for _ in 0..5 {
            assert_eq!(classify(&candles).unwrap(), first);
        }
    }

    #[test]
    fn test_short_window_is_an_error() {
        let candles = candles_from_closes(&rising_closes(MIN_CANDLES - 1));
        assert!(classify(&candles).is_err());
    }

    #[test]
    fn test_downtrend_reversal_flips_to_bullish() {
        // Long decline, then a strong recovery: fast EMA should cross above slow
        let mut closes = falling_closes(200);
        let bottom = *closes.last().unwrap();
        closes.extend((0..100).map(|i| bottom + 8.0 * i as f64));
        let candles = candles_from_closes(&closes);
        assert_eq!(classify(&candles).unwrap(), CdcStatus::Bullish);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [CdcStatus::Bullish, CdcStatus::Bearish, CdcStatus::Unknown] {
            assert_eq!(CdcStatus::from_str(status.as_str()), status);
        }
    }

    #[tokio::test]
    async fn test_engine_caches_between_calls() {
        use crate::candles::testkit::FixedCandleSource;

        let source = FixedCandleSource::new(candles_from_closes(&rising_closes(300)));
        let fetches_handle = std::sync::Arc::new(source);
        // Engine owns the source; observe fetch count through a second handle
        struct Shared(std::sync::Arc<FixedCandleSource>);
        #[async_trait::async_trait]
        impl crate::candles::CandleSource for Shared {
            async fn fetch_candles(
                &self,
                symbol: &str,
                interval: &str,
                limit: usize,
            ) -> Result<Vec<crate::candles::Candle>, crate::errors::DcaBotError> {
                self.0.fetch_candles(symbol, interval, limit).await
            }
        }

        let engine = SignalEngine::new(Box::new(Shared(fetches_handle.clone())));
        assert_eq!(engine.current_status().await.unwrap(), CdcStatus::Bullish);
        assert_eq!(engine.current_status().await.unwrap(), CdcStatus::Bullish);
        assert_eq!(fetches_handle.fetches(), 1, "second call must hit the cache");

        engine.invalidate_cache();
        engine.current_status().await.unwrap();
        assert_eq!(fetches_handle.fetches(), 2);
    }
}
