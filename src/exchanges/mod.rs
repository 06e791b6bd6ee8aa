//! Exchange adapter layer
//!
//! One capability trait implemented per venue. The set of venues is a closed
//! enum: adding one means adding a variant and an adapter, never another
//! string comparison inside decision logic.
//!
//! Contract (enforced by every implementation, paper or live):
//! - A buy below the venue's minimum notional fails with `AmountTooSmall`,
//!   never silently clamped
//! - Quantities are rounded DOWN to the venue's quantity step before
//!   submission
//! - A request exceeding the free balance fails with `InsufficientBalance`
//!   and has no side effects
//! - Paper mode fabricates a plausible fill from the current price without
//!   submitting anything

pub mod binance;
pub mod okx;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::settings::SETTINGS;

// =============================================================================
// VENUE VARIANTS
// =============================================================================

/// The closed set of supported venues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    Okx,
}

impl ExchangeKind {
    pub const ALL: [ExchangeKind; 2] = [ExchangeKind::Binance, ExchangeKind::Okx];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Binance => "binance",
            ExchangeKind::Okx => "okx",
        }
    }

    pub fn from_str(s: &str) -> Option<ExchangeKind> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Some(ExchangeKind::Binance),
            "okx" => Some(ExchangeKind::Okx),
            _ => None,
        }
    }

    /// Venue-native spot symbol for the configured trading pair
    pub fn trade_symbol(&self) -> &'static str {
        match self {
            ExchangeKind::Binance => "BTCUSDT",
            ExchangeKind::Okx => "BTC-USDT",
        }
    }

    /// Base asset of the trading pair
    pub fn base_asset(&self) -> &'static str {
        "BTC"
    }

    /// Quote asset all amounts are denominated in
    pub fn quote_asset(&self) -> &'static str {
        "USDT"
    }

    /// Auto-asset routing candidates: (asset, venue symbol) pairs the gate
    /// can choose between at this venue
    pub fn auto_asset_candidates(&self) -> [(&'static str, &'static str); 2] {
        match self {
            ExchangeKind::Binance => [("BTC", "BTCUSDT"), ("PAXG", "PAXGUSDT")],
            ExchangeKind::Okx => [("BTC", "BTC-USDT"), ("XAUT", "XAUT-USDT")],
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// ADAPTER CONTRACT TYPES
// =============================================================================

/// Current price plus the venue's trading constraints for a symbol
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceAndFilters {
    pub price: f64,
    /// Smallest quote notional the venue accepts
    pub min_notional: f64,
    /// Quantity increment; submitted quantities must be multiples of this
    pub quantity_step: f64,
}

/// Result of a filled market order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub order_id: String,
    pub filled_quantity: f64,
    pub filled_quote: f64,
    pub avg_price: f64,
    pub fee: f64,
}

/// Adapter contract error set
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("amount {requested:.2} below min notional {min_notional:.2} for {symbol}")]
    AmountTooSmall {
        symbol: String,
        requested: f64,
        min_notional: f64,
    },

    #[error("insufficient {asset} balance: requested {requested:.8}, available {available:.8}")]
    InsufficientBalance {
        asset: String,
        requested: f64,
        available: f64,
    },

    #[error("authentication failed for {exchange}: {message}")]
    AuthFailed { exchange: String, message: String },

    #[error("{exchange} venue error: {message}")]
    Venue { exchange: String, message: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out")]
    Timeout,
}

impl ExchangeError {
    /// Signing/credential failures mark the adapter unhealthy for the tick;
    /// the scheduler keeps going on other venues.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ExchangeError::AuthFailed { .. })
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else {
            ExchangeError::Http(err.to_string())
        }
    }
}

// =============================================================================
// ADAPTER TRAIT
// =============================================================================

/// Uniform balance/price/order operations per venue
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Which venue this adapter talks to
    fn kind(&self) -> ExchangeKind;

    /// Free (unlocked) balance of an asset
    async fn get_free_balance(&self, asset: &str) -> Result<f64, ExchangeError>;

    /// Last price and trading constraints for a symbol
    async fn get_price_and_filters(&self, symbol: &str) -> Result<PriceAndFilters, ExchangeError>;

    /// Market buy sized in quote currency
    async fn place_market_buy_by_quote(
        &self,
        symbol: &str,
        quote_amount: f64,
    ) -> Result<OrderResult, ExchangeError>;

    /// Market sell sized in base quantity
    async fn place_market_sell_by_quantity(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<OrderResult, ExchangeError>;
}

// =============================================================================
// FACTORY
// =============================================================================

/// Build the adapter for a venue using global settings (credentials, paper mode)
pub fn get_adapter(kind: ExchangeKind) -> Arc<dyn ExchangeAdapter> {
    let paper = SETTINGS.is_paper_mode();
    match kind {
        ExchangeKind::Binance => Arc::new(binance::BinanceAdapter::new(
            SETTINGS.binance.clone(),
            paper,
        )),
        ExchangeKind::Okx => Arc::new(okx::OkxAdapter::new(SETTINGS.okx.clone(), paper)),
    }
}

/// Adapter lookup seam so decision code can run against mocks
pub trait AdapterFactory: Send + Sync {
    fn adapter(&self, kind: ExchangeKind) -> Arc<dyn ExchangeAdapter>;
}

/// Production factory backed by `get_adapter`
pub struct LiveAdapterFactory;

impl AdapterFactory for LiveAdapterFactory {
    fn adapter(&self, kind: ExchangeKind) -> Arc<dyn ExchangeAdapter> {
        get_adapter(kind)
    }
}

#[cfg(test)]
pub use mock::MockAdapterFactory;

/// Fabricate a paper fill at the current price, applying the same filter
/// checks a live order would get. Shared by both adapters' paper branches.
pub(crate) fn paper_buy_fill(
    symbol: &str,
    quote_amount: f64,
    filters: &PriceAndFilters,
) -> Result<OrderResult, ExchangeError> {
    if quote_amount < filters.min_notional {
        return Err(ExchangeError::AmountTooSmall {
            symbol: symbol.to_string(),
            requested: quote_amount,
            min_notional: filters.min_notional,
        });
    }
    let qty = crate::utils::floor_to_step(quote_amount / filters.price, filters.quantity_step);
    Ok(OrderResult {
        order_id: format!("paper-{}", rand::random::<u32>()),
        filled_quantity: qty,
        filled_quote: qty * filters.price,
        avg_price: filters.price,
        fee: 0.0,
    })
}

/// Paper-mode counterpart of a market sell
pub(crate) fn paper_sell_fill(
    symbol: &str,
    quantity: f64,
    filters: &PriceAndFilters,
) -> Result<OrderResult, ExchangeError> {
    let qty = crate::utils::floor_to_step(quantity, filters.quantity_step);
    if qty * filters.price < filters.min_notional {
        return Err(ExchangeError::AmountTooSmall {
            symbol: symbol.to_string(),
            requested: qty * filters.price,
            min_notional: filters.min_notional,
        });
    }
    Ok(OrderResult {
        order_id: format!("paper-{}", rand::random::<u32>()),
        filled_quantity: qty,
        filled_quote: qty * filters.price,
        avg_price: filters.price,
        fee: 0.0,
    })
}
