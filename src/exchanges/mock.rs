//! In-memory exchange used by unit tests
//!
//! Keeps balances in a map, fills every order at a fixed price and records
//! what was placed so tests can assert on order traffic. Honors the same
//! contract checks as the real adapters.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{
    AdapterFactory, ExchangeAdapter, ExchangeError, ExchangeKind, OrderResult, PriceAndFilters,
};
use crate::utils::floor_to_step;
use std::sync::Arc;

/// Factory handing out one shared mock per venue
pub struct MockAdapterFactory {
    pub binance: Arc<MockExchange>,
    pub okx: Arc<MockExchange>,
}

impl MockAdapterFactory {
    pub fn new(binance: MockExchange, okx: MockExchange) -> Self {
        Self {
            binance: Arc::new(binance),
            okx: Arc::new(okx),
        }
    }

    /// Both venues at the same price with generous quote balances
    pub fn funded(price: f64, quote_balance: f64) -> Self {
        Self::new(
            MockExchange::new(ExchangeKind::Binance, price).with_balance("USDT", quote_balance),
            MockExchange::new(ExchangeKind::Okx, price).with_balance("USDT", quote_balance),
        )
    }

    pub fn mock(&self, kind: ExchangeKind) -> &Arc<MockExchange> {
        match kind {
            ExchangeKind::Binance => &self.binance,
            ExchangeKind::Okx => &self.okx,
        }
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn adapter(&self, kind: ExchangeKind) -> Arc<dyn ExchangeAdapter> {
        self.mock(kind).clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub symbol: String,
    pub side: &'static str,
    pub amount: f64,
}

pub struct MockExchange {
    kind: ExchangeKind,
    pub price: f64,
    pub min_notional: f64,
    pub quantity_step: f64,
    balances: Mutex<HashMap<String, f64>>,
    pub orders: Mutex<Vec<PlacedOrder>>,
    order_seq: AtomicU64,
    /// Simulate a signing failure on every call
    fail_auth: AtomicBool,
}

impl MockExchange {
    pub fn new(kind: ExchangeKind, price: f64) -> Self {
        Self {
            kind,
            price,
            min_notional: 10.0,
            quantity_step: 0.000001,
            balances: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
            order_seq: AtomicU64::new(1),
            fail_auth: AtomicBool::new(false),
        }
    }

    pub fn set_fail_auth(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::SeqCst);
    }

    pub fn with_balance(self, asset: &str, amount: f64) -> Self {
        self.balances.lock().insert(asset.to_uppercase(), amount);
        self
    }

    pub fn set_balance(&self, asset: &str, amount: f64) {
        self.balances.lock().insert(asset.to_uppercase(), amount);
    }

    pub fn balance(&self, asset: &str) -> f64 {
        *self.balances.lock().get(&asset.to_uppercase()).unwrap_or(&0.0)
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().len()
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn check_auth(&self) -> Result<(), ExchangeError> {
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(ExchangeError::AuthFailed {
                exchange: self.kind.as_str().to_string(),
                message: "mock auth failure".to_string(),
            });
        }
        Ok(())
    }

    /// Base asset of a venue symbol ("BTCUSDT" / "BTC-USDT" -> "BTC")
    fn base_of(symbol: &str) -> String {
        symbol
            .split('-')
            .next()
            .unwrap_or(symbol)
            .trim_end_matches("USDT")
            .to_string()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn kind(&self) -> ExchangeKind {
        self.kind
    }

    async fn get_free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        self.check_auth()?;
        Ok(self.balance(asset))
    }

    async fn get_price_and_filters(&self, _symbol: &str) -> Result<PriceAndFilters, ExchangeError> {
        self.check_auth()?;
        Ok(PriceAndFilters {
            price: self.price,
            min_notional: self.min_notional,
            quantity_step: self.quantity_step,
        })
    }

    async fn place_market_buy_by_quote(
        &self,
        symbol: &str,
        quote_amount: f64,
    ) -> Result<OrderResult, ExchangeError> {
        self.check_auth()?;
        if quote_amount < self.min_notional {
            return Err(ExchangeError::AmountTooSmall {
                symbol: symbol.to_string(),
                requested: quote_amount,
                min_notional: self.min_notional,
            });
        }
        let free_quote = self.balance("USDT");
        if quote_amount > free_quote {
            return Err(ExchangeError::InsufficientBalance {
                asset: "USDT".to_string(),
                requested: quote_amount,
                available: free_quote,
            });
        }

        let qty = floor_to_step(quote_amount / self.price, self.quantity_step);
        let spent = qty * self.price;
        {
            let mut balances = self.balances.lock();
            *balances.entry("USDT".to_string()).or_insert(0.0) -= spent;
            let base = Self::base_of(symbol);
            *balances.entry(base).or_insert(0.0) += qty;
        }
        self.orders.lock().push(PlacedOrder {
            symbol: symbol.to_string(),
            side: "buy",
            amount: quote_amount,
        });

        Ok(OrderResult {
            order_id: self.next_order_id(),
            filled_quantity: qty,
            filled_quote: spent,
            avg_price: self.price,
            fee: 0.0,
        })
    }

    async fn place_market_sell_by_quantity(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<OrderResult, ExchangeError> {
        self.check_auth()?;
        let qty = floor_to_step(quantity, self.quantity_step);
        if qty * self.price < self.min_notional {
            return Err(ExchangeError::AmountTooSmall {
                symbol: symbol.to_string(),
                requested: qty * self.price,
                min_notional: self.min_notional,
            });
        }
        let base = Self::base_of(symbol);
        let free_base = self.balance(&base);
        if qty > free_base {
            return Err(ExchangeError::InsufficientBalance {
                asset: base,
                requested: qty,
                available: free_base,
            });
        }

        let proceeds = qty * self.price;
        {
            let mut balances = self.balances.lock();
            *balances.entry(Self::base_of(symbol)).or_insert(0.0) -= qty;
            *balances.entry("USDT".to_string()).or_insert(0.0) += proceeds;
        }
        self.orders.lock().push(PlacedOrder {
            symbol: symbol.to_string(),
            side: "sell",
            amount: qty,
        });

        Ok(OrderResult {
            order_id: self.next_order_id(),
            filled_quantity: qty,
            filled_quote: proceeds,
            avg_price: self.price,
            fee: 0.0,
        })
    }
}
