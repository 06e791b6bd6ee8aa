//! Binance spot adapter
//!
//! Signed REST calls against api.binance.com (or the spot testnet). Market
//! buys are sized with `quoteOrderQty`, sells with a step-rounded base
//! quantity, matching how the venue fills market orders.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;

use super::{
    paper_buy_fill, paper_sell_fill, ExchangeAdapter, ExchangeError, ExchangeKind, OrderResult,
    PriceAndFilters,
};
use crate::logger::{self, LogTag};
use crate::settings::{ExchangeCredentials, SETTINGS};
use crate::utils::{floor_to_step, with_retries};

type HmacSha256 = Hmac<Sha256>;

const MAINNET_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";

/// Fallbacks when exchangeInfo omits a filter
const DEFAULT_MIN_NOTIONAL: f64 = 10.0;
const DEFAULT_QUANTITY_STEP: f64 = 0.000001;

pub struct BinanceAdapter {
    client: reqwest::Client,
    credentials: ExchangeCredentials,
    base_url: String,
    paper: bool,
}

impl BinanceAdapter {
    pub fn new(credentials: ExchangeCredentials, paper: bool) -> Self {
        let base_url = if credentials.testnet {
            TESTNET_URL.to_string()
        } else {
            MAINNET_URL.to_string()
        };
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(SETTINGS.execution.http_timeout_secs))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            credentials,
            base_url,
            paper,
        }
    }

    /// Sign a query string with HMAC-SHA256 (hex), Binance's request scheme
    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        if self.credentials.api_key.is_empty() || self.credentials.api_secret.is_empty() {
            return Err(ExchangeError::AuthFailed {
                exchange: "binance".to_string(),
                message: "API credentials are not configured".to_string(),
            });
        }
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| ExchangeError::AuthFailed {
                exchange: "binance".to_string(),
                message: e.to_string(),
            })?;
        mac.update(query.as_bytes());
        let signature = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        Ok(signature)
    }

    fn signed_url(&self, path: &str, params: &str) -> Result<String, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let query = if params.is_empty() {
            format!("timestamp={}", timestamp)
        } else {
            format!("{}&timestamp={}", params, timestamp)
        };
        let signature = self.sign(&query)?;
        Ok(format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        ))
    }

    /// Map a non-success response body to the contract error set
    fn venue_error(&self, status: u16, body: &str) -> ExchangeError {
        if status == 401 || status == 403 {
            return ExchangeError::AuthFailed {
                exchange: "binance".to_string(),
                message: format!("HTTP {}: {}", status, body),
            };
        }
        // Binance error payloads carry a numeric code; -2010 is the
        // insufficient-balance rejection
        if let Ok(parsed) = serde_json::from_str::<Value>(body) {
            if parsed.get("code").and_then(|c| c.as_i64()) == Some(-2010) {
                return ExchangeError::InsufficientBalance {
                    asset: "unknown".to_string(),
                    requested: 0.0,
                    available: 0.0,
                };
            }
        }
        ExchangeError::Venue {
            exchange: "binance".to_string(),
            message: format!("HTTP {}: {}", status, body),
        }
    }

    /// GET with bounded transport retry. Only reads are retried at this
    /// layer; order placement goes through the execution recorder, whose
    /// dedupe key is what makes a retried attempt safe.
    async fn get_public(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ExchangeError> {
        let response = with_retries(
            "binance GET",
            SETTINGS.execution.max_retries,
            Duration::from_millis(SETTINGS.execution.retry_base_delay_ms),
            || async move {
                self.client
                    .get(format!("{}{}", self.base_url, path))
                    .query(query)
                    .send()
                    .await
                    .map_err(ExchangeError::from)
            },
        )
        .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if status != 200 {
            return Err(self.venue_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| ExchangeError::Http(e.to_string()))
    }

    /// Signed GET with bounded retry; each attempt re-signs with a fresh
    /// timestamp so a slow retry cannot fall outside the recv window.
    async fn get_signed(&self, path: &str, params: &str) -> Result<Value, ExchangeError> {
        let response = with_retries(
            "binance signed GET",
            SETTINGS.execution.max_retries,
            Duration::from_millis(SETTINGS.execution.retry_base_delay_ms),
            || async move {
                let url = self.signed_url(path, params)?;
                self.client
                    .get(url)
                    .header("X-MBX-APIKEY", &self.credentials.api_key)
                    .send()
                    .await
                    .map_err(ExchangeError::from)
            },
        )
        .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if status != 200 {
            return Err(self.venue_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| ExchangeError::Http(e.to_string()))
    }

    async fn post_signed(&self, path: &str, params: &str) -> Result<Value, ExchangeError> {
        let url = self.signed_url(path, params)?;
        let response = self
            .client
            .post(url)
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if status != 200 {
            return Err(self.venue_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| ExchangeError::Http(e.to_string()))
    }

    fn parse_fill(&self, order: &Value) -> OrderResult {
        let num = |v: Option<&Value>| -> f64 {
            v.and_then(|x| x.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let executed_qty = num(order.get("executedQty"));
        let filled_quote = num(order.get("cummulativeQuoteQty"));
        let avg_price = if executed_qty > 0.0 {
            filled_quote / executed_qty
        } else {
            0.0
        };
        let fee = order
            .get("fills")
            .and_then(|f| f.as_array())
            .map(|fills| {
                fills
                    .iter()
                    .map(|f| num(f.get("commission")))
                    .sum::<f64>()
            })
            .unwrap_or(0.0);
        OrderResult {
            order_id: order
                .get("orderId")
                .map(|id| id.to_string())
                .unwrap_or_default(),
            filled_quantity: executed_qty,
            filled_quote,
            avg_price,
            fee,
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    async fn get_free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let account = self.get_signed("/api/v3/account", "").await?;
        let free = account
            .get("balances")
            .and_then(|b| b.as_array())
            .and_then(|balances| {
                balances.iter().find(|b| {
                    b.get("asset").and_then(|a| a.as_str()) == Some(&asset.to_uppercase())
                })
            })
            .and_then(|b| b.get("free"))
            .and_then(|f| f.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok(free)
    }

    async fn get_price_and_filters(&self, symbol: &str) -> Result<PriceAndFilters, ExchangeError> {
        let ticker = self
            .get_public("/api/v3/ticker/price", &[("symbol", symbol)])
            .await?;
        let price = ticker
            .get("price")
            .and_then(|p| p.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        let info = self
            .get_public("/api/v3/exchangeInfo", &[("symbol", symbol)])
            .await?;
        let mut min_notional = DEFAULT_MIN_NOTIONAL;
        let mut quantity_step = DEFAULT_QUANTITY_STEP;
        if let Some(filters) = info
            .get("symbols")
            .and_then(|s| s.as_array())
            .and_then(|arr| arr.first())
            .and_then(|sym| sym.get("filters"))
            .and_then(|f| f.as_array())
        {
            for filter in filters {
                match filter.get("filterType").and_then(|t| t.as_str()) {
                    Some("LOT_SIZE") => {
                        if let Some(step) = filter
                            .get("stepSize")
                            .and_then(|s| s.as_str())
                            .and_then(|s| s.parse::<f64>().ok())
                        {
                            if step > 0.0 {
                                quantity_step = step;
                            }
                        }
                    }
                    Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                        if let Some(min) = filter
                            .get("minNotional")
                            .and_then(|s| s.as_str())
                            .and_then(|s| s.parse::<f64>().ok())
                        {
                            if min > 0.0 {
                                min_notional = min;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(PriceAndFilters {
            price,
            min_notional,
            quantity_step,
        })
    }

    async fn place_market_buy_by_quote(
        &self,
        symbol: &str,
        quote_amount: f64,
    ) -> Result<OrderResult, ExchangeError> {
        let filters = self.get_price_and_filters(symbol).await?;
        if quote_amount < filters.min_notional {
            return Err(ExchangeError::AmountTooSmall {
                symbol: symbol.to_string(),
                requested: quote_amount,
                min_notional: filters.min_notional,
            });
        }

        if self.paper {
            logger::debug(
                LogTag::Exchange,
                &format!("paper buy {} {:.2} USDT @ {:.2}", symbol, quote_amount, filters.price),
            );
            return paper_buy_fill(symbol, quote_amount, &filters);
        }

        let free_quote = self.get_free_balance("USDT").await?;
        if quote_amount > free_quote {
            return Err(ExchangeError::InsufficientBalance {
                asset: "USDT".to_string(),
                requested: quote_amount,
                available: free_quote,
            });
        }

        let params = format!(
            "symbol={}&side=BUY&type=MARKET&quoteOrderQty={:.2}&newOrderRespType=FULL",
            symbol, quote_amount
        );
        let order = self.post_signed("/api/v3/order", &params).await?;
        Ok(self.parse_fill(&order))
    }

    async fn place_market_sell_by_quantity(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<OrderResult, ExchangeError> {
        let filters = self.get_price_and_filters(symbol).await?;
        let qty = floor_to_step(quantity, filters.quantity_step);
        if qty * filters.price < filters.min_notional {
            return Err(ExchangeError::AmountTooSmall {
                symbol: symbol.to_string(),
                requested: qty * filters.price,
                min_notional: filters.min_notional,
            });
        }

        if self.paper {
            logger::debug(
                LogTag::Exchange,
                &format!("paper sell {} {:.8} @ {:.2}", symbol, qty, filters.price),
            );
            return paper_sell_fill(symbol, quantity, &filters);
        }

        let base_asset = symbol.trim_end_matches("USDT");
        let free_base = self.get_free_balance(base_asset).await?;
        if qty > free_base {
            return Err(ExchangeError::InsufficientBalance {
                asset: base_asset.to_string(),
                requested: qty,
                available: free_base,
            });
        }

        let params = format!(
            "symbol={}&side=SELL&type=MARKET&quantity={}&newOrderRespType=FULL",
            symbol, qty
        );
        let order = self.post_signed("/api/v3/order", &params).await?;
        Ok(self.parse_fill(&order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(paper: bool) -> BinanceAdapter {
        BinanceAdapter::new(
            ExchangeCredentials {
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
                passphrase: String::new(),
                testnet: false,
            },
            paper,
        )
    }

    #[test]
    fn test_sign_is_deterministic_hex() {
        let a = adapter(true);
        let sig1 = a.sign("symbol=BTCUSDT&timestamp=1700000000000").unwrap();
        let sig2 = a.sign("symbol=BTCUSDT&timestamp=1700000000000").unwrap();
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_requires_credentials() {
        let a = BinanceAdapter::new(ExchangeCredentials::default(), true);
        assert!(matches!(
            a.sign("x=1"),
            Err(ExchangeError::AuthFailed { .. })
        ));
    }

    #[test]
    fn test_venue_error_maps_insufficient_balance_code() {
        let a = adapter(false);
        let err = a.venue_error(400, r#"{"code":-2010,"msg":"Account has insufficient balance"}"#);
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));
    }

    #[test]
    fn test_venue_error_maps_auth_status() {
        let a = adapter(false);
        let err = a.venue_error(401, "unauthorized");
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_parse_fill_sums_commissions() {
        let a = adapter(false);
        let order = serde_json::json!({
            "orderId": 123456,
            "executedQty": "0.00200000",
            "cummulativeQuoteQty": "100.00000000",
            "fills": [
                {"commission": "0.00000100"},
                {"commission": "0.00000200"}
            ]
        });
        let fill = a.parse_fill(&order);
        assert_eq!(fill.filled_quantity, 0.002);
        assert_eq!(fill.filled_quote, 100.0);
        assert_eq!(fill.avg_price, 50_000.0);
        assert!((fill.fee - 0.000003).abs() < 1e-12);
    }
}
