//! OKX spot adapter
//!
//! Signed REST calls against www.okx.com. OKX signs the concatenation of
//! timestamp + method + path + body with HMAC-SHA256, base64-encoded, and
//! carries the passphrase in a header. Market buys are sized in quote
//! currency via `tgtCcy=quote_ccy`; sells in base size.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
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

const BASE_URL: &str = "https://www.okx.com";

pub struct OkxAdapter {
    client: reqwest::Client,
    credentials: ExchangeCredentials,
    paper: bool,
}

impl OkxAdapter {
    pub fn new(credentials: ExchangeCredentials, paper: bool) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(SETTINGS.execution.http_timeout_secs))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            credentials,
            paper,
        }
    }

    /// RFC3339 timestamp with milliseconds, UTC Z, the format OKX signs
    fn iso_timestamp() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    /// Base64(HMAC-SHA256(timestamp + method + path + body))
    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String, ExchangeError> {
        if self.credentials.api_key.is_empty()
            || self.credentials.api_secret.is_empty()
            || self.credentials.passphrase.is_empty()
        {
            return Err(ExchangeError::AuthFailed {
                exchange: "okx".to_string(),
                message: "API credentials are not configured".to_string(),
            });
        }
        let prehash = format!("{}{}{}{}", timestamp, method, path, body);
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| ExchangeError::AuthFailed {
                exchange: "okx".to_string(),
                message: e.to_string(),
            })?;
        mac.update(prehash.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    async fn request_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ExchangeError> {
        let body_text = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();

        // Reads retry with a fresh signature per attempt; order placement
        // must not be blindly re-sent (the recorder owns retried attempts)
        let transport_retries = if method == reqwest::Method::GET {
            SETTINGS.execution.max_retries
        } else {
            0
        };

        let method_ref = &method;
        let body_ref = &body_text;
        let response = with_retries(
            "okx signed request",
            transport_retries,
            Duration::from_millis(SETTINGS.execution.retry_base_delay_ms),
            || async move {
                let timestamp = Self::iso_timestamp();
                let signature = self.sign(&timestamp, method_ref.as_str(), path, body_ref)?;

                let mut request = self
                    .client
                    .request(method_ref.clone(), format!("{}{}", BASE_URL, path))
                    .header("OK-ACCESS-KEY", &self.credentials.api_key)
                    .header("OK-ACCESS-SIGN", signature)
                    .header("OK-ACCESS-TIMESTAMP", timestamp)
                    .header("OK-ACCESS-PASSPHRASE", &self.credentials.passphrase)
                    .header("Content-Type", "application/json");
                if self.credentials.testnet {
                    // Demo-trading routing header
                    request = request.header("x-simulated-trading", "1");
                }
                if !body_ref.is_empty() {
                    request = request.body(body_ref.clone());
                }
                request.send().await.map_err(ExchangeError::from)
            },
        )
        .await?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;

        if status == 401 || status == 403 {
            return Err(ExchangeError::AuthFailed {
                exchange: "okx".to_string(),
                message: format!("HTTP {}", status),
            });
        }
        let code = body.get("code").and_then(|c| c.as_str()).unwrap_or("");
        if status != 200 || code != "0" {
            // 51008: order amount exceeds available balance
            if code == "51008" {
                return Err(ExchangeError::InsufficientBalance {
                    asset: "unknown".to_string(),
                    requested: 0.0,
                    available: 0.0,
                });
            }
            return Err(ExchangeError::Venue {
                exchange: "okx".to_string(),
                message: format!("HTTP {} code {}: {}", status, code, body),
            });
        }
        Ok(body)
    }

    /// Public GET with bounded transport retry. Order placement POSTs are
    /// never retried here; the execution recorder's dedupe key covers
    /// retried attempts.
    async fn get_public(&self, path_and_query: &str) -> Result<Value, ExchangeError> {
        let response = with_retries(
            "okx GET",
            SETTINGS.execution.max_retries,
            Duration::from_millis(SETTINGS.execution.retry_base_delay_ms),
            || async move {
                self.client
                    .get(format!("{}{}", BASE_URL, path_and_query))
                    .send()
                    .await
                    .map_err(ExchangeError::from)
            },
        )
        .await?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;
        if status != 200 || body.get("code").and_then(|c| c.as_str()) != Some("0") {
            return Err(ExchangeError::Venue {
                exchange: "okx".to_string(),
                message: format!("HTTP {}: {}", status, body),
            });
        }
        Ok(body)
    }

    /// Read the first element of an OKX `data` array
    fn first_data(body: &Value) -> Value {
        body.get("data")
            .and_then(|d| d.as_array())
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn num(value: &Value, key: &str) -> f64 {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
    }

    /// Fetch the executed fill details for an order id
    async fn fetch_order_result(&self, symbol: &str, ord_id: &str) -> Result<OrderResult, ExchangeError> {
        let path = format!("/api/v5/trade/order?instId={}&ordId={}", symbol, ord_id);
        let details = self.request_signed(reqwest::Method::GET, &path, None).await?;
        let order = Self::first_data(&details);
        let avg_price = Self::num(&order, "avgPx");
        let filled_quantity = Self::num(&order, "accFillSz");
        // OKX reports fees as negative numbers in the fee currency
        let fee = Self::num(&order, "fee").abs();
        Ok(OrderResult {
            order_id: ord_id.to_string(),
            filled_quantity,
            filled_quote: filled_quantity * avg_price,
            avg_price,
            fee,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Okx
    }

    async fn get_free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let body = self
            .request_signed(reqwest::Method::GET, "/api/v5/account/balance", None)
            .await?;
        let details = Self::first_data(&body);
        let free = details
            .get("details")
            .and_then(|d| d.as_array())
            .and_then(|arr| {
                arr.iter().find(|d| {
                    d.get("ccy").and_then(|c| c.as_str()).map(|c| c.to_uppercase())
                        == Some(asset.to_uppercase())
                })
            })
            .map(|d| {
                let avail = Self::num(d, "availBal");
                if avail > 0.0 {
                    avail
                } else {
                    Self::num(d, "cashBal")
                }
            })
            .unwrap_or(0.0);
        Ok(free)
    }

    async fn get_price_and_filters(&self, symbol: &str) -> Result<PriceAndFilters, ExchangeError> {
        let ticker = self
            .get_public(&format!("/api/v5/market/ticker?instId={}", symbol))
            .await?;
        let price = Self::num(&Self::first_data(&ticker), "last");

        let instruments = self
            .get_public(&format!(
                "/api/v5/public/instruments?instType=SPOT&instId={}",
                symbol
            ))
            .await?;
        let inst = Self::first_data(&instruments);
        let lot_size = Self::num(&inst, "lotSz").max(0.000001);
        let min_size = {
            let min = Self::num(&inst, "minSz");
            if min > 0.0 {
                min
            } else {
                lot_size
            }
        };

        Ok(PriceAndFilters {
            price,
            // OKX expresses its minimum in base units; convert to quote
            min_notional: min_size * price,
            quantity_step: lot_size,
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

        let payload = json!({
            "instId": symbol,
            "tdMode": "cash",
            "side": "buy",
            "ordType": "market",
            "tgtCcy": "quote_ccy",
            "sz": format!("{:.2}", quote_amount),
        });
        let body = self
            .request_signed(reqwest::Method::POST, "/api/v5/trade/order", Some(payload))
            .await?;
        let ord_id = Self::first_data(&body)
            .get("ordId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ExchangeError::Venue {
                exchange: "okx".to_string(),
                message: "order response missing ordId".to_string(),
            })?;
        self.fetch_order_result(symbol, &ord_id).await
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

        let base_asset = symbol.split('-').next().unwrap_or(symbol);
        let free_base = self.get_free_balance(base_asset).await?;
        if qty > free_base {
            return Err(ExchangeError::InsufficientBalance {
                asset: base_asset.to_string(),
                requested: qty,
                available: free_base,
            });
        }

        let payload = json!({
            "instId": symbol,
            "tdMode": "cash",
            "side": "sell",
            "ordType": "market",
            "sz": qty.to_string(),
        });
        let body = self
            .request_signed(reqwest::Method::POST, "/api/v5/trade/order", Some(payload))
            .await?;
        let ord_id = Self::first_data(&body)
            .get("ordId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ExchangeError::Venue {
                exchange: "okx".to_string(),
                message: "sell order response missing ordId".to_string(),
            })?;
        self.fetch_order_result(symbol, &ord_id).await
    }
}
