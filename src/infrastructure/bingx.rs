//! BingX perpetual-swap REST client.
//!
//! Implements `ExchangeGateway` over the signed BingX swap API. Requests
//! carry a millisecond timestamp and an HMAC-SHA256 signature (lowercase
//! hex) over the urlencoded, key-sorted parameter string. Responses use
//! the `{code, msg, data}` envelope with `code=0` meaning success.
//!
//! Transient failures (network, timeout, HTTP 429) are retried with
//! exponential backoff and jitter, capped by the configured retry budget;
//! anything still unresolved is surfaced and the next poll settles it.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::BingxConfig;
use crate::domain::entities::order::{LimitOrderRequest, MarketOrderRequest, StopOrderRequest};
use crate::domain::entities::signal::Side;
use crate::infrastructure::exchange::{
    ExchangeError, ExchangeGateway, ExchangeResult, OrderState, OrderStatus, PositionInfo,
    SymbolRules,
};

type HmacSha256 = Hmac<Sha256>;

const BALANCE_PATH: &str = "/openApi/swap/v2/user/balance";
const CONTRACTS_PATH: &str = "/openApi/swap/v2/quote/contracts";
const PRICE_PATH: &str = "/openApi/swap/v1/ticker/price";
const ORDER_PATH: &str = "/openApi/swap/v2/trade/order";
const POSITIONS_PATH: &str = "/openApi/swap/v2/user/positions";
const LEVERAGE_PATH: &str = "/openApi/swap/v2/trade/leverage";

/// BingX client for the perpetual swap API.
pub struct BingxClient {
    http: Client,
    config: BingxConfig,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl BingxClient {
    pub fn new(config: BingxConfig) -> ExchangeResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Format a symbol to the BingX wire form (`BTCUSDT` -> `BTC-USDT`).
    pub fn format_symbol(symbol: &str) -> String {
        if let Some(base) = symbol.strip_suffix("USDT") {
            if !base.is_empty() && !base.ends_with('-') {
                return format!("{}-USDT", base);
            }
        }
        symbol.replace('/', "-")
    }

    /// HMAC-SHA256 signature over the urlencoded sorted parameter string.
    fn sign(&self, query: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.secret_key.as_bytes())
            .map_err(|e| ExchangeError::InvalidResponse(format!("HMAC init failed: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn build_query(&self, mut params: Vec<(String, String)>, signed: bool) -> ExchangeResult<String> {
        if signed {
            let timestamp = chrono::Utc::now().timestamp_millis();
            params.push(("timestamp".to_string(), timestamp.to_string()));
        }
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");
        if signed {
            let signature = self.sign(&query)?;
            Ok(format!("{}&signature={}", query, signature))
        } else {
            Ok(query)
        }
    }

    /// One attempt at a request; the caller handles retries.
    async fn request_once(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
        signed: bool,
    ) -> ExchangeResult<Value> {
        let query = self.build_query(params, signed)?;
        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url, path)
        } else {
            format!("{}{}?{}", self.config.base_url, path, query)
        };

        let response = self
            .http
            .request(method, &url)
            .header("X-BX-APIKEY", &self.config.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout
                } else {
                    ExchangeError::Network(e.to_string())
                }
            })?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimited(format!("HTTP 429 on {}", path)));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Network(format!(
                "HTTP {} on {}: {}",
                status, path, body
            )));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        if envelope.code != 0 {
            let message = envelope.msg.unwrap_or_else(|| "unknown error".to_string());
            error!("BingX API error on {}: {} (code {})", path, message, envelope.code);
            return Err(ExchangeError::Api {
                code: envelope.code,
                message,
            });
        }

        Ok(envelope.data.unwrap_or(Value::Null))
    }

    /// Request with bounded retries on transient failures.
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
        signed: bool,
    ) -> ExchangeResult<Value> {
        let mut delay = Duration::from_millis(500);
        let mut attempt = 0;
        loop {
            match self
                .request_once(method.clone(), path, params.clone(), signed)
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    warn!(
                        "BingX transient error on {} (attempt {}/{}): {}; retrying in {:?}",
                        path, attempt, self.config.max_retries, e, delay + jitter
                    );
                    tokio::time::sleep(delay + jitter).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(5));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn urlencode(value: &str) -> String {
    // Query values here are symbols, order ids and decimal strings; only
    // a conservative reserved set needs escaping.
    value
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            _ => format!("%{:02X}", c as u32),
        })
        .collect()
}

fn decimal_field(value: &Value, keys: &[&str]) -> Option<Decimal> {
    for key in keys {
        if let Some(field) = value.get(*key) {
            let text = match field {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if let Ok(parsed) = Decimal::from_str(text.trim()) {
                return Some(parsed);
            }
        }
    }
    None
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ExchangeGateway for BingxClient {
    async fn get_balance(&self) -> ExchangeResult<Decimal> {
        let data = self
            .request(Method::GET, BALANCE_PATH, Vec::new(), true)
            .await?;
        let balance_obj = data
            .get("balance")
            .ok_or_else(|| ExchangeError::InvalidResponse("missing balance object".into()))?;
        decimal_field(balance_obj, &["availableMargin", "balance"])
            .ok_or_else(|| ExchangeError::InvalidResponse("unparseable balance".into()))
    }

    async fn get_symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        let formatted = Self::format_symbol(symbol);
        let data = self
            .request(Method::GET, CONTRACTS_PATH, Vec::new(), false)
            .await?;
        let contracts = data
            .as_array()
            .ok_or_else(|| ExchangeError::InvalidResponse("contracts is not an array".into()))?;

        for contract in contracts {
            if string_field(contract, "symbol").as_deref() == Some(formatted.as_str()) {
                let tick_size = decimal_field(contract, &["tickSize"]).unwrap_or(Decimal::ZERO);
                let lot = contract.get("lotSizeFilter").cloned().unwrap_or(Value::Null);
                let qty_step = decimal_field(&lot, &["qtyStep"])
                    .or_else(|| decimal_field(contract, &["stepSize", "size"]))
                    .unwrap_or(Decimal::ZERO);
                let min_qty = decimal_field(&lot, &["minQty"])
                    .or_else(|| decimal_field(contract, &["tradeMinQuantity", "minQty"]))
                    .unwrap_or(Decimal::ZERO);
                if tick_size <= Decimal::ZERO {
                    warn!("Invalid tickSize from exchange metadata (symbol={})", symbol);
                }
                if qty_step <= Decimal::ZERO {
                    warn!("Invalid qtyStep from exchange metadata (symbol={})", symbol);
                }
                return Ok(SymbolRules {
                    symbol: symbol.to_string(),
                    tick_size,
                    qty_step,
                    min_qty,
                });
            }
        }

        Err(ExchangeError::SymbolNotFound(formatted))
    }

    async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let params = vec![("symbol".to_string(), Self::format_symbol(symbol))];
        let data = self.request(Method::GET, PRICE_PATH, params, false).await?;
        decimal_field(&data, &["price"])
            .ok_or_else(|| ExchangeError::InvalidResponse("unparseable price".into()))
    }

    async fn place_limit(&self, request: &LimitOrderRequest) -> ExchangeResult<String> {
        let params = vec![
            ("symbol".to_string(), Self::format_symbol(&request.symbol)),
            ("side".to_string(), request.side.to_string()),
            ("positionSide".to_string(), request.position_side.to_string()),
            ("type".to_string(), "LIMIT".to_string()),
            ("price".to_string(), request.price.to_string()),
            ("quantity".to_string(), request.quantity.to_string()),
            ("timeInForce".to_string(), "GTC".to_string()),
            ("postOnly".to_string(), request.post_only.to_string()),
            ("reduceOnly".to_string(), request.reduce_only.to_string()),
        ];
        let data = self.request(Method::POST, ORDER_PATH, params, true).await?;
        let order = data.get("order").unwrap_or(&data);
        let order_id = string_field(order, "orderId")
            .ok_or_else(|| ExchangeError::InvalidResponse("order id missing".into()))?;
        debug!(
            "Limit order placed: {} {} {} @ {} (id {})",
            request.side, request.quantity, request.symbol, request.price, order_id
        );
        Ok(order_id)
    }

    async fn place_market(&self, request: &MarketOrderRequest) -> ExchangeResult<String> {
        let params = vec![
            ("symbol".to_string(), Self::format_symbol(&request.symbol)),
            ("side".to_string(), request.side.to_string()),
            ("positionSide".to_string(), request.position_side.to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), request.quantity.to_string()),
            ("reduceOnly".to_string(), request.reduce_only.to_string()),
        ];
        let data = self.request(Method::POST, ORDER_PATH, params, true).await?;
        let order = data.get("order").unwrap_or(&data);
        string_field(order, "orderId")
            .ok_or_else(|| ExchangeError::InvalidResponse("order id missing".into()))
    }

    async fn place_stop_market(&self, request: &StopOrderRequest) -> ExchangeResult<String> {
        let params = vec![
            ("symbol".to_string(), Self::format_symbol(&request.symbol)),
            ("side".to_string(), request.side.to_string()),
            ("positionSide".to_string(), request.position_side.to_string()),
            ("type".to_string(), "STOP_MARKET".to_string()),
            ("stopPrice".to_string(), request.stop_price.to_string()),
            ("quantity".to_string(), request.quantity.to_string()),
            ("reduceOnly".to_string(), "true".to_string()),
        ];
        let data = self.request(Method::POST, ORDER_PATH, params, true).await?;
        let order = data.get("order").unwrap_or(&data);
        string_field(order, "orderId")
            .ok_or_else(|| ExchangeError::InvalidResponse("order id missing".into()))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let params = vec![
            ("symbol".to_string(), Self::format_symbol(symbol)),
            ("orderId".to_string(), order_id.to_string()),
        ];
        self.request(Method::DELETE, ORDER_PATH, params, true)
            .await?;
        debug!("Order cancelled: {}", order_id);
        Ok(())
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderState> {
        let params = vec![
            ("symbol".to_string(), Self::format_symbol(symbol)),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let data = match self.request(Method::GET, ORDER_PATH, params, true).await {
            Ok(data) => data,
            // BingX reports unknown order ids as a business error.
            Err(ExchangeError::Api { code, message })
                if message.to_lowercase().contains("not exist")
                    || message.to_lowercase().contains("not found") =>
            {
                debug!("Order {} not found (code {})", order_id, code);
                return Err(ExchangeError::OrderNotFound(order_id.to_string()));
            }
            Err(e) => return Err(e),
        };
        let order = data.get("order").unwrap_or(&data);
        let status = string_field(order, "status")
            .map(|s| OrderStatus::from_wire(&s))
            .unwrap_or(OrderStatus::Unknown);
        Ok(OrderState {
            order_id: order_id.to_string(),
            status,
            executed_qty: decimal_field(order, &["executedQty"]).unwrap_or(Decimal::ZERO),
            avg_fill_price: decimal_field(order, &["avgPrice"]).unwrap_or(Decimal::ZERO),
        })
    }

    async fn get_positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>> {
        let mut params = Vec::new();
        if let Some(symbol) = symbol {
            params.push(("symbol".to_string(), Self::format_symbol(symbol)));
        }
        let data = self
            .request(Method::GET, POSITIONS_PATH, params, true)
            .await?;
        let rows = match data.as_array() {
            Some(rows) => rows.clone(),
            None => return Ok(Vec::new()),
        };

        let mut positions = Vec::new();
        for row in rows {
            let side = string_field(&row, "positionSide")
                .and_then(|s| Side::parse(&s))
                .unwrap_or(Side::Long);
            let qty = decimal_field(&row, &["positionAmt", "availableAmt"]).unwrap_or(Decimal::ZERO);
            if qty.is_zero() {
                continue;
            }
            let wire_symbol = string_field(&row, "symbol").unwrap_or_default();
            positions.push(PositionInfo {
                symbol: wire_symbol.replace('-', ""),
                side,
                qty: qty.abs(),
                entry_price: decimal_field(&row, &["avgPrice", "entryPrice"])
                    .unwrap_or(Decimal::ZERO),
            });
        }
        Ok(positions)
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        side: Side,
        leverage: Decimal,
    ) -> ExchangeResult<()> {
        let params = vec![
            ("symbol".to_string(), Self::format_symbol(symbol)),
            ("side".to_string(), side.to_string()),
            ("leverage".to_string(), leverage.round().to_string()),
        ];
        self.request(Method::POST, LEVERAGE_PATH, params, true)
            .await?;
        Ok(())
    }
}
