//! Exchange gateway trait.
//!
//! This module defines the `ExchangeGateway` trait, the common interface
//! the engine stages use to talk to the exchange. The abstraction keeps
//! trading logic independent of the wire client and allows mocking in
//! tests. Exchange-confirmed state read through this trait is the only
//! thing that drives position transitions.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::entities::order::{LimitOrderRequest, MarketOrderRequest, StopOrderRequest};
use crate::domain::entities::signal::Side;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors that can occur during exchange operations
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Exchange error (code {code}): {message}")]
    Api { code: i64, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),
}

impl ExchangeError {
    /// Transient errors are retried with backoff; the next poll resolves
    /// anything left pending. Business errors surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_) | ExchangeError::Timeout | ExchangeError::RateLimited(_)
        )
    }
}

/// Instrument quantization rules.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRules {
    pub symbol: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
}

/// Order status from the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    Unknown,
}

impl OrderStatus {
    pub fn from_wire(raw: &str) -> OrderStatus {
        match raw.trim().to_uppercase().as_str() {
            "NEW" | "PENDING" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" | "CANCELED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::Unknown,
        }
    }

    /// Still resting on the book.
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one order.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub order_id: String,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub avg_fill_price: Decimal,
}

/// One open exchange position.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
}

/// Exchange gateway providing the REST surface the engine needs.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Available account balance in USDT.
    async fn get_balance(&self) -> ExchangeResult<Decimal>;

    /// Tick size, quantity step and minimum quantity for a symbol.
    async fn get_symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules>;

    /// Last traded / mark price for a symbol.
    async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    /// Place a limit order; returns the exchange order id.
    async fn place_limit(&self, request: &LimitOrderRequest) -> ExchangeResult<String>;

    /// Place a market order; returns the exchange order id.
    async fn place_market(&self, request: &MarketOrderRequest) -> ExchangeResult<String>;

    /// Place a reduce-only stop-market order; returns the exchange order id.
    async fn place_stop_market(&self, request: &StopOrderRequest) -> ExchangeResult<String>;

    /// Cancel an order.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    /// Current state of an order.
    async fn get_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderState>;

    /// Open positions, optionally filtered by symbol.
    async fn get_positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>>;

    /// Set leverage for a symbol and position side.
    async fn set_leverage(&self, symbol: &str, side: Side, leverage: Decimal)
        -> ExchangeResult<()>;
}
