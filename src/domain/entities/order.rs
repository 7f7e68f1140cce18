//! Order request types handed to the exchange gateway.

use rust_decimal::Decimal;

/// Wire-level order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(raw: &str) -> Option<OrderSide> {
        match raw.trim().to_uppercase().as_str() {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-only GTC limit order request.
#[derive(Debug, Clone)]
pub struct LimitOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    /// Exchange position side the order acts on (hedge-mode accounts).
    pub position_side: crate::domain::entities::signal::Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub post_only: bool,
    pub reduce_only: bool,
}

/// Market order request.
#[derive(Debug, Clone)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: crate::domain::entities::signal::Side,
    pub quantity: Decimal,
    pub reduce_only: bool,
}

/// Reduce-only stop-market order request.
#[derive(Debug, Clone)]
pub struct StopOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: crate::domain::entities::signal::Side,
    pub stop_price: Decimal,
    pub quantity: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_side_roundtrip() {
        assert_eq!(OrderSide::parse("buy"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse("SELL"), Some(OrderSide::Sell));
        assert_eq!(OrderSide::Buy.as_str(), "BUY");
        assert_eq!(OrderSide::parse("hold"), None);
    }
}
