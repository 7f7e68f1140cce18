//! Database row types.
//!
//! Prices and quantities are stored as TEXT so decimal values round-trip
//! exactly; accessor methods parse them back into `Decimal`. Ladder and
//! pyramid structures live in JSON columns.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use std::str::FromStr;
use tracing::warn;

use crate::domain::entities::position::{HedgeState, PositionState, PyramidState, TpLevel};
use crate::domain::entities::signal::{Side, SignalStatus, SignalType};

/// Parse a stored decimal, defaulting to zero on malformed data.
pub fn parse_decimal(raw: &str) -> Decimal {
    match Decimal::from_str(raw.trim()) {
        Ok(value) => value,
        Err(_) => {
            warn!("Malformed decimal in database: {:?}", raw);
            Decimal::ZERO
        }
    }
}

pub fn parse_decimal_opt(raw: Option<&str>) -> Option<Decimal> {
    raw.and_then(|s| Decimal::from_str(s.trim()).ok())
}

/// One row of the `signals` table.
#[derive(Debug, Clone, FromRow)]
pub struct SignalRecord {
    pub id: i64,
    pub channel_name: String,
    pub chat_id: String,
    pub message_id: i64,
    pub message_ts: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub symbol: String,
    pub side: String,
    pub entry_mid: String,
    pub entry_low: Option<String>,
    pub entry_high: Option<String>,
    pub sl_price: Option<String>,
    pub tp_prices: String,
    pub declared_leverage: Option<String>,
    pub signal_type: Option<String>,
    pub status: String,
    pub dedup_hash: String,
    pub raw_text: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reentry_attempts: i64,
}

impl SignalRecord {
    pub fn side(&self) -> Side {
        Side::parse(&self.side).unwrap_or(Side::Long)
    }

    pub fn status(&self) -> SignalStatus {
        SignalStatus::parse(&self.status).unwrap_or(SignalStatus::New)
    }

    pub fn signal_type(&self) -> Option<SignalType> {
        self.signal_type.as_deref().and_then(SignalType::parse)
    }

    pub fn entry_mid(&self) -> Decimal {
        parse_decimal(&self.entry_mid)
    }

    pub fn sl_price(&self) -> Option<Decimal> {
        parse_decimal_opt(self.sl_price.as_deref())
    }

    pub fn declared_leverage(&self) -> Option<Decimal> {
        parse_decimal_opt(self.declared_leverage.as_deref())
    }

    /// Take-profit prices, in trade-direction order.
    pub fn tp_prices(&self) -> Vec<Decimal> {
        serde_json::from_str::<Vec<String>>(&self.tp_prices)
            .map(|prices| prices.iter().map(|p| parse_decimal(p)).collect())
            .unwrap_or_default()
    }
}

/// Payload for creating a position row.
#[derive(Debug, Clone)]
pub struct CreatePosition {
    pub signal_id: i64,
    pub bot_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub planned_qty: Decimal,
    pub leverage: Decimal,
    pub initial_margin: Decimal,
    pub sl_price: Decimal,
    pub tp_levels: Vec<TpLevel>,
    pub entry_order_ids: Vec<String>,
}

/// One row of the `positions` table.
#[derive(Debug, Clone, FromRow)]
pub struct PositionRecord {
    pub id: i64,
    pub signal_id: i64,
    pub bot_order_id: String,
    pub symbol: String,
    pub side: String,
    pub state: String,
    pub planned_qty: String,
    pub filled_qty: String,
    pub remaining_qty: String,
    pub avg_entry_price: Option<String>,
    pub original_entry_price: Option<String>,
    pub leverage: String,
    pub initial_margin: String,
    pub sl_price: Option<String>,
    pub sl_order_id: Option<String>,
    pub tp_levels: String,
    pub entry_order_ids: String,
    pub replacement_order_id: Option<String>,
    pub close_reason: Option<String>,
    pub pyramid_state: String,
    pub hedge_state: String,
    pub hedge_entry_order_id: Option<String>,
    pub hedge_tp_order_id: Option<String>,
    pub hedge_sl_order_id: Option<String>,
    pub peak_price: Option<String>,
    pub trailing_active: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sl_amended_at: Option<DateTime<Utc>>,
}

impl PositionRecord {
    pub fn side(&self) -> Side {
        Side::parse(&self.side).unwrap_or(Side::Long)
    }

    pub fn state(&self) -> PositionState {
        PositionState::parse(&self.state).unwrap_or(PositionState::Failed)
    }

    pub fn hedge_state(&self) -> HedgeState {
        HedgeState::parse(&self.hedge_state).unwrap_or(HedgeState::None)
    }

    pub fn planned_qty(&self) -> Decimal {
        parse_decimal(&self.planned_qty)
    }

    pub fn filled_qty(&self) -> Decimal {
        parse_decimal(&self.filled_qty)
    }

    pub fn remaining_qty(&self) -> Decimal {
        parse_decimal(&self.remaining_qty)
    }

    pub fn avg_entry_price(&self) -> Option<Decimal> {
        parse_decimal_opt(self.avg_entry_price.as_deref())
    }

    /// The immutable basis for every percent threshold.
    pub fn original_entry_price(&self) -> Option<Decimal> {
        parse_decimal_opt(self.original_entry_price.as_deref())
    }

    pub fn leverage(&self) -> Decimal {
        parse_decimal(&self.leverage)
    }

    pub fn sl_price(&self) -> Option<Decimal> {
        parse_decimal_opt(self.sl_price.as_deref())
    }

    pub fn peak_price(&self) -> Option<Decimal> {
        parse_decimal_opt(self.peak_price.as_deref())
    }

    pub fn trailing_active(&self) -> bool {
        self.trailing_active != 0
    }

    pub fn tp_levels(&self) -> Vec<TpLevel> {
        serde_json::from_str(&self.tp_levels).unwrap_or_default()
    }

    pub fn entry_order_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.entry_order_ids).unwrap_or_default()
    }

    pub fn pyramid_state(&self) -> PyramidState {
        serde_json::from_str(&self.pyramid_state).unwrap_or_default()
    }
}

/// One row of the `order_tracker` table.
#[derive(Debug, Clone, FromRow)]
pub struct OrderTrackerRecord {
    pub id: i64,
    pub position_id: i64,
    pub order_id: String,
    pub kind: String,
    pub level_index: Option<i64>,
    pub last_executed_qty: String,
    pub last_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OrderTrackerRecord {
    pub fn kind(&self) -> crate::domain::entities::position::OrderKind {
        crate::domain::entities::position::OrderKind::parse(&self.kind)
            .unwrap_or(crate::domain::entities::position::OrderKind::Entry)
    }

    pub fn last_executed_qty(&self) -> Decimal {
        parse_decimal(&self.last_executed_qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_decimal_defaults_to_zero() {
        assert_eq!(parse_decimal("1.23"), dec!(1.23));
        assert_eq!(parse_decimal(" 1.23 "), dec!(1.23));
        assert_eq!(parse_decimal("garbage"), Decimal::ZERO);
        assert_eq!(parse_decimal(""), Decimal::ZERO);
    }

    #[test]
    fn test_parse_decimal_opt() {
        assert_eq!(parse_decimal_opt(Some("2.5")), Some(dec!(2.5)));
        assert_eq!(parse_decimal_opt(Some("bad")), None);
        assert_eq!(parse_decimal_opt(None), None);
    }
}
