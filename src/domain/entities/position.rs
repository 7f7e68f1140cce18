//! Position domain types.
//!
//! A position is the exchange-side exposure created by executing a signal.
//! State transitions are monotone along
//! `PENDING_ENTRY -> PARTIAL -> OPEN -> CLOSING -> CLOSED` with the side
//! branches `CANCELLED` and `FAILED`. Every percent threshold (trailing,
//! pyramid, hedge) evaluates against the immutable original entry price.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Position lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    PendingEntry,
    Partial,
    Open,
    Closing,
    Closed,
    Cancelled,
    Failed,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::PendingEntry => "PENDING_ENTRY",
            PositionState::Partial => "PARTIAL",
            PositionState::Open => "OPEN",
            PositionState::Closing => "CLOSING",
            PositionState::Closed => "CLOSED",
            PositionState::Cancelled => "CANCELLED",
            PositionState::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<PositionState> {
        match raw.trim().to_uppercase().as_str() {
            "PENDING_ENTRY" => Some(PositionState::PendingEntry),
            "PARTIAL" => Some(PositionState::Partial),
            "OPEN" => Some(PositionState::Open),
            "CLOSING" => Some(PositionState::Closing),
            "CLOSED" => Some(PositionState::Closed),
            "CANCELLED" => Some(PositionState::Cancelled),
            "FAILED" => Some(PositionState::Failed),
            _ => None,
        }
    }

    /// Terminal states hold no exchange exposure and accept no transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionState::Closed | PositionState::Cancelled | PositionState::Failed
        )
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hedge lifecycle for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeState {
    None,
    Hedged,
    HedgeClosed,
}

impl HedgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HedgeState::None => "NONE",
            HedgeState::Hedged => "HEDGED",
            HedgeState::HedgeClosed => "HEDGE_CLOSED",
        }
    }

    pub fn parse(raw: &str) -> Option<HedgeState> {
        match raw.trim().to_uppercase().as_str() {
            "NONE" => Some(HedgeState::None),
            "HEDGED" => Some(HedgeState::Hedged),
            "HEDGE_CLOSED" => Some(HedgeState::HedgeClosed),
            _ => None,
        }
    }
}

impl std::fmt::Display for HedgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One take-profit ladder level, stored as a JSON column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpLevel {
    pub index: usize,
    pub price: Decimal,
    /// Quantity share allocated to this level.
    pub share_qty: Decimal,
    pub order_id: Option<String>,
    pub filled_qty: Decimal,
    pub done: bool,
}

impl TpLevel {
    pub fn new(index: usize, price: Decimal, share_qty: Decimal) -> Self {
        Self {
            index,
            price,
            share_qty,
            order_id: None,
            filled_qty: Decimal::ZERO,
            done: false,
        }
    }
}

/// One executed pyramid scale, stored inside `PyramidState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedScale {
    pub scale_id: u32,
    pub added_qty: Decimal,
    pub executed_at: DateTime<Utc>,
    pub order_id: String,
}

/// Pyramid progress for a position, stored as a JSON column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PyramidState {
    pub executed: Vec<ExecutedScale>,
}

impl PyramidState {
    pub fn has_scale(&self, scale_id: u32) -> bool {
        self.executed.iter().any(|s| s.scale_id == scale_id)
    }

    pub fn total_added(&self) -> Decimal {
        self.executed.iter().map(|s| s.added_qty).sum()
    }
}

/// Kind of a tracked exchange order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Entry,
    Tp,
    Sl,
    Pyramid,
    HedgeEntry,
    HedgeTp,
    HedgeSl,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Entry => "ENTRY",
            OrderKind::Tp => "TP",
            OrderKind::Sl => "SL",
            OrderKind::Pyramid => "PYRAMID",
            OrderKind::HedgeEntry => "HEDGE_ENTRY",
            OrderKind::HedgeTp => "HEDGE_TP",
            OrderKind::HedgeSl => "HEDGE_SL",
        }
    }

    pub fn parse(raw: &str) -> Option<OrderKind> {
        match raw.trim().to_uppercase().as_str() {
            "ENTRY" => Some(OrderKind::Entry),
            "TP" => Some(OrderKind::Tp),
            "SL" => Some(OrderKind::Sl),
            "PYRAMID" => Some(OrderKind::Pyramid),
            "HEDGE_ENTRY" => Some(OrderKind::HedgeEntry),
            "HEDGE_TP" => Some(OrderKind::HedgeTp),
            "HEDGE_SL" => Some(OrderKind::HedgeSl),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
