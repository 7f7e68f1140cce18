//! Signal domain types.
//!
//! A signal is a message from a monitored channel that the detector
//! classified as an actionable trade intent. Parsing produces a
//! `ParsedSignal`; ingestion normalizes it into a `NormalizedSignal` that
//! the signal store persists.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trade direction. BUY maps to LONG, SELL maps to SHORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Order side that opens exposure in this direction.
    pub fn open_order_side(&self) -> &'static str {
        match self {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }

    /// Order side that reduces exposure in this direction.
    pub fn close_order_side(&self) -> &'static str {
        match self {
            Side::Long => "SELL",
            Side::Short => "BUY",
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        match raw.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => Some(Side::Long),
            "SHORT" | "SELL" => Some(Side::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leverage-derived classification of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    Swing,
    Dynamic,
    Fast,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Swing => "SWING",
            SignalType::Dynamic => "DYNAMIC",
            SignalType::Fast => "FAST",
        }
    }

    pub fn parse(raw: &str) -> Option<SignalType> {
        match raw.trim().to_uppercase().as_str() {
            "SWING" => Some(SignalType::Swing),
            "DYNAMIC" | "DYNAMISK" => Some(SignalType::Dynamic),
            "FAST" | "FIXED" => Some(SignalType::Fast),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal queue status. An executed signal stays CLAIMED; its position
/// record carries the rest of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStatus {
    New,
    Claimed,
    Rejected,
    Expired,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::New => "NEW",
            SignalStatus::Claimed => "CLAIMED",
            SignalStatus::Rejected => "REJECTED",
            SignalStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(raw: &str) -> Option<SignalStatus> {
        match raw.trim().to_uppercase().as_str() {
            "NEW" => Some(SignalStatus::New),
            "CLAIMED" => Some(SignalStatus::Claimed),
            "REJECTED" => Some(SignalStatus::Rejected),
            "EXPIRED" => Some(SignalStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry specification extracted from a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntrySpec {
    Single(Decimal),
    Zone { low: Decimal, high: Decimal },
}

impl EntrySpec {
    pub fn zone(a: Decimal, b: Decimal) -> Self {
        if a <= b {
            EntrySpec::Zone { low: a, high: b }
        } else {
            EntrySpec::Zone { low: b, high: a }
        }
    }

    /// Midpoint for a zone, the price itself for a single value.
    pub fn mid(&self) -> Decimal {
        match self {
            EntrySpec::Single(p) => *p,
            EntrySpec::Zone { low, high } => (*low + *high) / Decimal::TWO,
        }
    }

    pub fn bounds(&self) -> (Option<Decimal>, Option<Decimal>) {
        match self {
            EntrySpec::Single(_) => (None, None),
            EntrySpec::Zone { low, high } => (Some(*low), Some(*high)),
        }
    }
}

/// Raw trade intent extracted by the detector.
#[derive(Debug, Clone)]
pub struct ParsedSignal {
    /// Normalized `BASEUSDT` symbol.
    pub symbol: String,
    pub side: Side,
    pub entry: Option<EntrySpec>,
    /// Take-profit prices in message order.
    pub targets: Vec<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub declared_leverage: Option<Decimal>,
    /// Explicit type keyword in the text, if any.
    pub type_hint: Option<SignalType>,
}

/// Fully normalized signal, ready for persistence.
#[derive(Debug, Clone)]
pub struct NormalizedSignal {
    pub channel_name: String,
    pub chat_id: String,
    pub message_id: i64,
    pub message_ts: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub entry_mid: Decimal,
    pub entry_low: Option<Decimal>,
    pub entry_high: Option<Decimal>,
    /// Monotonic in the trade direction.
    pub targets: Vec<Decimal>,
    /// Absent stop loss triggers the FAST fallback at sizing time.
    pub stop_loss: Option<Decimal>,
    pub declared_leverage: Option<Decimal>,
    pub type_hint: Option<SignalType>,
    pub raw_text: String,
}

/// Normalize a raw symbol token to `BASEUSDT`.
///
/// Accepts `#GUN`, `GUN/USDT`, `GUN-USDT`, `GUNUSDT`, `gun` and returns
/// `GUNUSDT`. Returns None for tokens that are not 2-10 letters.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let mut s: String = raw
        .trim()
        .to_uppercase()
        .chars()
        .filter(|c| !matches!(c, '#' | '/' | '-') && !c.is_whitespace())
        .collect();
    if let Some(base) = s.strip_suffix("USDT") {
        s = base.to_string();
    }
    if s.len() < 2 || s.len() > 10 || !s.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(format!("{}USDT", s))
}

/// Order targets monotonically in the trade direction: ascending for LONG
/// (each target further above entry), descending for SHORT.
pub fn order_targets(side: Side, targets: &mut [Decimal]) {
    match side {
        Side::Long => targets.sort(),
        Side::Short => {
            targets.sort();
            targets.reverse();
        }
    }
}

/// True when the stop loss sits on the loss side of the entry.
pub fn stop_on_loss_side(side: Side, entry: Decimal, stop_loss: Decimal) -> bool {
    match side {
        Side::Long => stop_loss < entry,
        Side::Short => stop_loss > entry,
    }
}
