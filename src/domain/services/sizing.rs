//! Position sizing and leverage classification.
//!
//! Given account balance `B`, per-trade risk `r`, planned initial margin
//! `IM`, entry `E` and stop `S`:
//!
//! ```text
//! delta    = |E - S| / E
//! notional = r * B / delta
//! leverage = clamp(notional / IM, min, max)   (HALF-UP, 2 decimals)
//! quantity = IM * leverage / E                (quantized down by caller)
//! ```
//!
//! A missing stop loss triggers the FAST fallback: the stop is synthesized
//! 2% from entry on the loss side and leverage is fixed at 10.00.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::entities::signal::{Side, SignalType};
use crate::domain::errors::ValidationError;

fn fast_sl_pct() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn fast_leverage() -> Decimal {
    Decimal::new(1000, 2) // 10.00
}

fn swing_max() -> Decimal {
    Decimal::new(600, 2) // 6.00
}

fn dynamic_min() -> Decimal {
    Decimal::new(750, 2) // 7.50
}

fn class_boundary() -> Decimal {
    Decimal::new(675, 2) // 6.75
}

/// Sizing request, validated on construction.
#[derive(Debug, Clone)]
pub struct SizingRequest {
    pub side: Side,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub balance: Decimal,
    pub risk_per_trade: Decimal,
    pub initial_margin: Decimal,
    pub min_leverage: Decimal,
    pub max_leverage: Decimal,
}

impl SizingRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.entry_price <= Decimal::ZERO {
            return Err(ValidationError::InvalidPrice(format!(
                "entry_price must be positive, got {}",
                self.entry_price
            )));
        }
        if self.balance < Decimal::ZERO {
            return Err(ValidationError::InvalidQuantity(
                "balance must be non-negative".to_string(),
            ));
        }
        if self.initial_margin <= Decimal::ZERO {
            return Err(ValidationError::InvalidQuantity(
                "initial_margin must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sizing result. `quantity_raw` is unquantized; the entry engine snaps it
/// down to the symbol's quantity step and enforces the exchange minimum.
#[derive(Debug, Clone, PartialEq)]
pub struct Sizing {
    pub leverage: Decimal,
    pub quantity_raw: Decimal,
    pub notional: Decimal,
    pub delta: Decimal,
    pub stop_loss: Decimal,
    pub class: SignalType,
    pub fast_fallback: bool,
}

/// Synthesize the FAST-fallback stop loss 2% from entry on the loss side.
pub fn fast_fallback_stop(side: Side, entry_price: Decimal) -> Decimal {
    match side {
        Side::Long => entry_price * (Decimal::ONE - fast_sl_pct()),
        Side::Short => entry_price * (Decimal::ONE + fast_sl_pct()),
    }
}

/// Classify a leverage into SWING/DYNAMIC. Values in the open interval
/// (6.00, 7.50) snap to the nearer class; exactly 6.75 goes to SWING.
pub fn classify_leverage(leverage: Decimal) -> SignalType {
    if leverage <= swing_max() {
        SignalType::Swing
    } else if leverage >= dynamic_min() {
        SignalType::Dynamic
    } else if leverage <= class_boundary() {
        SignalType::Swing
    } else {
        SignalType::Dynamic
    }
}

/// Compute leverage, quantity and classification for a signal.
pub fn compute(request: &SizingRequest) -> Result<Sizing, ValidationError> {
    request.validate()?;

    let entry = request.entry_price;

    let (stop_loss, leverage, delta, fast_fallback) = match request.stop_loss {
        None => {
            let sl = fast_fallback_stop(request.side, entry);
            (sl, fast_leverage(), fast_sl_pct(), true)
        }
        Some(sl) => {
            let mut delta = (entry - sl).abs() / entry;
            if delta.is_zero() {
                // Degenerate stop at entry: treat as the fallback distance.
                delta = fast_sl_pct();
            }
            let notional = request.risk_per_trade * request.balance / delta;
            let raw = notional / request.initial_margin;
            let clamped = raw
                .max(request.min_leverage)
                .min(request.max_leverage)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
            (sl, clamped, delta, false)
        }
    };

    let notional = request.initial_margin * leverage;
    let quantity_raw = notional / entry;

    let class = if fast_fallback {
        SignalType::Fast
    } else {
        classify_leverage(leverage)
    };

    Ok(Sizing {
        leverage,
        quantity_raw,
        notional,
        delta,
        stop_loss,
        class,
        fast_fallback,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(entry: Decimal, sl: Option<Decimal>) -> SizingRequest {
        SizingRequest {
            side: Side::Long,
            entry_price: entry,
            stop_loss: sl,
            balance: dec!(402.10),
            risk_per_trade: dec!(0.02),
            initial_margin: dec!(20.00),
            min_leverage: dec!(6.00),
            max_leverage: dec!(50.00),
        }
    }

    #[test]
    fn test_dynamic_sizing_from_signal_zone() {
        // #GUN LONG, mid 0.02335, SL 0.02234, balance 402.10
        let sizing = compute(&request(dec!(0.02335), Some(dec!(0.02234)))).unwrap();
        assert_eq!(sizing.leverage, dec!(9.30));
        assert_eq!(sizing.class, SignalType::Dynamic);
        assert!(!sizing.fast_fallback);
        // qty = 20 * 9.30 / 0.02335 ~= 7965.7
        assert!(sizing.quantity_raw > dec!(7965) && sizing.quantity_raw < dec!(7966));
        // delta ~= 0.04326
        assert!(sizing.delta > dec!(0.0432) && sizing.delta < dec!(0.0433));
    }

    #[test]
    fn test_fast_fallback_when_sl_missing() {
        let sizing = compute(&request(dec!(0.04160), None)).unwrap();
        assert!(sizing.fast_fallback);
        assert_eq!(sizing.leverage, dec!(10.00));
        assert_eq!(sizing.class, SignalType::Fast);
        assert_eq!(sizing.stop_loss, dec!(0.04160) * dec!(0.98));
    }

    #[test]
    fn test_fast_fallback_short_side() {
        let sl = fast_fallback_stop(Side::Short, dec!(100));
        assert_eq!(sl, dec!(102.00));
    }

    #[test]
    fn test_leverage_clamped_to_bounds() {
        // Very tight stop -> enormous notional -> clamp at 50.00
        let high = compute(&request(dec!(100), Some(dec!(99.9)))).unwrap();
        assert_eq!(high.leverage, dec!(50.00));

        // Very wide stop -> tiny notional -> clamp at 6.00
        let low = compute(&request(dec!(100), Some(dec!(50)))).unwrap();
        assert_eq!(low.leverage, dec!(6.00));
        assert_eq!(low.class, SignalType::Swing);
    }

    #[test]
    fn test_leverage_two_decimals() {
        let sizing = compute(&request(dec!(0.02335), Some(dec!(0.02234)))).unwrap();
        assert!(sizing.leverage.scale() <= 2);
    }

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(classify_leverage(dec!(6.00)), SignalType::Swing);
        assert_eq!(classify_leverage(dec!(7.50)), SignalType::Dynamic);
        assert_eq!(classify_leverage(dec!(6.74)), SignalType::Swing);
        // Exactly 6.75 classifies to the safer class.
        assert_eq!(classify_leverage(dec!(6.75)), SignalType::Swing);
        assert_eq!(classify_leverage(dec!(6.76)), SignalType::Dynamic);
        assert_eq!(classify_leverage(dec!(50.00)), SignalType::Dynamic);
    }

    #[test]
    fn test_degenerate_stop_at_entry() {
        let sizing = compute(&request(dec!(100), Some(dec!(100)))).unwrap();
        assert_eq!(sizing.delta, dec!(0.02));
    }

    #[test]
    fn test_invalid_entry_rejected() {
        let result = compute(&request(Decimal::ZERO, None));
        assert!(matches!(result, Err(ValidationError::InvalidPrice(_))));
    }
}
