//! Price and quantity quantization.
//!
//! All monetary arithmetic is fixed-precision `Decimal`; prices snap to the
//! symbol's tick size and quantities to its quantity step. Direction is
//! explicit because prices must round toward the safe side of the book
//! (down for resting buys, up for resting sells), while sizing always
//! rounds quantities down.

use rust_decimal::{Decimal, RoundingStrategy};

/// Rounding direction for price quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceRounding {
    Down,
    Up,
    /// Half-up to the nearest tick.
    Nearest,
}

/// Snap a price to the tick grid. A non-positive tick returns the price
/// unchanged (malformed exchange metadata is logged upstream).
pub fn quantize_price(price: Decimal, tick_size: Decimal, rounding: PriceRounding) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return price;
    }
    let ticks = price / tick_size;
    let snapped = match rounding {
        PriceRounding::Down => ticks.floor(),
        PriceRounding::Up => ticks.ceil(),
        PriceRounding::Nearest => {
            ticks.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        }
    };
    (snapped * tick_size).normalize()
}

/// Snap a quantity down to the step grid.
pub fn quantize_qty(quantity: Decimal, qty_step: Decimal) -> Decimal {
    if qty_step <= Decimal::ZERO {
        return quantity;
    }
    ((quantity / qty_step).floor() * qty_step).normalize()
}

/// Percent move of `price` relative to `basis`, signed in favor of `Long`.
/// A positive result is a favorable move for the given side.
pub fn favorable_move_pct(
    side: crate::domain::entities::signal::Side,
    basis: Decimal,
    price: Decimal,
) -> Decimal {
    use crate::domain::entities::signal::Side;
    if basis.is_zero() {
        return Decimal::ZERO;
    }
    let raw = (price - basis) / basis * Decimal::ONE_HUNDRED;
    match side {
        Side::Long => raw,
        Side::Short => -raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn test_quantize_price_directions() {
        let tick = dec!(0.0001);
        assert_eq!(
            quantize_price(dec!(0.023349), tick, PriceRounding::Down),
            dec!(0.0233)
        );
        assert_eq!(
            quantize_price(dec!(0.023351), tick, PriceRounding::Up),
            dec!(0.0234)
        );
        assert_eq!(
            quantize_price(dec!(0.02335), tick, PriceRounding::Nearest),
            dec!(0.0234)
        );
        assert_eq!(
            quantize_price(dec!(0.02334), tick, PriceRounding::Nearest),
            dec!(0.0233)
        );
    }

    #[test]
    fn test_quantize_price_idempotent() {
        let tick = dec!(0.00001);
        for rounding in [PriceRounding::Down, PriceRounding::Up, PriceRounding::Nearest] {
            let once = quantize_price(dec!(0.0233517), tick, rounding);
            let twice = quantize_price(once, tick, rounding);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_quantize_price_zero_tick_passthrough() {
        assert_eq!(
            quantize_price(dec!(1.2345), Decimal::ZERO, PriceRounding::Nearest),
            dec!(1.2345)
        );
    }

    #[test]
    fn test_quantize_qty_rounds_down() {
        assert_eq!(quantize_qty(dec!(7965.73), dec!(1)), dec!(7965));
        assert_eq!(quantize_qty(dec!(0.0159), dec!(0.001)), dec!(0.015));
        // Already on the grid stays put
        assert_eq!(quantize_qty(dec!(0.015), dec!(0.001)), dec!(0.015));
    }

    #[test]
    fn test_quantize_qty_idempotent() {
        let once = quantize_qty(dec!(123.4567), dec!(0.01));
        assert_eq!(once, quantize_qty(once, dec!(0.01)));
    }

    #[test]
    fn test_favorable_move_pct() {
        assert_eq!(favorable_move_pct(Side::Long, dec!(100), dec!(103)), dec!(3));
        assert_eq!(favorable_move_pct(Side::Long, dec!(100), dec!(98)), dec!(-2));
        assert_eq!(favorable_move_pct(Side::Short, dec!(100), dec!(98)), dec!(2));
        assert_eq!(favorable_move_pct(Side::Short, dec!(100), dec!(103)), dec!(-3));
        assert_eq!(favorable_move_pct(Side::Long, Decimal::ZERO, dec!(1)), Decimal::ZERO);
    }
}
