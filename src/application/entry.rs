//! Entry engine: dual-limit placement with merge-on-first-fill.
//!
//! Claims NEW signals (atomic CLAIMED transition with a lease), sizes the
//! position, and places two post-only GTC limit orders straddling the
//! entry mid. Fill progress is discovered by polling; on the first fill
//! the remaining original order is cancelled and replaced with a single
//! repriced order that preserves the volume-weighted intended entry.
//!
//! The exchange is authoritative: a position row only ever records what
//! order polling has confirmed, and `original_entry_price` is set exactly
//! once from the first merged average.

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::entities::order::{LimitOrderRequest, OrderSide};
use crate::domain::entities::position::{OrderKind, PositionState, TpLevel};
use crate::domain::entities::signal::{Side, SignalStatus};
use crate::domain::errors::ValidationError;
use crate::domain::services::quantize::{quantize_price, quantize_qty, PriceRounding};
use crate::domain::services::sizing::{self, SizingRequest};
use crate::infrastructure::exchange::{ExchangeError, ExchangeGateway};
use crate::persistence::lifecycle_store::LifecycleStore;
use crate::persistence::models::{CreatePosition, PositionRecord, SignalRecord};
use crate::persistence::signal_store::SignalStore;
use crate::persistence::telemetry::{Correlation, TelemetrySink};
use crate::task_runner::{self, CircuitBreakerConfig};

use super::publisher::Publisher;
use super::watchdog::{classify_error, CapacityGuard};
use super::PipelineError;

/// Tick-quantized dual-limit prices around the mid. Both round toward the
/// safe side of the book for the given direction.
pub fn dual_limit_prices(
    side: Side,
    mid: Decimal,
    half_spread: Decimal,
    tick: Decimal,
) -> (Decimal, Decimal) {
    let rounding = match side {
        Side::Long => PriceRounding::Down,
        Side::Short => PriceRounding::Up,
    };
    (
        quantize_price(mid - half_spread, tick, rounding),
        quantize_price(mid + half_spread, tick, rounding),
    )
}

/// Nudge a price away from the last traded price one tick at a time until
/// a post-only order at it cannot cross the book.
pub fn maker_safe_price(
    side: Side,
    price: Decimal,
    last_traded: Decimal,
    tick: Decimal,
    max_shifts: u32,
) -> Result<Decimal, ValidationError> {
    if tick <= Decimal::ZERO || last_traded <= Decimal::ZERO {
        return Ok(price);
    }
    let mut price = price;
    let mut shifts = 0;
    loop {
        let safe = match side {
            Side::Long => price < last_traded,
            Side::Short => price > last_traded,
        };
        if safe {
            return Ok(price);
        }
        if shifts >= max_shifts {
            return Err(ValidationError::MakerSafetyExhausted(max_shifts));
        }
        price = match side {
            Side::Long => price - tick,
            Side::Short => price + tick,
        };
        shifts += 1;
    }
}

/// 50/50 quantity split: the first leg rounds down to the step, the
/// second takes the remainder so the two always sum to the total.
pub fn split_quantity(total: Decimal, step: Decimal) -> (Decimal, Decimal) {
    let q1 = quantize_qty(total / Decimal::TWO, step);
    (q1, total - q1)
}

/// Replacement price preserving the volume-weighted intended entry:
/// `pr = (mid * total - filled_notional) / remaining`.
pub fn replacement_price(
    side: Side,
    mid: Decimal,
    total_qty: Decimal,
    filled_qty: Decimal,
    filled_notional: Decimal,
    tick: Decimal,
) -> Decimal {
    let remaining = total_qty - filled_qty;
    if remaining <= Decimal::ZERO {
        return mid;
    }
    let raw = (mid * total_qty - filled_notional) / remaining;
    let rounding = match side {
        Side::Long => PriceRounding::Down,
        Side::Short => PriceRounding::Up,
    };
    quantize_price(raw, tick, rounding)
}

/// Equal take-profit shares, quantized down, remainder on the last level.
/// The shares never sum to more than the planned quantity.
pub fn allocate_tp_shares(total: Decimal, levels: usize, step: Decimal) -> Vec<Decimal> {
    if levels == 0 {
        return Vec::new();
    }
    let per = quantize_qty(total / Decimal::from(levels as u64), step);
    let mut shares = vec![per; levels];
    let allocated: Decimal = per * Decimal::from((levels - 1) as u64);
    if let Some(last) = shares.last_mut() {
        *last = quantize_qty(total - allocated, step);
    }
    shares
}

/// Stage 2 executor.
pub struct EntryEngine {
    config: EngineConfig,
    signal_store: SignalStore,
    lifecycle_store: LifecycleStore,
    gateway: Arc<dyn ExchangeGateway>,
    publisher: Arc<Publisher>,
    telemetry: Arc<TelemetrySink>,
    capacity: CapacityGuard,
    worker_id: String,
}

impl EntryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        signal_store: SignalStore,
        lifecycle_store: LifecycleStore,
        gateway: Arc<dyn ExchangeGateway>,
        publisher: Arc<Publisher>,
        telemetry: Arc<TelemetrySink>,
        capacity: CapacityGuard,
        worker_id: String,
    ) -> Self {
        Self {
            config,
            signal_store,
            lifecycle_store,
            gateway,
            publisher,
            telemetry,
            capacity,
            worker_id,
        }
    }

    /// One engine iteration: advance pending entries, then claim at most
    /// one new signal.
    pub async fn tick(&self) -> Result<(), PipelineError> {
        self.poll_pending_fills().await?;

        let trading = &self.config.trading;
        if !trading.enabled || trading.extract_only {
            return Ok(());
        }
        if !self.capacity.may_accept_new_signal() {
            return Ok(());
        }

        let Some(signal) = self
            .signal_store
            .claim_next(&self.worker_id, trading.claim_lease)
            .await?
        else {
            return Ok(());
        };

        self.execute_claimed(signal).await;
        Ok(())
    }

    async fn execute_claimed(&self, signal: SignalRecord) {
        let signal_id = signal.id;
        match self.place_entry_for_signal(&signal).await {
            Ok(position) => {
                info!(
                    "Entry placed for signal {} -> position {} ({} {})",
                    signal_id, position.id, position.symbol, position.side
                );
            }
            Err(PipelineError::Exchange(e)) if e.is_transient() => {
                // Leave the work pending: the claim lease expires and the
                // signal becomes claimable again.
                warn!(
                    "Transient exchange error on signal {}; releasing claim: {}",
                    signal_id, e
                );
                if let Err(release_err) = self.signal_store.release_claim(signal_id).await {
                    warn!("Failed to release claim {}: {}", signal_id, release_err);
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Signal {} rejected: {}", signal_id, reason);
                self.telemetry.emit(
                    "signal_rejected",
                    "warning",
                    "entry",
                    "Signal rejected during entry",
                    Correlation::signal(signal_id),
                    Some(json!({
                        "reason": reason,
                        "class": classify_error("entry", &reason),
                        "symbol": signal.symbol,
                    })),
                );
                if let Err(store_err) = self
                    .signal_store
                    .mark_status(signal_id, SignalStatus::Rejected, Some(&reason))
                    .await
                {
                    warn!("Failed to mark signal {} rejected: {}", signal_id, store_err);
                }
                self.publisher
                    .notify_operator(
                        &format!(
                            "Signal REJECTED\nsignal_id={}\nsymbol={}\nreason={}",
                            signal_id, signal.symbol, reason
                        ),
                        Correlation::signal(signal_id),
                    )
                    .await;
            }
        }
    }

    /// Size the signal and place the dual-limit entry. Shared with the
    /// hedge manager's re-entry path, which replays the original signal.
    pub async fn place_entry_for_signal(
        &self,
        signal: &SignalRecord,
    ) -> Result<PositionRecord, PipelineError> {
        let side = signal.side();
        let symbol = signal.symbol.clone();
        let entry_mid = signal.entry_mid();

        let rules = self.gateway.get_symbol_rules(&symbol).await?;

        let balance = match self.gateway.get_balance().await {
            Ok(balance) => balance,
            Err(e) if e.is_transient() => {
                warn!("Balance fetch failed ({}); using configured baseline", e);
                self.config.trading.balance_baseline
            }
            Err(e) => return Err(e.into()),
        };

        let sizing = sizing::compute(&SizingRequest {
            side,
            entry_price: entry_mid,
            stop_loss: signal.sl_price(),
            balance,
            risk_per_trade: self.config.trading.risk_per_trade,
            initial_margin: self.config.trading.initial_margin,
            min_leverage: self.config.trading.min_leverage,
            max_leverage: self.config.trading.max_leverage,
        })?;

        let quantity = quantize_qty(sizing.quantity_raw, rules.qty_step);
        if quantity < rules.min_qty || quantity.is_zero() {
            return Err(ValidationError::BelowMinQuantity {
                quantity: quantity.to_string(),
                min_qty: rules.min_qty.to_string(),
            }
            .into());
        }

        self.signal_store.set_signal_type(signal.id, sizing.class).await?;

        self.gateway
            .set_leverage(&symbol, side, sizing.leverage)
            .await?;

        let last_traded = self.gateway.get_mark_price(&symbol).await?;
        let half_spread = quantize_price(
            entry_mid * self.config.trading.entry_spread_pct,
            rules.tick_size,
            PriceRounding::Nearest,
        );

        let (p1, p2) = dual_limit_prices(side, entry_mid, half_spread, rules.tick_size);
        let max_shifts = self.config.trading.max_price_shifts;
        let p1 = maker_safe_price(side, p1, last_traded, rules.tick_size, max_shifts)?;
        let p2 = maker_safe_price(side, p2, last_traded, rules.tick_size, max_shifts)?;

        let (q1, q2) = split_quantity(quantity, rules.qty_step);

        let mut order_ids = Vec::new();
        for (price, qty) in [(p1, q1), (p2, q2)] {
            if qty.is_zero() {
                continue;
            }
            let request = LimitOrderRequest {
                symbol: symbol.clone(),
                side: open_order_side(side),
                position_side: side,
                price,
                quantity: qty,
                post_only: true,
                reduce_only: false,
            };
            match self.gateway.place_limit(&request).await {
                Ok(order_id) => order_ids.push(order_id),
                Err(e) => {
                    // Partial placement is rolled back so the signal fails
                    // atomically.
                    for placed in &order_ids {
                        if let Err(cancel_err) = self.gateway.cancel_order(&symbol, placed).await {
                            warn!("Rollback cancel of {} failed: {}", placed, cancel_err);
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        if order_ids.is_empty() {
            return Err(ExchangeError::InvalidResponse("no entry orders placed".into()).into());
        }

        let sl_price = quantize_price(sizing.stop_loss, rules.tick_size, PriceRounding::Nearest);
        let tp_prices = signal.tp_prices();
        let shares = allocate_tp_shares(quantity, tp_prices.len(), rules.qty_step);
        let tp_levels: Vec<TpLevel> = tp_prices
            .iter()
            .zip(shares.iter())
            .enumerate()
            .map(|(index, (price, share))| {
                TpLevel::new(
                    index,
                    quantize_price(*price, rules.tick_size, PriceRounding::Nearest),
                    *share,
                )
            })
            .collect();

        let bot_order_id = Uuid::new_v4().to_string();

        // Telemetry lands before the position row exists.
        let mut correlation = Correlation::signal(signal.id).with_bot_order(bot_order_id.clone());
        for order_id in &order_ids {
            correlation = correlation.with_order(order_id.clone());
        }
        self.telemetry.emit(
            "entry_placed",
            "info",
            "entry",
            "Dual-limit entry placed",
            correlation,
            Some(json!({
                "symbol": symbol,
                "side": side.as_str(),
                "entry_mid": entry_mid.to_string(),
                "p1": p1.to_string(),
                "p2": p2.to_string(),
                "q1": q1.to_string(),
                "q2": q2.to_string(),
                "quantity": quantity.to_string(),
                "leverage": sizing.leverage.to_string(),
                "class": sizing.class.as_str(),
                "fast_fallback": sizing.fast_fallback,
            })),
        );

        let position = self
            .lifecycle_store
            .create_position(CreatePosition {
                signal_id: signal.id,
                bot_order_id,
                symbol: symbol.clone(),
                side,
                planned_qty: quantity,
                leverage: sizing.leverage,
                initial_margin: self.config.trading.initial_margin,
                sl_price,
                tp_levels,
                entry_order_ids: order_ids.clone(),
            })
            .await?;

        for order_id in &order_ids {
            self.lifecycle_store
                .upsert_tracker(position.id, order_id, OrderKind::Entry, None)
                .await?;
        }

        Ok(position)
    }

    /// Advance every PENDING_ENTRY / PARTIAL position from exchange truth.
    async fn poll_pending_fills(&self) -> Result<(), PipelineError> {
        let pending = self
            .lifecycle_store
            .list_by_states(&[PositionState::PendingEntry, PositionState::Partial])
            .await?;

        for position in pending {
            if let Err(e) = self.poll_one_pending(&position).await {
                warn!("Entry poll failed for position {}: {}", position.id, e);
            }
        }
        Ok(())
    }

    async fn poll_one_pending(&self, position: &PositionRecord) -> Result<(), PipelineError> {
        let mut order_ids = position.entry_order_ids();
        if let Some(replacement) = &position.replacement_order_id {
            order_ids.push(replacement.clone());
        }

        let (filled, notional) = self.sum_fills(&position.symbol, &order_ids).await?;
        if filled <= Decimal::ZERO {
            return Ok(());
        }
        let avg_entry = notional / filled;
        let planned = position.planned_qty();

        if filled >= planned {
            self.telemetry.emit(
                "entry_filled",
                "info",
                "entry",
                "Entry fully filled",
                Correlation::position(position.id).with_signal(position.signal_id),
                Some(json!({
                    "filled_qty": filled.to_string(),
                    "avg_entry_price": avg_entry.to_string(),
                })),
            );
            self.lifecycle_store
                .record_entry_fill(position.id, filled, filled, avg_entry)
                .await?;
            self.lifecycle_store
                .transition(
                    position.id,
                    &[PositionState::PendingEntry, PositionState::Partial],
                    PositionState::Open,
                    None,
                )
                .await?;
            return Ok(());
        }

        // Partial fill: record progress and merge once.
        self.lifecycle_store
            .record_entry_fill(position.id, filled, filled, avg_entry)
            .await?;
        self.lifecycle_store
            .transition(
                position.id,
                &[PositionState::PendingEntry],
                PositionState::Partial,
                None,
            )
            .await?;

        if position.replacement_order_id.is_some() {
            return Ok(());
        }

        self.merge_entry(position).await
    }

    /// Merge-on-first-fill: cancel surviving originals and place one
    /// replacement for the remainder at the volume-weighted price.
    async fn merge_entry(&self, position: &PositionRecord) -> Result<(), PipelineError> {
        let symbol = &position.symbol;
        let side = position.side();

        for order_id in position.entry_order_ids() {
            match self.gateway.get_order(symbol, &order_id).await {
                Ok(state) if state.status.is_open() => {
                    if let Err(e) = self.gateway.cancel_order(symbol, &order_id).await {
                        warn!("Cancel of original entry {} failed: {}", order_id, e);
                    }
                }
                Ok(_) => {}
                Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Re-read after cancels: a cancel can race one more fill.
        let (filled, notional) = self
            .sum_fills(symbol, &position.entry_order_ids())
            .await?;
        let planned = position.planned_qty();
        let remaining = planned - filled;
        if remaining <= Decimal::ZERO {
            return Ok(());
        }

        let rules = self.gateway.get_symbol_rules(symbol).await?;
        let entry_mid = self
            .signal_store
            .get(position.signal_id)
            .await?
            .map(|s| s.entry_mid())
            .unwrap_or(position.avg_entry_price().unwrap_or(Decimal::ZERO));

        let price = replacement_price(side, entry_mid, planned, filled, notional, rules.tick_size);
        let last_traded = self.gateway.get_mark_price(symbol).await?;
        let price = maker_safe_price(
            side,
            price,
            last_traded,
            rules.tick_size,
            self.config.trading.max_price_shifts,
        )?;

        let request = LimitOrderRequest {
            symbol: symbol.clone(),
            side: open_order_side(side),
            position_side: side,
            price,
            quantity: remaining,
            post_only: true,
            reduce_only: false,
        };
        let replacement_id = self.gateway.place_limit(&request).await?;

        self.telemetry.emit(
            "entry_merged",
            "info",
            "entry",
            "Originals cancelled, replacement placed",
            Correlation::position(position.id)
                .with_signal(position.signal_id)
                .with_order(replacement_id.clone()),
            Some(json!({
                "replacement_price": price.to_string(),
                "remaining_qty": remaining.to_string(),
                "filled_qty": filled.to_string(),
            })),
        );

        self.lifecycle_store
            .set_replacement_order(position.id, &replacement_id)
            .await?;
        self.lifecycle_store
            .upsert_tracker(position.id, &replacement_id, OrderKind::Entry, None)
            .await?;
        debug!("Position {} merged at {}", position.id, price);
        Ok(())
    }

    /// Sum executed quantity and notional across a set of orders.
    async fn sum_fills(
        &self,
        symbol: &str,
        order_ids: &[String],
    ) -> Result<(Decimal, Decimal), PipelineError> {
        let mut filled = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        for order_id in order_ids {
            let state = match self.gateway.get_order(symbol, order_id).await {
                Ok(state) => state,
                Err(ExchangeError::OrderNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if state.executed_qty > Decimal::ZERO && state.avg_fill_price > Decimal::ZERO {
                filled += state.executed_qty;
                notional += state.executed_qty * state.avg_fill_price;
            }
        }
        Ok((filled, notional))
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.trading.entry_poll_interval;
        let sleep_rx = shutdown.clone();
        let name = format!("entry-engine-{}", self.worker_id);
        task_runner::run_with_circuit_breaker(
            &name,
            CircuitBreakerConfig::default(),
            shutdown,
            move || {
                let engine = self.clone();
                let mut sleep_rx = sleep_rx.clone();
                async move {
                    engine.tick().await.map_err(|e| e.to_string())?;
                    task_runner::interruptible_sleep(interval, &mut sleep_rx).await;
                    Ok(())
                }
            },
        )
        .await;
    }
}

fn open_order_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Buy,
        Side::Short => OrderSide::Sell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_dual_limit_prices_straddle_mid() {
        let (p1, p2) = dual_limit_prices(Side::Long, dec!(0.02335), dec!(0.00002), dec!(0.00001));
        assert_eq!(p1, dec!(0.02333));
        assert_eq!(p2, dec!(0.02337));
        assert!(p1 < dec!(0.02335) && p2 > dec!(0.02335));
    }

    #[test]
    fn test_dual_limit_prices_round_to_safe_side() {
        // LONG rounds down, SHORT rounds up on the same inputs.
        let (long_p1, _) = dual_limit_prices(Side::Long, dec!(100.055), dec!(0.02), dec!(0.01));
        let (short_p1, _) = dual_limit_prices(Side::Short, dec!(100.055), dec!(0.02), dec!(0.01));
        assert_eq!(long_p1, dec!(100.03));
        assert_eq!(short_p1, dec!(100.04));
    }

    #[test]
    fn test_maker_safe_nudges_below_ltp_for_long() {
        // Both dual prices must rest below the last traded price.
        let price = maker_safe_price(Side::Long, dec!(100.02), dec!(100.00), dec!(0.01), 50).unwrap();
        assert!(price < dec!(100.00));
        assert_eq!(price, dec!(99.99));
    }

    #[test]
    fn test_maker_safe_nudges_above_ltp_for_short() {
        let price = maker_safe_price(Side::Short, dec!(99.98), dec!(100.00), dec!(0.01), 50).unwrap();
        assert!(price > dec!(100.00));
        assert_eq!(price, dec!(100.01));
    }

    #[test]
    fn test_maker_safe_already_safe_is_untouched() {
        let price = maker_safe_price(Side::Long, dec!(99.50), dec!(100.00), dec!(0.01), 50).unwrap();
        assert_eq!(price, dec!(99.50));
    }

    #[test]
    fn test_maker_safe_shift_budget_exhausted() {
        let result = maker_safe_price(Side::Long, dec!(101.00), dec!(100.00), dec!(0.01), 5);
        assert!(matches!(
            result,
            Err(ValidationError::MakerSafetyExhausted(5))
        ));
    }

    #[test]
    fn test_split_quantity_sums_to_total() {
        let (q1, q2) = split_quantity(dec!(7965), dec!(1));
        assert_eq!(q1, dec!(3982));
        assert_eq!(q2, dec!(3983));
        assert_eq!(q1 + q2, dec!(7965));

        let (q1, q2) = split_quantity(dec!(0.015), dec!(0.001));
        assert_eq!(q1, dec!(0.007));
        assert_eq!(q2, dec!(0.008));
    }

    #[test]
    fn test_replacement_price_preserves_weighted_entry() {
        // Planned 10 @ mid 100; 4 filled at 99.5. The remainder must rest
        // at a price that brings the blend back to 100.
        let price = replacement_price(
            Side::Long,
            dec!(100),
            dec!(10),
            dec!(4),
            dec!(398), // 4 * 99.5
            dec!(0.01),
        );
        // (100*10 - 398) / 6 = 100.333... rounded down to the tick.
        assert_eq!(price, dec!(100.33));

        // Volume-weighted check: 4*99.5 + 6*100.33 ~= 1000
        let blended = (dec!(398) + dec!(6) * price) / dec!(10);
        assert!((blended - dec!(100)).abs() < dec!(0.01));
    }

    #[test]
    fn test_replacement_price_full_fill_degenerates_to_mid() {
        let price = replacement_price(
            Side::Long,
            dec!(100),
            dec!(10),
            dec!(10),
            dec!(1000),
            dec!(0.01),
        );
        assert_eq!(price, dec!(100));
    }

    #[test]
    fn test_allocate_tp_shares_covers_total_exactly() {
        let shares = allocate_tp_shares(dec!(7965), 2, dec!(1));
        assert_eq!(shares, vec![dec!(3982), dec!(3983)]);
        assert_eq!(shares.iter().copied().sum::<Decimal>(), dec!(7965));

        let shares = allocate_tp_shares(dec!(10), 3, dec!(0.001));
        assert_eq!(shares.iter().copied().sum::<Decimal>(), dec!(10));
        // The reduce-only sum never exceeds the planned quantity.
        assert!(shares.iter().copied().sum::<Decimal>() <= dec!(10));
    }

    #[test]
    fn test_allocate_tp_shares_empty() {
        assert!(allocate_tp_shares(dec!(10), 0, dec!(1)).is_empty());
    }
}
