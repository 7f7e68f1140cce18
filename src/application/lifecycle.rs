//! Lifecycle manager: TP/SL attachment and position state transitions.
//!
//! On OPEN the manager attaches one reduce-only take-profit limit per
//! ladder level and a reduce-only stop-market, each individually
//! exchange-confirmed. A poll loop then reads tracked orders and applies
//! executed-qty deltas, so replaying unchanged exchange state is a no-op:
//!
//! - any TP fill reduces remaining exposure,
//! - a TP2 full fill moves the stop to break-even plus a cost epsilon,
//! - profit beyond the trigger arms a trailing stop that follows the
//!   peak favorable price, amendments rate-limited per position,
//! - a filled stop closes the position with `stop_hit`.
//!
//! Positions in hedge mode are owned by the hedge manager and skipped.

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::entities::order::{LimitOrderRequest, OrderSide, StopOrderRequest};
use crate::domain::entities::position::{HedgeState, OrderKind, PositionState};
use crate::domain::entities::signal::Side;
use crate::domain::services::quantize::{favorable_move_pct, quantize_price, PriceRounding};
use crate::infrastructure::exchange::{ExchangeError, ExchangeGateway, OrderStatus};
use crate::persistence::lifecycle_store::LifecycleStore;
use crate::persistence::models::PositionRecord;
use crate::persistence::signal_store::SignalStore;
use crate::persistence::telemetry::{Correlation, TelemetrySink};
use crate::task_runner::{self, CircuitBreakerConfig};

use super::publisher::{EntryConfirmation, Publisher};
use super::PipelineError;

/// Break-even stop: entry nudged by the cost epsilon toward profit.
pub fn breakeven_price(side: Side, entry: Decimal, epsilon_pct: Decimal) -> Decimal {
    let offset = entry * epsilon_pct / Decimal::ONE_HUNDRED;
    match side {
        Side::Long => entry + offset,
        Side::Short => entry - offset,
    }
}

/// Trailing stop price behind the peak favorable price.
pub fn trailing_stop_price(side: Side, peak: Decimal, distance_pct: Decimal) -> Decimal {
    let offset = peak * distance_pct / Decimal::ONE_HUNDRED;
    match side {
        Side::Long => peak - offset,
        Side::Short => peak + offset,
    }
}

/// True when `candidate` protects more profit than `current`.
pub fn stop_improves(side: Side, current: Option<Decimal>, candidate: Decimal) -> bool {
    match current {
        None => true,
        Some(current) => match side {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        },
    }
}

pub struct LifecycleManager {
    config: EngineConfig,
    signal_store: SignalStore,
    lifecycle_store: LifecycleStore,
    gateway: Arc<dyn ExchangeGateway>,
    publisher: Arc<Publisher>,
    telemetry: Arc<TelemetrySink>,
}

impl LifecycleManager {
    pub fn new(
        config: EngineConfig,
        signal_store: SignalStore,
        lifecycle_store: LifecycleStore,
        gateway: Arc<dyn ExchangeGateway>,
        publisher: Arc<Publisher>,
        telemetry: Arc<TelemetrySink>,
    ) -> Self {
        Self {
            config,
            signal_store,
            lifecycle_store,
            gateway,
            publisher,
            telemetry,
        }
    }

    /// One lifecycle iteration.
    pub async fn tick(&self) -> Result<(), PipelineError> {
        self.attach_pending().await?;
        self.poll_orders().await?;
        self.update_trailing().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // TP/SL attachment
    // ------------------------------------------------------------------

    async fn attach_pending(&self) -> Result<(), PipelineError> {
        let open = self
            .lifecycle_store
            .list_by_states(&[PositionState::Open])
            .await?;

        for position in open {
            if position.hedge_state() != HedgeState::None {
                continue;
            }
            let needs_tp = position
                .tp_levels()
                .iter()
                .any(|l| l.order_id.is_none() && !l.done && l.share_qty > Decimal::ZERO);
            let needs_sl = position.sl_order_id.is_none();
            if !needs_tp && !needs_sl {
                continue;
            }
            if let Err(e) = self.attach_one(&position).await {
                warn!("TP/SL attach failed for position {}: {}", position.id, e);
            }
        }
        Ok(())
    }

    async fn attach_one(&self, position: &PositionRecord) -> Result<(), PipelineError> {
        let side = position.side();
        let close_side = close_order_side(side);
        let mut levels = position.tp_levels();

        for idx in 0..levels.len() {
            let (skip, price, share_qty, level_index) = {
                let level = &levels[idx];
                (
                    level.order_id.is_some() || level.done || level.share_qty.is_zero(),
                    level.price,
                    level.share_qty,
                    level.index,
                )
            };
            if skip {
                continue;
            }
            let request = LimitOrderRequest {
                symbol: position.symbol.clone(),
                side: close_side,
                position_side: side,
                price,
                quantity: share_qty,
                post_only: false,
                reduce_only: true,
            };
            match self.gateway.place_limit(&request).await {
                Ok(order_id) => {
                    levels[idx].order_id = Some(order_id.clone());
                    self.lifecycle_store
                        .update_tp_levels(position.id, &levels)
                        .await?;
                    self.lifecycle_store
                        .upsert_tracker(position.id, &order_id, OrderKind::Tp, Some(level_index as i64))
                        .await?;
                }
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    self.fail_position(position, &format!("TP{} attach failed: {}", level_index + 1, e))
                        .await?;
                    return Ok(());
                }
            }
        }

        if position.sl_order_id.is_none() {
            let sl_price = position.sl_price().unwrap_or(Decimal::ZERO);
            if sl_price > Decimal::ZERO {
                let request = StopOrderRequest {
                    symbol: position.symbol.clone(),
                    side: close_side,
                    position_side: side,
                    stop_price: sl_price,
                    quantity: position.remaining_qty(),
                };
                match self.gateway.place_stop_market(&request).await {
                    Ok(order_id) => {
                        self.lifecycle_store
                            .set_stop_loss(position.id, sl_price, Some(&order_id))
                            .await?;
                        self.lifecycle_store
                            .upsert_tracker(position.id, &order_id, OrderKind::Sl, None)
                            .await?;
                    }
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => {
                        self.fail_position(position, &format!("SL attach failed: {}", e))
                            .await?;
                        return Ok(());
                    }
                }
            }
        }

        self.telemetry.emit(
            "tp_sl_attached",
            "info",
            "lifecycle",
            "Reduce-only TP ladder and stop attached",
            Correlation::position(position.id).with_signal(position.signal_id),
            Some(json!({
                "tp_count": levels.len(),
                "sl_price": position.sl_price.clone(),
            })),
        );
        info!("Position {} protected (TP/SL attached)", position.id);

        self.publish_confirmation(position, &levels).await;
        Ok(())
    }

    /// Exchange-first confirmation: only sent once the entry has filled
    /// and every protective order is acknowledged.
    async fn publish_confirmation(
        &self,
        position: &PositionRecord,
        levels: &[crate::domain::entities::position::TpLevel],
    ) {
        let source_channel = match self.signal_store.get(position.signal_id).await {
            Ok(Some(signal)) => signal.channel_name,
            _ => String::new(),
        };
        let confirmation = EntryConfirmation {
            bot_order_id: position.bot_order_id.clone(),
            exchange_order_ids: position.entry_order_ids(),
            source_channel,
            symbol: position.symbol.clone(),
            side: position.side(),
            entry_price: position
                .original_entry_price()
                .unwrap_or_else(|| position.avg_entry_price().unwrap_or(Decimal::ZERO)),
            sl_price: position.sl_price().unwrap_or(Decimal::ZERO),
            leverage: position.leverage(),
            quantity: position.planned_qty(),
            tp_list: levels.iter().map(|l| (l.price, l.share_qty)).collect(),
            order_accepted: true,
            tp_sl_set: true,
            position_opened: true,
        };
        self.publisher
            .publish_confirmation(
                &confirmation,
                Correlation::position(position.id).with_signal(position.signal_id),
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Order polling (executed-qty deltas)
    // ------------------------------------------------------------------

    async fn poll_orders(&self) -> Result<(), PipelineError> {
        let tracked = self
            .lifecycle_store
            .list_by_states(&[PositionState::Open, PositionState::Closing])
            .await?;

        for position in tracked {
            if position.hedge_state() == HedgeState::Hedged {
                continue;
            }
            if let Err(e) = self.poll_one(&position).await {
                warn!("Lifecycle poll failed for position {}: {}", position.id, e);
            }
        }
        Ok(())
    }

    async fn poll_one(&self, position: &PositionRecord) -> Result<(), PipelineError> {
        let trackers = self.lifecycle_store.list_trackers_for(position.id).await?;

        for tracker in trackers {
            let kind = tracker.kind();
            if !matches!(kind, OrderKind::Tp | OrderKind::Sl | OrderKind::Pyramid) {
                continue;
            }

            let state = match self
                .gateway
                .get_order(&position.symbol, &tracker.order_id)
                .await
            {
                Ok(state) => state,
                Err(ExchangeError::OrderNotFound(_)) => continue,
                Err(e) if e.is_transient() => {
                    debug!("Order {} state unknown this poll: {}", tracker.order_id, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let last = tracker.last_executed_qty();
            if state.executed_qty < last {
                // Exchange reported less than before; record and let the
                // reconcile pass sort it out.
                self.lifecycle_store
                    .update_tracker(&tracker.order_id, state.executed_qty, Some(state.status.as_str()))
                    .await?;
                continue;
            }

            let delta = state.executed_qty - last;
            if delta > Decimal::ZERO {
                self.apply_fill(position, kind, &tracker.order_id, tracker.level_index, delta, state.status)
                    .await?;
            }

            self.lifecycle_store
                .update_tracker(&tracker.order_id, state.executed_qty, Some(state.status.as_str()))
                .await?;

            if kind == OrderKind::Sl && state.status == OrderStatus::Filled {
                self.close_position(position, "stop_hit").await?;
                return Ok(());
            }
        }

        self.check_closing(position).await
    }

    async fn apply_fill(
        &self,
        position: &PositionRecord,
        kind: OrderKind,
        order_id: &str,
        level_index: Option<i64>,
        delta: Decimal,
        status: OrderStatus,
    ) -> Result<(), PipelineError> {
        let correlation = Correlation::position(position.id)
            .with_signal(position.signal_id)
            .with_order(order_id.to_string());

        match kind {
            OrderKind::Tp => {
                self.telemetry.emit(
                    "tp_fill",
                    "info",
                    "lifecycle",
                    "Take-profit fill confirmed",
                    correlation,
                    Some(json!({
                        "level": level_index,
                        "fill_qty": delta.to_string(),
                        "status": status.as_str(),
                    })),
                );

                let mut levels = position.tp_levels();
                let mut tp2_completed = false;
                if let Some(index) = level_index {
                    if let Some(level) = levels.iter_mut().find(|l| l.index as i64 == index) {
                        level.filled_qty += delta;
                        if status == OrderStatus::Filled || level.filled_qty >= level.share_qty {
                            level.done = true;
                            tp2_completed = level.index == 1;
                        }
                    }
                }
                self.lifecycle_store
                    .update_tp_levels(position.id, &levels)
                    .await?;
                self.lifecycle_store
                    .reduce_remaining(position.id, delta)
                    .await?;

                // TP2 full fill moves the stop to break-even + epsilon.
                if tp2_completed && !position.trailing_active() {
                    if let Some(entry) = position.original_entry_price() {
                        let breakeven = breakeven_price(
                            position.side(),
                            entry,
                            self.config.lifecycle.breakeven_epsilon_pct,
                        );
                        if let Err(e) = self.amend_stop(position, breakeven, "breakeven").await {
                            warn!("Break-even move failed for position {}: {}", position.id, e);
                        }
                    }
                }
            }
            OrderKind::Sl => {
                self.telemetry.emit(
                    "sl_fill",
                    "warning",
                    "lifecycle",
                    "Stop-loss fill confirmed",
                    correlation,
                    Some(json!({
                        "fill_qty": delta.to_string(),
                        "status": status.as_str(),
                    })),
                );
                self.lifecycle_store
                    .reduce_remaining(position.id, delta)
                    .await?;
            }
            OrderKind::Pyramid => {
                self.telemetry.emit(
                    "pyramid_fill",
                    "info",
                    "lifecycle",
                    "Pyramid add fill confirmed",
                    correlation,
                    Some(json!({ "fill_qty": delta.to_string() })),
                );
                self.lifecycle_store
                    .increase_filled(position.id, delta)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// OPEN -> CLOSING once every TP is done; CLOSING -> CLOSED once the
    /// exchange reads the position flat.
    async fn check_closing(&self, position: &PositionRecord) -> Result<(), PipelineError> {
        let Some(current) = self.lifecycle_store.get(position.id).await? else {
            return Ok(());
        };

        if current.state() == PositionState::Open {
            let levels = current.tp_levels();
            if !levels.is_empty() && levels.iter().all(|l| l.done) {
                self.telemetry.emit(
                    "position_closing",
                    "info",
                    "lifecycle",
                    "All take-profits filled; awaiting flat position",
                    Correlation::position(current.id).with_signal(current.signal_id),
                    None,
                );
                self.lifecycle_store
                    .transition(current.id, &[PositionState::Open], PositionState::Closing, None)
                    .await?;
            }
            if current.remaining_qty() <= Decimal::ZERO && current.filled_qty() > Decimal::ZERO {
                self.close_position(&current, "position_exhausted").await?;
            }
            return Ok(());
        }

        if current.state() == PositionState::Closing {
            let open_positions = self.gateway.get_positions(Some(&current.symbol)).await?;
            let still_open = open_positions
                .iter()
                .any(|p| p.side == current.side() && p.qty > Decimal::ZERO);
            if !still_open {
                self.close_position(&current, "targets_filled").await?;
            }
        }
        Ok(())
    }

    /// Terminal close: cancel leftovers, then CAS to CLOSED.
    pub async fn close_position(
        &self,
        position: &PositionRecord,
        reason: &str,
    ) -> Result<(), PipelineError> {
        self.telemetry.emit(
            "position_closed",
            "info",
            "lifecycle",
            "Position closed (exchange confirmed)",
            Correlation::position(position.id).with_signal(position.signal_id),
            Some(json!({ "reason": reason })),
        );

        let applied = self
            .lifecycle_store
            .transition(
                position.id,
                &[
                    PositionState::Open,
                    PositionState::Closing,
                    PositionState::Partial,
                ],
                PositionState::Closed,
                Some(reason),
            )
            .await?;
        if !applied {
            return Ok(());
        }

        // Cancel whatever protective orders are still resting.
        for level in position.tp_levels() {
            if let Some(order_id) = &level.order_id {
                if !level.done {
                    let _ = self.gateway.cancel_order(&position.symbol, order_id).await;
                }
            }
        }
        if reason != "stop_hit" {
            if let Some(sl_order_id) = &position.sl_order_id {
                let _ = self.gateway.cancel_order(&position.symbol, sl_order_id).await;
            }
        }

        self.lifecycle_store
            .reduce_remaining(position.id, position.remaining_qty())
            .await?;
        info!("Position {} closed ({})", position.id, reason);
        Ok(())
    }

    async fn fail_position(
        &self,
        position: &PositionRecord,
        reason: &str,
    ) -> Result<(), PipelineError> {
        self.telemetry.emit(
            "position_failed",
            "error",
            "lifecycle",
            reason,
            Correlation::position(position.id).with_signal(position.signal_id),
            None,
        );
        let applied = self
            .lifecycle_store
            .transition(
                position.id,
                &[
                    PositionState::Open,
                    PositionState::Partial,
                    PositionState::PendingEntry,
                ],
                PositionState::Failed,
                Some(reason),
            )
            .await?;
        if applied {
            self.publisher
                .notify_operator(
                    &format!(
                        "Position FAILED\nposition_id={}\nsymbol={}\nreason={}",
                        position.id, position.symbol, reason
                    ),
                    Correlation::position(position.id).with_signal(position.signal_id),
                )
                .await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trailing stop
    // ------------------------------------------------------------------

    async fn update_trailing(&self) -> Result<(), PipelineError> {
        let open = self
            .lifecycle_store
            .list_by_states(&[PositionState::Open])
            .await?;

        for position in open {
            if position.hedge_state() != HedgeState::None {
                continue;
            }
            let Some(entry) = position.original_entry_price() else {
                continue;
            };
            if let Err(e) = self.trail_one(&position, entry).await {
                warn!("Trailing update failed for position {}: {}", position.id, e);
            }
        }
        Ok(())
    }

    async fn trail_one(
        &self,
        position: &PositionRecord,
        entry: Decimal,
    ) -> Result<(), PipelineError> {
        let side = position.side();
        let mark = self.gateway.get_mark_price(&position.symbol).await?;
        let profit = favorable_move_pct(side, entry, mark);

        if !position.trailing_active() && profit < self.config.lifecycle.trail_trigger_pct {
            return Ok(());
        }

        // Peak is the most favorable price seen since trailing armed.
        let peak = match (position.peak_price(), side) {
            (Some(peak), Side::Long) => peak.max(mark),
            (Some(peak), Side::Short) => peak.min(mark),
            (None, _) => mark,
        };
        self.lifecycle_store.set_peak(position.id, peak, true).await?;

        let candidate =
            trailing_stop_price(side, peak, self.config.lifecycle.trail_distance_pct);
        let rules = self.gateway.get_symbol_rules(&position.symbol).await?;
        let candidate = quantize_price(candidate, rules.tick_size, PriceRounding::Nearest);

        if !stop_improves(side, position.sl_price(), candidate) {
            return Ok(());
        }

        // Rate limit amendments so the exchange is not hammered.
        if let Some(last) = position.sl_amended_at {
            let min_interval = chrono::Duration::from_std(
                self.config.lifecycle.trail_min_amend_interval,
            )
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
            if chrono::Utc::now() - last < min_interval {
                return Ok(());
            }
        }

        self.amend_stop(position, candidate, "trail").await
    }

    /// Replace the protective stop: the new order is placed before the old
    /// one is cancelled so the position is never unprotected.
    async fn amend_stop(
        &self,
        position: &PositionRecord,
        new_price: Decimal,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let side = position.side();
        let request = StopOrderRequest {
            symbol: position.symbol.clone(),
            side: close_order_side(side),
            position_side: side,
            stop_price: new_price,
            quantity: position.remaining_qty(),
        };
        let new_order_id = self.gateway.place_stop_market(&request).await?;

        self.telemetry.emit(
            "sl_moved",
            "info",
            "lifecycle",
            "Stop-loss amended (exchange confirmed)",
            Correlation::position(position.id)
                .with_signal(position.signal_id)
                .with_order(new_order_id.clone()),
            Some(json!({
                "new_sl": new_price.to_string(),
                "reason": reason,
            })),
        );

        self.lifecycle_store
            .set_stop_loss(position.id, new_price, Some(&new_order_id))
            .await?;
        self.lifecycle_store.touch_sl_amended(position.id).await?;
        self.lifecycle_store
            .upsert_tracker(position.id, &new_order_id, OrderKind::Sl, None)
            .await?;

        if let Some(old_order_id) = &position.sl_order_id {
            match self.gateway.cancel_order(&position.symbol, old_order_id).await {
                Ok(()) | Err(ExchangeError::OrderNotFound(_)) => {
                    self.lifecycle_store.delete_tracker(old_order_id).await?;
                }
                Err(e) => warn!("Old stop {} not cancelled yet: {}", old_order_id, e),
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.lifecycle.poll_interval;
        let sleep_rx = shutdown.clone();
        task_runner::run_with_circuit_breaker(
            "lifecycle-manager",
            CircuitBreakerConfig::default(),
            shutdown,
            move || {
                let manager = self.clone();
                let mut sleep_rx = sleep_rx.clone();
                async move {
                    manager.tick().await.map_err(|e| e.to_string())?;
                    task_runner::interruptible_sleep(interval, &mut sleep_rx).await;
                    Ok(())
                }
            },
        )
        .await;
    }
}

fn close_order_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Sell,
        Side::Short => OrderSide::Buy,
    }
}
