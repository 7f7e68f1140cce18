//! Hedge and re-entry manager.
//!
//! Adverse move: when an OPEN position moves 2% against the original
//! entry price and no hedge exists, a counter-direction position of the
//! current size is opened at market with the same leverage. Its exit
//! orders sit at the two signal levels: the hedge TP at the original
//! entry price (a stop, it triggers when price recovers) and the hedge SL
//! at the original stop price (a reduce-only limit on the profitable
//! side). Either fill closes everything.
//!
//! Re-entry: a primary stop-out (including a hedge TP fill, which counts
//! as the primary SL event) triggers a fresh dual-limit entry from the
//! original signal parameters. Only failed attempts count, bounded at
//! `max_reentry_attempts` per signal; exhaustion locks the (symbol, side)
//! until ingestion accepts a new signal for the symbol.

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::domain::entities::order::{LimitOrderRequest, MarketOrderRequest, OrderSide, StopOrderRequest};
use crate::domain::entities::position::{HedgeState, OrderKind, PositionState};
use crate::domain::entities::signal::Side;
use crate::domain::services::quantize::favorable_move_pct;
use crate::domain::services::sizing::fast_fallback_stop;
use crate::infrastructure::exchange::{ExchangeError, ExchangeGateway, OrderStatus};
use crate::persistence::lifecycle_store::LifecycleStore;
use crate::persistence::models::PositionRecord;
use crate::persistence::signal_store::SignalStore;
use crate::persistence::telemetry::{Correlation, TelemetrySink};
use crate::task_runner::{self, CircuitBreakerConfig};

use super::entry::EntryEngine;
use super::PipelineError;

/// Close reason recorded when the hedge stop (at the original SL) fills.
const HEDGE_STOP_EXIT: &str = "hedge_stop_exit";

pub struct HedgeReentryManager {
    config: EngineConfig,
    signal_store: SignalStore,
    lifecycle_store: LifecycleStore,
    gateway: Arc<dyn ExchangeGateway>,
    entry_engine: Arc<EntryEngine>,
    telemetry: Arc<TelemetrySink>,
}

impl HedgeReentryManager {
    pub fn new(
        config: EngineConfig,
        signal_store: SignalStore,
        lifecycle_store: LifecycleStore,
        gateway: Arc<dyn ExchangeGateway>,
        entry_engine: Arc<EntryEngine>,
        telemetry: Arc<TelemetrySink>,
    ) -> Self {
        Self {
            config,
            signal_store,
            lifecycle_store,
            gateway,
            entry_engine,
            telemetry,
        }
    }

    pub async fn tick(&self) -> Result<(), PipelineError> {
        if !self.config.hedge.enabled {
            return Ok(());
        }

        let open = self
            .lifecycle_store
            .list_by_states(&[PositionState::Open])
            .await?;

        for position in &open {
            let result = match position.hedge_state() {
                HedgeState::None => self.check_adverse_move(position).await,
                HedgeState::Hedged => self.resolve_hedge(position).await,
                HedgeState::HedgeClosed => Ok(()),
            };
            if let Err(e) = result {
                warn!("Hedge check failed for position {}: {}", position.id, e);
            }
        }

        if let Err(e) = self.reentry_scan().await {
            warn!("Re-entry scan failed: {}", e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Adverse move -> hedge
    // ------------------------------------------------------------------

    async fn check_adverse_move(&self, position: &PositionRecord) -> Result<(), PipelineError> {
        let Some(entry) = position.original_entry_price() else {
            return Ok(());
        };
        let qty = position.remaining_qty();
        if qty <= Decimal::ZERO {
            return Ok(());
        }

        let mark = self.gateway.get_mark_price(&position.symbol).await?;
        let move_pct = favorable_move_pct(position.side(), entry, mark);
        if move_pct > -self.config.hedge.adverse_move_pct {
            return Ok(());
        }

        self.telemetry.emit(
            "hedge_triggered",
            "warning",
            "hedge",
            "Adverse move reached hedge threshold",
            Correlation::position(position.id).with_signal(position.signal_id),
            Some(json!({
                "move_pct": move_pct.round_dp(4).to_string(),
                "mark_price": mark.to_string(),
                "original_entry": entry.to_string(),
            })),
        );

        // One-shot: the CAS loses for everyone but the first observer.
        if !self
            .lifecycle_store
            .transition_hedge(position.id, HedgeState::None, HedgeState::Hedged)
            .await?
        {
            return Ok(());
        }

        self.open_hedge(position, entry, qty).await
    }

    async fn open_hedge(
        &self,
        position: &PositionRecord,
        original_entry: Decimal,
        qty: Decimal,
    ) -> Result<(), PipelineError> {
        let side = position.side();
        let hedge_side = side.opposite();
        let symbol = position.symbol.clone();

        // The primary's protective orders would fight the hedge; remove
        // them first.
        for level in position.tp_levels() {
            if let Some(order_id) = &level.order_id {
                if !level.done {
                    let _ = self.gateway.cancel_order(&symbol, order_id).await;
                }
            }
        }
        if let Some(sl_order_id) = &position.sl_order_id {
            let _ = self.gateway.cancel_order(&symbol, sl_order_id).await;
        }
        self.lifecycle_store
            .delete_trackers_for(position.id, &[OrderKind::Tp, OrderKind::Sl])
            .await?;
        self.lifecycle_store.clear_stop_loss_order(position.id).await?;

        self.gateway
            .set_leverage(&symbol, hedge_side, position.leverage())
            .await?;

        let entry_order_id = self
            .gateway
            .place_market(&MarketOrderRequest {
                symbol: symbol.clone(),
                side: open_order_side(hedge_side),
                position_side: hedge_side,
                quantity: qty,
                reduce_only: false,
            })
            .await?;

        // The stop price the signal carried; reconstructed via the FAST
        // rule when the signal had none.
        let signal_sl = match self.signal_store.get(position.signal_id).await? {
            Some(signal) => signal
                .sl_price()
                .unwrap_or_else(|| fast_fallback_stop(side, original_entry)),
            None => fast_fallback_stop(side, original_entry),
        };

        let close_side = close_order_side(hedge_side);

        // Hedge TP at the original entry: on the adverse side of the hedge,
        // so it rests as a stop and triggers when price recovers.
        let tp_order_id = self
            .gateway
            .place_stop_market(&StopOrderRequest {
                symbol: symbol.clone(),
                side: close_side,
                position_side: hedge_side,
                stop_price: original_entry,
                quantity: qty,
            })
            .await
            .map(Some)
            .unwrap_or_else(|e| {
                warn!("Hedge TP placement failed: {}", e);
                None
            });

        // Hedge SL at the original stop: on the profitable side of the
        // hedge, a reduce-only limit.
        let sl_order_id = self
            .gateway
            .place_limit(&LimitOrderRequest {
                symbol: symbol.clone(),
                side: close_side,
                position_side: hedge_side,
                price: signal_sl,
                quantity: qty,
                post_only: false,
                reduce_only: true,
            })
            .await
            .map(Some)
            .unwrap_or_else(|e| {
                warn!("Hedge SL placement failed: {}", e);
                None
            });

        self.lifecycle_store
            .set_hedge_orders(
                position.id,
                Some(entry_order_id.as_str()),
                tp_order_id.as_deref(),
                sl_order_id.as_deref(),
            )
            .await?;

        self.lifecycle_store
            .upsert_tracker(position.id, &entry_order_id, OrderKind::HedgeEntry, None)
            .await?;
        if let Some(order_id) = &tp_order_id {
            self.lifecycle_store
                .upsert_tracker(position.id, order_id, OrderKind::HedgeTp, None)
                .await?;
        }
        if let Some(order_id) = &sl_order_id {
            self.lifecycle_store
                .upsert_tracker(position.id, order_id, OrderKind::HedgeSl, None)
                .await?;
        }

        self.telemetry.emit(
            "hedge_opened",
            "info",
            "hedge",
            "Counter-direction hedge opened",
            Correlation::position(position.id)
                .with_signal(position.signal_id)
                .with_order(entry_order_id.clone()),
            Some(json!({
                "symbol": symbol,
                "primary_side": side.as_str(),
                "hedge_side": hedge_side.as_str(),
                "qty": qty.to_string(),
                "hedge_tp_at_entry": original_entry.to_string(),
                "hedge_sl_at_stop": signal_sl.to_string(),
            })),
        );
        info!(
            "Hedge opened for position {}: {} {} {}",
            position.id, hedge_side, qty, symbol
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hedge resolution -> forced exit
    // ------------------------------------------------------------------

    async fn resolve_hedge(&self, position: &PositionRecord) -> Result<(), PipelineError> {
        let tp_filled = self
            .order_filled(&position.symbol, position.hedge_tp_order_id.as_deref())
            .await?;
        let sl_filled = if tp_filled {
            false
        } else {
            self.order_filled(&position.symbol, position.hedge_sl_order_id.as_deref())
                .await?
        };
        if !tp_filled && !sl_filled {
            return Ok(());
        }

        // The hedge TP sits at the original entry, so its fill is the
        // primary SL event for re-entry purposes.
        let close_reason = if tp_filled { "stop_hit" } else { HEDGE_STOP_EXIT };

        self.telemetry.emit(
            "hedge_closed",
            "info",
            "hedge",
            "Hedge exit filled; forcing primary exit",
            Correlation::position(position.id).with_signal(position.signal_id),
            Some(json!({
                "outcome": if tp_filled { "hedge_tp" } else { "hedge_sl" },
                "close_reason": close_reason,
            })),
        );

        if !self
            .lifecycle_store
            .transition_hedge(position.id, HedgeState::Hedged, HedgeState::HedgeClosed)
            .await?
        {
            return Ok(());
        }

        // Cancel the surviving hedge exit.
        let leftover = if tp_filled {
            position.hedge_sl_order_id.as_deref()
        } else {
            position.hedge_tp_order_id.as_deref()
        };
        if let Some(order_id) = leftover {
            let _ = self.gateway.cancel_order(&position.symbol, order_id).await;
        }

        // Force-close the primary exposure at market.
        let remaining = position.remaining_qty();
        if remaining > Decimal::ZERO {
            let side = position.side();
            if let Err(e) = self
                .gateway
                .place_market(&MarketOrderRequest {
                    symbol: position.symbol.clone(),
                    side: close_order_side(side),
                    position_side: side,
                    quantity: remaining,
                    reduce_only: true,
                })
                .await
            {
                warn!(
                    "Forced exit of position {} failed (reconcile will retry): {}",
                    position.id, e
                );
            }
        }

        self.lifecycle_store
            .transition(
                position.id,
                &[PositionState::Open, PositionState::Closing],
                PositionState::Closed,
                Some(close_reason),
            )
            .await?;
        self.lifecycle_store
            .reduce_remaining(position.id, remaining)
            .await?;
        info!("Position {} closed via hedge ({})", position.id, close_reason);
        Ok(())
    }

    async fn order_filled(
        &self,
        symbol: &str,
        order_id: Option<&str>,
    ) -> Result<bool, PipelineError> {
        let Some(order_id) = order_id else {
            return Ok(false);
        };
        match self.gateway.get_order(symbol, order_id).await {
            Ok(state) => Ok(state.status == OrderStatus::Filled),
            Err(ExchangeError::OrderNotFound(_)) => Ok(false),
            Err(e) if e.is_transient() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Bounded re-entry
    // ------------------------------------------------------------------

    async fn reentry_scan(&self) -> Result<(), PipelineError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(1);
        let closed = self.lifecycle_store.list_recently_closed(cutoff).await?;
        let max_attempts = self.config.hedge.max_reentry_attempts as i64;

        for position in closed {
            let stop_out = matches!(
                position.close_reason.as_deref(),
                Some("stop_hit") | Some(HEDGE_STOP_EXIT)
            );
            if !stop_out {
                continue;
            }
            let Some(signal) = self.signal_store.get(position.signal_id).await? else {
                continue;
            };
            let side = signal.side();

            if self.lifecycle_store.has_active_for_signal(signal.id).await? {
                continue;
            }
            if self
                .signal_store
                .is_reentry_locked(&signal.symbol, side)
                .await?
            {
                continue;
            }
            if signal.reentry_attempts >= max_attempts {
                self.lock_signal(&signal.symbol, side, signal.id, max_attempts)
                    .await?;
                continue;
            }

            // Only re-enter a flat book: an unnoticed live position on the
            // exchange means polling has not caught up yet.
            let exchange_positions = self.gateway.get_positions(Some(&signal.symbol)).await?;
            if exchange_positions
                .iter()
                .any(|p| p.side == side && p.qty > Decimal::ZERO)
            {
                continue;
            }

            self.telemetry.emit(
                "reentry_attempt",
                "info",
                "hedge",
                "Re-entry via fresh dual-limit entry",
                Correlation::signal(signal.id),
                Some(json!({
                    "symbol": signal.symbol,
                    "side": side.as_str(),
                    "failed_attempts": signal.reentry_attempts,
                    "max_attempts": max_attempts,
                })),
            );

            // Only failed re-entries count against the budget; a working
            // symbol must never lock itself out.
            match self.entry_engine.place_entry_for_signal(&signal).await {
                Ok(new_position) => {
                    info!(
                        "Re-entry placed for signal {} -> position {}",
                        signal.id, new_position.id
                    );
                }
                Err(e) => {
                    let failed = self
                        .signal_store
                        .increment_reentry_attempts(signal.id)
                        .await?;
                    warn!(
                        "Re-entry for signal {} failed ({}/{}): {}",
                        signal.id, failed, max_attempts, e
                    );
                    if failed >= max_attempts {
                        self.lock_signal(&signal.symbol, side, signal.id, max_attempts)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn lock_signal(
        &self,
        symbol: &str,
        side: Side,
        signal_id: i64,
        max_attempts: i64,
    ) -> Result<(), PipelineError> {
        self.telemetry.emit(
            "reentry_locked",
            "warning",
            "hedge",
            "Max re-entry attempts reached; locked until a new signal arrives",
            Correlation::signal(signal_id),
            Some(json!({
                "symbol": symbol,
                "side": side.as_str(),
                "max_attempts": max_attempts,
            })),
        );
        self.signal_store
            .set_reentry_lock(
                symbol,
                side,
                Some(signal_id),
                &format!("max re-entry attempts reached ({})", max_attempts),
            )
            .await?;
        Ok(())
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.hedge.poll_interval;
        let sleep_rx = shutdown.clone();
        task_runner::run_with_circuit_breaker(
            "hedge-manager",
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

fn open_order_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Buy,
        Side::Short => OrderSide::Sell,
    }
}

fn close_order_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Sell,
        Side::Short => OrderSide::Buy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_adverse_threshold_arithmetic() {
        // LONG at 100, mark 98.00: favorable move is -2%, which meets the
        // default threshold.
        let move_pct = favorable_move_pct(Side::Long, dec!(100), dec!(98));
        assert_eq!(move_pct, dec!(-2));
        assert!(move_pct <= -dec!(2.0));

        // 98.01 is still short of the trigger.
        let near_miss = favorable_move_pct(Side::Long, dec!(100), dec!(98.01));
        assert!(near_miss > -dec!(2.0));
    }

    #[test]
    fn test_hedge_sides_mirror_primary() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(open_order_side(Side::Short), OrderSide::Sell);
        // Closing a SHORT hedge buys back.
        assert_eq!(close_order_side(Side::Short), OrderSide::Buy);
    }

    #[test]
    fn test_hedge_stop_reconstruction_when_signal_lacked_sl() {
        let sl = fast_fallback_stop(Side::Long, dec!(100));
        assert_eq!(sl, dec!(98.00));
    }
}
