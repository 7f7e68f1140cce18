//! Pyramid manager: programmed adds to winning positions.
//!
//! Every poll computes unrealized profit against the immutable original
//! entry price and walks the scale ladder in order. A scale executes at
//! most once: the scale id is recorded atomically in the position row
//! only after the exchange accepted the market add, and an exchange
//! failure leaves the scale unmarked so the next poll retries. Total
//! added quantity is capped by the max multiplier.

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{EngineConfig, PyramidScale};
use crate::domain::entities::order::{MarketOrderRequest, OrderSide};
use crate::domain::entities::position::{ExecutedScale, HedgeState, OrderKind, PositionState};
use crate::domain::entities::signal::Side;
use crate::domain::services::quantize::favorable_move_pct;
use crate::infrastructure::exchange::ExchangeGateway;
use crate::persistence::lifecycle_store::LifecycleStore;
use crate::persistence::models::PositionRecord;
use crate::persistence::telemetry::{Correlation, TelemetrySink};
use crate::task_runner::{self, CircuitBreakerConfig};

use super::PipelineError;

/// True when adding `add_qty` keeps the total inside the multiplier cap.
pub fn within_pyramid_cap(
    planned_qty: Decimal,
    already_added: Decimal,
    add_qty: Decimal,
    max_multiplier: Decimal,
) -> bool {
    let addable = planned_qty * (max_multiplier - Decimal::ONE);
    already_added + add_qty <= addable
}

pub struct PyramidManager {
    config: EngineConfig,
    lifecycle_store: LifecycleStore,
    gateway: Arc<dyn ExchangeGateway>,
    telemetry: Arc<TelemetrySink>,
}

impl PyramidManager {
    pub fn new(
        config: EngineConfig,
        lifecycle_store: LifecycleStore,
        gateway: Arc<dyn ExchangeGateway>,
        telemetry: Arc<TelemetrySink>,
    ) -> Self {
        Self {
            config,
            lifecycle_store,
            gateway,
            telemetry,
        }
    }

    pub async fn tick(&self) -> Result<(), PipelineError> {
        if !self.config.pyramid.enabled {
            return Ok(());
        }

        let open = self
            .lifecycle_store
            .list_by_states(&[PositionState::Open])
            .await?;

        for position in open {
            if position.hedge_state() != HedgeState::None {
                continue;
            }
            if let Err(e) = self.check_one(&position).await {
                warn!("Pyramid check failed for position {}: {}", position.id, e);
            }
        }
        Ok(())
    }

    async fn check_one(&self, position: &PositionRecord) -> Result<(), PipelineError> {
        let Some(entry) = position.original_entry_price() else {
            return Ok(());
        };
        let planned = position.planned_qty();
        if planned.is_zero() {
            return Ok(());
        }

        let mark = self.gateway.get_mark_price(&position.symbol).await?;
        let profit_pct = favorable_move_pct(position.side(), entry, mark);

        for scale in &self.config.pyramid.scales {
            if profit_pct < scale.threshold_pct {
                // The ladder is ordered; later scales need more profit.
                break;
            }
            // Re-read so a concurrent execution of the same scale is seen.
            let Some(current) = self.lifecycle_store.get(position.id).await? else {
                return Ok(());
            };
            let pyramid = current.pyramid_state();
            if pyramid.has_scale(scale.id) {
                continue;
            }
            self.execute_scale(&current, scale, planned, profit_pct).await?;
        }
        Ok(())
    }

    async fn execute_scale(
        &self,
        position: &PositionRecord,
        scale: &PyramidScale,
        planned: Decimal,
        profit_pct: Decimal,
    ) -> Result<(), PipelineError> {
        let add_qty = planned * scale.add_fraction;
        let mut pyramid = position.pyramid_state();

        if !within_pyramid_cap(
            planned,
            pyramid.total_added(),
            add_qty,
            self.config.pyramid.max_multiplier,
        ) {
            warn!(
                "Pyramid scale {} would exceed max multiplier for position {} (added {})",
                scale.id,
                position.id,
                pyramid.total_added()
            );
            return Ok(());
        }

        let side = position.side();
        let request = MarketOrderRequest {
            symbol: position.symbol.clone(),
            side: open_order_side(side),
            position_side: side,
            quantity: add_qty,
            reduce_only: false,
        };

        // Exchange failure leaves the scale unmarked; next poll retries.
        let order_id = self.gateway.place_market(&request).await?;

        self.telemetry.emit(
            "pyramid_scale",
            "info",
            "pyramid",
            "Pyramid add placed (exchange confirmed)",
            Correlation::position(position.id)
                .with_signal(position.signal_id)
                .with_order(order_id.clone()),
            Some(json!({
                "scale_id": scale.id,
                "add_qty": add_qty.to_string(),
                "profit_pct": profit_pct.round_dp(4).to_string(),
                "threshold_pct": scale.threshold_pct.to_string(),
            })),
        );

        pyramid.executed.push(ExecutedScale {
            scale_id: scale.id,
            added_qty: add_qty,
            executed_at: chrono::Utc::now(),
            order_id: order_id.clone(),
        });
        self.lifecycle_store
            .update_pyramid_state(position.id, &pyramid)
            .await?;
        self.lifecycle_store
            .upsert_tracker(position.id, &order_id, OrderKind::Pyramid, None)
            .await?;

        info!(
            "Pyramid scale {} added for position {} ({} @ +{}%)",
            scale.id,
            position.id,
            add_qty,
            profit_pct.round_dp(2)
        );
        Ok(())
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.pyramid.poll_interval;
        let sleep_rx = shutdown.clone();
        task_runner::run_with_circuit_breaker(
            "pyramid-manager",
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
