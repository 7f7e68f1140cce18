//! Maintenance: timed cleanup and reconciliation.
//!
//! Runs periodically and is idempotent end to end:
//!
//! - entry orders still unfilled after the short timeout (24 h) are
//!   cancelled and the signal marked EXPIRED,
//! - any tracked order older than the long timeout (6 d) is cancelled and
//!   purged from tracking,
//! - every tracked order of an active position is confirmed against the
//!   exchange; orphans on either side are logged and corrected,
//! - an OPEN position without a live protective stop gets one re-placed.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::domain::entities::order::{OrderSide, StopOrderRequest};
use crate::domain::entities::position::{HedgeState, OrderKind, PositionState};
use crate::domain::entities::signal::{Side, SignalStatus};
use crate::infrastructure::exchange::{ExchangeError, ExchangeGateway};
use crate::persistence::lifecycle_store::LifecycleStore;
use crate::persistence::models::PositionRecord;
use crate::persistence::signal_store::SignalStore;
use crate::persistence::telemetry::{Correlation, TelemetrySink};
use crate::task_runner::{self, CircuitBreakerConfig};

use super::publisher::Publisher;
use super::PipelineError;

pub struct Maintenance {
    config: EngineConfig,
    signal_store: SignalStore,
    lifecycle_store: LifecycleStore,
    gateway: Arc<dyn ExchangeGateway>,
    publisher: Arc<Publisher>,
    telemetry: Arc<TelemetrySink>,
}

impl Maintenance {
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

    pub async fn tick(&self) -> Result<(), PipelineError> {
        if let Err(e) = self.expire_stale_signals().await {
            warn!("Stale-signal cleanup failed: {}", e);
        }
        if let Err(e) = self.expire_unfilled_entries().await {
            warn!("Unfilled-entry cleanup failed: {}", e);
        }
        if let Err(e) = self.purge_stale_orders().await {
            warn!("Stale-order purge failed: {}", e);
        }
        if let Err(e) = self.reconcile_trackers().await {
            warn!("Tracker reconcile failed: {}", e);
        }
        if let Err(e) = self.restore_protections().await {
            warn!("Protection restore failed: {}", e);
        }
        Ok(())
    }

    /// NEW signals no entry worker claimed within the short timeout age
    /// out; waiting longer than a day on capacity makes the intent stale.
    async fn expire_stale_signals(&self) -> Result<(), PipelineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.maintenance.unfilled_entry_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        for signal in self.signal_store.list_new_before(cutoff).await? {
            self.telemetry.emit(
                "signal_aged_out",
                "info",
                "maintenance",
                "NEW signal aged out unclaimed",
                Correlation::signal(signal.id),
                Some(json!({ "symbol": signal.symbol })),
            );
            self.signal_store
                .mark_status(signal.id, SignalStatus::Expired, Some("aged_out"))
                .await?;
        }
        Ok(())
    }

    /// Entry orders open for 24 h with no fills: cancel and expire.
    async fn expire_unfilled_entries(&self) -> Result<(), PipelineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.maintenance.unfilled_entry_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        let stale = self
            .lifecycle_store
            .list_state_created_before(PositionState::PendingEntry, cutoff)
            .await?;

        for position in stale {
            if position.filled_qty() > Decimal::ZERO {
                continue;
            }
            self.cancel_entry_orders(&position).await;

            self.telemetry.emit(
                "entry_expired",
                "warning",
                "maintenance",
                "Entry unfilled past timeout; orders cancelled",
                Correlation::position(position.id).with_signal(position.signal_id),
                Some(json!({ "symbol": position.symbol })),
            );

            let applied = self
                .lifecycle_store
                .transition(
                    position.id,
                    &[PositionState::PendingEntry],
                    PositionState::Cancelled,
                    Some("entry_timeout"),
                )
                .await?;
            if !applied {
                continue;
            }

            self.signal_store
                .mark_status(position.signal_id, SignalStatus::Expired, Some("entry_timeout"))
                .await?;
            self.publisher
                .notify_operator(
                    &format!(
                        "Signal EXPIRED\nsignal_id={}\nsymbol={}\nreason=no fills within 24h",
                        position.signal_id, position.symbol
                    ),
                    Correlation::position(position.id).with_signal(position.signal_id),
                )
                .await;
            info!(
                "Expired unfilled entry for position {} ({})",
                position.id, position.symbol
            );
        }
        Ok(())
    }

    async fn cancel_entry_orders(&self, position: &PositionRecord) {
        let mut order_ids = position.entry_order_ids();
        if let Some(replacement) = &position.replacement_order_id {
            order_ids.push(replacement.clone());
        }
        for order_id in order_ids {
            match self.gateway.get_order(&position.symbol, &order_id).await {
                Ok(state) if state.status.is_open() => {
                    if let Err(e) = self.gateway.cancel_order(&position.symbol, &order_id).await {
                        warn!("Cancel of stale entry {} failed: {}", order_id, e);
                    }
                }
                Ok(_) | Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => warn!("State check of {} failed: {}", order_id, e),
            }
        }
    }

    /// Any tracked order older than 6 d: cancel on the exchange and drop
    /// from active tracking.
    async fn purge_stale_orders(&self) -> Result<(), PipelineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.maintenance.stale_order_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(6));

        let stale = self.lifecycle_store.list_trackers_before(cutoff).await?;
        for tracker in stale {
            let Some(position) = self.lifecycle_store.get(tracker.position_id).await? else {
                self.lifecycle_store.delete_tracker(&tracker.order_id).await?;
                continue;
            };
            match self.gateway.get_order(&position.symbol, &tracker.order_id).await {
                Ok(state) if state.status.is_open() => {
                    if let Err(e) = self
                        .gateway
                        .cancel_order(&position.symbol, &tracker.order_id)
                        .await
                    {
                        warn!("Cancel of stale order {} failed: {}", tracker.order_id, e);
                        continue;
                    }
                }
                Ok(_) | Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => {
                    warn!("State check of {} failed: {}", tracker.order_id, e);
                    continue;
                }
            }
            self.lifecycle_store.delete_tracker(&tracker.order_id).await?;
            self.telemetry.emit(
                "stale_order_purged",
                "info",
                "maintenance",
                "Order past long timeout cancelled and purged",
                Correlation::position(tracker.position_id).with_order(tracker.order_id.clone()),
                None,
            );
        }
        Ok(())
    }

    /// Every tracked order of an active position must exist on the
    /// exchange; orphaned trackers are dropped.
    async fn reconcile_trackers(&self) -> Result<(), PipelineError> {
        let active = self
            .lifecycle_store
            .list_by_states(&[
                PositionState::PendingEntry,
                PositionState::Partial,
                PositionState::Open,
                PositionState::Closing,
            ])
            .await?;

        for position in active {
            let trackers = self.lifecycle_store.list_trackers_for(position.id).await?;
            for tracker in trackers {
                match self
                    .gateway
                    .get_order(&position.symbol, &tracker.order_id)
                    .await
                {
                    Ok(_) => {}
                    Err(ExchangeError::OrderNotFound(_)) => {
                        warn!(
                            "Orphan tracker {} for position {}; removing",
                            tracker.order_id, position.id
                        );
                        self.telemetry.emit(
                            "orphan_tracker_removed",
                            "warning",
                            "maintenance",
                            "Tracked order missing on exchange",
                            Correlation::position(position.id)
                                .with_order(tracker.order_id.clone()),
                            Some(json!({ "kind": tracker.kind })),
                        );
                        self.lifecycle_store.delete_tracker(&tracker.order_id).await?;
                        if position.sl_order_id.as_deref() == Some(tracker.order_id.as_str()) {
                            self.lifecycle_store.clear_stop_loss_order(position.id).await?;
                        }
                    }
                    Err(e) if e.is_transient() => {}
                    Err(e) => warn!("Reconcile of {} failed: {}", tracker.order_id, e),
                }
            }
        }
        Ok(())
    }

    /// OPEN positions must always carry a live protective stop.
    async fn restore_protections(&self) -> Result<(), PipelineError> {
        let open = self
            .lifecycle_store
            .list_by_states(&[PositionState::Open])
            .await?;

        for position in open {
            if position.hedge_state() != HedgeState::None {
                continue;
            }
            if position.sl_order_id.is_some() {
                continue;
            }
            let Some(sl_price) = position.sl_price() else {
                continue;
            };
            let remaining = position.remaining_qty();
            if remaining <= Decimal::ZERO {
                continue;
            }

            let side = position.side();
            let request = StopOrderRequest {
                symbol: position.symbol.clone(),
                side: close_order_side(side),
                position_side: side,
                stop_price: sl_price,
                quantity: remaining,
            };
            match self.gateway.place_stop_market(&request).await {
                Ok(order_id) => {
                    self.telemetry.emit(
                        "protection_restored",
                        "warning",
                        "maintenance",
                        "Missing stop re-placed",
                        Correlation::position(position.id)
                            .with_signal(position.signal_id)
                            .with_order(order_id.clone()),
                        Some(json!({ "sl_price": sl_price.to_string() })),
                    );
                    self.lifecycle_store
                        .set_stop_loss(position.id, sl_price, Some(&order_id))
                        .await?;
                    self.lifecycle_store
                        .upsert_tracker(position.id, &order_id, OrderKind::Sl, None)
                        .await?;
                }
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    let reason = format!("protection restore failed: {}", e);
                    let applied = self
                        .lifecycle_store
                        .transition(
                            position.id,
                            &[PositionState::Open],
                            PositionState::Failed,
                            Some(&reason),
                        )
                        .await?;
                    if applied {
                        self.publisher
                            .notify_operator(
                                &format!(
                                    "Position FAILED\nposition_id={}\nsymbol={}\nreason={}",
                                    position.id, position.symbol, reason
                                ),
                                Correlation::position(position.id)
                                    .with_signal(position.signal_id),
                            )
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.maintenance.interval;
        let sleep_rx = shutdown.clone();
        task_runner::run_with_circuit_breaker(
            "maintenance",
            CircuitBreakerConfig::default(),
            shutdown,
            move || {
                let maintenance = self.clone();
                let mut sleep_rx = sleep_rx.clone();
                async move {
                    maintenance.tick().await.map_err(|e| e.to_string())?;
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
