//! Watchdog: capacity guard and error classification.
//!
//! The watchdog periodically counts active exposure (non-terminal
//! positions plus claimed-but-unexecuted signals) and publishes a shared
//! capacity state. The entry engine consults the guard before claiming;
//! over capacity a signal simply stays NEW until room frees up or it ages
//! out.

use serde_json::json;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::warn;

use crate::config::WatchdogConfig;
use crate::persistence::lifecycle_store::LifecycleStore;
use crate::persistence::signal_store::SignalStore;
use crate::persistence::telemetry::{Correlation, TelemetrySink};
use crate::task_runner::{self, CircuitBreakerConfig};

use super::PipelineError;

/// Shared capacity snapshot.
#[derive(Debug, Clone, Default)]
pub struct CapacityState {
    pub blocked: bool,
    pub active_trades: i64,
    pub max_active_trades: i64,
    pub reason: Option<String>,
}

/// Read-only handle consulted before accepting new work.
#[derive(Clone)]
pub struct CapacityGuard {
    state: Arc<RwLock<CapacityState>>,
}

impl CapacityGuard {
    pub fn may_accept_new_signal(&self) -> bool {
        self.state.read().map(|s| !s.blocked).unwrap_or(false)
    }

    pub fn snapshot(&self) -> CapacityState {
        self.state.read().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Deterministic, best-effort error classification for telemetry. The
/// chat-rate-limit category only applies to chat subsystems; a throttled
/// exchange call stays `unknown` and its retry policy lives in the
/// gateway, not here.
pub fn classify_error(subsystem: &str, message: &str) -> &'static str {
    let lower = message.to_lowercase();
    let chat_subsystem = matches!(
        subsystem.to_lowercase().as_str(),
        "chat" | "telegram" | "ingestion" | "publisher"
    );
    if lower.contains("timeout") || lower.contains("timed out") {
        "api_timeout"
    } else if lower.contains("connection") || lower.contains("connect") || lower.contains("dns") {
        "api_connectivity"
    } else if lower.contains("insufficient") || lower.contains("margin") || lower.contains("balance")
    {
        "insufficient_funds"
    } else if lower.contains("parse") || lower.contains("validation") {
        "parsing_validation"
    } else if chat_subsystem
        && (lower.contains("flood") || lower.contains("rate limit") || lower.contains("429"))
    {
        "chat_rate_limit"
    } else {
        "unknown"
    }
}

/// Capacity watchdog loop.
pub struct Watchdog {
    signal_store: SignalStore,
    lifecycle_store: LifecycleStore,
    telemetry: Arc<TelemetrySink>,
    config: WatchdogConfig,
    state: Arc<RwLock<CapacityState>>,
}

impl Watchdog {
    pub fn new(
        signal_store: SignalStore,
        lifecycle_store: LifecycleStore,
        telemetry: Arc<TelemetrySink>,
        config: WatchdogConfig,
    ) -> Self {
        let state = Arc::new(RwLock::new(CapacityState {
            // Blocked until the first tick has real counts.
            blocked: true,
            max_active_trades: config.max_active_trades,
            ..CapacityState::default()
        }));
        Self {
            signal_store,
            lifecycle_store,
            telemetry,
            config,
            state,
        }
    }

    pub fn guard(&self) -> CapacityGuard {
        CapacityGuard {
            state: self.state.clone(),
        }
    }

    /// One capacity evaluation.
    pub async fn tick(&self) -> Result<(), PipelineError> {
        let positions_active = self.lifecycle_store.count_active().await?;
        let signals_inflight = self.signal_store.count_inflight().await?;

        // Conservative union: over-counting is safer than under-counting.
        let active = positions_active + signals_inflight;
        let max = self.config.max_active_trades;
        let blocked = active >= max;

        if let Ok(mut state) = self.state.write() {
            state.active_trades = active;
            state.max_active_trades = max;
            state.blocked = blocked;
            state.reason = blocked
                .then(|| format!("Max active trades exceeded ({}/{})", active, max));
        }

        if blocked {
            warn!("Capacity blocked: {}/{} active trades", active, max);
        }

        self.telemetry.emit(
            "watchdog_capacity",
            if blocked { "warning" } else { "info" },
            "watchdog",
            "Capacity evaluation",
            Correlation::default(),
            Some(json!({
                "active_trades": active,
                "positions_active": positions_active,
                "signals_inflight": signals_inflight,
                "max_active_trades": max,
                "blocked": blocked,
            })),
        );

        Ok(())
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.poll_interval;
        let sleep_rx = shutdown.clone();
        task_runner::run_with_circuit_breaker(
            "watchdog",
            CircuitBreakerConfig::default(),
            shutdown,
            move || {
                let watchdog = self.clone();
                let mut sleep_rx = sleep_rx.clone();
                async move {
                    watchdog.tick().await.map_err(|e| e.to_string())?;
                    task_runner::interruptible_sleep(interval, &mut sleep_rx).await;
                    Ok(())
                }
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::Side;
    use crate::persistence::init_database;
    use crate::persistence::models::CreatePosition;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn watchdog(max: i64) -> (Watchdog, LifecycleStore) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let signal_store = SignalStore::new(pool.clone());
        let lifecycle_store = LifecycleStore::new(pool);
        let watchdog = Watchdog::new(
            signal_store,
            lifecycle_store.clone(),
            Arc::new(TelemetrySink::disabled()),
            WatchdogConfig {
                poll_interval: Duration::from_secs(10),
                max_active_trades: max,
            },
        );
        (watchdog, lifecycle_store)
    }

    fn position(signal_id: i64) -> CreatePosition {
        CreatePosition {
            signal_id,
            bot_order_id: format!("bot-{}", signal_id),
            symbol: "GUNUSDT".to_string(),
            side: Side::Long,
            planned_qty: dec!(10),
            leverage: dec!(10.00),
            initial_margin: dec!(20.00),
            sl_price: dec!(95),
            tp_levels: vec![],
            entry_order_ids: vec![],
        }
    }

    #[tokio::test]
    async fn test_guard_blocked_until_first_tick() {
        let (watchdog, _) = watchdog(10).await;
        let guard = watchdog.guard();
        assert!(!guard.may_accept_new_signal());

        watchdog.tick().await.unwrap();
        assert!(guard.may_accept_new_signal());
    }

    #[tokio::test]
    async fn test_guard_blocks_over_capacity() {
        let (watchdog, lifecycle_store) = watchdog(1).await;
        let guard = watchdog.guard();

        lifecycle_store.create_position(position(1)).await.unwrap();
        watchdog.tick().await.unwrap();

        assert!(!guard.may_accept_new_signal());
        let snapshot = guard.snapshot();
        assert!(snapshot.blocked);
        assert_eq!(snapshot.active_trades, 1);
        assert!(snapshot.reason.unwrap().contains("1/1"));
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error("entry", "request timed out"), "api_timeout");
        assert_eq!(classify_error("entry", "Connection refused"), "api_connectivity");
        assert_eq!(classify_error("entry", "Insufficient margin"), "insufficient_funds");
        assert_eq!(classify_error("entry", "validation failed"), "parsing_validation");
        assert_eq!(classify_error("weird", "weird"), "unknown");
    }

    #[test]
    fn test_chat_rate_limit_is_subsystem_gated() {
        assert_eq!(
            classify_error("telegram", "FloodWait of 30 seconds"),
            "chat_rate_limit"
        );
        assert_eq!(
            classify_error("publisher", "HTTP 429 too many requests"),
            "chat_rate_limit"
        );
        // A throttled exchange call is not a chat rate limit.
        assert_eq!(classify_error("entry", "HTTP 429 too many requests"), "unknown");
        assert_eq!(classify_error("entry", "rate limit exceeded"), "unknown");
    }
}
