//! Lifecycle store.
//!
//! Owns position records and the order tracker. State transitions are
//! compare-and-set updates guarded by the current state, so concurrent
//! pollers reading the same exchange truth collapse to one effective
//! writer per position. `original_entry_price` is written with COALESCE
//! and can therefore never change once set.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use tracing::{debug, error};

use super::models::{CreatePosition, OrderTrackerRecord, PositionRecord};
use super::{DatabaseError, DbPool};
use crate::domain::entities::position::{
    HedgeState, OrderKind, PositionState, PyramidState, TpLevel,
};

/// Position repository.
#[derive(Clone)]
pub struct LifecycleStore {
    pool: DbPool,
}

impl LifecycleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a new position in PENDING_ENTRY.
    pub async fn create_position(
        &self,
        create: CreatePosition,
    ) -> Result<PositionRecord, DatabaseError> {
        let now = Utc::now();
        let tp_json = serde_json::to_string(&create.tp_levels)
            .map_err(|e| DatabaseError::QueryError(format!("TP serialization failed: {}", e)))?;
        let entry_ids_json = serde_json::to_string(&create.entry_order_ids)
            .map_err(|e| DatabaseError::QueryError(format!("Order id serialization: {}", e)))?;

        let record = sqlx::query_as::<_, PositionRecord>(
            r#"
            INSERT INTO positions (
                signal_id, bot_order_id, symbol, side, state,
                planned_qty, filled_qty, remaining_qty, leverage, initial_margin,
                sl_price, tp_levels, entry_order_ids, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, 'PENDING_ENTRY', ?5, '0', '0', ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            RETURNING *
            "#,
        )
        .bind(create.signal_id)
        .bind(&create.bot_order_id)
        .bind(&create.symbol)
        .bind(create.side.as_str())
        .bind(create.planned_qty.to_string())
        .bind(create.leverage.to_string())
        .bind(create.initial_margin.to_string())
        .bind(create.sl_price.to_string())
        .bind(tp_json)
        .bind(entry_ids_json)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create position: {}", e);
            DatabaseError::QueryError(format!("Failed to create position: {}", e))
        })?;

        debug!(
            "Created position {} for signal {} ({})",
            record.id, record.signal_id, record.symbol
        );
        Ok(record)
    }

    pub async fn get(&self, id: i64) -> Result<Option<PositionRecord>, DatabaseError> {
        sqlx::query_as::<_, PositionRecord>("SELECT * FROM positions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to get position: {}", e)))
    }

    pub async fn list_by_states(
        &self,
        states: &[PositionState],
    ) -> Result<Vec<PositionRecord>, DatabaseError> {
        let quoted: Vec<String> = states.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let query = format!(
            "SELECT * FROM positions WHERE state IN ({}) ORDER BY id ASC",
            quoted.join(", ")
        );
        sqlx::query_as::<_, PositionRecord>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to list positions: {}", e)))
    }

    /// Positions still holding or pursuing exposure.
    pub async fn count_active(&self) -> Result<i64, DatabaseError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM positions \
             WHERE state NOT IN ('CLOSED', 'CANCELLED', 'FAILED')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to count active: {}", e)))?;
        Ok(row.get("count"))
    }

    /// Closed positions touched since the cutoff, for re-entry scans.
    pub async fn list_recently_closed(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PositionRecord>, DatabaseError> {
        sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE state = 'CLOSED' AND updated_at >= ?1 ORDER BY id ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list closed: {}", e)))
    }

    /// Positions in a state created before the cutoff, for maintenance.
    pub async fn list_state_created_before(
        &self,
        state: PositionState,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PositionRecord>, DatabaseError> {
        sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE state = ?1 AND created_at <= ?2 ORDER BY id ASC",
        )
        .bind(state.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list stale: {}", e)))
    }

    /// True when the signal still has a non-terminal position.
    pub async fn has_active_for_signal(&self, signal_id: i64) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM positions WHERE signal_id = ?1 \
             AND state NOT IN ('CLOSED', 'CANCELLED', 'FAILED') LIMIT 1",
        )
        .bind(signal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to check signal: {}", e)))?;
        Ok(row.is_some())
    }

    /// Compare-and-set state transition. Returns false when the position
    /// was not in any of the expected source states (another poller won).
    pub async fn transition(
        &self,
        id: i64,
        from: &[PositionState],
        to: PositionState,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let quoted: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let query = format!(
            "UPDATE positions SET state = ?1, close_reason = COALESCE(?2, close_reason), \
             updated_at = ?3 WHERE id = ?4 AND state IN ({})",
            quoted.join(", ")
        );
        let result = sqlx::query(&query)
            .bind(to.as_str())
            .bind(reason)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to transition: {}", e)))?;

        let applied = result.rows_affected() > 0;
        if applied {
            debug!("Position {} -> {}{}", id, to, reason.map(|r| format!(" ({})", r)).unwrap_or_default());
        }
        Ok(applied)
    }

    /// Record entry-fill progress. `original_entry_price` is only written
    /// when still NULL; subsequent calls can never change it.
    pub async fn record_entry_fill(
        &self,
        id: i64,
        filled_qty: Decimal,
        remaining_qty: Decimal,
        avg_entry_price: Decimal,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE positions
            SET filled_qty = ?1,
                remaining_qty = ?2,
                avg_entry_price = ?3,
                original_entry_price = COALESCE(original_entry_price, ?3),
                updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(filled_qty.to_string())
        .bind(remaining_qty.to_string())
        .bind(avg_entry_price.to_string())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to record fill: {}", e)))?;
        Ok(())
    }

    pub async fn set_replacement_order(
        &self,
        id: i64,
        order_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE positions SET replacement_order_id = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(order_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to set replacement: {}", e)))?;
        Ok(())
    }

    pub async fn update_tp_levels(&self, id: i64, levels: &[TpLevel]) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(levels)
            .map_err(|e| DatabaseError::QueryError(format!("TP serialization failed: {}", e)))?;
        sqlx::query("UPDATE positions SET tp_levels = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(json)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to update TP levels: {}", e)))?;
        Ok(())
    }

    pub async fn set_stop_loss(
        &self,
        id: i64,
        sl_price: Decimal,
        sl_order_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE positions SET sl_price = ?1, sl_order_id = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(sl_price.to_string())
        .bind(sl_order_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to set stop loss: {}", e)))?;
        Ok(())
    }

    /// Stamp an SL amendment for the per-position rate limiter. The
    /// initial attach does not stamp, only amendments do.
    pub async fn touch_sl_amended(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE positions SET sl_amended_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to stamp amendment: {}", e)))?;
        Ok(())
    }

    pub async fn clear_stop_loss_order(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE positions SET sl_order_id = NULL, updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to clear SL order: {}", e)))?;
        Ok(())
    }

    /// Reduce remaining exposure after a reduce-only fill.
    pub async fn reduce_remaining(&self, id: i64, delta: Decimal) -> Result<(), DatabaseError> {
        let Some(position) = self.get(id).await? else {
            return Ok(());
        };
        let remaining = (position.remaining_qty() - delta).max(Decimal::ZERO);
        sqlx::query("UPDATE positions SET remaining_qty = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(remaining.to_string())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to reduce remaining: {}", e)))?;
        Ok(())
    }

    /// Grow exposure after an opening fill (pyramid adds).
    pub async fn increase_filled(&self, id: i64, delta: Decimal) -> Result<(), DatabaseError> {
        let Some(position) = self.get(id).await? else {
            return Ok(());
        };
        let filled = position.filled_qty() + delta;
        let remaining = position.remaining_qty() + delta;
        sqlx::query(
            "UPDATE positions SET filled_qty = ?1, remaining_qty = ?2, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(filled.to_string())
        .bind(remaining.to_string())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to increase filled: {}", e)))?;
        Ok(())
    }

    pub async fn update_pyramid_state(
        &self,
        id: i64,
        state: &PyramidState,
    ) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(state)
            .map_err(|e| DatabaseError::QueryError(format!("Pyramid serialization: {}", e)))?;
        sqlx::query("UPDATE positions SET pyramid_state = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(json)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to update pyramid: {}", e)))?;
        Ok(())
    }

    /// Flip hedge state with a CAS on the previous value.
    pub async fn transition_hedge(
        &self,
        id: i64,
        from: HedgeState,
        to: HedgeState,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE positions SET hedge_state = ?1, updated_at = ?2 \
             WHERE id = ?3 AND hedge_state = ?4",
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to transition hedge: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_hedge_orders(
        &self,
        id: i64,
        entry_order_id: Option<&str>,
        tp_order_id: Option<&str>,
        sl_order_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE positions SET hedge_entry_order_id = ?1, hedge_tp_order_id = ?2, \
             hedge_sl_order_id = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(entry_order_id)
        .bind(tp_order_id)
        .bind(sl_order_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to set hedge orders: {}", e)))?;
        Ok(())
    }

    pub async fn set_peak(
        &self,
        id: i64,
        peak_price: Decimal,
        trailing_active: bool,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE positions SET peak_price = ?1, trailing_active = ?2, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(peak_price.to_string())
        .bind(trailing_active as i64)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to set peak: {}", e)))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Order tracker
    // ------------------------------------------------------------------

    pub async fn upsert_tracker(
        &self,
        position_id: i64,
        order_id: &str,
        kind: OrderKind,
        level_index: Option<i64>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO order_tracker (position_id, order_id, kind, level_index, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(order_id) DO UPDATE SET
                position_id = excluded.position_id,
                kind = excluded.kind,
                level_index = excluded.level_index
            "#,
        )
        .bind(position_id)
        .bind(order_id)
        .bind(kind.as_str())
        .bind(level_index)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to upsert tracker: {}", e)))?;
        Ok(())
    }

    pub async fn update_tracker(
        &self,
        order_id: &str,
        last_executed_qty: Decimal,
        last_status: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE order_tracker SET last_executed_qty = ?1, last_status = ?2 WHERE order_id = ?3",
        )
        .bind(last_executed_qty.to_string())
        .bind(last_status)
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to update tracker: {}", e)))?;
        Ok(())
    }

    pub async fn list_trackers_for(
        &self,
        position_id: i64,
    ) -> Result<Vec<OrderTrackerRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderTrackerRecord>(
            "SELECT * FROM order_tracker WHERE position_id = ?1 ORDER BY id ASC",
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list trackers: {}", e)))
    }

    /// Trackers created before the cutoff, for maintenance sweeps.
    pub async fn list_trackers_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OrderTrackerRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderTrackerRecord>(
            "SELECT * FROM order_tracker WHERE created_at <= ?1 ORDER BY id ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list stale trackers: {}", e)))
    }

    pub async fn delete_tracker(&self, order_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM order_tracker WHERE order_id = ?1")
            .bind(order_id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to delete tracker: {}", e)))?;
        Ok(())
    }

    pub async fn delete_trackers_for(
        &self,
        position_id: i64,
        kinds: &[OrderKind],
    ) -> Result<(), DatabaseError> {
        let quoted: Vec<String> = kinds.iter().map(|k| format!("'{}'", k.as_str())).collect();
        let query = format!(
            "DELETE FROM order_tracker WHERE position_id = ?1 AND kind IN ({})",
            quoted.join(", ")
        );
        sqlx::query(&query)
            .bind(position_id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to delete trackers: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::Side;
    use crate::persistence::init_database;
    use rust_decimal_macros::dec;

    async fn store() -> LifecycleStore {
        let pool = init_database("sqlite::memory:").await.unwrap();
        LifecycleStore::new(pool)
    }

    fn sample_create() -> CreatePosition {
        CreatePosition {
            signal_id: 1,
            bot_order_id: "bot-1".to_string(),
            symbol: "GUNUSDT".to_string(),
            side: Side::Long,
            planned_qty: dec!(7965),
            leverage: dec!(9.30),
            initial_margin: dec!(20.00),
            sl_price: dec!(0.02234),
            tp_levels: vec![
                TpLevel::new(0, dec!(0.02375), dec!(3983)),
                TpLevel::new(1, dec!(0.02400), dec!(3982)),
            ],
            entry_order_ids: vec!["e1".to_string(), "e2".to_string()],
        }
    }

    #[tokio::test]
    async fn test_create_and_read_position() {
        let store = store().await;
        let record = store.create_position(sample_create()).await.unwrap();
        assert_eq!(record.state(), PositionState::PendingEntry);
        assert_eq!(record.planned_qty(), dec!(7965));
        assert_eq!(record.tp_levels().len(), 2);
        assert_eq!(record.entry_order_ids(), vec!["e1", "e2"]);
        assert_eq!(record.hedge_state(), HedgeState::None);

        let fetched = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.bot_order_id, "bot-1");
    }

    #[tokio::test]
    async fn test_transition_cas_semantics() {
        let store = store().await;
        let record = store.create_position(sample_create()).await.unwrap();

        let applied = store
            .transition(
                record.id,
                &[PositionState::PendingEntry, PositionState::Partial],
                PositionState::Open,
                None,
            )
            .await
            .unwrap();
        assert!(applied);

        // Re-running the same transition is a no-op: exchange state replay
        // must not produce further side effects.
        let replay = store
            .transition(
                record.id,
                &[PositionState::PendingEntry, PositionState::Partial],
                PositionState::Open,
                None,
            )
            .await
            .unwrap();
        assert!(!replay);
    }

    #[tokio::test]
    async fn test_original_entry_price_set_once() {
        let store = store().await;
        let record = store.create_position(sample_create()).await.unwrap();

        store
            .record_entry_fill(record.id, dec!(4000), dec!(4000), dec!(0.02330))
            .await
            .unwrap();
        let first = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(first.original_entry_price(), Some(dec!(0.02330)));

        // A later fill moves the average but never the original.
        store
            .record_entry_fill(record.id, dec!(7965), dec!(7965), dec!(0.02334))
            .await
            .unwrap();
        let second = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(second.avg_entry_price(), Some(dec!(0.02334)));
        assert_eq!(second.original_entry_price(), Some(dec!(0.02330)));
    }

    #[tokio::test]
    async fn test_count_active_excludes_terminal() {
        let store = store().await;
        let record = store.create_position(sample_create()).await.unwrap();
        assert_eq!(store.count_active().await.unwrap(), 1);

        store
            .transition(
                record.id,
                &[PositionState::PendingEntry],
                PositionState::Cancelled,
                Some("test"),
            )
            .await
            .unwrap();
        assert_eq!(store.count_active().await.unwrap(), 0);
        assert!(!store.has_active_for_signal(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_remaining_qty_floor_at_zero() {
        let store = store().await;
        let record = store.create_position(sample_create()).await.unwrap();
        store
            .record_entry_fill(record.id, dec!(100), dec!(100), dec!(0.0233))
            .await
            .unwrap();

        store.reduce_remaining(record.id, dec!(150)).await.unwrap();
        let fetched = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.remaining_qty(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_increase_filled_for_pyramid_add() {
        let store = store().await;
        let record = store.create_position(sample_create()).await.unwrap();
        store
            .record_entry_fill(record.id, dec!(10), dec!(10), dec!(100))
            .await
            .unwrap();

        store.increase_filled(record.id, dec!(5)).await.unwrap();
        let fetched = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.filled_qty(), dec!(15));
        assert_eq!(fetched.remaining_qty(), dec!(15));
    }

    #[tokio::test]
    async fn test_hedge_transition_cas() {
        let store = store().await;
        let record = store.create_position(sample_create()).await.unwrap();

        assert!(store
            .transition_hedge(record.id, HedgeState::None, HedgeState::Hedged)
            .await
            .unwrap());
        // Second trigger loses the race.
        assert!(!store
            .transition_hedge(record.id, HedgeState::None, HedgeState::Hedged)
            .await
            .unwrap());
        assert!(store
            .transition_hedge(record.id, HedgeState::Hedged, HedgeState::HedgeClosed)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_order_tracker_roundtrip() {
        let store = store().await;
        let record = store.create_position(sample_create()).await.unwrap();

        store
            .upsert_tracker(record.id, "tp-1", OrderKind::Tp, Some(0))
            .await
            .unwrap();
        store
            .upsert_tracker(record.id, "sl-1", OrderKind::Sl, None)
            .await
            .unwrap();

        let trackers = store.list_trackers_for(record.id).await.unwrap();
        assert_eq!(trackers.len(), 2);
        assert_eq!(trackers[0].kind(), OrderKind::Tp);
        assert_eq!(trackers[0].last_executed_qty(), Decimal::ZERO);

        store
            .update_tracker("tp-1", dec!(100), Some("PARTIALLY_FILLED"))
            .await
            .unwrap();
        let trackers = store.list_trackers_for(record.id).await.unwrap();
        assert_eq!(trackers[0].last_executed_qty(), dec!(100));

        store
            .delete_trackers_for(record.id, &[OrderKind::Tp, OrderKind::Sl])
            .await
            .unwrap();
        assert!(store.list_trackers_for(record.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_loss_amendment_tracks_timestamp() {
        let store = store().await;
        let record = store.create_position(sample_create()).await.unwrap();
        assert!(record.sl_amended_at.is_none());

        // The initial attach carries no amendment stamp.
        store
            .set_stop_loss(record.id, dec!(0.02334), Some("sl-2"))
            .await
            .unwrap();
        let fetched = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.sl_price(), Some(dec!(0.02334)));
        assert_eq!(fetched.sl_order_id.as_deref(), Some("sl-2"));
        assert!(fetched.sl_amended_at.is_none());

        store.touch_sl_amended(record.id).await.unwrap();
        let stamped = store.get(record.id).await.unwrap().unwrap();
        assert!(stamped.sl_amended_at.is_some());
    }
}
