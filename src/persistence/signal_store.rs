//! Signal store.
//!
//! Owns the persistent signal queue: insert-once semantics keyed on
//! `(chat_id, message_id)`, hash + percent-difference deduplication inside
//! a TTL window, atomic claiming with a lease, and the per-(symbol, side)
//! re-entry locks.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, error};

use super::models::SignalRecord;
use super::{DatabaseError, DbPool};
use crate::domain::entities::signal::{NormalizedSignal, Side, SignalStatus};

/// Outcome of an insert attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// Same `(chat_id, message_id)` already stored.
    DuplicateMessage,
    /// Identical normalized-text hash seen within the TTL window.
    DuplicateHash,
    /// A recent signal for the same (channel, symbol, side) is too close.
    DuplicateRecent { min_diff: Decimal },
}

/// Largest relative difference across entry, stop and paired targets.
/// Differing target counts mean the signals are not comparable and the
/// new one is accepted (diff of 1.00).
pub fn max_component_diff(
    entry_a: Decimal,
    sl_a: Decimal,
    tps_a: &[Decimal],
    entry_b: Decimal,
    sl_b: Decimal,
    tps_b: &[Decimal],
) -> Decimal {
    if tps_a.len() != tps_b.len() {
        return Decimal::ONE;
    }

    fn pct(a: Decimal, b: Decimal) -> Decimal {
        if a.is_zero() {
            return Decimal::ONE;
        }
        ((a - b) / a).abs()
    }

    let mut diffs = vec![pct(entry_a, entry_b), pct(sl_a, sl_b)];
    for (tp_a, tp_b) in tps_a.iter().zip(tps_b.iter()) {
        diffs.push(pct(*tp_a, *tp_b));
    }
    diffs.into_iter().max().unwrap_or(Decimal::ONE)
}

/// Decide whether the new signal is a duplicate of the recent set.
/// Rules: any diff <= 5% blocks; all diffs >= 10% accept; in between the
/// deterministic boundary is 7.5% on the smallest diff.
pub fn recent_duplicate_decision(diffs: &[Decimal]) -> Option<Decimal> {
    if diffs.is_empty() {
        return None;
    }
    let min_diff = diffs.iter().copied().min().unwrap_or(Decimal::ONE);
    let block_at = Decimal::new(5, 2); // 0.05
    let accept_at = Decimal::new(10, 2); // 0.10
    let boundary = Decimal::new(75, 3); // 0.075

    if diffs.iter().any(|d| *d <= block_at) {
        return Some(min_diff);
    }
    if diffs.iter().all(|d| *d >= accept_at) {
        return None;
    }
    if min_diff < boundary {
        Some(min_diff)
    } else {
        None
    }
}

/// Signal repository.
#[derive(Clone)]
pub struct SignalStore {
    pool: DbPool,
}

impl SignalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Cheap duplicate pre-check on the message key and text hash, run
    /// before the detector so duplicates never reach parsing.
    pub async fn check_duplicate(
        &self,
        chat_id: &str,
        message_id: i64,
        text_hash: &str,
        ttl: Duration,
    ) -> Result<Option<&'static str>, DatabaseError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(2));

        let key_hit: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM signals WHERE chat_id = ?1 AND message_id = ?2")
                .bind(chat_id)
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryError(format!("Dedup key lookup failed: {}", e)))?;
        if key_hit.is_some() {
            return Ok(Some("message_key"));
        }

        let hash_hit: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM signals WHERE dedup_hash = ?1 AND received_at >= ?2 LIMIT 1",
        )
        .bind(text_hash)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Dedup hash lookup failed: {}", e)))?;
        if hash_hit.is_some() {
            return Ok(Some("text_hash"));
        }

        Ok(None)
    }

    /// Insert a normalized signal unless deduplication blocks it.
    pub async fn insert_signal(
        &self,
        signal: &NormalizedSignal,
        text_hash: &str,
        ttl: Duration,
    ) -> Result<InsertOutcome, DatabaseError> {
        let cutoff = signal.received_at
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(2));

        // Insert-once on the message key.
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM signals WHERE chat_id = ?1 AND message_id = ?2")
                .bind(&signal.chat_id)
                .bind(signal.message_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryError(format!("Dedup key lookup failed: {}", e)))?;
        if existing.is_some() {
            return Ok(InsertOutcome::DuplicateMessage);
        }

        // Identical text hash within the TTL window.
        let hash_hit: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM signals WHERE dedup_hash = ?1 AND received_at >= ?2 LIMIT 1",
        )
        .bind(text_hash)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Dedup hash lookup failed: {}", e)))?;
        if hash_hit.is_some() {
            return Ok(InsertOutcome::DuplicateHash);
        }

        // Percent-difference rules against recent accepted signals for the
        // same (channel, symbol, side).
        let recent = sqlx::query(
            r#"
            SELECT entry_mid, sl_price, tp_prices
            FROM signals
            WHERE channel_name = ?1 AND symbol = ?2 AND side = ?3 AND received_at >= ?4
            ORDER BY id DESC
            LIMIT 50
            "#,
        )
        .bind(&signal.channel_name)
        .bind(&signal.symbol)
        .bind(signal.side.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Recent signal lookup failed: {}", e)))?;

        if !recent.is_empty() {
            let new_sl = signal.stop_loss.unwrap_or(Decimal::ZERO);
            let diffs: Vec<Decimal> = recent
                .iter()
                .map(|row| {
                    let entry = super::models::parse_decimal(&row.get::<String, _>("entry_mid"));
                    let sl = super::models::parse_decimal_opt(
                        row.get::<Option<String>, _>("sl_price").as_deref(),
                    )
                    .unwrap_or(Decimal::ZERO);
                    let tps: Vec<Decimal> = serde_json::from_str::<Vec<String>>(
                        &row.get::<String, _>("tp_prices"),
                    )
                    .map(|prices| {
                        prices
                            .iter()
                            .map(|p| super::models::parse_decimal(p))
                            .collect()
                    })
                    .unwrap_or_default();
                    max_component_diff(signal.entry_mid, new_sl, &signal.targets, entry, sl, &tps)
                })
                .collect();

            if let Some(min_diff) = recent_duplicate_decision(&diffs) {
                return Ok(InsertOutcome::DuplicateRecent { min_diff });
            }
        }

        let tp_json = serde_json::to_string(
            &signal
                .targets
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>(),
        )
        .map_err(|e| DatabaseError::QueryError(format!("TP serialization failed: {}", e)))?;

        let row = sqlx::query(
            r#"
            INSERT OR IGNORE INTO signals (
                channel_name, chat_id, message_id, message_ts, received_at,
                symbol, side, entry_mid, entry_low, entry_high, sl_price,
                tp_prices, declared_leverage, signal_type, status, dedup_hash, raw_text
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'NEW', ?15, ?16)
            RETURNING id
            "#,
        )
        .bind(&signal.channel_name)
        .bind(&signal.chat_id)
        .bind(signal.message_id)
        .bind(signal.message_ts)
        .bind(signal.received_at)
        .bind(&signal.symbol)
        .bind(signal.side.as_str())
        .bind(signal.entry_mid.to_string())
        .bind(signal.entry_low.map(|d| d.to_string()))
        .bind(signal.entry_high.map(|d| d.to_string()))
        .bind(signal.stop_loss.map(|d| d.to_string()))
        .bind(tp_json)
        .bind(signal.declared_leverage.map(|d| d.to_string()))
        .bind(signal.type_hint.map(|t| t.as_str().to_string()))
        .bind(text_hash)
        .bind(&signal.raw_text)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert signal: {}", e);
            DatabaseError::QueryError(format!("Failed to insert signal: {}", e))
        })?;

        match row {
            Some(row) => {
                let id: i64 = row.get("id");
                debug!("Inserted signal {} for {}", id, signal.symbol);
                Ok(InsertOutcome::Inserted(id))
            }
            // Raced with another writer on the unique key.
            None => Ok(InsertOutcome::DuplicateMessage),
        }
    }

    /// Atomically claim the oldest NEW signal. CLAIMED rows whose lease
    /// expired become claimable again.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<SignalRecord>, DatabaseError> {
        let now = Utc::now();
        let lease_cutoff =
            now - chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(10));

        let record = sqlx::query_as::<_, SignalRecord>(
            r#"
            UPDATE signals
            SET status = 'CLAIMED', claimed_by = ?1, claimed_at = ?2
            WHERE id = (
                SELECT id FROM signals
                WHERE status = 'NEW'
                   OR (status = 'CLAIMED' AND claimed_at IS NOT NULL AND claimed_at <= ?3)
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(lease_cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim signal: {}", e);
            DatabaseError::QueryError(format!("Failed to claim signal: {}", e))
        })?;

        if let Some(record) = &record {
            debug!("Claimed signal {} ({})", record.id, record.symbol);
        }
        Ok(record)
    }

    /// Revert a claimed signal to NEW (clean shutdown before placement).
    pub async fn release_claim(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE signals SET status = 'NEW', claimed_by = NULL, claimed_at = NULL \
             WHERE id = ?1 AND status = 'CLAIMED'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to release claim: {}", e)))?;
        Ok(())
    }

    pub async fn mark_status(
        &self,
        id: i64,
        status: SignalStatus,
        last_error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE signals SET status = ?1, last_error = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(last_error)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to update signal: {}", e)))?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<SignalRecord>, DatabaseError> {
        sqlx::query_as::<_, SignalRecord>("SELECT * FROM signals WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to get signal: {}", e)))
    }

    /// Signals claimed by an entry worker that have not produced a
    /// position yet. Executed signals stay CLAIMED, so exclude those to
    /// avoid double counting against the position tally.
    pub async fn count_inflight(&self) -> Result<i64, DatabaseError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM signals s WHERE s.status = 'CLAIMED' \
             AND NOT EXISTS (SELECT 1 FROM positions p WHERE p.signal_id = s.id)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to count claims: {}", e)))?;
        Ok(row.get("count"))
    }

    /// Persist the post-sizing classification on the signal row.
    pub async fn set_signal_type(
        &self,
        id: i64,
        signal_type: crate::domain::entities::signal::SignalType,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE signals SET signal_type = ?1 WHERE id = ?2")
            .bind(signal_type.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to set type: {}", e)))?;
        Ok(())
    }

    /// NEW signals received before the cutoff, for age-out sweeps.
    pub async fn list_new_before(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Vec<SignalRecord>, DatabaseError> {
        sqlx::query_as::<_, SignalRecord>(
            "SELECT * FROM signals WHERE status = 'NEW' AND received_at <= ?1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list stale NEW: {}", e)))
    }

    /// Bump the re-entry attempt counter, returning the new value.
    pub async fn increment_reentry_attempts(&self, id: i64) -> Result<i64, DatabaseError> {
        let row = sqlx::query(
            "UPDATE signals SET reentry_attempts = reentry_attempts + 1 WHERE id = ?1 \
             RETURNING reentry_attempts",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to bump attempts: {}", e)))?;
        Ok(row.get("reentry_attempts"))
    }

    // ------------------------------------------------------------------
    // Re-entry locks (per symbol + side)
    // ------------------------------------------------------------------

    pub async fn set_reentry_lock(
        &self,
        symbol: &str,
        side: Side,
        signal_id: Option<i64>,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO reentry_locks (symbol, side, signal_id, reason, locked_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(symbol, side) DO UPDATE SET
                signal_id = excluded.signal_id,
                reason = excluded.reason,
                locked_at = excluded.locked_at
            "#,
        )
        .bind(symbol)
        .bind(side.as_str())
        .bind(signal_id)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to set lock: {}", e)))?;
        Ok(())
    }

    pub async fn is_reentry_locked(&self, symbol: &str, side: Side) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM reentry_locks WHERE symbol = ?1 AND side = ?2")
                .bind(symbol)
                .bind(side.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryError(format!("Failed to read lock: {}", e)))?;
        Ok(row.is_some())
    }

    /// A fresh external signal for a symbol unlocks both sides.
    pub async fn clear_reentry_locks(&self, symbol: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM reentry_locks WHERE symbol = ?1")
            .bind(symbol)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to clear locks: {}", e)))?;
        Ok(())
    }
}
