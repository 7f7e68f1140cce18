//! Signal ingestion pipeline.
//!
//! One task per source channel stream. Each message is deduplicated,
//! run through the detector, normalized, and persisted as a NEW signal.
//! Acceptance also clears any re-entry lock for the symbol: a fresh
//! external signal re-arms trading that was locked out.
//!
//! In extract-only mode this pipeline still runs in full; the entry
//! engine simply never claims what it persists.

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::entities::signal::{
    order_targets, stop_on_loss_side, NormalizedSignal, ParsedSignal,
};
use crate::domain::services::detector;
use crate::infrastructure::telegram::ChatMessage;
use crate::persistence::signal_store::{InsertOutcome, SignalStore};
use crate::persistence::telemetry::{Correlation, TelemetrySink};

use super::PipelineError;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted(i64),
    Duplicate(String),
    NotSignal(String),
    Empty,
}

/// SHA-256 over the lowercased, whitespace-collapsed message text.
pub fn normalized_text_hash(text: &str) -> String {
    let normalized = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Ingestion pipeline for one chat source stream.
pub struct IngestionPipeline {
    signal_store: SignalStore,
    telemetry: Arc<TelemetrySink>,
    dedup_ttl: Duration,
}

impl IngestionPipeline {
    pub fn new(signal_store: SignalStore, telemetry: Arc<TelemetrySink>, dedup_ttl: Duration) -> Self {
        Self {
            signal_store,
            telemetry,
            dedup_ttl,
        }
    }

    /// Consume the stream until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<ChatMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Ingestion pipeline started");
        loop {
            let message = tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => {
                        info!("Chat stream closed; ingestion stopping");
                        return;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Ingestion stopping on shutdown signal");
                        return;
                    }
                    continue;
                }
            };

            match self.process_message(&message).await {
                Ok(outcome) => debug!(
                    "Message {}/{} -> {:?}",
                    message.channel_name, message.message_id, outcome
                ),
                Err(e) => warn!(
                    "Ingestion error on {}/{}: {}",
                    message.channel_name, message.message_id, e
                ),
            }
        }
    }

    /// Full ingestion flow for one message.
    pub async fn process_message(
        &self,
        message: &ChatMessage,
    ) -> Result<IngestOutcome, PipelineError> {
        let text = message.text.trim();
        if text.is_empty() {
            return Ok(IngestOutcome::Empty);
        }

        // Duplicates drop before any parsing happens.
        let text_hash = normalized_text_hash(text);
        if let Some(rule) = self
            .signal_store
            .check_duplicate(&message.chat_id, message.message_id, &text_hash, self.dedup_ttl)
            .await?
        {
            self.emit_duplicate(message, rule, None);
            return Ok(IngestOutcome::Duplicate(rule.to_string()));
        }

        // Detection before normalization: non-signals never persist.
        let detection = match detector::detect(text) {
            Ok(detection) => detection,
            Err(rejection) => {
                let reason = rejection.reason();
                self.telemetry.emit(
                    "non_signal",
                    "info",
                    "ingestion",
                    "Message rejected by detector",
                    Correlation::default(),
                    Some(json!({
                        "channel": message.channel_name,
                        "message_id": message.message_id,
                        "reason": reason,
                    })),
                );
                return Ok(IngestOutcome::NotSignal(reason));
            }
        };

        let Some(normalized) = normalize(detection.parsed, message) else {
            self.telemetry.emit(
                "non_signal",
                "info",
                "ingestion",
                "Signal lacked a usable entry price",
                Correlation::default(),
                Some(json!({
                    "channel": message.channel_name,
                    "message_id": message.message_id,
                    "reason": "missing_entry",
                })),
            );
            return Ok(IngestOutcome::NotSignal("missing_entry".to_string()));
        };

        match self
            .signal_store
            .insert_signal(&normalized, &text_hash, self.dedup_ttl)
            .await?
        {
            InsertOutcome::Inserted(id) => {
                // A fresh external signal unlocks re-entry for the symbol.
                self.signal_store
                    .clear_reentry_locks(&normalized.symbol)
                    .await?;
                self.telemetry.emit(
                    "signal_accepted",
                    "info",
                    "ingestion",
                    "Signal accepted and queued",
                    Correlation::signal(id),
                    Some(json!({
                        "channel": normalized.channel_name,
                        "symbol": normalized.symbol,
                        "side": normalized.side.as_str(),
                        "entry_mid": normalized.entry_mid.to_string(),
                        "targets": normalized.targets.len(),
                        "score": detection.score,
                        "confidence": detection.confidence.as_str(),
                    })),
                );
                info!(
                    "Signal accepted: {} {} from {} (score {})",
                    normalized.symbol, normalized.side, normalized.channel_name, detection.score
                );
                Ok(IngestOutcome::Accepted(id))
            }
            InsertOutcome::DuplicateMessage => {
                self.emit_duplicate(message, "message_key", None);
                Ok(IngestOutcome::Duplicate("message_key".to_string()))
            }
            InsertOutcome::DuplicateHash => {
                self.emit_duplicate(message, "text_hash", None);
                Ok(IngestOutcome::Duplicate("text_hash".to_string()))
            }
            InsertOutcome::DuplicateRecent { min_diff } => {
                self.emit_duplicate(message, "percent_diff", Some(min_diff.to_string()));
                Ok(IngestOutcome::Duplicate("percent_diff".to_string()))
            }
        }
    }

    fn emit_duplicate(&self, message: &ChatMessage, rule: &str, min_diff: Option<String>) {
        self.telemetry.emit(
            "duplicate",
            "info",
            "ingestion",
            "Duplicate signal dropped",
            Correlation::default(),
            Some(json!({
                "channel": message.channel_name,
                "message_id": message.message_id,
                "rule": rule,
                "min_diff": min_diff,
            })),
        );
    }
}

/// Normalize a parsed signal into its persisted form. Returns None when
/// no entry price can be established.
fn normalize(parsed: ParsedSignal, message: &ChatMessage) -> Option<NormalizedSignal> {
    let mut targets = parsed.targets;

    // Entry comes from the entry clause, or failing that the first target.
    let entry = match parsed.entry {
        Some(entry) => entry,
        None => {
            let inferred = *targets.first()?;
            debug!(
                "No entry clause; inferring entry from first target ({})",
                inferred
            );
            crate::domain::entities::signal::EntrySpec::Single(inferred)
        }
    };
    let entry_mid = entry.mid();
    let (entry_low, entry_high) = entry.bounds();

    order_targets(parsed.side, &mut targets);

    // A stop on the wrong side of entry is treated as absent; sizing will
    // apply the FAST fallback.
    let stop_loss = parsed.stop_loss.filter(|sl| {
        let valid = stop_on_loss_side(parsed.side, entry_mid, *sl);
        if !valid {
            warn!(
                "Dropping stop loss {} on the wrong side of entry {} ({})",
                sl, entry_mid, parsed.side
            );
        }
        valid
    });

    Some(NormalizedSignal {
        channel_name: message.channel_name.clone(),
        chat_id: message.chat_id.clone(),
        message_id: message.message_id,
        message_ts: message.timestamp,
        received_at: Utc::now(),
        symbol: parsed.symbol,
        side: parsed.side,
        entry_mid,
        entry_low,
        entry_high,
        targets,
        stop_loss,
        declared_leverage: parsed.declared_leverage,
        type_hint: parsed.type_hint,
        raw_text: message.text.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::Side;
    use crate::persistence::init_database;
    use rust_decimal_macros::dec;

    fn message(id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            chat_id: "-100123".to_string(),
            channel_name: "CRYPTOR".to_string(),
            message_id: id,
            timestamp: Some(Utc::now()),
            text: text.to_string(),
        }
    }

    async fn pipeline() -> (IngestionPipeline, SignalStore) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let store = SignalStore::new(pool);
        let pipeline = IngestionPipeline::new(
            store.clone(),
            Arc::new(TelemetrySink::disabled()),
            Duration::from_secs(7200),
        );
        (pipeline, store)
    }

    const SIGNAL_TEXT: &str = "#GUN/USDT LONG Entry zone 0.02350 - 0.02320 \
                               Targets: 0.02375, 0.02400 Stop loss 0.02234";

    #[tokio::test]
    async fn test_signal_accepted_and_normalized() {
        let (pipeline, store) = pipeline().await;
        let outcome = pipeline.process_message(&message(1, SIGNAL_TEXT)).await.unwrap();
        let IngestOutcome::Accepted(id) = outcome else {
            panic!("expected acceptance, got {:?}", outcome);
        };

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.symbol, "GUNUSDT");
        assert_eq!(record.side(), Side::Long);
        assert_eq!(record.entry_mid(), dec!(0.02335));
        assert_eq!(record.sl_price(), Some(dec!(0.02234)));
        assert_eq!(record.tp_prices(), vec![dec!(0.02375), dec!(0.02400)]);
        assert_eq!(record.status, "NEW");
    }

    #[tokio::test]
    async fn test_same_message_id_dropped_at_store() {
        let (pipeline, _) = pipeline().await;
        pipeline.process_message(&message(1, SIGNAL_TEXT)).await.unwrap();
        let outcome = pipeline.process_message(&message(1, SIGNAL_TEXT)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Duplicate("message_key".to_string()));
    }

    #[tokio::test]
    async fn test_same_text_different_id_dropped_by_hash() {
        let (pipeline, _) = pipeline().await;
        pipeline.process_message(&message(1, SIGNAL_TEXT)).await.unwrap();
        // Whitespace and case changes still hash the same.
        let restyled = SIGNAL_TEXT.to_uppercase().replace("  ", " ");
        let outcome = pipeline.process_message(&message(2, &restyled)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Duplicate("text_hash".to_string()));
    }

    #[tokio::test]
    async fn test_status_update_not_persisted() {
        let (pipeline, store) = pipeline().await;
        let outcome = pipeline
            .process_message(&message(1, "#PARTI/USDT All entry targets achieved"))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::NotSignal(_)));

        let count: i64 = store.count_inflight().await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_entry_inferred_from_first_target() {
        let (pipeline, store) = pipeline().await;
        let outcome = pipeline
            .process_message(&message(1, "#FHE LONG SETUP Target 1: 0.04160 Target 2: 0.04210"))
            .await
            .unwrap();
        let IngestOutcome::Accepted(id) = outcome else {
            panic!("expected acceptance");
        };

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.entry_mid(), dec!(0.04160));
        // No SL: left null for the FAST fallback downstream.
        assert_eq!(record.sl_price(), None);
    }

    #[tokio::test]
    async fn test_wrong_side_stop_dropped() {
        let (pipeline, store) = pipeline().await;
        // "SL" above entry on a LONG is not a loss-side stop.
        let outcome = pipeline
            .process_message(&message(
                1,
                "#OP LONG Entry: 1.85 Target 1: 1.95 SL: 1.99",
            ))
            .await
            .unwrap();
        let IngestOutcome::Accepted(id) = outcome else {
            panic!("expected acceptance");
        };
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.sl_price(), None);
    }

    #[tokio::test]
    async fn test_targets_ordered_in_trade_direction() {
        let (pipeline, store) = pipeline().await;
        let outcome = pipeline
            .process_message(&message(
                1,
                "#ETH SHORT Entry: 3000 Targets: 2900, 2950, 2850 SL: 3100",
            ))
            .await
            .unwrap();
        let IngestOutcome::Accepted(id) = outcome else {
            panic!("expected acceptance");
        };
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.tp_prices(), vec![dec!(2950), dec!(2900), dec!(2850)]);
    }

    #[tokio::test]
    async fn test_acceptance_clears_reentry_lock() {
        let (pipeline, store) = pipeline().await;
        store
            .set_reentry_lock("GUNUSDT", Side::Long, None, "max attempts")
            .await
            .unwrap();

        pipeline.process_message(&message(1, SIGNAL_TEXT)).await.unwrap();
        assert!(!store.is_reentry_locked("GUNUSDT", Side::Long).await.unwrap());
    }

    #[test]
    fn test_normalized_text_hash_collapses_whitespace_and_case() {
        let a = normalized_text_hash("#GUN  LONG\nEntry: 1");
        let b = normalized_text_hash("#gun long entry: 1");
        assert_eq!(a, b);
        assert_ne!(a, normalized_text_hash("#gun long entry: 2"));
    }
}
