//! Telemetry sink.
//!
//! Append-only JSONL event log, one event per line, ordered by arrival.
//! Events correlate by signal id, position id, bot order id and exchange
//! order ids so an audit can be reconstructed offline. Secret-looking
//! payload keys are redacted before anything reaches disk. Emission is
//! best-effort: telemetry must never take the engine down, and writes are
//! issued *before* the state transitions they report.

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Correlation ids attached to an event.
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub signal_id: Option<i64>,
    pub position_id: Option<i64>,
    pub bot_order_id: Option<String>,
    pub exchange_order_ids: Vec<String>,
}

impl Correlation {
    pub fn signal(signal_id: i64) -> Self {
        Self {
            signal_id: Some(signal_id),
            ..Self::default()
        }
    }

    pub fn position(position_id: i64) -> Self {
        Self {
            position_id: Some(position_id),
            ..Self::default()
        }
    }

    pub fn with_signal(mut self, signal_id: i64) -> Self {
        self.signal_id = Some(signal_id);
        self
    }

    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.exchange_order_ids.push(order_id.into());
        self
    }

    pub fn with_bot_order(mut self, bot_order_id: impl Into<String>) -> Self {
        self.bot_order_id = Some(bot_order_id.into());
        self
    }
}

const REDACTED_KEYS: &[&str] = &[
    "api_key",
    "apikey",
    "secret",
    "secret_key",
    "signature",
    "authorization",
    "auth",
    "token",
    "password",
    "bot_token",
];

fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.len() > 8 => {
            Value::String(format!("{}***{}", &s[..4.min(s.len())], &s[s.len() - 2..]))
        }
        _ => Value::String("***".to_string()),
    }
}

/// Recursively redact sensitive keys in a payload.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, inner) in map {
                if REDACTED_KEYS.contains(&key.to_lowercase().as_str()) {
                    out.insert(key.clone(), redact_value(inner));
                } else {
                    out.insert(key.clone(), redact(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Append-only JSONL telemetry sink.
pub struct TelemetrySink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl TelemetrySink {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Sink that drops everything; used in tests of other components.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Never fails outward.
    pub fn emit(
        &self,
        event_type: &str,
        level: &str,
        subsystem: &str,
        message: &str,
        correlation: Correlation,
        payload: Option<Value>,
    ) {
        let key_material = json!({
            "event_type": event_type,
            "subsystem": subsystem,
            "signal_id": correlation.signal_id,
            "position_id": correlation.position_id,
            "bot_order_id": correlation.bot_order_id,
            "exchange_order_ids": correlation.exchange_order_ids,
            "message": message,
        });
        let event_key = hex::encode(Sha256::digest(key_material.to_string().as_bytes()));

        let event = json!({
            "ts_utc": Utc::now().to_rfc3339(),
            "event_type": event_type,
            "level": level.to_uppercase(),
            "subsystem": subsystem,
            "message": message,
            "event_key": event_key,
            "correlation": {
                "signal_id": correlation.signal_id,
                "position_id": correlation.position_id,
                "bot_order_id": correlation.bot_order_id,
                "exchange_order_ids": correlation.exchange_order_ids,
            },
            "payload": payload.as_ref().map(redact),
        });

        let line = event.to_string();
        match self.file.lock() {
            Ok(mut guard) => {
                if let Some(file) = guard.as_mut() {
                    if let Err(e) = writeln!(file, "{}", line) {
                        warn!("Telemetry write failed: {}", e);
                    }
                }
            }
            Err(_) => warn!("Telemetry sink lock poisoned; event dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kasima-telemetry-{}-{}.jsonl", name, std::process::id()))
    }

    #[test]
    fn test_events_append_in_order() {
        let path = temp_path("order");
        let _ = std::fs::remove_file(&path);
        let sink = TelemetrySink::new(&path).unwrap();

        sink.emit(
            "signal_accepted",
            "info",
            "ingestion",
            "accepted",
            Correlation::signal(1),
            None,
        );
        sink.emit(
            "entry_placed",
            "info",
            "entry",
            "dual limit placed",
            Correlation::position(1).with_order("e1").with_order("e2"),
            Some(json!({"q1": "10", "q2": "10"})),
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first["event_type"], "signal_accepted");
        assert_eq!(second["event_type"], "entry_placed");
        assert_eq!(second["correlation"]["exchange_order_ids"][0], "e1");
        assert!(first["ts_utc"].as_str().unwrap() <= second["ts_utc"].as_str().unwrap());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_payload_redaction() {
        let payload = json!({
            "api_key": "Z3w6CaFqcLhk05UfB58e",
            "nested": {"secret": "vjQfaT0l3kXooWHLLBQT"},
            "symbol": "GUNUSDT",
        });
        let redacted = redact(&payload);
        assert_eq!(redacted["symbol"], "GUNUSDT");
        let api_key = redacted["api_key"].as_str().unwrap();
        assert!(api_key.contains("***"));
        assert!(!api_key.contains("CaFqcLhk"));
        assert!(redacted["nested"]["secret"].as_str().unwrap().contains("***"));
    }

    #[test]
    fn test_event_key_is_stable() {
        let path = temp_path("stable");
        let _ = std::fs::remove_file(&path);
        let sink = TelemetrySink::new(&path).unwrap();
        sink.emit("x", "info", "s", "m", Correlation::signal(9), None);
        sink.emit("x", "info", "s", "m", Correlation::signal(9), None);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["event_key"], lines[1]["event_key"]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        let sink = TelemetrySink::disabled();
        sink.emit("x", "info", "s", "m", Correlation::default(), None);
    }
}
