//! Telegram chat source and publisher.
//!
//! Long-polls the Bot API `getUpdates` endpoint for channel posts from the
//! monitored source channels and exposes them as an at-least-once message
//! stream; duplicates are the ingestion pipeline's problem. Outbound sends
//! go through `sendMessage` on the same bot token.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{ChannelSpec, TelegramConfig};

#[derive(Debug, Error, Clone)]
pub enum ChatError {
    #[error("Chat network error: {0}")]
    Network(String),

    #[error("Chat API error: {0}")]
    Api(String),
}

/// One message received from a monitored channel.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub chat_id: String,
    pub channel_name: String,
    pub message_id: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
}

/// Chat platform interface: an at-least-once inbound stream plus sends.
#[async_trait]
pub trait ChatSource: Send + Sync {
    /// Subscribe to the given channels; messages arrive on the returned
    /// receiver until shutdown.
    async fn subscribe(
        &self,
        channels: &[ChannelSpec],
        shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<ChatMessage>, ChatError>;

    /// Send a text message to a chat.
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChatError>;
}

/// `ChatSource` over the Telegram Bot API.
pub struct TelegramSource {
    http: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramSource {
    pub fn new(config: TelegramConfig) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(35))
            .build()
            .map_err(|e| ChatError::Network(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{}",
            self.config.bot_token, method
        )
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Value>, ChatError> {
        let response = self
            .http
            .get(self.api_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", "25".to_string()),
                (
                    "allowed_updates",
                    "[\"message\",\"channel_post\"]".to_string(),
                ),
            ])
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api(format!("getUpdates {}: {}", status, body)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Api(e.to_string()))?;
        Ok(body
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

/// Extract `(update_id, chat_id, message_id, date, text)` from one update.
fn parse_update(update: &Value) -> Option<(i64, String, i64, Option<i64>, String)> {
    let update_id = update.get("update_id")?.as_i64()?;
    let post = update
        .get("channel_post")
        .or_else(|| update.get("message"))?;
    let chat_id = post.get("chat")?.get("id")?.as_i64()?.to_string();
    let message_id = post.get("message_id")?.as_i64()?;
    let date = post.get("date").and_then(|d| d.as_i64());
    let text = post
        .get("text")
        .or_else(|| post.get("caption"))?
        .as_str()?
        .to_string();
    Some((update_id, chat_id, message_id, date, text))
}

#[async_trait]
impl ChatSource for TelegramSource {
    async fn subscribe(
        &self,
        channels: &[ChannelSpec],
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<ChatMessage>, ChatError> {
        let (tx, rx) = mpsc::channel(256);
        let names: HashMap<String, String> = channels
            .iter()
            .map(|c| (c.chat_id.clone(), c.name.clone()))
            .collect();
        let source = Arc::new(Self {
            http: self.http.clone(),
            config: self.config.clone(),
        });
        let poll_interval = self.config.poll_interval;

        info!("Subscribing to {} source channels", names.len());

        tokio::spawn(async move {
            let mut offset = 0i64;
            loop {
                if *shutdown.borrow() {
                    debug!("Telegram poller stopping on shutdown signal");
                    return;
                }

                let updates = tokio::select! {
                    result = source.get_updates(offset) => match result {
                        Ok(updates) => updates,
                        Err(e) => {
                            warn!("Telegram getUpdates failed: {}", e);
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => continue,
                                _ = shutdown.changed() => return,
                            }
                        }
                    },
                    _ = shutdown.changed() => return,
                };

                for update in &updates {
                    let Some((update_id, chat_id, message_id, date, text)) = parse_update(update)
                    else {
                        if let Some(id) = update.get("update_id").and_then(|u| u.as_i64()) {
                            offset = offset.max(id + 1);
                        }
                        continue;
                    };
                    offset = offset.max(update_id + 1);

                    // Only monitored channels flow downstream.
                    let Some(name) = names.get(&chat_id) else {
                        continue;
                    };

                    let message = ChatMessage {
                        chat_id: chat_id.clone(),
                        channel_name: name.clone(),
                        message_id,
                        timestamp: date.and_then(|d| Utc.timestamp_opt(d, 0).single()),
                        text,
                    };
                    if tx.send(message).await.is_err() {
                        debug!("Chat message receiver dropped; poller exiting");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChatError> {
        let response = self
            .http
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(body = %body, "Telegram sendMessage error");
            return Err(ChatError::Api(format!("sendMessage {}: {}", status, body)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_channel_post() {
        let update = serde_json::json!({
            "update_id": 7,
            "channel_post": {
                "chat": {"id": -1002290339976i64},
                "message_id": 314,
                "date": 1736900000,
                "text": "#GUN LONG Entry zone 0.0235 - 0.0232"
            }
        });
        let (update_id, chat_id, message_id, date, text) = parse_update(&update).unwrap();
        assert_eq!(update_id, 7);
        assert_eq!(chat_id, "-1002290339976");
        assert_eq!(message_id, 314);
        assert_eq!(date, Some(1736900000));
        assert!(text.starts_with("#GUN"));
    }

    #[test]
    fn test_parse_update_skips_non_text() {
        let update = serde_json::json!({
            "update_id": 8,
            "channel_post": {
                "chat": {"id": -100},
                "message_id": 315,
                "photo": [{"file_id": "abc"}]
            }
        });
        assert!(parse_update(&update).is_none());
    }

    #[test]
    fn test_parse_update_caption_fallback() {
        let update = serde_json::json!({
            "update_id": 9,
            "message": {
                "chat": {"id": -100},
                "message_id": 316,
                "caption": "chart attached"
            }
        });
        let (_, _, _, _, text) = parse_update(&update).unwrap();
        assert_eq!(text, "chart attached");
    }
}
