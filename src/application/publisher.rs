//! Outbound messaging.
//!
//! The only format ever emitted to the destination channel is the fixed
//! confirmation block, and it is sent strictly after the exchange has
//! acknowledged the orders it describes. Raw forwarding of source
//! messages is forbidden. Operator notices carry rejection and failure
//! reasons with correlating ids; every terminal non-happy state produces
//! exactly one (the caller guards with its CAS transition).

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::domain::entities::signal::Side;
use crate::infrastructure::telegram::ChatSource;
use crate::persistence::telemetry::{Correlation, TelemetrySink};

/// Everything the confirmation template renders.
#[derive(Debug, Clone)]
pub struct EntryConfirmation {
    pub bot_order_id: String,
    pub exchange_order_ids: Vec<String>,
    pub source_channel: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub sl_price: Decimal,
    pub leverage: Decimal,
    pub quantity: Decimal,
    /// (price, quantity share) per take-profit level.
    pub tp_list: Vec<(Decimal, Decimal)>,
    pub order_accepted: bool,
    pub tp_sl_set: bool,
    pub position_opened: bool,
}

/// Render the fixed confirmation block.
pub fn format_confirmation(confirmation: &EntryConfirmation) -> String {
    let mut message = format!(
        "SENT ONLY AFTER EXCHANGE CONFIRMATION (code=0/fills)\n\
         \n\
         Order placed\n\
         Source: {}\n\
         Symbol: {}\n\
         Side: {}\n\
         Entry: {}\n\
         Stop Loss: {}\n\
         Leverage: x{:.2}\n\
         Quantity: {}\n\
         Bot Order ID: {}\n\
         Exchange Order IDs: {}\n",
        confirmation.source_channel,
        confirmation.symbol,
        confirmation.side,
        confirmation.entry_price,
        confirmation.sl_price,
        confirmation.leverage,
        confirmation.quantity,
        confirmation.bot_order_id,
        confirmation.exchange_order_ids.join(", "),
    );

    if !confirmation.tp_list.is_empty() {
        message.push_str("Take Profits:\n");
        for (index, (price, share)) in confirmation.tp_list.iter().enumerate() {
            let pct_from_entry = if confirmation.entry_price.is_zero() {
                Decimal::ZERO
            } else {
                ((*price - confirmation.entry_price) / confirmation.entry_price
                    * Decimal::ONE_HUNDRED)
                    .round_dp(2)
            };
            let sign = if pct_from_entry >= Decimal::ZERO { "+" } else { "" };
            message.push_str(&format!(
                "  TP{}: {} ({}{}%) share {}\n",
                index + 1,
                price,
                sign,
                pct_from_entry,
                share
            ));
        }
    }

    message.push_str(&format!(
        "order_accepted: {}\ntp_sl_set: {}\nposition_opened: {}",
        confirmation.order_accepted, confirmation.tp_sl_set, confirmation.position_opened
    ));

    message
}

/// Outbound channel endpoints.
pub struct Publisher {
    chat: Arc<dyn ChatSource>,
    destination_chat_id: String,
    operator_chat_id: String,
    telemetry: Arc<TelemetrySink>,
}

impl Publisher {
    pub fn new(
        chat: Arc<dyn ChatSource>,
        destination_chat_id: String,
        operator_chat_id: String,
        telemetry: Arc<TelemetrySink>,
    ) -> Self {
        Self {
            chat,
            destination_chat_id,
            operator_chat_id,
            telemetry,
        }
    }

    /// Publish the confirmation template to the destination channel.
    pub async fn publish_confirmation(
        &self,
        confirmation: &EntryConfirmation,
        correlation: Correlation,
    ) {
        let text = format_confirmation(confirmation);
        self.telemetry.emit(
            "confirmation_published",
            "info",
            "publisher",
            "Entry confirmation sent to destination channel",
            correlation,
            Some(json!({
                "symbol": confirmation.symbol,
                "side": confirmation.side.as_str(),
                "bot_order_id": confirmation.bot_order_id,
            })),
        );
        if self.destination_chat_id.is_empty() {
            return;
        }
        if let Err(e) = self.chat.send(&self.destination_chat_id, &text).await {
            warn!("Failed to publish confirmation: {}", e);
        }
    }

    /// Compact operator notice for a rejected signal or failed position.
    pub async fn notify_operator(&self, text: &str, correlation: Correlation) {
        self.telemetry.emit(
            "operator_notice",
            "warning",
            "publisher",
            text,
            correlation,
            None,
        );
        if self.operator_chat_id.is_empty() {
            return;
        }
        if let Err(e) = self.chat.send(&self.operator_chat_id, text).await {
            warn!("Failed to notify operator: {}", e);
        }
    }
}
