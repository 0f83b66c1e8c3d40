//! Fan-out Bridge (§4.3): reads the per-stream log via a durable consumer
//! group and dispatches entries to the WebSocket Gateway's broadcast surface.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::gateway::Gateway;
use crate::log::Log;
use crate::models::{Bar, ServerFrame, Trade};

const TRADES_STREAM: &str = "market:realtime:trades";
const BARS_STREAM: &str = "market:realtime:bars";
const CONSUMER_GROUP: &str = "gateway_stream_consumers";
const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct EntryEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    symbol: String,
}

pub struct FanoutBridge {
    log: Log,
    gateway: Gateway,
    consumer_name: String,
    broadcast_global: bool,
}

impl FanoutBridge {
    pub fn new(log: Log, gateway: Gateway, consumer_name: String, broadcast_global: bool) -> Self {
        Self {
            log,
            gateway,
            consumer_name,
            broadcast_global,
        }
    }

    /// Runs forever, reading both streams and dispatching to the gateway.
    /// Pending-entry recovery is handled transparently by `Log::read`.
    pub async fn run(self) -> anyhow::Result<()> {
        let consumer = self.log.consumer_group(
            &[TRADES_STREAM, BARS_STREAM],
            CONSUMER_GROUP,
            &self.consumer_name,
        );

        loop {
            let deliveries = consumer.read(100, READ_TIMEOUT).await;
            for delivery in deliveries {
                self.dispatch(&consumer, &delivery).await;
            }
        }
    }

    async fn dispatch(&self, consumer: &crate::log::GroupConsumer, delivery: &crate::log::Delivery) {
        let envelope: EntryEnvelope = match serde_json::from_str(&delivery.entry.data) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, stream = %delivery.stream, "dropping malformed log entry");
                consumer.ack(&delivery.stream, delivery.entry.id);
                return;
            }
        };

        if envelope.symbol.is_empty() {
            warn!(stream = %delivery.stream, "dropping log entry with empty symbol");
            consumer.ack(&delivery.stream, delivery.entry.id);
            return;
        }

        let frame = if envelope.kind == "bar" {
            match serde_json::from_str::<Bar>(&delivery.entry.data) {
                Ok(bar) => ServerFrame::BarUpdate(bar),
                Err(e) => {
                    warn!(error = %e, stream = %delivery.stream, "dropping malformed bar entry");
                    consumer.ack(&delivery.stream, delivery.entry.id);
                    return;
                }
            }
        } else {
            match serde_json::from_str::<Trade>(&delivery.entry.data) {
                Ok(trade) => ServerFrame::TradeUpdate(trade),
                Err(e) => {
                    warn!(error = %e, stream = %delivery.stream, "dropping malformed trade entry");
                    consumer.ack(&delivery.stream, delivery.entry.id);
                    return;
                }
            }
        };

        self.gateway.broadcast_to_symbol(&envelope.symbol, &frame);
        if self.broadcast_global {
            self.gateway.broadcast(&frame);
        }

        // Dispatch to the in-process gateway cannot itself fail (no network
        // hop), so we always ack. A future networked gateway would only ack
        // after a confirmed send.
        consumer.ack(&delivery.stream, delivery.entry.id);
    }
}
