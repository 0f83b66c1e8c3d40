//! Ingest Worker (§4.1): sustains a single upstream WebSocket connection,
//! normalizes trade/bar frames, and forwards them to the bus.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::config::Config;
use crate::models::{Bar, RawFrame, Trade};

const TRADES_TOPIC: &str = "stock_trades_realtime";
const BARS_TOPIC: &str = "stock_bars_staging";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct IngestWorker {
    url: String,
    key: Option<String>,
    secret: Option<String>,
    symbols: Vec<String>,
    bus: Bus,
}

impl IngestWorker {
    pub fn new(config: &Config, bus: Bus) -> Self {
        Self {
            url: config.upstream_ws_url.clone(),
            key: config.upstream_key.clone(),
            secret: config.upstream_secret.clone(),
            symbols: config.subscribed_symbols.clone(),
            bus,
        }
    }

    /// Blocks, reconnecting with exponential backoff, until an unrecoverable
    /// (fatal) failure occurs. Subscription state is retained across
    /// reconnects (§4.1).
    pub async fn run(&self) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("upstream feed closed gracefully");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) if is_fatal(&e) => {
                    warn!(error = %e, "upstream authentication failure, aborting ingest worker");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "upstream connection lost, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!(url = %self.url, "connecting to upstream market-data feed");
        let (ws, response) = connect_async(&self.url)
            .await
            .context("failed to connect to upstream feed")?;

        if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
            anyhow::bail!("upstream authentication rejected (status {})", response.status());
        }

        let (mut write, mut read) = ws.split();

        if let Some(sub) = self.subscribe_message() {
            write
                .send(Message::Text(sub))
                .await
                .context("failed to send subscription")?;
        }

        loop {
            let next = tokio::time::timeout(IDLE_TIMEOUT, read.next()).await;
            let message = match next {
                Ok(Some(m)) => m.context("upstream read error")?,
                Ok(None) => return Ok(()),
                Err(_) => anyhow::bail!("upstream idle for {:?}, reconnecting", IDLE_TIMEOUT),
            };

            match message {
                Message::Text(text) => self.handle(&text),
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
    }

    fn subscribe_message(&self) -> Option<String> {
        if self.symbols.is_empty() {
            return None;
        }
        let mut msg = serde_json::json!({
            "action": "subscribe",
            "symbols": self.symbols,
        });
        if let (Some(key), Some(secret)) = (&self.key, &self.secret) {
            msg["key"] = serde_json::Value::String(key.clone());
            msg["secret"] = serde_json::Value::String(secret.clone());
        }
        Some(msg.to_string())
    }

    /// Normalizes a raw upstream frame and publishes it to the bus (§4.1).
    /// Unknown frame kinds are logged and dropped; control frames are
    /// acknowledged implicitly (no reply required by the feed) and otherwise
    /// ignored.
    pub fn handle(&self, raw: &str) {
        let frame: RawFrame = match serde_json::from_str(raw) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "dropping unparseable/unknown upstream frame");
                return;
            }
        };

        match frame {
            RawFrame::Control { action } => {
                debug!(%action, "acknowledged control frame");
            }
            RawFrame::Trade {
                symbol,
                price,
                size,
                timestamp,
            } => match parse_epoch_millis(&timestamp) {
                Ok(ts) => {
                    let ticker = symbol.to_ascii_uppercase();
                    // Volume is a running per-symbol sum computed by the
                    // Stream Processor at flush time (§4.2); the ingest
                    // worker has no persisted history to derive it from, so
                    // it publishes 0.0 as a placeholder that downstream
                    // overwrites before persistence (see DESIGN.md).
                    let trade = Trade::new(ticker.clone(), price, size, ts, 0.0);
                    if let Ok(payload) = serde_json::to_vec(&trade) {
                        self.bus.publish(TRADES_TOPIC, &ticker, payload);
                    }
                }
                Err(e) => warn!(error = %e, %symbol, "dropping trade with unparseable timestamp"),
            },
            RawFrame::Bar {
                symbol,
                timeframe,
                timestamp,
                open,
                high,
                low,
                close,
                volume,
                trade_count,
                vwap,
            } => match parse_epoch_millis(&timestamp) {
                Ok(ts) => {
                    let ticker = symbol.to_ascii_uppercase();
                    let bar = Bar {
                        kind: "bar".to_string(),
                        symbol: ticker.clone(),
                        timeframe,
                        timestamp: ts,
                        open,
                        high,
                        low,
                        close,
                        volume,
                        trade_count,
                        vwap,
                    };
                    if let Ok(payload) = serde_json::to_vec(&bar) {
                        self.bus.publish(BARS_TOPIC, &ticker, payload);
                    }
                }
                Err(e) => warn!(error = %e, %symbol, "dropping bar with unparseable timestamp"),
            },
        }
    }
}

fn parse_epoch_millis(iso8601: &str) -> Result<i64> {
    Ok(DateTime::parse_from_rfc3339(iso8601)
        .with_context(|| format!("invalid ISO-8601 timestamp: {}", iso8601))?
        .timestamp_millis())
}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.to_string().to_ascii_lowercase().contains("authentication")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> IngestWorker {
        IngestWorker {
            url: "wss://example.invalid".into(),
            key: None,
            secret: None,
            symbols: vec!["AAPL".into()],
            bus: Bus::new(),
        }
    }

    #[test]
    fn handle_normalizes_trade_and_uppercases_ticker() {
        let worker = worker();
        worker.handle(r#"{"type":"trade","S":"aapl","p":150.25,"s":100,"t":"2025-01-15T10:30:00Z"}"#);

        let consumer = worker.bus.consumer(TRADES_TOPIC, "test");
        let batch = tokio_test_block_on(consumer.poll_batch(10, Duration::from_millis(50)));
        assert_eq!(batch.len(), 1);
        let trade: Trade = serde_json::from_slice(&batch[0].payload).unwrap();
        assert_eq!(trade.symbol, "AAPL");
        assert_eq!(trade.timestamp, 1736937000000);
        assert_eq!(trade.price, 150.25);
    }

    #[test]
    fn handle_drops_unknown_frame_kind() {
        let worker = worker();
        worker.handle(r#"{"type":"heartbeat"}"#);
        let consumer = worker.bus.consumer(TRADES_TOPIC, "test");
        let batch = tokio_test_block_on(consumer.poll_batch(10, Duration::from_millis(20)));
        assert!(batch.is_empty());
    }

    #[test]
    fn handle_acks_control_frame_without_publishing() {
        let worker = worker();
        worker.handle(r#"{"type":"control","action":"ack"}"#);
        let consumer = worker.bus.consumer(TRADES_TOPIC, "test");
        let batch = tokio_test_block_on(consumer.poll_batch(10, Duration::from_millis(20)));
        assert!(batch.is_empty());
    }

    fn tokio_test_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
