//! Synthetic emitter for development without an upstream feed (§4.4).
//! Must not be run alongside a live Fan-out Bridge on the same instance.

use std::time::Duration;

use rand::Rng;
use tracing::info;

use super::Gateway;
use crate::models::{Bar, ServerFrame, Trade};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
const MOCK_TICKERS: &[&str] = &["AAPL", "MSFT", "GOOGL", "AMZN", "TSLA"];

/// Runs forever, emitting plausible trade/bar updates directly to the
/// gateway's broadcast surface.
pub async fn run(gateway: Gateway) {
    info!("mock realtime emitter started");
    let mut interval = tokio::time::interval(DEFAULT_INTERVAL);
    loop {
        interval.tick().await;
        let ticker = MOCK_TICKERS[rand::thread_rng().gen_range(0..MOCK_TICKERS.len())];
        let now = chrono::Utc::now().timestamp_millis();

        if rand::thread_rng().gen_bool(0.7) {
            let price = 100.0 + rand::thread_rng().gen_range(-5.0..5.0);
            let size = rand::thread_rng().gen_range(1.0..500.0);
            let trade = Trade::new(ticker.to_string(), price, size, now, size);
            gateway.broadcast_to_symbol(ticker, &ServerFrame::TradeUpdate(trade));
        } else {
            let open: f64 = 100.0 + rand::thread_rng().gen_range(-5.0..5.0);
            let close: f64 = open + rand::thread_rng().gen_range(-1.0..1.0);
            let high = open.max(close) + rand::thread_rng().gen_range(0.0..1.0);
            let low = open.min(close) - rand::thread_rng().gen_range(0.0..1.0);
            let bar = Bar {
                kind: "bar".to_string(),
                symbol: ticker.to_string(),
                timeframe: "1m".to_string(),
                timestamp: now,
                open,
                high,
                low,
                close,
                volume: rand::thread_rng().gen_range(1000.0..50000.0),
                trade_count: rand::thread_rng().gen_range(1..200),
                vwap: (open + close) / 2.0,
            };
            gateway.broadcast_to_symbol(ticker, &ServerFrame::BarUpdate(bar));
        }
    }
}
