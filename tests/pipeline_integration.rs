//! End-to-end exercise of the realtime pipeline: bus -> Stream Processor ->
//! per-stream log -> Fan-out Bridge -> Gateway broadcast surface.
//!
//! Drives the in-memory bus/log/store directly; no external services
//! required (§6 "Test tooling").

use std::time::Duration;

use market_data_core::bus::Bus;
use market_data_core::db::Store;
use market_data_core::fanout::FanoutBridge;
use market_data_core::gateway::Gateway;
use market_data_core::health::HealthState;
use market_data_core::log::Log;
use market_data_core::models::{Bar, Trade};
use market_data_core::stream_processor::StreamProcessor;

const TRADES_TOPIC: &str = "stock_trades_realtime";
const BARS_TOPIC: &str = "stock_bars_staging";

#[tokio::test]
async fn happy_path_trade_flows_from_bus_to_subscribed_client() {
    let bus = Bus::new();
    let log = Log::new();
    let store = Store::open_in_memory().unwrap();
    let gateway = Gateway::new(Vec::new());

    let processor = StreamProcessor::new(
        bus.clone(),
        log.clone(),
        store.clone(),
        100,
        Duration::from_millis(50),
        HealthState::new(),
    );
    tokio::spawn(processor.run());

    let bridge = FanoutBridge::new(log.clone(), gateway.clone(), "gateway-consumer".into(), false);
    tokio::spawn(bridge.run());

    let mut room = gateway.subscribe_room("AAPL");

    let trade = Trade::new("AAPL".into(), 150.25, 100.0, 1_736_937_000_000, 0.0);
    bus.publish(TRADES_TOPIC, "AAPL", serde_json::to_vec(&trade).unwrap());

    let frame = tokio::time::timeout(Duration::from_millis(500), room.recv())
        .await
        .expect("trade_update within 500ms")
        .expect("channel open");
    assert!(frame.contains("trade_update"));
    assert!(frame.contains("\"price\":150.25"));
    assert!(frame.contains("\"volume\":100"));

    let symbol_id = store.get_or_insert_symbol("AAPL").unwrap();
    assert_eq!(store.count_trades(symbol_id).unwrap(), 1);
}

#[tokio::test]
async fn duplicate_frame_persists_once_but_may_be_delivered_twice() {
    let bus = Bus::new();
    let log = Log::new();
    let store = Store::open_in_memory().unwrap();
    let gateway = Gateway::new(Vec::new());

    let processor = StreamProcessor::new(
        bus.clone(),
        log.clone(),
        store.clone(),
        100,
        Duration::from_millis(50),
        HealthState::new(),
    );
    tokio::spawn(processor.run());

    let bridge = FanoutBridge::new(log.clone(), gateway.clone(), "gateway-consumer".into(), false);
    tokio::spawn(bridge.run());

    let mut room = gateway.subscribe_room("AAPL");

    let trade = Trade::new("AAPL".into(), 150.25, 100.0, 1_736_937_000_000, 0.0);
    let payload = serde_json::to_vec(&trade).unwrap();
    bus.publish(TRADES_TOPIC, "AAPL", payload.clone());
    bus.publish(TRADES_TOPIC, "AAPL", payload);

    let first = tokio::time::timeout(Duration::from_millis(500), room.recv()).await;
    assert!(first.is_ok(), "at least one trade_update delivered");

    let symbol_id = store.get_or_insert_symbol("AAPL").unwrap();
    assert_eq!(
        store.count_trades(symbol_id).unwrap(),
        1,
        "idempotency key suppresses the duplicate row"
    );
}

#[tokio::test]
async fn invalid_bar_is_dropped_before_reaching_clients() {
    let bus = Bus::new();
    let log = Log::new();
    let store = Store::open_in_memory().unwrap();
    let gateway = Gateway::new(Vec::new());

    let processor = StreamProcessor::new(
        bus.clone(),
        log.clone(),
        store.clone(),
        100,
        Duration::from_millis(50),
        HealthState::new(),
    );
    tokio::spawn(processor.run());

    let bridge = FanoutBridge::new(log.clone(), gateway.clone(), "gateway-consumer".into(), false);
    tokio::spawn(bridge.run());

    let mut room = gateway.subscribe_room("AAPL");

    let bad_bar = Bar {
        kind: "bar".to_string(),
        symbol: "AAPL".into(),
        timeframe: "1m".into(),
        timestamp: 1_736_937_000_000,
        open: 10.0,
        high: 9.0,
        low: 8.0,
        close: 9.0,
        volume: 100.0,
        trade_count: 5,
        vwap: 9.5,
    };
    bus.publish(BARS_TOPIC, "AAPL", serde_json::to_vec(&bad_bar).unwrap());

    let result = tokio::time::timeout(Duration::from_millis(200), room.recv()).await;
    assert!(result.is_err(), "no bar_update should arrive for an invalid bar");

    let symbol_id = store.get_or_insert_symbol("AAPL").unwrap();
    assert_eq!(store.count_trades(symbol_id).unwrap(), 0);
}

#[tokio::test]
async fn room_isolation_keeps_unrelated_subscribers_silent() {
    let bus = Bus::new();
    let log = Log::new();
    let store = Store::open_in_memory().unwrap();
    let gateway = Gateway::new(Vec::new());

    let processor = StreamProcessor::new(
        bus.clone(),
        log.clone(),
        store.clone(),
        100,
        Duration::from_millis(50),
        HealthState::new(),
    );
    tokio::spawn(processor.run());

    let bridge = FanoutBridge::new(log.clone(), gateway.clone(), "gateway-consumer".into(), false);
    tokio::spawn(bridge.run());

    let mut aapl_room = gateway.subscribe_room("AAPL");
    let mut msft_room = gateway.subscribe_room("MSFT");

    let trade = Trade::new("AAPL".into(), 150.25, 100.0, 1_736_937_000_000, 0.0);
    bus.publish(TRADES_TOPIC, "AAPL", serde_json::to_vec(&trade).unwrap());

    let aapl_frame = tokio::time::timeout(Duration::from_millis(500), aapl_room.recv()).await;
    assert!(aapl_frame.is_ok());

    let msft_frame = tokio::time::timeout(Duration::from_millis(150), msft_room.recv()).await;
    assert!(msft_frame.is_err(), "MSFT subscriber receives nothing for an AAPL trade");
}
