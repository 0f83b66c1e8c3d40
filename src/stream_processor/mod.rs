//! Stream Processor (§4.2): drains the bus in batches, persists idempotently,
//! and republishes committed records to the per-stream log.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::bus::{Bus, BusConsumer};
use crate::db::Store;
use crate::health::HealthState;
use crate::log::Log;
use crate::models::{Bar, Trade};

const TRADES_TOPIC: &str = "stock_trades_realtime";
const BARS_TOPIC: &str = "stock_bars_staging";
const TRADES_STREAM: &str = "market:realtime:trades";
const BARS_STREAM: &str = "market:realtime:bars";

const MIN_FLUSH_BACKOFF: Duration = Duration::from_secs(1);
const MAX_FLUSH_BACKOFF: Duration = Duration::from_secs(15);
const DEGRADED_THRESHOLD: u32 = 5;

pub struct StreamProcessor {
    bus: Bus,
    log: Log,
    store: Store,
    batch_size: usize,
    flush_interval: Duration,
    health: HealthState,
}

impl StreamProcessor {
    pub fn new(
        bus: Bus,
        log: Log,
        store: Store,
        batch_size: usize,
        flush_interval: Duration,
        health: HealthState,
    ) -> Self {
        Self {
            bus,
            log,
            store,
            batch_size,
            flush_interval,
            health,
        }
    }

    /// Runs both consumer loops (`trades-persist`, `bars-persist`) concurrently
    /// until one exits (which only happens on a bug; the loops themselves
    /// retry forever on recoverable failure).
    pub async fn run(self) -> Result<()> {
        let trades = TradeLoop {
            consumer: self.bus.consumer(TRADES_TOPIC, "trades-persist"),
            log: self.log.clone(),
            store: self.store.clone(),
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            symbol_cache: HashMap::new(),
            volume_cache: HashMap::new(),
            health: self.health.clone(),
        };
        let bars = BarLoop {
            consumer: self.bus.consumer(BARS_TOPIC, "bars-persist"),
            log: self.log.clone(),
            store: self.store.clone(),
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            symbol_cache: HashMap::new(),
            health: self.health.clone(),
        };

        tokio::try_join!(trades.run(), bars.run())?;
        Ok(())
    }
}

struct TradeLoop {
    consumer: BusConsumer,
    log: Log,
    store: Store,
    batch_size: usize,
    flush_interval: Duration,
    symbol_cache: HashMap<String, i64>,
    volume_cache: HashMap<i64, f64>,
    health: HealthState,
}

impl TradeLoop {
    async fn run(mut self) -> Result<()> {
        let mut consecutive_failures = 0u32;
        loop {
            let batch = self.consumer.poll_batch(self.batch_size, self.flush_interval).await;
            if batch.is_empty() {
                continue;
            }

            let mut backoff = MIN_FLUSH_BACKOFF;
            loop {
                match self.flush(&batch) {
                    Ok(max_offset) => {
                        self.consumer.commit(max_offset);
                        consecutive_failures = 0;
                        self.health.set_degraded(false);
                        break;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(error = %e, consecutive_failures, "trade batch flush failed, retrying");
                        if consecutive_failures >= DEGRADED_THRESHOLD {
                            warn!("stream processor (trades) health degraded after repeated flush failures");
                            self.health.set_degraded(true);
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_FLUSH_BACKOFF);
                    }
                }
            }
        }
    }

    fn flush(&mut self, batch: &[crate::bus::BusMessage]) -> Result<u64> {
        let mut max_offset = 0u64;
        let mut entries = Vec::new();
        for msg in batch {
            max_offset = max_offset.max(msg.offset);
            let Ok(trade) = serde_json::from_slice::<Trade>(&msg.payload) else {
                continue;
            };
            let symbol_id = self.resolve_symbol(&trade.symbol)?;
            entries.push((trade, symbol_id));
        }

        let mut volume_cache = self.volume_cache.clone();
        let mut committed = Vec::new();
        self.store.transaction(|conn| {
            for (trade, symbol_id) in &entries {
                let running_volume = volume_cache.get(symbol_id).copied().unwrap_or(0.0) + trade.size;
                let inserted = Store::insert_trade(
                    conn,
                    *symbol_id,
                    trade.timestamp,
                    trade.price,
                    trade.size,
                    running_volume,
                )?;
                if inserted {
                    volume_cache.insert(*symbol_id, running_volume);
                    committed.push(Trade::new(
                        trade.symbol.clone(),
                        trade.price,
                        trade.size,
                        trade.timestamp,
                        running_volume,
                    ));
                }
            }
            Ok(())
        })?;
        self.volume_cache = volume_cache;

        for record in &committed {
            let data = serde_json::to_string(record)?;
            self.log.append(TRADES_STREAM, &record.symbol, &data);
        }
        info!(count = committed.len(), "flushed trade batch");
        Ok(max_offset)
    }

    fn resolve_symbol(&mut self, ticker: &str) -> Result<i64> {
        if let Some(&id) = self.symbol_cache.get(ticker) {
            return Ok(id);
        }
        let id = self.store.get_or_insert_symbol(ticker)?;
        self.symbol_cache.insert(ticker.to_string(), id);
        let seed = self.store.last_volume(id)?.unwrap_or(0.0);
        self.volume_cache.entry(id).or_insert(seed);
        Ok(id)
    }
}

struct BarLoop {
    consumer: BusConsumer,
    log: Log,
    store: Store,
    batch_size: usize,
    flush_interval: Duration,
    symbol_cache: HashMap<String, i64>,
    health: HealthState,
}

impl BarLoop {
    async fn run(mut self) -> Result<()> {
        let mut consecutive_failures = 0u32;
        loop {
            let batch = self.consumer.poll_batch(self.batch_size, self.flush_interval).await;
            if batch.is_empty() {
                continue;
            }

            let mut backoff = MIN_FLUSH_BACKOFF;
            loop {
                match self.flush(&batch) {
                    Ok(max_offset) => {
                        self.consumer.commit(max_offset);
                        consecutive_failures = 0;
                        self.health.set_degraded(false);
                        break;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(error = %e, consecutive_failures, "bar batch flush failed, retrying");
                        if consecutive_failures >= DEGRADED_THRESHOLD {
                            warn!("stream processor (bars) health degraded after repeated flush failures");
                            self.health.set_degraded(true);
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_FLUSH_BACKOFF);
                    }
                }
            }
        }
    }

    fn flush(&mut self, batch: &[crate::bus::BusMessage]) -> Result<u64> {
        let mut max_offset = 0u64;
        let mut entries = Vec::new();
        for msg in batch {
            max_offset = max_offset.max(msg.offset);
            let Ok(bar) = serde_json::from_slice::<Bar>(&msg.payload) else {
                continue;
            };
            if !bar.is_valid() {
                warn!(symbol = %bar.symbol, timestamp = bar.timestamp, "dropping bar failing OHLC invariant");
                continue;
            }
            let symbol_id = self.resolve_symbol(&bar.symbol)?;
            entries.push((bar, symbol_id));
        }

        let mut committed = Vec::new();
        self.store.transaction(|conn| {
            for (bar, symbol_id) in entries {
                let inserted = Store::insert_bar(
                    conn,
                    symbol_id,
                    &bar.timeframe,
                    bar.timestamp,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.trade_count,
                    bar.vwap,
                )?;
                if inserted {
                    committed.push(bar);
                }
            }
            Ok(())
        })?;

        for record in &committed {
            let data = serde_json::to_string(record)?;
            self.log.append(BARS_STREAM, &record.symbol, &data);
        }
        info!(count = committed.len(), "flushed bar batch");
        Ok(max_offset)
    }

    fn resolve_symbol(&mut self, ticker: &str) -> Result<i64> {
        if let Some(&id) = self.symbol_cache.get(ticker) {
            return Ok(id);
        }
        let id = self.store.get_or_insert_symbol(ticker)?;
        self.symbol_cache.insert(ticker.to_string(), id);
        Ok(id)
    }
}
