//! Wire and storage shapes shared across the pipeline (§3, §6).

use serde::{Deserialize, Serialize};

/// A persisted (or in-flight) trade observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    #[serde(rename = "type")]
    pub kind: String,
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    /// Epoch milliseconds, monotonic per-symbol only.
    pub timestamp: i64,
    pub volume: f64,
}

impl Trade {
    pub fn new(symbol: String, price: f64, size: f64, timestamp: i64, volume: f64) -> Self {
        Self {
            kind: "trade".to_string(),
            symbol,
            price,
            size,
            timestamp,
            volume,
        }
    }
}

/// A persisted (or in-flight) OHLC bar observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    #[serde(rename = "type")]
    pub kind: String,
    pub symbol: String,
    pub timeframe: String,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: i64,
    pub vwap: f64,
}

impl Bar {
    /// Checks the OHLC invariant of §3/§4.2: `low <= min(open,close) <= max(open,close) <= high`,
    /// plus the non-negativity of `volume` and `trade_count`.
    pub fn is_valid(&self) -> bool {
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low <= lo && hi <= self.high && self.volume >= 0.0 && self.trade_count >= 0
    }
}

/// A raw frame as it arrives over the upstream WebSocket, before normalization.
///
/// `#[serde(tag = "type")]` mirrors the discriminator the upstream feed sends;
/// anything that doesn't match one of these three shapes fails to deserialize
/// and is treated as an unknown frame kind by the ingest worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RawFrame {
    Trade {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "p")]
        price: f64,
        #[serde(rename = "s")]
        size: f64,
        #[serde(rename = "t")]
        timestamp: String,
    },
    Bar {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "tf", default = "default_timeframe")]
        timeframe: String,
        #[serde(rename = "t")]
        timestamp: String,
        #[serde(rename = "o")]
        open: f64,
        #[serde(rename = "h")]
        high: f64,
        #[serde(rename = "l")]
        low: f64,
        #[serde(rename = "c")]
        close: f64,
        #[serde(rename = "v", default)]
        volume: f64,
        #[serde(rename = "n", default)]
        trade_count: i64,
        #[serde(rename = "vw", default)]
        vwap: f64,
    },
    Control {
        #[serde(default)]
        action: String,
    },
}

fn default_timeframe() -> String {
    "1m".to_string()
}

/// The client's `subscribe`/`unsubscribe` payload accepts either a bare ticker
/// string or `{symbol}` (§4.4); parsed once at the protocol boundary into a
/// single canonical shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SubscribePayload {
    Bare(String),
    Wrapped { symbol: String },
}

#[derive(Debug, Clone)]
pub struct SubscribeCommand {
    pub ticker: String,
}

impl From<SubscribePayload> for SubscribeCommand {
    fn from(payload: SubscribePayload) -> Self {
        let ticker = match payload {
            SubscribePayload::Bare(s) => s,
            SubscribePayload::Wrapped { symbol } => symbol,
        };
        SubscribeCommand {
            ticker: ticker.to_ascii_uppercase(),
        }
    }
}

/// Frames the client ever receives over the WebSocket (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected { message: String, timestamp: String },
    TradeUpdate(Trade),
    BarUpdate(Bar),
}
