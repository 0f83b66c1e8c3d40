//! WebSocket Gateway (§4.4): accepts client connections, manages per-symbol
//! subscription rooms, and exposes a thin HTTP proxy over the upstream REST
//! API.

pub mod http;
pub mod mock;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::health::HealthState;
use crate::models::{ServerFrame, SubscribeCommand, SubscribePayload};
#[cfg(test)]
use crate::models::Trade;

/// Bounded per-connection outbound queue (§4.4); a slow client backs up this
/// queue and is disconnected rather than allowed to stall the broadcaster.
const OUTBOUND_QUEUE_SIZE: usize = 1024;

type ConnId = u64;

struct GatewayInner {
    connections: Mutex<HashMap<ConnId, mpsc::Sender<String>>>,
    rooms: Mutex<HashMap<String, HashSet<ConnId>>>,
    next_id: AtomicU64,
}

/// Cheap to clone (wraps an `Arc`); shared by every websocket task, the
/// fan-out bridge, and the mock emitter.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(_cors_origins: Vec<String>) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                connections: Mutex::new(HashMap::new()),
                rooms: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn register(&self) -> (ConnId, mpsc::Receiver<String>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        self.inner.connections.lock().insert(id, tx);
        (id, rx)
    }

    fn unregister(&self, id: ConnId) {
        self.inner.connections.lock().remove(&id);
        let mut rooms = self.inner.rooms.lock();
        rooms.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
    }

    /// No-op if already subscribed (§4.4).
    fn subscribe(&self, id: ConnId, ticker: &str) {
        self.inner
            .rooms
            .lock()
            .entry(room_name(ticker))
            .or_default()
            .insert(id);
    }

    /// No-op if not subscribed (§4.4).
    fn unsubscribe(&self, id: ConnId, ticker: &str) {
        if let Some(members) = self.inner.rooms.lock().get_mut(&room_name(ticker)) {
            members.remove(&id);
        }
    }

    fn send_to(&self, id: ConnId, frame: &str) {
        let sender = self.inner.connections.lock().get(&id).cloned();
        let Some(sender) = sender else { return };
        if sender.try_send(frame.to_string()).is_err() {
            warn!(conn_id = id, "outbound queue overflow, dropping connection");
            self.unregister(id);
        }
    }

    /// Broadcasts to every room subscriber for `ticker` (§4.3/§4.4).
    pub fn broadcast_to_symbol(&self, ticker: &str, frame: &ServerFrame) {
        let members: Vec<ConnId> = self
            .inner
            .rooms
            .lock()
            .get(&room_name(ticker))
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        if members.is_empty() {
            return;
        }
        let Ok(payload) = serde_json::to_string(frame) else {
            warn!("failed to serialize outbound frame");
            return;
        };
        for id in members {
            self.send_to(id, &payload);
        }
    }

    /// Broadcasts to every connected client, gated by `BROADCAST_GLOBAL`.
    pub fn broadcast(&self, frame: &ServerFrame) {
        let ids: Vec<ConnId> = self.inner.connections.lock().keys().copied().collect();
        let Ok(payload) = serde_json::to_string(frame) else {
            warn!("failed to serialize outbound frame");
            return;
        };
        for id in ids {
            self.send_to(id, &payload);
        }
    }

    /// Registers a fake connection pre-subscribed to `ticker`'s room,
    /// bypassing the WebSocket transport. Used by tests to observe broadcast
    /// traffic without driving a real socket.
    pub fn subscribe_room(&self, ticker: &str) -> mpsc::Receiver<String> {
        let (id, rx) = self.register();
        self.subscribe(id, ticker);
        rx
    }
}

fn room_name(ticker: &str) -> String {
    format!("symbol:{}", ticker.to_ascii_uppercase())
}

#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Gateway,
    pub http_client: reqwest::Client,
    pub upstream_rest_base_url: Option<String>,
    pub health: HealthState,
}

/// Builds the full axum router: websocket endpoint, health check, and the
/// REST proxy of `http.rs`, wrapped in CORS/tracing layers per the teacher's
/// convention.
pub fn router(config: &Config, gateway: Gateway, health: HealthState) -> Router {
    let state = GatewayState {
        gateway,
        http_client: reqwest::Client::new(),
        upstream_rest_base_url: config.upstream_rest_base_url.clone(),
        health,
    };

    let cors = if config.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .merge(http::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reports the Stream Processor's health-degraded signal (§4.2) so an
/// operator can observe repeated flush failures without tailing logs.
async fn health_check(State(state): State<GatewayState>) -> impl IntoResponse {
    let status = if state.health.is_degraded() { "degraded" } else { "ok" };
    axum::Json(serde_json::json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Gateway) {
    let (mut sink, mut stream) = socket.split();
    let (id, mut outbound) = gateway.register();
    info!(conn_id = id, "client connected");

    let connected_frame = ServerFrame::Connected {
        message: "connected".to_string(),
        timestamp: Utc::now().to_rfc3339(),
    };
    let connected = match serde_json::to_string(&connected_frame) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn_id = id, error = %e, "failed to serialize connected frame");
            gateway.unregister(id);
            return;
        }
    };
    if sink.send(Message::Text(connected)).await.is_err() {
        gateway.unregister(id);
        return;
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let gateway_for_recv = gateway.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => handle_client_command(&gateway_for_recv, id, &text),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.unregister(id);
    info!(conn_id = id, "client disconnected");
}

#[derive(serde::Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientCommand {
    Subscribe { symbol: SubscribePayload },
    Unsubscribe { symbol: SubscribePayload },
}

fn handle_client_command(gateway: &Gateway, id: ConnId, text: &str) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "dropping unrecognized client command");
            return;
        }
    };
    match command {
        ClientCommand::Subscribe { symbol } => {
            let cmd: SubscribeCommand = symbol.into();
            gateway.subscribe(id, &cmd.ticker);
        }
        ClientCommand::Unsubscribe { symbol } => {
            let cmd: SubscribeCommand = symbol.into();
            gateway.unsubscribe(id, &cmd.ticker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_to_symbol_only_reaches_room_subscribers() {
        let gateway = Gateway::new(Vec::new());
        let mut aapl_room = gateway.subscribe_room("AAPL");
        let mut msft_room = gateway.subscribe_room("MSFT");

        let frame = ServerFrame::TradeUpdate(Trade::new("AAPL".into(), 150.0, 10.0, 1000, 10.0));
        gateway.broadcast_to_symbol("AAPL", &frame);

        assert!(aapl_room.try_recv().is_ok());
        assert!(msft_room.try_recv().is_err());
    }

    #[test]
    fn duplicate_subscribe_is_a_no_op() {
        let gateway = Gateway::new(Vec::new());
        let (id, _rx) = gateway.register();
        gateway.subscribe(id, "AAPL");
        gateway.subscribe(id, "AAPL");
        assert_eq!(gateway.inner.rooms.lock().get(&room_name("AAPL")).unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_without_prior_subscribe_is_a_no_op() {
        let gateway = Gateway::new(Vec::new());
        let (id, _rx) = gateway.register();
        gateway.unsubscribe(id, "AAPL");
        assert!(gateway.inner.rooms.lock().get(&room_name("AAPL")).is_none());
    }

    #[test]
    fn global_broadcast_reaches_all_connections_regardless_of_room() {
        let gateway = Gateway::new(Vec::new());
        let (_id1, mut rx1) = gateway.register();
        let (_id2, mut rx2) = gateway.register();

        let frame = ServerFrame::TradeUpdate(Trade::new("AAPL".into(), 150.0, 10.0, 1000, 10.0));
        gateway.broadcast(&frame);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
