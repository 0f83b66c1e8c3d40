//! Runtime configuration, read once at startup from the environment.
//!
//! Mirrors the recognized options of §6: every variable is read through
//! `env::var` with an explicit default, `.env` is loaded first (best effort)
//! so local development doesn't need real shell exports.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_ws_url: String,
    pub upstream_key: Option<String>,
    pub upstream_secret: Option<String>,
    pub subscribed_symbols: Vec<String>,

    /// Recognized for forward-compatibility with a networked bus deployment;
    /// the reference implementation backs the bus in-process (see DESIGN.md).
    pub bus_brokers: Vec<String>,
    pub log_host: Option<String>,
    pub log_port: Option<u16>,
    pub log_url: Option<String>,

    pub db_path: String,

    pub batch_size: usize,
    pub flush_interval: Duration,

    pub mock_realtime: bool,
    pub cors_origins: Vec<String>,
    pub broadcast_global: bool,
    pub gateway_bind_addr: String,
    pub upstream_rest_base_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        load_dotenv();

        Self {
            upstream_ws_url: env::var("UPSTREAM_WS_URL")
                .unwrap_or_else(|_| "wss://market-feed.example.com/stream".to_string()),
            upstream_key: env::var("UPSTREAM_KEY").ok(),
            upstream_secret: env::var("UPSTREAM_SECRET").ok(),
            subscribed_symbols: csv_env("SUBSCRIBED_SYMBOLS")
                .into_iter()
                .map(|s| s.to_ascii_uppercase())
                .collect(),

            bus_brokers: csv_env("BUS_BROKERS"),
            log_host: env::var("LOG_HOST").ok(),
            log_port: env::var("LOG_PORT").ok().and_then(|v| v.parse().ok()),
            log_url: env::var("LOG_URL").ok(),

            db_path: env::var("DATABASE_URL")
                .or_else(|_| env::var("DB_PATH"))
                .unwrap_or_else(|_| "market_data.db".to_string()),

            batch_size: env_usize("BATCH_SIZE", 100),
            flush_interval: Duration::from_millis(env_u64("FLUSH_INTERVAL_MS", 1000)),

            mock_realtime: env_bool("MOCK_REALTIME", false),
            cors_origins: csv_env("CORS_ORIGINS"),
            broadcast_global: env_bool("BROADCAST_GLOBAL", false),
            gateway_bind_addr: env::var("GATEWAY_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            upstream_rest_base_url: env::var("UPSTREAM_REST_BASE_URL").ok(),
        }
    }
}

fn load_dotenv() {
    let _ = dotenv::dotenv();
}

fn csv_env(key: &str) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_env_trims_and_drops_blanks() {
        std::env::set_var("TEST_CSV_ENV", " AAPL, MSFT ,,TSLA");
        assert_eq!(csv_env("TEST_CSV_ENV"), vec!["AAPL", "MSFT", "TSLA"]);
        std::env::remove_var("TEST_CSV_ENV");
    }

    #[test]
    fn env_bool_defaults_when_unset() {
        std::env::remove_var("TEST_BOOL_ENV");
        assert!(!env_bool("TEST_BOOL_ENV", false));
        assert!(env_bool("TEST_BOOL_ENV", true));
    }
}
