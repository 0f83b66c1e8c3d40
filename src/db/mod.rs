//! Relational store (§3, §6): append-only `trades`/`bars` fact tables plus a
//! `symbols` lookup table. Idempotency is enforced entirely by unique
//! constraints — no explicit locking beyond SQLite's single-writer model
//! (§5).

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS symbols (
    symbol_id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL UNIQUE,
    name TEXT,
    exchange TEXT
);

CREATE TABLE IF NOT EXISTS trades (
    trade_id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol_id INTEGER NOT NULL REFERENCES symbols(symbol_id),
    ts INTEGER NOT NULL,
    price REAL NOT NULL,
    size REAL NOT NULL,
    volume REAL NOT NULL,
    UNIQUE(symbol_id, ts, price, size)
);

CREATE INDEX IF NOT EXISTS idx_trades_symbol_ts ON trades(symbol_id, ts DESC);

CREATE TABLE IF NOT EXISTS bars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol_id INTEGER NOT NULL REFERENCES symbols(symbol_id),
    timeframe TEXT NOT NULL,
    ts INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    trade_count INTEGER NOT NULL,
    vwap REAL NOT NULL,
    UNIQUE(symbol_id, ts, timeframe)
);

CREATE INDEX IF NOT EXISTS idx_bars_symbol_ts ON bars(symbol_id, ts DESC);
"#;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize market schema")?;

        info!(path = %db_path, "relational store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database with the schema applied; used by tests
    /// that don't need a file on disk.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get-or-insert protocol of §3: one row per ticker, created lazily.
    pub fn get_or_insert_symbol(&self, ticker: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO symbols (ticker) VALUES (?1) ON CONFLICT(ticker) DO NOTHING",
            params![ticker],
        )?;
        let id: i64 = conn.query_row(
            "SELECT symbol_id FROM symbols WHERE ticker = ?1",
            params![ticker],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Running volume most recently persisted for `symbol_id`, used to
    /// re-seed the in-memory cache on crash-recovery (§4.2).
    pub fn last_volume(&self, symbol_id: i64) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT volume FROM trades WHERE symbol_id = ?1 ORDER BY ts DESC LIMIT 1",
            params![symbol_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    /// Runs `f` inside a single transaction; rolls back on error.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        match f(&conn) {
            Ok(value) => {
                conn.execute("COMMIT", [])?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Inserts a trade under the idempotency clause of §3. Returns `true` if
    /// a new row was written, `false` if the `(symbol_id, ts, price, size)`
    /// key already existed (duplicate suppressed, treated as success per
    /// §7).
    pub fn insert_trade(
        conn: &Connection,
        symbol_id: i64,
        ts: i64,
        price: f64,
        size: f64,
        volume: f64,
    ) -> Result<bool> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO trades (symbol_id, ts, price, size, volume)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![symbol_id, ts, price, size, volume],
        )?;
        Ok(changed > 0)
    }

    /// Inserts a bar under the idempotency clause of §3. Caller is
    /// responsible for validating the OHLC invariant first (§4.2).
    pub fn insert_bar(
        conn: &Connection,
        symbol_id: i64,
        timeframe: &str,
        ts: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        trade_count: i64,
        vwap: f64,
    ) -> Result<bool> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO bars
             (symbol_id, timeframe, ts, open, high, low, close, volume, trade_count, vwap)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![symbol_id, timeframe, ts, open, high, low, close, volume, trade_count, vwap],
        )?;
        Ok(changed > 0)
    }

    pub fn count_trades(&self, symbol_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE symbol_id = ?1",
            params![symbol_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_insert_symbol_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let a = store.get_or_insert_symbol("AAPL").unwrap();
        let b = store.get_or_insert_symbol("AAPL").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_trade_key_is_suppressed() {
        let store = Store::open_in_memory().unwrap();
        let symbol_id = store.get_or_insert_symbol("AAPL").unwrap();

        let inserted = store
            .transaction(|conn| Store::insert_trade(conn, symbol_id, 1000, 150.25, 100.0, 100.0))
            .unwrap();
        assert!(inserted);

        let inserted_again = store
            .transaction(|conn| Store::insert_trade(conn, symbol_id, 1000, 150.25, 100.0, 100.0))
            .unwrap();
        assert!(!inserted_again);

        assert_eq!(store.count_trades(symbol_id).unwrap(), 1);
    }

    #[test]
    fn last_volume_reseeds_from_max_timestamp_row() {
        let store = Store::open_in_memory().unwrap();
        let symbol_id = store.get_or_insert_symbol("AAPL").unwrap();
        assert_eq!(store.last_volume(symbol_id).unwrap(), None);

        store
            .transaction(|conn| Store::insert_trade(conn, symbol_id, 1000, 150.0, 10.0, 10.0))
            .unwrap();
        store
            .transaction(|conn| Store::insert_trade(conn, symbol_id, 2000, 151.0, 5.0, 15.0))
            .unwrap();

        assert_eq!(store.last_volume(symbol_id).unwrap(), Some(15.0));
    }
}
