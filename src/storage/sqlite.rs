//! Sqlite-backed implementations of the storage contracts.
//!
//! Record identity is the primary key, so replaying a batch is a no-op
//! rewrite of the same rows, which is the idempotence the flush path
//! relies on.
//! Book sides are stored as JSON, matching their wire form.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::broker::BrokerConfig;
use crate::error::{MdsError, MdsResult};
use crate::models::{
    Candle, CandleFilter, InstrumentInfo, InstrumentSubscription, OrderBook, OrderBookFilter,
    PriceLevel, Ticker, TickerFilter, Timeframe,
};

use super::{MetadataStorage, TimeSeriesStorage};

const TIME_SERIES_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS tickers (
    broker_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    price REAL NOT NULL,
    volume REAL NOT NULL,
    market TEXT NOT NULL,
    instrument_type TEXT NOT NULL,
    change REAL,
    high_24h REAL,
    low_24h REAL,
    volume_24h REAL,
    prev_close_24h REAL,
    open_interest REAL,
    bid REAL,
    ask REAL,
    bid_size REAL,
    ask_size REAL,
    PRIMARY KEY (broker_id, symbol, ts_ms)
);

CREATE INDEX IF NOT EXISTS idx_tickers_symbol_ts ON tickers(symbol, ts_ms);

CREATE TABLE IF NOT EXISTS candles (
    broker_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    trades INTEGER NOT NULL DEFAULT 0,
    quote_volume REAL NOT NULL DEFAULT 0,
    open_interest REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (broker_id, symbol, timeframe, ts_ms)
);

CREATE INDEX IF NOT EXISTS idx_candles_symbol_ts ON candles(symbol, timeframe, ts_ms);

CREATE TABLE IF NOT EXISTS order_books (
    broker_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    market TEXT NOT NULL,
    instrument_type TEXT NOT NULL,
    bids_json TEXT NOT NULL,
    asks_json TEXT NOT NULL,
    PRIMARY KEY (broker_id, symbol, ts_ms)
);

CREATE INDEX IF NOT EXISTS idx_order_books_symbol_ts ON order_books(symbol, ts_ms);
"#;

const METADATA_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS instruments (
    symbol TEXT PRIMARY KEY,
    base_asset TEXT NOT NULL DEFAULT '',
    quote_asset TEXT NOT NULL DEFAULT '',
    instrument_type TEXT NOT NULL,
    market TEXT NOT NULL,
    price_precision INTEGER NOT NULL,
    quantity_precision INTEGER NOT NULL,
    min_price REAL NOT NULL DEFAULT 0,
    max_price REAL NOT NULL DEFAULT 0,
    min_quantity REAL NOT NULL DEFAULT 0,
    max_quantity REAL NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS subscriptions (
    id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    broker_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_subscriptions_broker ON subscriptions(broker_id, symbol);

CREATE TABLE IF NOT EXISTS broker_configs (
    id TEXT PRIMARY KEY,
    payload TEXT NOT NULL
) WITHOUT ROWID;
"#;

fn open_connection(db_path: &str, schema: &str) -> MdsResult<Connection> {
    let path = Path::new(db_path);
    if let Some(parent) = path.parent() {
        if !parent.exists() && !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(MdsError::store)?;
        }
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(db_path, flags).map_err(MdsError::store)?;
    conn.execute_batch(schema).map_err(MdsError::store)?;
    Ok(conn)
}

fn parse_market(s: &str) -> crate::models::MarketType {
    serde_json::from_str(&format!("\"{s}\"")).unwrap_or(crate::models::MarketType::Spot)
}

fn parse_instrument_type(s: &str) -> crate::models::InstrumentType {
    serde_json::from_str(&format!("\"{s}\"")).unwrap_or(crate::models::InstrumentType::Spot)
}

/// Builds `WHERE`/`LIMIT` for the filter shapes shared by the three record
/// families.
struct QueryParts {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl QueryParts {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            params: Vec::new(),
        }
    }

    fn in_clause(&mut self, column: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        let marks = vec!["?"; values.len()].join(", ");
        self.clauses.push(format!("{column} IN ({marks})"));
        for v in values {
            self.params.push(Box::new(v.clone()));
        }
    }

    fn time_range(&mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) {
        if let Some(start) = start {
            self.clauses.push("ts_ms >= ?".into());
            self.params.push(Box::new(start.timestamp_millis()));
        }
        if let Some(end) = end {
            self.clauses.push("ts_ms <= ?".into());
            self.params.push(Box::new(end.timestamp_millis()));
        }
    }

    fn sql(&self, table: &str, columns: &str, limit: Option<u32>, offset: Option<u32>) -> String {
        let mut sql = format!("SELECT {columns} FROM {table}");
        if !self.clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ts_ms ASC, broker_id ASC, symbol ASC");
        match (limit, offset) {
            (Some(l), Some(o)) => sql.push_str(&format!(" LIMIT {l} OFFSET {o}")),
            (Some(l), None) => sql.push_str(&format!(" LIMIT {l}")),
            (None, Some(o)) => sql.push_str(&format!(" LIMIT -1 OFFSET {o}")),
            (None, None) => {}
        }
        sql
    }
}

// =============================================================================
// Time-series store
// =============================================================================

pub struct SqliteTimeSeriesStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTimeSeriesStorage {
    pub fn open(db_path: &str) -> MdsResult<Self> {
        let conn = open_connection(db_path, TIME_SERIES_SCHEMA)?;
        info!(path = %db_path, "time-series storage opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests and throwaway runs.
    pub fn open_memory() -> MdsResult<Self> {
        let conn = Connection::open_in_memory().map_err(MdsError::store)?;
        conn.execute_batch(TIME_SERIES_SCHEMA)
            .map_err(MdsError::store)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn latest(&self, table: &str, broker_id: &str, symbol: &str) -> MdsResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let ms: Option<i64> = conn
            .query_row(
                &format!("SELECT MAX(ts_ms) FROM {table} WHERE broker_id = ?1 AND symbol = ?2"),
                params![broker_id, symbol],
                |row| row.get(0),
            )
            .map_err(MdsError::store)?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }
}

#[async_trait]
impl TimeSeriesStorage for SqliteTimeSeriesStorage {
    async fn save_tickers(&self, tickers: &[Ticker]) -> MdsResult<()> {
        if tickers.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])
            .map_err(MdsError::store)?;
        let result = (|| -> rusqlite::Result<()> {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT OR REPLACE INTO tickers (
                    broker_id, symbol, ts_ms, price, volume, market, instrument_type,
                    change, high_24h, low_24h, volume_24h, prev_close_24h,
                    open_interest, bid, ask, bid_size, ask_size
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                "#,
            )?;
            for t in tickers {
                stmt.execute(params![
                    t.broker_id,
                    t.symbol,
                    t.timestamp.timestamp_millis(),
                    t.price,
                    t.volume,
                    t.market.as_str(),
                    t.instrument_type.as_str(),
                    t.change,
                    t.high_24h,
                    t.low_24h,
                    t.volume_24h,
                    t.prev_close_24h,
                    t.open_interest,
                    t.bid,
                    t.ask,
                    t.bid_size,
                    t.ask_size,
                ])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => conn.execute("COMMIT", []).map_err(MdsError::store).map(|_| ()),
            Err(err) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(MdsError::store(err))
            }
        }
    }

    async fn save_candles(&self, candles: &[Candle]) -> MdsResult<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])
            .map_err(MdsError::store)?;
        let result = (|| -> rusqlite::Result<()> {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT OR REPLACE INTO candles (
                    broker_id, symbol, timeframe, ts_ms, open, high, low, close,
                    volume, trades, quote_volume, open_interest
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )?;
            for c in candles {
                stmt.execute(params![
                    c.broker_id,
                    c.symbol,
                    c.timeframe.as_str(),
                    c.timestamp.timestamp_millis(),
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume,
                    c.trades as i64,
                    c.quote_volume,
                    c.open_interest,
                ])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => conn.execute("COMMIT", []).map_err(MdsError::store).map(|_| ()),
            Err(err) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(MdsError::store(err))
            }
        }
    }

    async fn save_order_books(&self, books: &[OrderBook]) -> MdsResult<()> {
        if books.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])
            .map_err(MdsError::store)?;
        let result = (|| -> MdsResult<()> {
            let mut stmt = conn
                .prepare_cached(
                    r#"
                    INSERT OR REPLACE INTO order_books (
                        broker_id, symbol, ts_ms, market, instrument_type, bids_json, asks_json
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                )
                .map_err(MdsError::store)?;
            for b in books {
                let bids_json = serde_json::to_string(&b.bids).map_err(MdsError::store)?;
                let asks_json = serde_json::to_string(&b.asks).map_err(MdsError::store)?;
                stmt.execute(params![
                    b.broker_id,
                    b.symbol,
                    b.timestamp.timestamp_millis(),
                    b.market.as_str(),
                    b.instrument_type.as_str(),
                    bids_json,
                    asks_json,
                ])
                .map_err(MdsError::store)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => conn.execute("COMMIT", []).map_err(MdsError::store).map(|_| ()),
            Err(err) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(err)
            }
        }
    }

    async fn get_tickers(&self, filter: &TickerFilter) -> MdsResult<Vec<Ticker>> {
        let mut parts = QueryParts::new();
        parts.in_clause("symbol", &filter.symbols);
        parts.in_clause("broker_id", &filter.broker_ids);
        parts.time_range(filter.start, filter.end);
        let sql = parts.sql(
            "tickers",
            "broker_id, symbol, ts_ms, price, volume, market, instrument_type, \
             change, high_24h, low_24h, volume_24h, prev_close_24h, open_interest, \
             bid, ask, bid_size, ask_size",
            filter.limit,
            filter.offset,
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(MdsError::store)?;
        let rows = stmt
            .query_map(params_from_iter(parts.params.iter()), |row| {
                Ok(Ticker {
                    broker_id: row.get(0)?,
                    symbol: row.get(1)?,
                    timestamp: DateTime::from_timestamp_millis(row.get::<_, i64>(2)?)
                        .unwrap_or_default(),
                    price: row.get(3)?,
                    volume: row.get(4)?,
                    market: parse_market(&row.get::<_, String>(5)?),
                    instrument_type: parse_instrument_type(&row.get::<_, String>(6)?),
                    change: row.get(7)?,
                    high_24h: row.get(8)?,
                    low_24h: row.get(9)?,
                    volume_24h: row.get(10)?,
                    prev_close_24h: row.get(11)?,
                    open_interest: row.get(12)?,
                    bid: row.get(13)?,
                    ask: row.get(14)?,
                    bid_size: row.get(15)?,
                    ask_size: row.get(16)?,
                })
            })
            .map_err(MdsError::store)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(MdsError::store)?;
        Ok(rows)
    }

    async fn get_candles(&self, filter: &CandleFilter) -> MdsResult<Vec<Candle>> {
        let mut parts = QueryParts::new();
        parts.in_clause("symbol", &filter.symbols);
        parts.in_clause("broker_id", &filter.broker_ids);
        let timeframes: Vec<String> = filter
            .timeframes
            .iter()
            .map(|tf| tf.as_str().to_string())
            .collect();
        parts.in_clause("timeframe", &timeframes);
        parts.time_range(filter.start, filter.end);
        let sql = parts.sql(
            "candles",
            "broker_id, symbol, timeframe, ts_ms, open, high, low, close, volume, \
             trades, quote_volume, open_interest",
            filter.limit,
            filter.offset,
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(MdsError::store)?;
        let rows = stmt
            .query_map(params_from_iter(parts.params.iter()), |row| {
                let timeframe: String = row.get(2)?;
                Ok(Candle {
                    broker_id: row.get(0)?,
                    symbol: row.get(1)?,
                    timeframe: timeframe.parse::<Timeframe>().unwrap_or(Timeframe::M1),
                    timestamp: DateTime::from_timestamp_millis(row.get::<_, i64>(3)?)
                        .unwrap_or_default(),
                    open: row.get(4)?,
                    high: row.get(5)?,
                    low: row.get(6)?,
                    close: row.get(7)?,
                    volume: row.get(8)?,
                    trades: row.get::<_, i64>(9)? as u64,
                    quote_volume: row.get(10)?,
                    open_interest: row.get(11)?,
                })
            })
            .map_err(MdsError::store)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(MdsError::store)?;
        Ok(rows)
    }

    async fn get_order_books(&self, filter: &OrderBookFilter) -> MdsResult<Vec<OrderBook>> {
        let mut parts = QueryParts::new();
        parts.in_clause("symbol", &filter.symbols);
        parts.in_clause("broker_id", &filter.broker_ids);
        parts.time_range(filter.start, filter.end);
        let sql = parts.sql(
            "order_books",
            "broker_id, symbol, ts_ms, market, instrument_type, bids_json, asks_json",
            filter.limit,
            filter.offset,
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(MdsError::store)?;
        let rows = stmt
            .query_map(params_from_iter(parts.params.iter()), |row| {
                let bids_json: String = row.get(5)?;
                let asks_json: String = row.get(6)?;
                let bids: Vec<PriceLevel> = serde_json::from_str(&bids_json).unwrap_or_default();
                let asks: Vec<PriceLevel> = serde_json::from_str(&asks_json).unwrap_or_default();
                Ok(OrderBook {
                    broker_id: row.get(0)?,
                    symbol: row.get(1)?,
                    timestamp: DateTime::from_timestamp_millis(row.get::<_, i64>(2)?)
                        .unwrap_or_default(),
                    market: parse_market(&row.get::<_, String>(3)?),
                    instrument_type: parse_instrument_type(&row.get::<_, String>(4)?),
                    bids,
                    asks,
                })
            })
            .map_err(MdsError::store)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(MdsError::store)?;
        Ok(rows)
    }

    async fn latest_ticker_timestamp(
        &self,
        broker_id: &str,
        symbol: &str,
    ) -> MdsResult<Option<DateTime<Utc>>> {
        self.latest("tickers", broker_id, symbol)
    }

    async fn latest_candle_timestamp(
        &self,
        broker_id: &str,
        symbol: &str,
    ) -> MdsResult<Option<DateTime<Utc>>> {
        self.latest("candles", broker_id, symbol)
    }

    async fn latest_order_book_timestamp(
        &self,
        broker_id: &str,
        symbol: &str,
    ) -> MdsResult<Option<DateTime<Utc>>> {
        self.latest("order_books", broker_id, symbol)
    }

    async fn health(&self) -> MdsResult<()> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(MdsError::store)
    }
}

// =============================================================================
// Metadata store
// =============================================================================

pub struct SqliteMetadataStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStorage {
    pub fn open(db_path: &str) -> MdsResult<Self> {
        let conn = open_connection(db_path, METADATA_SCHEMA)?;
        info!(path = %db_path, "metadata storage opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_memory() -> MdsResult<Self> {
        let conn = Connection::open_in_memory().map_err(MdsError::store)?;
        conn.execute_batch(METADATA_SCHEMA).map_err(MdsError::store)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl MetadataStorage for SqliteMetadataStorage {
    async fn save_instrument(&self, info: &InstrumentInfo) -> MdsResult<()> {
        self.conn
            .lock()
            .execute(
                r#"
                INSERT OR REPLACE INTO instruments (
                    symbol, base_asset, quote_asset, instrument_type, market,
                    price_precision, quantity_precision, min_price, max_price,
                    min_quantity, max_quantity, is_active
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    info.symbol,
                    info.base_asset,
                    info.quote_asset,
                    info.instrument_type.as_str(),
                    info.market.as_str(),
                    info.price_precision,
                    info.quantity_precision,
                    info.min_price,
                    info.max_price,
                    info.min_quantity,
                    info.max_quantity,
                    info.is_active,
                ],
            )
            .map_err(MdsError::store)?;
        Ok(())
    }

    async fn get_instrument(&self, symbol: &str) -> MdsResult<Option<InstrumentInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, base_asset, quote_asset, instrument_type, market, \
                 price_precision, quantity_precision, min_price, max_price, \
                 min_quantity, max_quantity, is_active FROM instruments WHERE symbol = ?1",
            )
            .map_err(MdsError::store)?;
        let mut rows = stmt
            .query_map(params![symbol], map_instrument_row)
            .map_err(MdsError::store)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(MdsError::store)?)),
            None => Ok(None),
        }
    }

    async fn list_instruments(&self) -> MdsResult<Vec<InstrumentInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, base_asset, quote_asset, instrument_type, market, \
                 price_precision, quantity_precision, min_price, max_price, \
                 min_quantity, max_quantity, is_active FROM instruments ORDER BY symbol",
            )
            .map_err(MdsError::store)?;
        let rows = stmt
            .query_map([], map_instrument_row)
            .map_err(MdsError::store)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(MdsError::store)?;
        Ok(rows)
    }

    async fn delete_instrument(&self, symbol: &str) -> MdsResult<()> {
        let affected = self
            .conn
            .lock()
            .execute("DELETE FROM instruments WHERE symbol = ?1", params![symbol])
            .map_err(MdsError::store)?;
        if affected == 0 {
            return Err(MdsError::not_found(format!("instrument {symbol}")));
        }
        Ok(())
    }

    async fn save_subscription(&self, sub: &InstrumentSubscription) -> MdsResult<()> {
        let payload = serde_json::to_string(sub).map_err(MdsError::store)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO subscriptions (id, payload, broker_id, symbol, is_active) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![sub.id, payload, sub.broker_id, sub.symbol, sub.is_active],
            )
            .map_err(MdsError::store)?;
        Ok(())
    }

    async fn get_subscription(&self, id: &str) -> MdsResult<Option<InstrumentSubscription>> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM subscriptions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(MdsError::store(other)),
            })?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(MdsError::store)?)),
            None => Ok(None),
        }
    }

    async fn list_subscriptions(&self) -> MdsResult<Vec<InstrumentSubscription>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT payload FROM subscriptions ORDER BY id")
            .map_err(MdsError::store)?;
        let raws = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(MdsError::store)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(MdsError::store)?;
        raws.iter()
            .map(|raw| serde_json::from_str(raw).map_err(MdsError::store))
            .collect()
    }

    async fn update_subscription(&self, sub: &InstrumentSubscription) -> MdsResult<()> {
        let payload = serde_json::to_string(sub).map_err(MdsError::store)?;
        let affected = self
            .conn
            .lock()
            .execute(
                "UPDATE subscriptions SET payload = ?2, broker_id = ?3, symbol = ?4, is_active = ?5 \
                 WHERE id = ?1",
                params![sub.id, payload, sub.broker_id, sub.symbol, sub.is_active],
            )
            .map_err(MdsError::store)?;
        if affected == 0 {
            return Err(MdsError::not_found(format!("subscription {}", sub.id)));
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: &str) -> MdsResult<()> {
        let affected = self
            .conn
            .lock()
            .execute("DELETE FROM subscriptions WHERE id = ?1", params![id])
            .map_err(MdsError::store)?;
        if affected == 0 {
            return Err(MdsError::not_found(format!("subscription {id}")));
        }
        Ok(())
    }

    async fn save_broker_config(&self, config: &BrokerConfig) -> MdsResult<()> {
        let payload = serde_json::to_string(config).map_err(MdsError::store)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO broker_configs (id, payload) VALUES (?1, ?2)",
                params![config.id, payload],
            )
            .map_err(MdsError::store)?;
        Ok(())
    }

    async fn get_broker_config(&self, id: &str) -> MdsResult<Option<BrokerConfig>> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM broker_configs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(MdsError::store(other)),
            })?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(MdsError::store)?)),
            None => Ok(None),
        }
    }

    async fn list_broker_configs(&self) -> MdsResult<Vec<BrokerConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT payload FROM broker_configs ORDER BY id")
            .map_err(MdsError::store)?;
        let raws = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(MdsError::store)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(MdsError::store)?;
        raws.iter()
            .map(|raw| serde_json::from_str(raw).map_err(MdsError::store))
            .collect()
    }

    async fn delete_broker_config(&self, id: &str) -> MdsResult<()> {
        let affected = self
            .conn
            .lock()
            .execute("DELETE FROM broker_configs WHERE id = ?1", params![id])
            .map_err(MdsError::store)?;
        if affected == 0 {
            return Err(MdsError::not_found(format!("broker config {id}")));
        }
        Ok(())
    }

    async fn health(&self) -> MdsResult<()> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(MdsError::store)
    }
}

fn map_instrument_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstrumentInfo> {
    Ok(InstrumentInfo {
        symbol: row.get(0)?,
        base_asset: row.get(1)?,
        quote_asset: row.get(2)?,
        instrument_type: parse_instrument_type(&row.get::<_, String>(3)?),
        market: parse_market(&row.get::<_, String>(4)?),
        price_precision: row.get(5)?,
        quantity_precision: row.get(6)?,
        min_price: row.get(7)?,
        max_price: row.get(8)?,
        min_quantity: row.get(9)?,
        max_quantity: row.get(10)?,
        is_active: row.get(11)?,
    })
}
