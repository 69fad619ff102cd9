//! Market data primitives: tickers, candles, order book snapshots.
//!
//! All three record types are immutable once produced by an adapter; the
//! only field stamped downstream is `broker_id` (by the broker-storage
//! integration layer). JSON field names are part of the wire contract.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum number of price levels accepted per order book side.
pub const MAX_BOOK_DEPTH: usize = 1000;

/// Market segment a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
    Stock,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Futures => "futures",
            MarketType::Stock => "stock",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instrument classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentType {
    Spot,
    Futures,
    Stock,
    Etf,
    Bond,
}

impl InstrumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Spot => "spot",
            InstrumentType::Futures => "futures",
            InstrumentType::Stock => "stock",
            InstrumentType::Etf => "etf",
            InstrumentType::Bond => "bond",
        }
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle aggregation timeframe. The code set is closed; `1m` and `1M`
/// differ only by case, so codes are matched case-sensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "5s")]
    S5,
    #[serde(rename = "15s")]
    S15,
    #[serde(rename = "30s")]
    S30,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mon1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 19] = [
        Timeframe::S1,
        Timeframe::S5,
        Timeframe::S15,
        Timeframe::S30,
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::D3,
        Timeframe::W1,
        Timeframe::Mon1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::S1 => "1s",
            Timeframe::S5 => "5s",
            Timeframe::S15 => "15s",
            Timeframe::S30 => "30s",
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::D3 => "3d",
            Timeframe::W1 => "1w",
            Timeframe::Mon1 => "1M",
        }
    }

    /// Nominal bar duration. Months use 30 days.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::S1 => Duration::seconds(1),
            Timeframe::S5 => Duration::seconds(5),
            Timeframe::S15 => Duration::seconds(15),
            Timeframe::S30 => Duration::seconds(30),
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M3 => Duration::minutes(3),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H2 => Duration::hours(2),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::H6 => Duration::hours(6),
            Timeframe::H8 => Duration::hours(8),
            Timeframe::H12 => Duration::hours(12),
            Timeframe::D1 => Duration::days(1),
            Timeframe::D3 => Duration::days(3),
            Timeframe::W1 => Duration::weeks(1),
            Timeframe::Mon1 => Duration::days(30),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .find(|tf| tf.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown timeframe code: {s}"))
    }
}

/// Latest trade-price snapshot for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub market: MarketType,
    #[serde(rename = "type")]
    pub instrument_type: InstrumentType,
    pub timestamp: DateTime<Utc>,
    /// Stamped by the integration layer; adapters may leave it empty.
    #[serde(default)]
    pub broker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_close_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_size: Option<f64>,
}

impl Ticker {
    /// Minimal valid ticker; optional fields unset.
    pub fn new(
        symbol: impl Into<String>,
        price: f64,
        volume: f64,
        market: MarketType,
        instrument_type: InstrumentType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            market,
            instrument_type,
            timestamp,
            broker_id: String::new(),
            change: None,
            high_24h: None,
            low_24h: None,
            volume_24h: None,
            prev_close_24h: None,
            open_interest: None,
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
        }
    }

    /// Duplicate-detection identity: (broker_id, symbol, timestamp).
    pub fn identity(&self) -> (String, String, i64) {
        (
            self.broker_id.clone(),
            self.symbol.clone(),
            self.timestamp.timestamp_millis(),
        )
    }
}

/// OHLCV bar aggregated over a fixed timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub broker_id: String,
    #[serde(default)]
    pub trades: u64,
    #[serde(default)]
    pub quote_volume: f64,
    #[serde(default)]
    pub open_interest: f64,
}

impl Candle {
    /// Duplicate-detection identity: (broker_id, symbol, timeframe, timestamp).
    pub fn identity(&self) -> (String, String, Timeframe, i64) {
        (
            self.broker_id.clone(),
            self.symbol.clone(),
            self.timeframe,
            self.timestamp.timestamp_millis(),
        )
    }
}

/// Single resting price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

impl PriceLevel {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }
}

/// Snapshot of resting bids and asks at a point in time.
///
/// Bids are ordered descending by price, asks ascending, so index 0 is the
/// best level on each side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub market: MarketType,
    #[serde(rename = "type")]
    pub instrument_type: InstrumentType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub broker_id: String,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Best bid at or above best ask. Crossed snapshots are rejected by the
    /// validator; the helper exists so callers can check before handing off.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b.price >= a.price,
            _ => false,
        }
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }
}
