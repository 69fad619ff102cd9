//! Record validation: structural checks plus stateful anomaly and
//! duplicate tracking.
//!
//! Structural checks are stateless per call. Anomaly detection compares
//! against the last accepted price per (broker, symbol); duplicate
//! detection remembers record identities until `clear_tracking`. Both are
//! switchable at runtime, so the live config sits behind an `ArcSwap` and
//! every validation takes a consistent snapshot of it.

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ValidationError;
use crate::models::{
    Candle, InstrumentInfo, InstrumentSubscription, InstrumentType, OrderBook, Ticker, Timeframe,
    MAX_BOOK_DEPTH, MAX_PRECISION,
};

#[cfg(test)]
mod validator_tests;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub anomaly_detection: bool,
    pub duplicate_detection: bool,
    /// Max allowed move from the last accepted price, in percent.
    pub max_price_deviation: f64,
    /// Max allowed volume/prev_volume ratio; 0 disables the check.
    pub max_volume_spike: f64,
    /// Reject timestamps further than this in the future.
    pub max_future_skew_secs: i64,
    /// Reject timestamps older than this.
    pub max_age_days: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            anomaly_detection: true,
            duplicate_detection: true,
            max_price_deviation: 50.0,
            max_volume_spike: 10.0,
            max_future_skew_secs: 300,
            max_age_days: 365,
        }
    }
}

#[derive(Debug, Default)]
pub struct ValidatorStats {
    pub validated: AtomicU64,
    pub rejected: AtomicU64,
    pub anomalies: AtomicU64,
    pub duplicates: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorStatsSnapshot {
    pub validated: u64,
    pub rejected: u64,
    pub anomalies: u64,
    pub duplicates: u64,
}

type PairKey = (String, String);
type CandleKey = (String, String, Timeframe);

pub struct Validator {
    config: ArcSwap<ValidatorConfig>,
    last_prices: Mutex<HashMap<PairKey, f64>>,
    last_volumes: Mutex<HashMap<PairKey, f64>>,
    last_closes: Mutex<HashMap<CandleKey, f64>>,
    seen_tickers: Mutex<HashSet<(String, String, i64)>>,
    seen_candles: Mutex<HashSet<(String, String, Timeframe, i64)>>,
    seen_books: Mutex<HashSet<(String, String, i64)>>,
    stats: ValidatorStats,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            last_prices: Mutex::new(HashMap::new()),
            last_volumes: Mutex::new(HashMap::new()),
            last_closes: Mutex::new(HashMap::new()),
            seen_tickers: Mutex::new(HashSet::new()),
            seen_candles: Mutex::new(HashSet::new()),
            seen_books: Mutex::new(HashSet::new()),
            stats: ValidatorStats::default(),
        }
    }

    pub fn config(&self) -> Arc<ValidatorConfig> {
        self.config.load_full()
    }

    /// Swap the live configuration. Takes effect for the next validation.
    pub fn set_config(&self, config: ValidatorConfig) {
        self.config.store(Arc::new(config));
    }

    /// Drop all anomaly and duplicate state.
    pub fn clear_tracking(&self) {
        self.last_prices.lock().clear();
        self.last_volumes.lock().clear();
        self.last_closes.lock().clear();
        self.seen_tickers.lock().clear();
        self.seen_candles.lock().clear();
        self.seen_books.lock().clear();
    }

    pub fn stats(&self) -> ValidatorStatsSnapshot {
        ValidatorStatsSnapshot {
            validated: self.stats.validated.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            anomalies: self.stats.anomalies.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
        }
    }

    pub fn validate_ticker(&self, t: &Ticker) -> Result<(), ValidationError> {
        let cfg = self.config.load();
        let result = self.check_ticker(t, &cfg);
        self.record_outcome(&result);
        result
    }

    pub fn validate_candle(&self, c: &Candle) -> Result<(), ValidationError> {
        let cfg = self.config.load();
        let result = self.check_candle(c, &cfg);
        self.record_outcome(&result);
        result
    }

    pub fn validate_order_book(&self, book: &OrderBook) -> Result<(), ValidationError> {
        let cfg = self.config.load();
        let result = self.check_order_book(book, &cfg);
        self.record_outcome(&result);
        result
    }

    pub fn validate_instrument(&self, info: &InstrumentInfo) -> Result<(), ValidationError> {
        let result = check_instrument(info);
        self.record_outcome(&result);
        result
    }

    pub fn validate_subscription(
        &self,
        sub: &InstrumentSubscription,
    ) -> Result<(), ValidationError> {
        let result = check_subscription(sub);
        self.record_outcome(&result);
        result
    }

    fn record_outcome(&self, result: &Result<(), ValidationError>) {
        match result {
            Ok(()) => {
                self.stats.validated.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                match err {
                    ValidationError::Anomaly { .. } | ValidationError::VolumeSpike { .. } => {
                        self.stats.anomalies.fetch_add(1, Ordering::Relaxed);
                    }
                    ValidationError::Duplicate { .. } => {
                        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }
    }

    fn check_ticker(&self, t: &Ticker, cfg: &ValidatorConfig) -> Result<(), ValidationError> {
        if t.symbol.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        require_positive("price", t.price)?;
        require_non_negative("volume", t.volume)?;
        for (field, value) in [
            ("volume_24h", t.volume_24h),
            ("open_interest", t.open_interest),
        ] {
            if let Some(v) = value {
                require_non_negative(field, v)?;
            }
        }
        if t.instrument_type == InstrumentType::Stock {
            if let (Some(bid), Some(ask)) = (t.bid, t.ask) {
                if bid >= ask {
                    return Err(ValidationError::BidAskInverted { bid, ask });
                }
            }
        }
        if let (Some(high), Some(low)) = (t.high_24h, t.low_24h) {
            if high > 0.0 && low > 0.0 && (t.price < low || t.price > high) {
                return Err(ValidationError::OutsideDailyRange {
                    price: t.price,
                    low,
                    high,
                });
            }
        }
        check_timestamp(t.timestamp, cfg)?;

        let pair = (t.broker_id.clone(), t.symbol.clone());

        if cfg.anomaly_detection {
            if let Some(&prev) = self.last_prices.lock().get(&pair) {
                let deviation_pct = ((t.price - prev).abs() / prev) * 100.0;
                if deviation_pct > cfg.max_price_deviation {
                    return Err(ValidationError::Anomaly {
                        prev,
                        current: t.price,
                        deviation_pct,
                        max_pct: cfg.max_price_deviation,
                    });
                }
            }
            if cfg.max_volume_spike > 0.0 {
                if let Some(&prev) = self.last_volumes.lock().get(&pair) {
                    if prev > 0.0 && t.volume > prev * cfg.max_volume_spike {
                        return Err(ValidationError::VolumeSpike {
                            prev,
                            current: t.volume,
                            max_ratio: cfg.max_volume_spike,
                        });
                    }
                }
            }
        }

        if cfg.duplicate_detection {
            let identity = t.identity();
            if !self.seen_tickers.lock().insert(identity) {
                return Err(ValidationError::Duplicate {
                    key: format!("{}/{}@{}", t.broker_id, t.symbol, t.timestamp),
                });
            }
        }

        // Tracking state only advances for accepted records.
        self.last_prices.lock().insert(pair.clone(), t.price);
        self.last_volumes.lock().insert(pair, t.volume);
        Ok(())
    }

    fn check_candle(&self, c: &Candle, cfg: &ValidatorConfig) -> Result<(), ValidationError> {
        if c.symbol.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        require_positive("open", c.open)?;
        require_positive("high", c.high)?;
        require_positive("low", c.low)?;
        require_positive("close", c.close)?;
        require_non_negative("volume", c.volume)?;
        require_non_negative("quote_volume", c.quote_volume)?;
        require_non_negative("open_interest", c.open_interest)?;

        let body_low = c.open.min(c.close);
        let body_high = c.open.max(c.close);
        if c.low > body_low || body_high > c.high {
            return Err(ValidationError::OhlcOutOfOrder {
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
            });
        }
        check_timestamp(c.timestamp, cfg)?;

        if cfg.anomaly_detection {
            let key = (c.broker_id.clone(), c.symbol.clone(), c.timeframe);
            if let Some(&prev) = self.last_closes.lock().get(&key) {
                let deviation_pct = ((c.close - prev).abs() / prev) * 100.0;
                if deviation_pct > cfg.max_price_deviation {
                    return Err(ValidationError::Anomaly {
                        prev,
                        current: c.close,
                        deviation_pct,
                        max_pct: cfg.max_price_deviation,
                    });
                }
            }
        }

        if cfg.duplicate_detection {
            let identity = c.identity();
            if !self.seen_candles.lock().insert(identity) {
                return Err(ValidationError::Duplicate {
                    key: format!(
                        "{}/{}/{}@{}",
                        c.broker_id, c.symbol, c.timeframe, c.timestamp
                    ),
                });
            }
        }

        self.last_closes
            .lock()
            .insert((c.broker_id.clone(), c.symbol.clone(), c.timeframe), c.close);
        Ok(())
    }

    fn check_order_book(
        &self,
        book: &OrderBook,
        cfg: &ValidatorConfig,
    ) -> Result<(), ValidationError> {
        if book.symbol.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        for (side, levels) in [("bid", &book.bids), ("ask", &book.asks)] {
            if levels.len() > MAX_BOOK_DEPTH {
                return Err(ValidationError::TooManyLevels {
                    side,
                    count: levels.len(),
                    max: MAX_BOOK_DEPTH,
                });
            }
            for level in levels.iter() {
                require_positive("level price", level.price)?;
                require_positive("level quantity", level.quantity)?;
            }
        }
        if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
            if bid.price >= ask.price {
                return Err(ValidationError::CrossedBook {
                    bid: bid.price,
                    ask: ask.price,
                });
            }
        }
        check_timestamp(book.timestamp, cfg)?;

        if cfg.duplicate_detection {
            let identity = (
                book.broker_id.clone(),
                book.symbol.clone(),
                book.timestamp.timestamp_millis(),
            );
            if !self.seen_books.lock().insert(identity) {
                return Err(ValidationError::Duplicate {
                    key: format!("{}/{}@{}", book.broker_id, book.symbol, book.timestamp),
                });
            }
        }
        Ok(())
    }
}

fn require_positive(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !(value > 0.0) {
        return Err(ValidationError::NonPositive { field, value });
    }
    Ok(())
}

fn require_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value < 0.0 || value.is_nan() {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(())
}

fn check_timestamp(ts: DateTime<Utc>, cfg: &ValidatorConfig) -> Result<(), ValidationError> {
    let now = Utc::now();
    if ts > now + Duration::seconds(cfg.max_future_skew_secs) {
        return Err(ValidationError::TimestampInFuture {
            max_minutes: cfg.max_future_skew_secs / 60,
        });
    }
    if ts < now - Duration::days(cfg.max_age_days) {
        return Err(ValidationError::TimestampTooOld {
            max_days: cfg.max_age_days,
        });
    }
    Ok(())
}

fn check_instrument(info: &InstrumentInfo) -> Result<(), ValidationError> {
    if info.symbol.is_empty() {
        return Err(ValidationError::EmptySymbol);
    }
    if info.instrument_type != InstrumentType::Stock {
        if info.base_asset.is_empty() {
            return Err(ValidationError::MissingField { field: "base_asset" });
        }
        if info.quote_asset.is_empty() {
            return Err(ValidationError::MissingField {
                field: "quote_asset",
            });
        }
    }
    for (field, value) in [
        ("price_precision", info.price_precision),
        ("quantity_precision", info.quantity_precision),
    ] {
        if value > MAX_PRECISION {
            return Err(ValidationError::PrecisionOutOfRange {
                field,
                value,
                max: MAX_PRECISION,
            });
        }
    }
    for (field, min, max) in [
        ("price", info.min_price, info.max_price),
        ("quantity", info.min_quantity, info.max_quantity),
    ] {
        if min < 0.0 {
            return Err(ValidationError::Negative {
                field: "min bound",
                value: min,
            });
        }
        if max > 0.0 && max < min {
            return Err(ValidationError::BoundsInverted { field, min, max });
        }
    }
    Ok(())
}

fn check_subscription(sub: &InstrumentSubscription) -> Result<(), ValidationError> {
    if sub.symbol.is_empty() {
        return Err(ValidationError::EmptySymbol);
    }
    if sub.broker_id.is_empty() {
        return Err(ValidationError::MissingField { field: "broker_id" });
    }
    if sub.data_types.is_empty() {
        return Err(ValidationError::EmptyDataTypes);
    }
    if sub.start_date.timestamp_millis() == 0 {
        return Err(ValidationError::ZeroStartDate);
    }
    Ok(())
}
