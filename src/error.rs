//! Typed errors surfaced at component boundaries.
//!
//! Each kind maps to a distinct handling policy: validation rejections and
//! backpressure signals are never retried, store failures are left to the
//! gap detector, disconnects to the reconnect loop.

use thiserror::Error;

use crate::models::DataType;

pub type MdsResult<T> = Result<T, MdsError>;

#[derive(Debug, Error)]
pub enum MdsError {
    /// Structural or semantic rejection; the offending record is dropped.
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    /// Backpressure from a bounded channel; the producer decides whether to
    /// retry.
    #[error("channel full: {data_type}")]
    ChannelFull { data_type: DataType },

    /// Downstream persistence failed. Not retried automatically.
    #[error("store failure: {0}")]
    Store(String),

    /// A worker observed a closed stream.
    #[error("adapter disconnected: {broker_id}")]
    AdapterDisconnected { broker_id: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("not supported: {what}")]
    NotSupported { what: String },

    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    /// An adapter stream is single-consumer and was already handed out.
    #[error("{data_type} stream already consumed")]
    StreamConsumed { data_type: DataType },

    #[error("operation timed out: {what}")]
    Timeout { what: String },

    /// Context cancelled; workers exit cleanly.
    #[error("cancelled")]
    Cancelled,

    /// Several per-type failures accumulated by a flush pass.
    #[error("flush failed: {0:?}")]
    FlushFailed(Vec<MdsError>),
}

impl MdsError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported { what: what.into() }
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout { what: what.into() }
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }
}

/// Reasons the validator rejects a record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("symbol is empty")]
    EmptySymbol,

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("timestamp more than {max_minutes}m in the future")]
    TimestampInFuture { max_minutes: i64 },

    #[error("timestamp more than {max_days}d in the past")]
    TimestampTooOld { max_days: i64 },

    #[error("price anomaly: {prev} -> {current} deviates {deviation_pct:.1}% (max {max_pct:.1}%)")]
    Anomaly {
        prev: f64,
        current: f64,
        deviation_pct: f64,
        max_pct: f64,
    },

    #[error("volume spike: {prev} -> {current} exceeds {max_ratio:.1}x")]
    VolumeSpike {
        prev: f64,
        current: f64,
        max_ratio: f64,
    },

    #[error("duplicate record: {key}")]
    Duplicate { key: String },

    #[error("bid {bid} must be below ask {ask}")]
    BidAskInverted { bid: f64, ask: f64 },

    #[error("price {price} outside 24h range [{low}, {high}]")]
    OutsideDailyRange { price: f64, low: f64, high: f64 },

    #[error("OHLC out of order: low {low}, open {open}, close {close}, high {high}")]
    OhlcOutOfOrder {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },

    #[error("crossed book: best bid {bid} >= best ask {ask}")]
    CrossedBook { bid: f64, ask: f64 },

    #[error("{side} side has {count} levels, max {max}")]
    TooManyLevels {
        side: &'static str,
        count: usize,
        max: usize,
    },

    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("{field} precision {value} exceeds {max}")]
    PrecisionOutOfRange { field: &'static str, value: u8, max: u8 },

    #[error("{field}: max {max} must be >= min {min}")]
    BoundsInverted { field: &'static str, min: f64, max: f64 },

    #[error("subscription requests no data types")]
    EmptyDataTypes,

    #[error("subscription start date is unset")]
    ZeroStartDate,
}
