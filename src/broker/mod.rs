//! Broker adapter contract.
//!
//! The pipeline is polymorphic over anything implementing [`BrokerAdapter`]:
//! crypto and stock adapters differ only in the instruments they serve and
//! the optional capabilities they advertise. Records emitted by an adapter
//! need not carry `broker_id`; the integration layer stamps it.
//!
//! Streams are lazy, infinite and non-restartable: each data type has one
//! consumer handle backed by a bounded drop-oldest buffer. A slow consumer
//! never blocks the adapter's producer; overflow drops the oldest record
//! and bumps a counter.

pub mod mock;
pub mod registry;

use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use chrono::{DateTime, Utc};

use crate::error::{MdsError, MdsResult};
use crate::models::{
    Candle, InstrumentInfo, InstrumentSubscription, OrderBook, Ticker, Timeframe,
};

// =============================================================================
// Stream plumbing
// =============================================================================

/// Bounded drop-oldest buffer between an adapter's producer and the single
/// stream consumer.
pub struct StreamBuffer<T> {
    queue: ArrayQueue<T>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> StreamBuffer<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    /// Producer side. On overflow the oldest record is displaced.
    pub fn push(&self, item: T) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.queue.force_push(item).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    /// Close the stream. Buffered records remain readable; `recv` returns
    /// `None` once drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn recv_inner(&self) -> Option<T> {
        loop {
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.queue.pop();
            }
            let notified = self.notify.notified();
            // Re-check after registering interest so a push between the pop
            // above and here is not missed.
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.queue.pop();
            }
            notified.await;
        }
    }
}

/// Consumer handle for one adapter stream. Handed out at most once per
/// stream per connection.
pub struct StreamHandle<T> {
    buffer: Arc<StreamBuffer<T>>,
}

impl<T> StreamHandle<T> {
    pub fn new(buffer: Arc<StreamBuffer<T>>) -> Self {
        Self { buffer }
    }

    /// Next record, or `None` once the stream is closed and drained.
    /// Cancel-safe: a record is only removed when it is returned.
    pub async fn recv(&mut self) -> Option<T> {
        self.buffer.recv_inner().await
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.buffer.dropped()
    }
}

// =============================================================================
// Adapter identity & configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Crypto,
    Stock,
}

impl Default for BrokerKind {
    fn default() -> Self {
        BrokerKind::Crypto
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKind::Crypto => f.write_str("crypto"),
            BrokerKind::Stock => f.write_str("stock"),
        }
    }
}

/// Optional capabilities an adapter can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerFeature {
    Streaming,
    HistoricalData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub id: String,
    pub name: String,
    pub kind: BrokerKind,
    pub features: Vec<BrokerFeature>,
}

impl BrokerInfo {
    pub fn supports(&self, feature: BrokerFeature) -> bool {
        self.features.contains(&feature)
    }
}

/// Per-broker configuration. Unset limits fall back to the global
/// `[broker.*]` defaults at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub id: String,
    pub name: String,
    pub kind: BrokerKind,
    /// Adapter implementation selector; only `mock` ships in-tree.
    pub adapter: String,
    pub enabled: bool,
    pub buffer_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub connect_timeout_ms: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub max_subscriptions: Option<usize>,
    pub requests_per_sec: Option<u32>,
    pub requests_per_min: Option<u32>,
    /// Free-form adapter settings (e.g. mock tick interval).
    pub settings: HashMap<String, serde_json::Value>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            kind: BrokerKind::default(),
            adapter: "mock".into(),
            enabled: true,
            buffer_size: None,
            batch_size: None,
            connect_timeout_ms: None,
            reconnect_delay_ms: None,
            max_reconnect_attempts: None,
            max_subscriptions: None,
            requests_per_sec: None,
            requests_per_min: None,
            settings: HashMap::new(),
        }
    }
}

// =============================================================================
// Adapter contract
// =============================================================================

/// Base capability set every market-data adapter implements.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn info(&self) -> BrokerInfo;

    async fn connect(&self, timeout: Duration) -> MdsResult<()>;

    async fn disconnect(&self) -> MdsResult<()>;

    fn is_connected(&self) -> bool;

    /// Idempotent with respect to the adapter's active subscription set.
    async fn subscribe(&self, subs: &[InstrumentSubscription]) -> MdsResult<()>;

    async fn unsubscribe(&self, subs: &[InstrumentSubscription]) -> MdsResult<()>;

    /// Single-consumer stream handles. A second take for the same
    /// connection fails with `StreamConsumed`.
    fn ticker_stream(&self) -> MdsResult<StreamHandle<Ticker>>;

    fn candle_stream(&self) -> MdsResult<StreamHandle<Candle>>;

    fn order_book_stream(&self) -> MdsResult<StreamHandle<OrderBook>>;

    async fn supported_instruments(&self) -> MdsResult<Vec<InstrumentInfo>>;

    fn health(&self) -> MdsResult<()>;

    /// Capability discovery for backfill; adapters advertising
    /// [`BrokerFeature::HistoricalData`] return `Some(self)`.
    fn as_historical(&self) -> Option<&dyn HistoricalDataProvider> {
        None
    }
}

/// Additive capability: adapters that can serve historical data for gap
/// recovery.
#[async_trait]
pub trait HistoricalDataProvider: Send + Sync {
    async fn historical_tickers(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> MdsResult<Vec<Ticker>>;

    async fn historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> MdsResult<Vec<Candle>>;

    /// Most venues cannot replay books; the default refuses.
    async fn historical_order_books(
        &self,
        symbol: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _limit: usize,
    ) -> MdsResult<Vec<OrderBook>> {
        Err(MdsError::not_supported(format!(
            "historical order books for {symbol}"
        )))
    }
}
