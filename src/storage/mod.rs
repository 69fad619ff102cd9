//! Storage layer: store contracts, buffered writer, adaptive batcher and
//! the filtered query surface.
//!
//! The pipeline only ever talks to the two contracts below; the sqlite
//! drivers are one implementation. Batch writes must be idempotent under
//! retry of the same batch, since flushes are at-least-once.

pub mod processor;
pub mod query;
pub mod service;
pub mod sqlite;

#[cfg(test)]
mod processor_tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::MdsResult;
use crate::models::{
    Candle, CandleFilter, InstrumentInfo, InstrumentSubscription, OrderBook, OrderBookFilter,
    Ticker, TickerFilter,
};

use crate::broker::BrokerConfig;

/// Durable time-series store for the three record families.
#[async_trait]
pub trait TimeSeriesStorage: Send + Sync {
    async fn save_tickers(&self, tickers: &[Ticker]) -> MdsResult<()>;
    async fn save_candles(&self, candles: &[Candle]) -> MdsResult<()>;
    async fn save_order_books(&self, books: &[OrderBook]) -> MdsResult<()>;

    async fn get_tickers(&self, filter: &TickerFilter) -> MdsResult<Vec<Ticker>>;
    async fn get_candles(&self, filter: &CandleFilter) -> MdsResult<Vec<Candle>>;
    async fn get_order_books(&self, filter: &OrderBookFilter) -> MdsResult<Vec<OrderBook>>;

    /// Latest stored timestamps per (broker, symbol); the gap detector's
    /// only read path.
    async fn latest_ticker_timestamp(
        &self,
        broker_id: &str,
        symbol: &str,
    ) -> MdsResult<Option<DateTime<Utc>>>;
    async fn latest_candle_timestamp(
        &self,
        broker_id: &str,
        symbol: &str,
    ) -> MdsResult<Option<DateTime<Utc>>>;
    async fn latest_order_book_timestamp(
        &self,
        broker_id: &str,
        symbol: &str,
    ) -> MdsResult<Option<DateTime<Utc>>>;

    async fn health(&self) -> MdsResult<()>;
}

/// Strongly-consistent metadata store: instruments, subscriptions, broker
/// configs. Read-after-write within one process must reflect the write.
#[async_trait]
pub trait MetadataStorage: Send + Sync {
    async fn save_instrument(&self, info: &InstrumentInfo) -> MdsResult<()>;
    async fn get_instrument(&self, symbol: &str) -> MdsResult<Option<InstrumentInfo>>;
    async fn list_instruments(&self) -> MdsResult<Vec<InstrumentInfo>>;
    async fn delete_instrument(&self, symbol: &str) -> MdsResult<()>;

    async fn save_subscription(&self, sub: &InstrumentSubscription) -> MdsResult<()>;
    async fn get_subscription(&self, id: &str) -> MdsResult<Option<InstrumentSubscription>>;
    async fn list_subscriptions(&self) -> MdsResult<Vec<InstrumentSubscription>>;
    async fn update_subscription(&self, sub: &InstrumentSubscription) -> MdsResult<()>;
    async fn delete_subscription(&self, id: &str) -> MdsResult<()>;

    async fn save_broker_config(&self, config: &BrokerConfig) -> MdsResult<()>;
    async fn get_broker_config(&self, id: &str) -> MdsResult<Option<BrokerConfig>>;
    async fn list_broker_configs(&self) -> MdsResult<Vec<BrokerConfig>>;
    async fn delete_broker_config(&self, id: &str) -> MdsResult<()>;

    async fn health(&self) -> MdsResult<()>;
}

/// Owner of the two store handles, shared across services.
#[derive(Clone)]
pub struct StorageManager {
    time_series: Arc<dyn TimeSeriesStorage>,
    metadata: Arc<dyn MetadataStorage>,
}

impl StorageManager {
    pub fn new(time_series: Arc<dyn TimeSeriesStorage>, metadata: Arc<dyn MetadataStorage>) -> Self {
        Self {
            time_series,
            metadata,
        }
    }

    pub fn time_series(&self) -> Arc<dyn TimeSeriesStorage> {
        Arc::clone(&self.time_series)
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStorage> {
        Arc::clone(&self.metadata)
    }

    pub async fn health(&self) -> MdsResult<()> {
        self.time_series.health().await?;
        self.metadata.health().await
    }
}
