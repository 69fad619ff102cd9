//! Filtered historical reads.
//!
//! Reads pass through the time-series store; when a date filter is
//! configured, each record is additionally checked against the governing
//! subscription's start date; data older than the point we declared
//! interest in is never served, even if the store happens to hold it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MdsResult;
use crate::models::{
    Candle, CandleFilter, DataType, OrderBook, OrderBookFilter, Ticker, TickerFilter,
};

use super::{MetadataStorage, TimeSeriesStorage};

/// Clamps query results to subscription start dates.
pub struct DateFilter {
    metadata: Arc<dyn MetadataStorage>,
}

impl DateFilter {
    pub fn new(metadata: Arc<dyn MetadataStorage>) -> Self {
        Self { metadata }
    }

    /// Earliest declared start per (broker, symbol) among subscriptions
    /// carrying `data_type`. Pairs with no subscription are unconstrained.
    async fn start_dates(
        &self,
        data_type: DataType,
    ) -> MdsResult<HashMap<(String, String), DateTime<Utc>>> {
        let mut starts: HashMap<(String, String), DateTime<Utc>> = HashMap::new();
        for sub in self.metadata.list_subscriptions().await? {
            if !sub.wants(data_type) {
                continue;
            }
            let key = (sub.broker_id.clone(), sub.symbol.clone());
            starts
                .entry(key)
                .and_modify(|existing| {
                    if sub.start_date < *existing {
                        *existing = sub.start_date;
                    }
                })
                .or_insert(sub.start_date);
        }
        Ok(starts)
    }

    pub async fn filter_tickers(&self, rows: Vec<Ticker>) -> MdsResult<Vec<Ticker>> {
        let starts = self.start_dates(DataType::Ticker).await?;
        Ok(rows
            .into_iter()
            .filter(|t| {
                starts
                    .get(&(t.broker_id.clone(), t.symbol.clone()))
                    .map_or(true, |start| t.timestamp >= *start)
            })
            .collect())
    }

    pub async fn filter_candles(&self, rows: Vec<Candle>) -> MdsResult<Vec<Candle>> {
        let starts = self.start_dates(DataType::Candle).await?;
        Ok(rows
            .into_iter()
            .filter(|c| {
                starts
                    .get(&(c.broker_id.clone(), c.symbol.clone()))
                    .map_or(true, |start| c.timestamp >= *start)
            })
            .collect())
    }

    pub async fn filter_order_books(&self, rows: Vec<OrderBook>) -> MdsResult<Vec<OrderBook>> {
        let starts = self.start_dates(DataType::OrderBook).await?;
        Ok(rows
            .into_iter()
            .filter(|b| {
                starts
                    .get(&(b.broker_id.clone(), b.symbol.clone()))
                    .map_or(true, |start| b.timestamp >= *start)
            })
            .collect())
    }
}

pub struct QueryService {
    storage: Option<Arc<dyn TimeSeriesStorage>>,
    date_filter: Option<DateFilter>,
}

impl QueryService {
    pub fn new(storage: Arc<dyn TimeSeriesStorage>, date_filter: Option<DateFilter>) -> Self {
        Self {
            storage: Some(storage),
            date_filter,
        }
    }

    /// Early-startup variant: no store attached yet, every query returns
    /// empty without error.
    pub fn detached() -> Self {
        Self {
            storage: None,
            date_filter: None,
        }
    }

    pub async fn get_tickers(&self, filter: &TickerFilter) -> MdsResult<Vec<Ticker>> {
        let Some(storage) = &self.storage else {
            return Ok(Vec::new());
        };
        let rows = storage.get_tickers(filter).await?;
        match &self.date_filter {
            Some(df) => df.filter_tickers(rows).await,
            None => Ok(rows),
        }
    }

    pub async fn get_candles(&self, filter: &CandleFilter) -> MdsResult<Vec<Candle>> {
        let Some(storage) = &self.storage else {
            return Ok(Vec::new());
        };
        let rows = storage.get_candles(filter).await?;
        match &self.date_filter {
            Some(df) => df.filter_candles(rows).await,
            None => Ok(rows),
        }
    }

    pub async fn get_order_books(&self, filter: &OrderBookFilter) -> MdsResult<Vec<OrderBook>> {
        let Some(storage) = &self.storage else {
            return Ok(Vec::new());
        };
        let rows = storage.get_order_books(filter).await?;
        match &self.date_filter {
            Some(df) => df.filter_order_books(rows).await,
            None => Ok(rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstrumentSubscription, InstrumentType, MarketType};
    use crate::storage::sqlite::{SqliteMetadataStorage, SqliteTimeSeriesStorage};
    use chrono::TimeZone;

    fn ticker_at(minute: u32) -> Ticker {
        let mut t = Ticker::new(
            "BTCUSDT",
            50_000.0,
            1.0,
            MarketType::Spot,
            InstrumentType::Spot,
            Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap(),
        );
        t.broker_id = "b1".into();
        t
    }

    async fn seeded() -> (Arc<SqliteTimeSeriesStorage>, Arc<SqliteMetadataStorage>) {
        let ts = Arc::new(SqliteTimeSeriesStorage::open_memory().unwrap());
        let meta = Arc::new(SqliteMetadataStorage::open_memory().unwrap());
        ts.save_tickers(&[ticker_at(0), ticker_at(10), ticker_at(20)])
            .await
            .unwrap();
        let mut sub = InstrumentSubscription::new(
            "BTCUSDT",
            InstrumentType::Spot,
            MarketType::Spot,
            vec![DataType::Ticker],
            "b1",
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 10, 0).unwrap(),
        );
        sub.is_active = true;
        meta.save_subscription(&sub).await.unwrap();
        (ts, meta)
    }

    #[tokio::test]
    async fn date_filter_excludes_records_before_subscription_start() {
        let (ts, meta) = seeded().await;
        let service = QueryService::new(ts, Some(DateFilter::new(meta)));
        let rows = service
            .get_tickers(&TickerFilter::for_pair("b1", "BTCUSDT"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|t| t.timestamp
            >= Utc.with_ymd_and_hms(2025, 6, 1, 12, 10, 0).unwrap()));
    }

    #[tokio::test]
    async fn unsubscribed_pairs_pass_through() {
        let (ts, meta) = seeded().await;
        let mut other = ticker_at(0);
        other.broker_id = "b2".into();
        ts.save_tickers(&[other]).await.unwrap();

        let service = QueryService::new(ts, Some(DateFilter::new(meta)));
        let rows = service
            .get_tickers(&TickerFilter::for_pair("b2", "BTCUSDT"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn without_date_filter_everything_is_returned() {
        let (ts, _meta) = seeded().await;
        let service = QueryService::new(ts, None);
        let rows = service
            .get_tickers(&TickerFilter::for_pair("b1", "BTCUSDT"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn detached_service_returns_empty_without_error() {
        let service = QueryService::detached();
        assert!(service
            .get_tickers(&TickerFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(service
            .get_candles(&CandleFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(service
            .get_order_books(&OrderBookFilter::default())
            .await
            .unwrap()
            .is_empty());
    }
}
