//! In-process mock broker adapter.
//!
//! Serves two jobs: deterministic fixture for the integration tests (records
//! can be injected by hand) and a synthetic feed for local runs (a random
//! walk per subscribed symbol on a configurable interval). Advertises the
//! historical-data capability so the recovery path is exercisable without a
//! live venue.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{MdsError, MdsResult};
use crate::models::{
    Candle, DataType, InstrumentInfo, InstrumentSubscription, InstrumentType, MarketType,
    OrderBook, PriceLevel, Ticker, Timeframe,
};

use super::{
    BrokerAdapter, BrokerConfig, BrokerFeature, BrokerInfo, BrokerKind, HistoricalDataProvider,
    StreamBuffer, StreamHandle,
};

#[derive(Debug, Clone)]
pub struct MockAdapterOptions {
    pub buffer_size: usize,
    /// Feed period; `Duration::ZERO` disables the synthetic feed so tests
    /// can inject records explicitly.
    pub tick_interval: Duration,
    pub base_price: f64,
    pub candle_timeframe: Timeframe,
    pub max_subscriptions: usize,
}

impl Default for MockAdapterOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            tick_interval: Duration::from_millis(100),
            base_price: 100.0,
            candle_timeframe: Timeframe::M1,
            max_subscriptions: 100,
        }
    }
}

struct Streams {
    ticker: Arc<StreamBuffer<Ticker>>,
    candle: Arc<StreamBuffer<Candle>>,
    book: Arc<StreamBuffer<OrderBook>>,
    ticker_taken: bool,
    candle_taken: bool,
    book_taken: bool,
}

impl Streams {
    fn new(capacity: usize) -> Self {
        Self {
            ticker: StreamBuffer::new(capacity),
            candle: StreamBuffer::new(capacity),
            book: StreamBuffer::new(capacity),
            ticker_taken: false,
            candle_taken: false,
            book_taken: false,
        }
    }

    fn close_all(&self) {
        self.ticker.close();
        self.candle.close();
        self.book.close();
    }
}

pub struct MockBrokerAdapter {
    id: String,
    name: String,
    kind: BrokerKind,
    options: MockAdapterOptions,
    connected: AtomicBool,
    subscriptions: Arc<Mutex<HashMap<String, InstrumentSubscription>>>,
    streams: Mutex<Option<Streams>>,
    prices: Arc<Mutex<HashMap<String, f64>>>,
    feed_stop: Mutex<Option<watch::Sender<bool>>>,
    feed_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MockBrokerAdapter {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: BrokerKind,
        options: MockAdapterOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: name.into(),
            kind,
            options,
            connected: AtomicBool::new(false),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            streams: Mutex::new(None),
            prices: Arc::new(Mutex::new(HashMap::new())),
            feed_stop: Mutex::new(None),
            feed_handle: Mutex::new(None),
        })
    }

    pub fn from_config(cfg: &BrokerConfig, default_buffer_size: usize) -> Arc<Self> {
        let mut options = MockAdapterOptions {
            buffer_size: cfg.buffer_size.unwrap_or(default_buffer_size),
            max_subscriptions: cfg.max_subscriptions.unwrap_or(100),
            ..MockAdapterOptions::default()
        };
        if let Some(ms) = cfg.settings.get("tick_interval_ms").and_then(|v| v.as_u64()) {
            options.tick_interval = Duration::from_millis(ms);
        }
        if let Some(price) = cfg.settings.get("base_price").and_then(|v| v.as_f64()) {
            options.base_price = price;
        }
        if let Some(tf) = cfg
            .settings
            .get("candle_timeframe")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Timeframe>().ok())
        {
            options.candle_timeframe = tf;
        }
        let name = if cfg.name.is_empty() {
            format!("mock-{}", cfg.kind)
        } else {
            cfg.name.clone()
        };
        Self::new(cfg.id.clone(), name, cfg.kind, options)
    }

    /// Push a record into the live ticker stream, as if the venue sent it.
    pub fn inject_ticker(&self, ticker: Ticker) -> MdsResult<()> {
        let streams = self.streams.lock();
        let streams = streams.as_ref().ok_or_else(|| self.disconnected_err())?;
        streams.ticker.push(ticker);
        Ok(())
    }

    pub fn inject_candle(&self, candle: Candle) -> MdsResult<()> {
        let streams = self.streams.lock();
        let streams = streams.as_ref().ok_or_else(|| self.disconnected_err())?;
        streams.candle.push(candle);
        Ok(())
    }

    pub fn inject_order_book(&self, book: OrderBook) -> MdsResult<()> {
        let streams = self.streams.lock();
        let streams = streams.as_ref().ok_or_else(|| self.disconnected_err())?;
        streams.book.push(book);
        Ok(())
    }

    /// Drop the connection without a clean disconnect, closing the live
    /// streams. The reconnect loop is expected to bring the adapter back.
    pub fn simulate_connection_loss(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(tx) = self.feed_stop.lock().take() {
            let _ = tx.send(true);
        }
        if let Some(streams) = self.streams.lock().take() {
            streams.close_all();
        }
        info!(broker_id = %self.id, "mock adapter dropped connection");
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    fn disconnected_err(&self) -> MdsError {
        MdsError::AdapterDisconnected {
            broker_id: self.id.clone(),
        }
    }

    fn market_for_kind(&self) -> MarketType {
        match self.kind {
            BrokerKind::Crypto => MarketType::Spot,
            BrokerKind::Stock => MarketType::Stock,
        }
    }

    fn instrument_type_for_kind(&self) -> InstrumentType {
        match self.kind {
            BrokerKind::Crypto => InstrumentType::Spot,
            BrokerKind::Stock => InstrumentType::Stock,
        }
    }

    fn spawn_feed(
        &self,
        ticker_buf: Arc<StreamBuffer<Ticker>>,
        candle_buf: Arc<StreamBuffer<Candle>>,
        book_buf: Arc<StreamBuffer<OrderBook>>,
    ) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.feed_stop.lock() = Some(stop_tx);

        let broker_id = self.id.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        let prices = Arc::clone(&self.prices);
        let options = self.options.clone();
        let handle = tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut ticker_interval = tokio::time::interval(options.tick_interval);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!(broker_id = %broker_id, "mock feed stopping");
                        return;
                    }
                    _ = ticker_interval.tick() => {
                        emit_round(
                            &mut rng,
                            &subscriptions,
                            &prices,
                            &options,
                            &ticker_buf,
                            &candle_buf,
                            &book_buf,
                        );
                    }
                }
            }
        });
        *self.feed_handle.lock() = Some(handle);
    }
}

fn emit_round(
    rng: &mut StdRng,
    subscriptions: &Mutex<HashMap<String, InstrumentSubscription>>,
    prices: &Mutex<HashMap<String, f64>>,
    options: &MockAdapterOptions,
    ticker_buf: &StreamBuffer<Ticker>,
    candle_buf: &StreamBuffer<Candle>,
    book_buf: &StreamBuffer<OrderBook>,
) {
    let subs: Vec<InstrumentSubscription> = subscriptions.lock().values().cloned().collect();
    let now = Utc::now();
    for sub in subs {
        let prev = *prices
            .lock()
            .entry(sub.symbol.clone())
            .or_insert(options.base_price);
        let price = prev * (1.0 + rng.gen_range(-0.001..0.001));
        prices.lock().insert(sub.symbol.clone(), price);

        if sub.wants(DataType::Ticker) {
            let mut t = Ticker::new(
                sub.symbol.clone(),
                price,
                rng.gen_range(0.5..5.0),
                sub.market,
                sub.instrument_type,
                now,
            );
            t.bid = Some(price * 0.9995);
            t.ask = Some(price * 1.0005);
            ticker_buf.push(t);
        }
        if sub.wants(DataType::Candle) {
            let (low, high) = (prev.min(price) * 0.9995, prev.max(price) * 1.0005);
            candle_buf.push(Candle {
                symbol: sub.symbol.clone(),
                open: prev,
                high,
                low,
                close: price,
                volume: rng.gen_range(0.1..50.0),
                timeframe: options.candle_timeframe,
                timestamp: now,
                broker_id: String::new(),
                trades: rng.gen_range(1..100),
                quote_volume: price * rng.gen_range(0.1..50.0),
                open_interest: 0.0,
            });
        }
        if sub.wants(DataType::OrderBook) {
            let bids = (1..=5)
                .map(|i| PriceLevel::new(price * (1.0 - 0.0005 * i as f64), rng.gen_range(0.1..10.0)))
                .collect();
            let asks = (1..=5)
                .map(|i| PriceLevel::new(price * (1.0 + 0.0005 * i as f64), rng.gen_range(0.1..10.0)))
                .collect();
            book_buf.push(OrderBook {
                symbol: sub.symbol.clone(),
                bids,
                asks,
                market: sub.market,
                instrument_type: sub.instrument_type,
                timestamp: now,
                broker_id: String::new(),
            });
        }
    }
}

#[async_trait]
impl BrokerAdapter for MockBrokerAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> BrokerInfo {
        BrokerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            features: vec![BrokerFeature::Streaming, BrokerFeature::HistoricalData],
        }
    }

    async fn connect(&self, _timeout: Duration) -> MdsResult<()> {
        if self.connected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let streams = Streams::new(self.options.buffer_size);
        let ticker_buf = Arc::clone(&streams.ticker);
        let candle_buf = Arc::clone(&streams.candle);
        let book_buf = Arc::clone(&streams.book);
        *self.streams.lock() = Some(streams);

        if !self.options.tick_interval.is_zero() {
            self.spawn_feed(ticker_buf, candle_buf, book_buf);
        }
        info!(broker_id = %self.id, kind = %self.kind, "mock adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> MdsResult<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(tx) = self.feed_stop.lock().take() {
            let _ = tx.send(true);
        }
        let handle = self.feed_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Some(streams) = self.streams.lock().take() {
            streams.close_all();
        }
        info!(broker_id = %self.id, "mock adapter disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn subscribe(&self, subs: &[InstrumentSubscription]) -> MdsResult<()> {
        let mut active = self.subscriptions.lock();
        for sub in subs {
            if !active.contains_key(&sub.id) && active.len() >= self.options.max_subscriptions {
                return Err(MdsError::not_supported(format!(
                    "subscription limit {} reached on {}",
                    self.options.max_subscriptions, self.id
                )));
            }
            active.insert(sub.id.clone(), sub.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, subs: &[InstrumentSubscription]) -> MdsResult<()> {
        let mut active = self.subscriptions.lock();
        for sub in subs {
            active.remove(&sub.id);
        }
        Ok(())
    }

    fn ticker_stream(&self) -> MdsResult<StreamHandle<Ticker>> {
        let mut streams = self.streams.lock();
        let streams = streams.as_mut().ok_or_else(|| self.disconnected_err())?;
        if streams.ticker_taken {
            return Err(MdsError::StreamConsumed {
                data_type: DataType::Ticker,
            });
        }
        streams.ticker_taken = true;
        Ok(StreamHandle::new(Arc::clone(&streams.ticker)))
    }

    fn candle_stream(&self) -> MdsResult<StreamHandle<Candle>> {
        let mut streams = self.streams.lock();
        let streams = streams.as_mut().ok_or_else(|| self.disconnected_err())?;
        if streams.candle_taken {
            return Err(MdsError::StreamConsumed {
                data_type: DataType::Candle,
            });
        }
        streams.candle_taken = true;
        Ok(StreamHandle::new(Arc::clone(&streams.candle)))
    }

    fn order_book_stream(&self) -> MdsResult<StreamHandle<OrderBook>> {
        let mut streams = self.streams.lock();
        let streams = streams.as_mut().ok_or_else(|| self.disconnected_err())?;
        if streams.book_taken {
            return Err(MdsError::StreamConsumed {
                data_type: DataType::OrderBook,
            });
        }
        streams.book_taken = true;
        Ok(StreamHandle::new(Arc::clone(&streams.book)))
    }

    async fn supported_instruments(&self) -> MdsResult<Vec<InstrumentInfo>> {
        let symbols: &[(&str, &str, &str)] = match self.kind {
            BrokerKind::Crypto => &[
                ("BTCUSDT", "BTC", "USDT"),
                ("ETHUSDT", "ETH", "USDT"),
                ("SOLUSDT", "SOL", "USDT"),
            ],
            BrokerKind::Stock => &[("AAPL", "", ""), ("MSFT", "", ""), ("SPY", "", "")],
        };
        Ok(symbols
            .iter()
            .map(|(symbol, base, quote)| InstrumentInfo {
                symbol: (*symbol).into(),
                base_asset: (*base).into(),
                quote_asset: (*quote).into(),
                instrument_type: self.instrument_type_for_kind(),
                market: self.market_for_kind(),
                price_precision: 2,
                quantity_precision: 8,
                min_price: 0.01,
                max_price: 0.0,
                min_quantity: 0.0001,
                max_quantity: 0.0,
                is_active: true,
            })
            .collect())
    }

    fn health(&self) -> MdsResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(self.disconnected_err())
        }
    }

    fn as_historical(&self) -> Option<&dyn HistoricalDataProvider> {
        Some(self)
    }
}

#[async_trait]
impl HistoricalDataProvider for MockBrokerAdapter {
    async fn historical_tickers(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> MdsResult<Vec<Ticker>> {
        let base = *self
            .prices
            .lock()
            .get(symbol)
            .unwrap_or(&self.options.base_price);
        Ok(synthetic_series(start, end, limit)
            .into_iter()
            .enumerate()
            .map(|(i, ts)| {
                let price = base * (1.0 + ((i % 7) as f64 - 3.0) * 0.0002);
                Ticker::new(
                    symbol,
                    price,
                    1.0,
                    self.market_for_kind(),
                    self.instrument_type_for_kind(),
                    ts,
                )
            })
            .collect())
    }

    async fn historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> MdsResult<Vec<Candle>> {
        let base = *self
            .prices
            .lock()
            .get(symbol)
            .unwrap_or(&self.options.base_price);
        let step = timeframe.duration();
        let mut out = Vec::new();
        let mut ts = start;
        while ts <= end && out.len() < limit {
            let drift = ((out.len() % 5) as f64 - 2.0) * 0.0005;
            let open = base * (1.0 + drift);
            let close = base * (1.0 + drift * 0.5);
            out.push(Candle {
                symbol: symbol.into(),
                open,
                high: open.max(close) * 1.0005,
                low: open.min(close) * 0.9995,
                close,
                volume: 1.0,
                timeframe,
                timestamp: ts,
                broker_id: String::new(),
                trades: 10,
                quote_volume: close,
                open_interest: 0.0,
            });
            ts += step;
        }
        Ok(out)
    }
}

/// Timestamps spread evenly across `[start, end]`, capped at `limit`.
fn synthetic_series(start: DateTime<Utc>, end: DateTime<Utc>, limit: usize) -> Vec<DateTime<Utc>> {
    if end <= start || limit == 0 {
        return Vec::new();
    }
    let span_ms = (end - start).num_milliseconds().max(1);
    let count = limit.min(span_ms as usize).max(1);
    let step = span_ms / count as i64;
    (0..count)
        .map(|i| start + ChronoDuration::milliseconds(step * i as i64 + step / 2))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> Arc<MockBrokerAdapter> {
        MockBrokerAdapter::new(
            "b1",
            "mock",
            BrokerKind::Crypto,
            MockAdapterOptions {
                tick_interval: Duration::ZERO,
                ..MockAdapterOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn streams_are_single_consumer() {
        let a = adapter();
        a.connect(Duration::from_secs(1)).await.unwrap();
        assert!(a.ticker_stream().is_ok());
        assert!(matches!(
            a.ticker_stream(),
            Err(MdsError::StreamConsumed { .. })
        ));
    }

    #[tokio::test]
    async fn injected_records_flow_through() {
        let a = adapter();
        a.connect(Duration::from_secs(1)).await.unwrap();
        let mut stream = a.ticker_stream().unwrap();
        a.inject_ticker(Ticker::new(
            "BTCUSDT",
            50000.0,
            1.0,
            MarketType::Spot,
            InstrumentType::Spot,
            Utc::now(),
        ))
        .unwrap();
        let rec = stream.recv().await.unwrap();
        assert_eq!(rec.symbol, "BTCUSDT");
        assert!(rec.broker_id.is_empty());
    }

    #[tokio::test]
    async fn disconnect_closes_streams() {
        let a = adapter();
        a.connect(Duration::from_secs(1)).await.unwrap();
        let mut stream = a.ticker_stream().unwrap();
        a.disconnect().await.unwrap();
        assert_eq!(stream.recv().await, None);
        assert!(a.health().is_err());
    }

    #[tokio::test]
    async fn reconnect_provides_fresh_streams() {
        let a = adapter();
        a.connect(Duration::from_secs(1)).await.unwrap();
        let _first = a.ticker_stream().unwrap();
        a.disconnect().await.unwrap();
        a.connect(Duration::from_secs(1)).await.unwrap();
        assert!(a.ticker_stream().is_ok());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let a = adapter();
        let sub = InstrumentSubscription::new(
            "BTCUSDT",
            InstrumentType::Spot,
            MarketType::Spot,
            vec![DataType::Ticker],
            "b1",
            Utc::now(),
        );
        a.subscribe(&[sub.clone()]).await.unwrap();
        a.subscribe(&[sub.clone()]).await.unwrap();
        assert_eq!(a.subscription_count(), 1);
        a.unsubscribe(&[sub]).await.unwrap();
        assert_eq!(a.subscription_count(), 0);
    }

    #[tokio::test]
    async fn historical_tickers_stay_inside_window() {
        let a = adapter();
        let end = Utc::now();
        let start = end - ChronoDuration::hours(2);
        let recs = a.historical_tickers("BTCUSDT", start, end, 100).await.unwrap();
        assert_eq!(recs.len(), 100);
        assert!(recs.iter().all(|r| r.timestamp >= start && r.timestamp <= end));

        let books = a.historical_order_books("BTCUSDT", start, end, 10).await;
        assert!(matches!(books, Err(MdsError::NotSupported { .. })));
    }
}
