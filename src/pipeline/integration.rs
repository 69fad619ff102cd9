//! Broker-storage integration: the per-broker fan-in workers.
//!
//! Every registered, connected adapter gets three workers, one per record
//! family. A worker reads one record at a time, stamps the broker id,
//! saves through the configured sink under a per-record deadline, and
//! keeps per-broker plus aggregate counters. Workers exit on the
//! integration stop signal or when the adapter's stream closes; the
//! reconnect loop owns recovery from the latter.

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerAdapter, StreamHandle};
use crate::error::{MdsError, MdsResult};
use crate::models::{Candle, DataType, OrderBook, Ticker};
use crate::storage::processor::DataProcessor;
use crate::storage::service::StorageService;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Per-record save deadline.
    pub save_timeout_ms: u64,
    /// Health fails when data was seen once but none since this long.
    pub stale_after_ms: u64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            save_timeout_ms: 10_000,
            stale_after_ms: 300_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub tickers: AtomicU64,
    pub candles: AtomicU64,
    pub order_books: AtomicU64,
    pub errors: AtomicU64,
    /// Unix millis of the last successful save; 0 = never.
    pub last_data_received_ms: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
    pub tickers: u64,
    pub candles: u64,
    pub order_books: u64,
    pub errors: u64,
    pub last_data_received_ms: i64,
}

impl IngestStats {
    fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            tickers: self.tickers.load(Ordering::Relaxed),
            candles: self.candles.load(Ordering::Relaxed),
            order_books: self.order_books.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_data_received_ms: self.last_data_received_ms.load(Ordering::Relaxed),
        }
    }

    fn note_saved(&self, kind: DataType) {
        match kind {
            DataType::Ticker => self.tickers.fetch_add(1, Ordering::Relaxed),
            DataType::Candle => self.candles.fetch_add(1, Ordering::Relaxed),
            DataType::OrderBook => self.order_books.fetch_add(1, Ordering::Relaxed),
        };
        self.last_data_received_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Where the workers deliver records: the buffered writer (blocks briefly
/// on its buffer mutex) or the channel-fed processor (rejects when full).
/// Which one runs is a deployment decision.
#[derive(Clone)]
pub enum IngestSink {
    Buffered(Arc<StorageService>),
    Adaptive(Arc<DataProcessor>),
}

impl From<Arc<StorageService>> for IngestSink {
    fn from(service: Arc<StorageService>) -> Self {
        IngestSink::Buffered(service)
    }
}

impl From<Arc<DataProcessor>> for IngestSink {
    fn from(processor: Arc<DataProcessor>) -> Self {
        IngestSink::Adaptive(processor)
    }
}

/// Record families the worker loop is generic over.
trait IngestRecord: Sized + Send + Sync + 'static {
    const KIND: DataType;

    fn stamp_broker(&mut self, broker_id: &str);

    fn save(self, sink: &IngestSink) -> BoxFuture<'_, MdsResult<()>>;
}

impl IngestRecord for Ticker {
    const KIND: DataType = DataType::Ticker;

    fn stamp_broker(&mut self, broker_id: &str) {
        self.broker_id = broker_id.to_string();
    }

    fn save(self, sink: &IngestSink) -> BoxFuture<'_, MdsResult<()>> {
        Box::pin(async move {
            match sink {
                IngestSink::Buffered(service) => service.save_ticker(self).await,
                IngestSink::Adaptive(processor) => processor.process_ticker(self).await,
            }
        })
    }
}

impl IngestRecord for Candle {
    const KIND: DataType = DataType::Candle;

    fn stamp_broker(&mut self, broker_id: &str) {
        self.broker_id = broker_id.to_string();
    }

    fn save(self, sink: &IngestSink) -> BoxFuture<'_, MdsResult<()>> {
        Box::pin(async move {
            match sink {
                IngestSink::Buffered(service) => service.save_candle(self).await,
                IngestSink::Adaptive(processor) => processor.process_candle(self).await,
            }
        })
    }
}

impl IngestRecord for OrderBook {
    const KIND: DataType = DataType::OrderBook;

    fn stamp_broker(&mut self, broker_id: &str) {
        self.broker_id = broker_id.to_string();
    }

    fn save(self, sink: &IngestSink) -> BoxFuture<'_, MdsResult<()>> {
        Box::pin(async move {
            match sink {
                IngestSink::Buffered(service) => service.save_order_book(self).await,
                IngestSink::Adaptive(processor) => processor.process_order_book(self).await,
            }
        })
    }
}

struct BrokerWorkers {
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<IngestStats>,
}

pub struct BrokerStorageIntegration {
    sink: IngestSink,
    config: IntegrationConfig,
    workers: Mutex<HashMap<String, BrokerWorkers>>,
    aggregate: Arc<IngestStats>,
}

impl BrokerStorageIntegration {
    pub fn new(sink: impl Into<IngestSink>, config: IntegrationConfig) -> Arc<Self> {
        Arc::new(Self {
            sink: sink.into(),
            config,
            workers: Mutex::new(HashMap::new()),
            aggregate: Arc::new(IngestStats::default()),
        })
    }

    /// Launch the worker triple for a connected adapter. Re-registering a
    /// broker (after reconnect) replaces its previous workers.
    pub async fn register_broker(&self, adapter: Arc<dyn BrokerAdapter>) -> MdsResult<()> {
        let broker_id = adapter.id().to_string();

        let ticker_stream = adapter.ticker_stream()?;
        let candle_stream = adapter.candle_stream()?;
        let book_stream = adapter.order_book_stream()?;

        let mut workers = self.workers.lock().await;
        if let Some(old) = workers.remove(&broker_id) {
            let _ = old.stop_tx.send(true);
            for handle in old.handles {
                let _ = handle.await;
            }
        }

        let stats = Arc::new(IngestStats::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let save_timeout = Duration::from_millis(self.config.save_timeout_ms);

        let handles = vec![
            tokio::spawn(run_worker::<Ticker>(
                broker_id.clone(),
                ticker_stream,
                self.sink.clone(),
                Arc::clone(&stats),
                Arc::clone(&self.aggregate),
                save_timeout,
                stop_rx.clone(),
            )),
            tokio::spawn(run_worker::<Candle>(
                broker_id.clone(),
                candle_stream,
                self.sink.clone(),
                Arc::clone(&stats),
                Arc::clone(&self.aggregate),
                save_timeout,
                stop_rx.clone(),
            )),
            tokio::spawn(run_worker::<OrderBook>(
                broker_id.clone(),
                book_stream,
                self.sink.clone(),
                Arc::clone(&stats),
                Arc::clone(&self.aggregate),
                save_timeout,
                stop_rx,
            )),
        ];

        workers.insert(
            broker_id.clone(),
            BrokerWorkers {
                stop_tx,
                handles,
                stats,
            },
        );
        info!(broker_id = %broker_id, "broker integrated");
        Ok(())
    }

    /// Stop and join the worker triple for one broker.
    pub async fn unregister_broker(&self, broker_id: &str) -> MdsResult<()> {
        let entry = self
            .workers
            .lock()
            .await
            .remove(broker_id)
            .ok_or_else(|| MdsError::not_found(format!("integration for broker {broker_id}")))?;
        let _ = entry.stop_tx.send(true);
        for handle in entry.handles {
            let _ = handle.await;
        }
        info!(broker_id = %broker_id, "broker integration stopped");
        Ok(())
    }

    pub async fn is_registered(&self, broker_id: &str) -> bool {
        self.workers.lock().await.contains_key(broker_id)
    }

    pub async fn active_brokers(&self) -> Vec<String> {
        self.workers.lock().await.keys().cloned().collect()
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.aggregate.snapshot()
    }

    pub async fn broker_stats(&self, broker_id: &str) -> Option<IngestStatsSnapshot> {
        self.workers
            .lock()
            .await
            .get(broker_id)
            .map(|w| w.stats.snapshot())
    }

    /// Unhealthy when nothing is integrated, or data has been seen before
    /// but none arrived within the staleness window.
    pub async fn health(&self) -> MdsResult<()> {
        if self.workers.lock().await.is_empty() {
            return Err(MdsError::Store("no active broker integrations".into()));
        }
        let last = self.aggregate.last_data_received_ms.load(Ordering::Relaxed);
        if last != 0 {
            let age_ms = Utc::now().timestamp_millis() - last;
            if age_ms > self.config.stale_after_ms as i64 {
                return Err(MdsError::Store(format!(
                    "no data received for {age_ms}ms"
                )));
            }
        }
        Ok(())
    }

    /// Stop every worker triple.
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;
        for (broker_id, entry) in workers.drain() {
            let _ = entry.stop_tx.send(true);
            for handle in entry.handles {
                let _ = handle.await;
            }
            debug!(broker_id = %broker_id, "integration workers joined");
        }
    }
}

async fn run_worker<T: IngestRecord>(
    broker_id: String,
    mut stream: StreamHandle<T>,
    sink: IngestSink,
    per_broker: Arc<IngestStats>,
    aggregate: Arc<IngestStats>,
    save_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            // The stop branch wins ties, so no save is issued after
            // shutdown begins.
            biased;
            _ = stop.changed() => {
                debug!(broker_id = %broker_id, kind = %T::KIND, "worker stopped");
                return;
            }
            maybe = stream.recv() => match maybe {
                Some(mut record) => {
                    record.stamp_broker(&broker_id);
                    match tokio::time::timeout(save_timeout, record.save(&sink)).await {
                        Ok(Ok(())) => {
                            per_broker.note_saved(T::KIND);
                            aggregate.note_saved(T::KIND);
                        }
                        Ok(Err(err)) => {
                            per_broker.errors.fetch_add(1, Ordering::Relaxed);
                            aggregate.errors.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                broker_id = %broker_id,
                                kind = %T::KIND,
                                error = %err,
                                "record dropped"
                            );
                        }
                        Err(_) => {
                            per_broker.errors.fetch_add(1, Ordering::Relaxed);
                            aggregate.errors.fetch_add(1, Ordering::Relaxed);
                            warn!(broker_id = %broker_id, kind = %T::KIND, "save timed out");
                        }
                    }
                }
                None => {
                    info!(broker_id = %broker_id, kind = %T::KIND, "adapter stream closed");
                    return;
                }
            },
        }
    }
}
