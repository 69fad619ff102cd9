//! Channel-fed data processor with utilization-driven batch sizing.
//!
//! The alternative ingestion path to the buffered writer: three bounded
//! channels, one worker each. Producers never block: a full channel
//! rejects the record with `ChannelFull` and the caller decides what to do.
//! Workers accumulate a local batch until it reaches the adaptive target
//! size, the flush ticker fires, or the channel closes, then write the
//! batch straight to the store.

use futures_util::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MdsError, MdsResult};
use crate::models::{Candle, DataType, OrderBook, Ticker};
use crate::validator::Validator;

use super::TimeSeriesStorage;

/// How many recently chosen batch sizes the sampler retains.
const RECENT_SIZES: usize = 100;
/// Utilization above this counts as an overflow event.
const OVERFLOW_UTILIZATION: f64 = 0.95;
/// Utilization above this fails the health check.
const UNHEALTHY_UTILIZATION: f64 = 0.90;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Whether the binary wires this path at all.
    pub enabled: bool,
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub adaptive_threshold: f64,
    pub adaptive_batching: bool,
    /// Doubles the ticker channel, the highest-rate feed, so candles and
    /// books cannot starve it.
    pub priority_buffering: bool,
    pub flush_interval_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_capacity: 1000,
            batch_size: 100,
            min_batch_size: 10,
            max_batch_size: 500,
            adaptive_threshold: 0.7,
            adaptive_batching: true,
            priority_buffering: false,
            flush_interval_ms: 5_000,
        }
    }
}

/// Batch size for the current channel fill level.
///
/// Above the threshold the size grows with utilization (capped at
/// `max_batch_size`); below it the size shrinks proportionally (floored at
/// `min_batch_size`). With adaptive batching off the configured
/// `batch_size` is returned as-is.
pub fn adaptive_batch_size(len: usize, capacity: usize, cfg: &ProcessorConfig) -> usize {
    if !cfg.adaptive_batching {
        return cfg.batch_size;
    }
    let utilization = if capacity == 0 {
        0.0
    } else {
        len as f64 / capacity as f64
    };
    if utilization > cfg.adaptive_threshold {
        let grown = (cfg.batch_size as f64 * (1.0 + utilization)).round() as usize;
        grown.min(cfg.max_batch_size)
    } else {
        let shrunk = (cfg.batch_size as f64 * utilization).round() as usize;
        shrunk.max(cfg.min_batch_size)
    }
}

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub tickers_processed: AtomicU64,
    pub candles_processed: AtomicU64,
    pub order_books_processed: AtomicU64,
    pub batches_written: AtomicU64,
    pub errors: AtomicU64,
    pub overflow_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    pub tickers_processed: u64,
    pub candles_processed: u64,
    pub order_books_processed: u64,
    pub batches_written: u64,
    pub errors: u64,
    pub overflow_events: u64,
}

/// Record families the worker loop is generic over.
trait BatchRecord: Sized + Send + Sync + 'static {
    const KIND: DataType;

    fn save_batch<'a>(
        storage: &'a Arc<dyn TimeSeriesStorage>,
        batch: &'a [Self],
    ) -> BoxFuture<'a, MdsResult<()>>;
}

impl BatchRecord for Ticker {
    const KIND: DataType = DataType::Ticker;

    fn save_batch<'a>(
        storage: &'a Arc<dyn TimeSeriesStorage>,
        batch: &'a [Self],
    ) -> BoxFuture<'a, MdsResult<()>> {
        Box::pin(async move { storage.save_tickers(batch).await })
    }
}

impl BatchRecord for Candle {
    const KIND: DataType = DataType::Candle;

    fn save_batch<'a>(
        storage: &'a Arc<dyn TimeSeriesStorage>,
        batch: &'a [Self],
    ) -> BoxFuture<'a, MdsResult<()>> {
        Box::pin(async move { storage.save_candles(batch).await })
    }
}

impl BatchRecord for OrderBook {
    const KIND: DataType = DataType::OrderBook;

    fn save_batch<'a>(
        storage: &'a Arc<dyn TimeSeriesStorage>,
        batch: &'a [Self],
    ) -> BoxFuture<'a, MdsResult<()>> {
        Box::pin(async move { storage.save_order_books(batch).await })
    }
}

pub struct DataProcessor {
    storage: Arc<dyn TimeSeriesStorage>,
    validator: Arc<Validator>,
    config: ProcessorConfig,
    ticker_tx: mpsc::Sender<Ticker>,
    candle_tx: mpsc::Sender<Candle>,
    book_tx: mpsc::Sender<OrderBook>,
    ticker_rx: SyncMutex<Option<mpsc::Receiver<Ticker>>>,
    candle_rx: SyncMutex<Option<mpsc::Receiver<Candle>>>,
    book_rx: SyncMutex<Option<mpsc::Receiver<OrderBook>>>,
    stats: Arc<ProcessorStats>,
    recent_sizes: Arc<SyncMutex<VecDeque<usize>>>,
    shutdown_tx: SyncMutex<Option<watch::Sender<bool>>>,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl DataProcessor {
    pub fn new(
        storage: Arc<dyn TimeSeriesStorage>,
        validator: Arc<Validator>,
        config: ProcessorConfig,
    ) -> Arc<Self> {
        let cap = config.channel_capacity.max(1);
        let ticker_cap = if config.priority_buffering { cap * 2 } else { cap };
        let (ticker_tx, ticker_rx) = mpsc::channel(ticker_cap);
        let (candle_tx, candle_rx) = mpsc::channel(cap);
        let (book_tx, book_rx) = mpsc::channel(cap);
        Arc::new(Self {
            storage,
            validator,
            config,
            ticker_tx,
            candle_tx,
            book_tx,
            ticker_rx: SyncMutex::new(Some(ticker_rx)),
            candle_rx: SyncMutex::new(Some(candle_rx)),
            book_rx: SyncMutex::new(Some(book_rx)),
            stats: Arc::new(ProcessorStats::default()),
            recent_sizes: Arc::new(SyncMutex::new(VecDeque::with_capacity(RECENT_SIZES))),
            shutdown_tx: SyncMutex::new(None),
            workers: SyncMutex::new(Vec::new()),
        })
    }

    /// Spawn the three type workers and the utilization sampler.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.shutdown_tx.lock();
        if guard.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        *guard = Some(tx);
        drop(guard);

        let mut workers = self.workers.lock();
        if let Some(ticker_rx) = self.ticker_rx.lock().take() {
            workers.push(tokio::spawn(run_worker(
                Arc::clone(&self.storage),
                ticker_rx,
                self.ticker_tx.clone(),
                self.config.clone(),
                Arc::clone(&self.stats),
                rx.clone(),
            )));
        }
        if let Some(candle_rx) = self.candle_rx.lock().take() {
            workers.push(tokio::spawn(run_worker(
                Arc::clone(&self.storage),
                candle_rx,
                self.candle_tx.clone(),
                self.config.clone(),
                Arc::clone(&self.stats),
                rx.clone(),
            )));
        }
        if let Some(book_rx) = self.book_rx.lock().take() {
            workers.push(tokio::spawn(run_worker(
                Arc::clone(&self.storage),
                book_rx,
                self.book_tx.clone(),
                self.config.clone(),
                Arc::clone(&self.stats),
                rx.clone(),
            )));
        }
        workers.push(tokio::spawn(run_sampler(
            self.ticker_tx.clone(),
            self.candle_tx.clone(),
            self.book_tx.clone(),
            self.config.clone(),
            Arc::clone(&self.stats),
            Arc::clone(&self.recent_sizes),
            rx,
        )));
    }

    pub async fn process_ticker(&self, ticker: Ticker) -> MdsResult<()> {
        if let Err(err) = self.validator.validate_ticker(&ticker) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(err.into());
        }
        self.enqueue(&self.ticker_tx, ticker, DataType::Ticker)?;
        self.stats.tickers_processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn process_candle(&self, candle: Candle) -> MdsResult<()> {
        if let Err(err) = self.validator.validate_candle(&candle) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(err.into());
        }
        self.enqueue(&self.candle_tx, candle, DataType::Candle)?;
        self.stats.candles_processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn process_order_book(&self, book: OrderBook) -> MdsResult<()> {
        if let Err(err) = self.validator.validate_order_book(&book) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(err.into());
        }
        self.enqueue(&self.book_tx, book, DataType::OrderBook)?;
        self.stats
            .order_books_processed
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// (len, capacity) per channel: ticker, candle, order book.
    pub fn utilization(&self) -> [(usize, usize); 3] {
        [
            channel_fill(&self.ticker_tx),
            channel_fill(&self.candle_tx),
            channel_fill(&self.book_tx),
        ]
    }

    /// Fails when any channel is above 90% capacity.
    pub fn health(&self) -> MdsResult<()> {
        for (kind, (len, cap)) in [DataType::Ticker, DataType::Candle, DataType::OrderBook]
            .into_iter()
            .zip(self.utilization())
        {
            if cap > 0 && len as f64 / cap as f64 > UNHEALTHY_UTILIZATION {
                return Err(MdsError::Store(format!(
                    "{kind} channel at {len}/{cap}, over {:.0}%",
                    UNHEALTHY_UTILIZATION * 100.0
                )));
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            tickers_processed: self.stats.tickers_processed.load(Ordering::Relaxed),
            candles_processed: self.stats.candles_processed.load(Ordering::Relaxed),
            order_books_processed: self.stats.order_books_processed.load(Ordering::Relaxed),
            batches_written: self.stats.batches_written.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            overflow_events: self.stats.overflow_events.load(Ordering::Relaxed),
        }
    }

    /// Sizes the sampler chose recently, oldest first.
    pub fn recent_batch_sizes(&self) -> Vec<usize> {
        self.recent_sizes.lock().iter().copied().collect()
    }

    /// Signal shutdown and wait for the workers to drain their batches.
    pub async fn close(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }
    }

    fn enqueue<T>(&self, tx: &mpsc::Sender<T>, item: T, kind: DataType) -> MdsResult<()> {
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(MdsError::ChannelFull { data_type: kind })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MdsError::Cancelled),
        }
    }
}

fn channel_fill<T>(tx: &mpsc::Sender<T>) -> (usize, usize) {
    let cap = tx.max_capacity();
    (cap - tx.capacity(), cap)
}

async fn run_worker<T: BatchRecord>(
    storage: Arc<dyn TimeSeriesStorage>,
    mut rx: mpsc::Receiver<T>,
    probe: mpsc::Sender<T>,
    config: ProcessorConfig,
    stats: Arc<ProcessorStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch: Vec<T> = Vec::with_capacity(config.max_batch_size.max(1));
    let mut flush_tick =
        tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                // Drain what is already queued, then flush and exit.
                while let Ok(item) = rx.try_recv() {
                    batch.push(item);
                    if batch.len() >= config.max_batch_size.max(1) {
                        write_out::<T>(&storage, &mut batch, &stats).await;
                    }
                }
                write_out::<T>(&storage, &mut batch, &stats).await;
                debug!(kind = %T::KIND, "processor worker stopped");
                return;
            }
            maybe = rx.recv() => match maybe {
                Some(item) => {
                    batch.push(item);
                    let (len, cap) = channel_fill(&probe);
                    let target = adaptive_batch_size(len, cap, &config).max(1);
                    if batch.len() >= target {
                        write_out::<T>(&storage, &mut batch, &stats).await;
                    }
                }
                None => {
                    write_out::<T>(&storage, &mut batch, &stats).await;
                    debug!(kind = %T::KIND, "processor channel closed");
                    return;
                }
            },
            _ = flush_tick.tick() => {
                if !batch.is_empty() {
                    write_out::<T>(&storage, &mut batch, &stats).await;
                }
            }
        }
    }
}

/// Batches are not retried on store failure; the gap detector backfills.
async fn write_out<T: BatchRecord>(
    storage: &Arc<dyn TimeSeriesStorage>,
    batch: &mut Vec<T>,
    stats: &ProcessorStats,
) {
    if batch.is_empty() {
        return;
    }
    match T::save_batch(storage, batch).await {
        Ok(()) => {
            stats.batches_written.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(kind = %T::KIND, error = %err, count = batch.len(), "batch write failed");
        }
    }
    batch.clear();
}

async fn run_sampler(
    ticker_tx: mpsc::Sender<Ticker>,
    candle_tx: mpsc::Sender<Candle>,
    book_tx: mpsc::Sender<OrderBook>,
    config: ProcessorConfig,
    stats: Arc<ProcessorStats>,
    recent_sizes: Arc<SyncMutex<VecDeque<usize>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick.tick() => {
                let fills = [
                    channel_fill(&ticker_tx),
                    channel_fill(&candle_tx),
                    channel_fill(&book_tx),
                ];
                let mut sizes = recent_sizes.lock();
                for (len, cap) in fills {
                    let chosen = adaptive_batch_size(len, cap, &config);
                    if sizes.len() == RECENT_SIZES {
                        sizes.pop_front();
                    }
                    sizes.push_back(chosen);
                    if cap > 0 && len as f64 / cap as f64 > OVERFLOW_UTILIZATION {
                        stats.overflow_events.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}
