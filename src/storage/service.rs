//! Buffered storage writer.
//!
//! One bounded buffer per record type, each behind its own async mutex so
//! the three families never contend with each other. A record is appended
//! under the lock and the buffer is flushed under that same lock once it
//! reaches the configured batch size; a single background flusher ticks at
//! `flush_interval` and sweeps all three. On a store failure the buffer is
//! kept and the write is retried by the next flush; identity-keyed
//! persistence makes the retry idempotent.

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{MdsError, MdsResult};
use crate::models::{Candle, OrderBook, Ticker};
use crate::validator::Validator;

use super::TimeSeriesStorage;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageServiceConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub flush_timeout_ms: u64,
}

impl Default for StorageServiceConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval_ms: 5_000,
            flush_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct StorageServiceStats {
    pub tickers_saved: AtomicU64,
    pub candles_saved: AtomicU64,
    pub order_books_saved: AtomicU64,
    pub flushes: AtomicU64,
    pub errors: AtomicU64,
    pub validation_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageServiceStatsSnapshot {
    pub tickers_saved: u64,
    pub candles_saved: u64,
    pub order_books_saved: u64,
    pub flushes: u64,
    pub errors: u64,
    pub validation_failures: u64,
}

pub struct StorageService {
    storage: Arc<dyn TimeSeriesStorage>,
    validator: Arc<Validator>,
    config: StorageServiceConfig,
    tickers: Mutex<Vec<Ticker>>,
    candles: Mutex<Vec<Candle>>,
    order_books: Mutex<Vec<OrderBook>>,
    stats: StorageServiceStats,
    shutdown_tx: SyncMutex<Option<watch::Sender<bool>>>,
    flusher: SyncMutex<Option<JoinHandle<()>>>,
}

impl StorageService {
    pub fn new(
        storage: Arc<dyn TimeSeriesStorage>,
        validator: Arc<Validator>,
        config: StorageServiceConfig,
    ) -> Arc<Self> {
        let cap = config.batch_size;
        Arc::new(Self {
            storage,
            validator,
            config,
            tickers: Mutex::new(Vec::with_capacity(cap)),
            candles: Mutex::new(Vec::with_capacity(cap)),
            order_books: Mutex::new(Vec::with_capacity(cap)),
            stats: StorageServiceStats::default(),
            shutdown_tx: SyncMutex::new(None),
            flusher: SyncMutex::new(None),
        })
    }

    /// Spawn the periodic flusher. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.shutdown_tx.lock();
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *guard = Some(tx);
        drop(guard);

        let service = Arc::clone(self);
        let period = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        debug!("storage flusher stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = service.flush_all().await {
                            warn!(error = %err, "periodic flush failed");
                        }
                    }
                }
            }
        });
        *self.flusher.lock() = Some(handle);
    }

    pub fn stats(&self) -> StorageServiceStatsSnapshot {
        StorageServiceStatsSnapshot {
            tickers_saved: self.stats.tickers_saved.load(Ordering::Relaxed),
            candles_saved: self.stats.candles_saved.load(Ordering::Relaxed),
            order_books_saved: self.stats.order_books_saved.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            validation_failures: self.stats.validation_failures.load(Ordering::Relaxed),
        }
    }

    /// Buffered records per type (ticker, candle, order book).
    pub async fn buffered(&self) -> (usize, usize, usize) {
        (
            self.tickers.lock().await.len(),
            self.candles.lock().await.len(),
            self.order_books.lock().await.len(),
        )
    }

    pub async fn save_ticker(&self, ticker: Ticker) -> MdsResult<()> {
        if let Err(err) = self.validator.validate_ticker(&ticker) {
            self.note_validation_failure();
            return Err(err.into());
        }
        let mut buf = self.tickers.lock().await;
        buf.push(ticker);
        if buf.len() >= self.config.batch_size {
            let count = buf.len() as u64;
            self.write_batch(|storage, batch| async move { storage.save_tickers(&batch).await },
                &mut buf)
                .await?;
            self.stats.tickers_saved.fetch_add(count, Ordering::Relaxed);
        }
        Ok(())
    }

    pub async fn save_candle(&self, candle: Candle) -> MdsResult<()> {
        if let Err(err) = self.validator.validate_candle(&candle) {
            self.note_validation_failure();
            return Err(err.into());
        }
        let mut buf = self.candles.lock().await;
        buf.push(candle);
        if buf.len() >= self.config.batch_size {
            let count = buf.len() as u64;
            self.write_batch(|storage, batch| async move { storage.save_candles(&batch).await },
                &mut buf)
                .await?;
            self.stats.candles_saved.fetch_add(count, Ordering::Relaxed);
        }
        Ok(())
    }

    pub async fn save_order_book(&self, book: OrderBook) -> MdsResult<()> {
        if let Err(err) = self.validator.validate_order_book(&book) {
            self.note_validation_failure();
            return Err(err.into());
        }
        let mut buf = self.order_books.lock().await;
        buf.push(book);
        if buf.len() >= self.config.batch_size {
            let count = buf.len() as u64;
            self.write_batch(
                |storage, batch| async move { storage.save_order_books(&batch).await },
                &mut buf,
            )
            .await?;
            self.stats
                .order_books_saved
                .fetch_add(count, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Validate a whole batch, then write it directly past the buffer.
    /// Partial batches are never written: one bad record fails the call.
    pub async fn save_tickers(&self, tickers: &[Ticker]) -> MdsResult<()> {
        for t in tickers {
            if let Err(err) = self.validator.validate_ticker(t) {
                self.note_validation_failure();
                return Err(err.into());
            }
        }
        self.direct_write(self.storage.save_tickers(tickers)).await?;
        self.stats
            .tickers_saved
            .fetch_add(tickers.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn save_candles(&self, candles: &[Candle]) -> MdsResult<()> {
        for c in candles {
            if let Err(err) = self.validator.validate_candle(c) {
                self.note_validation_failure();
                return Err(err.into());
            }
        }
        self.direct_write(self.storage.save_candles(candles)).await?;
        self.stats
            .candles_saved
            .fetch_add(candles.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn save_order_books(&self, books: &[OrderBook]) -> MdsResult<()> {
        for b in books {
            if let Err(err) = self.validator.validate_order_book(b) {
                self.note_validation_failure();
                return Err(err.into());
            }
        }
        self.direct_write(self.storage.save_order_books(books))
            .await?;
        self.stats
            .order_books_saved
            .fetch_add(books.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flush every non-empty buffer, one lock at a time. Per-type errors
    /// are accumulated; the pass never short-circuits.
    pub async fn flush_all(&self) -> MdsResult<()> {
        let mut failures = Vec::new();

        {
            let mut buf = self.tickers.lock().await;
            let count = buf.len() as u64;
            match self
                .write_batch(|storage, batch| async move { storage.save_tickers(&batch).await },
                    &mut buf)
                .await
            {
                Ok(()) => {
                    self.stats.tickers_saved.fetch_add(count, Ordering::Relaxed);
                }
                Err(err) => failures.push(err),
            }
        }
        {
            let mut buf = self.candles.lock().await;
            let count = buf.len() as u64;
            match self
                .write_batch(|storage, batch| async move { storage.save_candles(&batch).await },
                    &mut buf)
                .await
            {
                Ok(()) => {
                    self.stats.candles_saved.fetch_add(count, Ordering::Relaxed);
                }
                Err(err) => failures.push(err),
            }
        }
        {
            let mut buf = self.order_books.lock().await;
            let count = buf.len() as u64;
            match self
                .write_batch(
                    |storage, batch| async move { storage.save_order_books(&batch).await },
                    &mut buf,
                )
                .await
            {
                Ok(()) => {
                    self.stats
                        .order_books_saved
                        .fetch_add(count, Ordering::Relaxed);
                }
                Err(err) => failures.push(err),
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(MdsError::FlushFailed(failures)),
        }
    }

    /// Stop the flusher, wait for it, then run one final flush. Buffered
    /// records outlive the flusher; only records in transit after the
    /// deadline are lost.
    pub async fn close(&self, deadline: Duration) -> MdsResult<()> {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        let handle = self.flusher.lock().take();
        let work = async {
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            self.flush_all().await
        };
        match timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(MdsError::timeout("storage service close")),
        }
    }

    fn note_validation_failure(&self) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        self.stats
            .validation_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Write `buf` as one batch while its lock is held; clear it only on
    /// success so a failed flush is retried next pass.
    async fn write_batch<T, F, Fut>(&self, write: F, buf: &mut Vec<T>) -> MdsResult<()>
    where
        T: Clone,
        F: FnOnce(Arc<dyn TimeSeriesStorage>, Vec<T>) -> Fut,
        Fut: std::future::Future<Output = MdsResult<()>>,
    {
        if buf.is_empty() {
            return Ok(());
        }
        let batch = buf.clone();
        let flush_timeout = Duration::from_millis(self.config.flush_timeout_ms);
        match timeout(flush_timeout, write(Arc::clone(&self.storage), batch)).await {
            Ok(Ok(())) => {
                buf.clear();
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(err)) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
            Err(_) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(MdsError::timeout("batch flush"))
            }
        }
    }

    async fn direct_write<Fut>(&self, write: Fut) -> MdsResult<()>
    where
        Fut: std::future::Future<Output = MdsResult<()>>,
    {
        let flush_timeout = Duration::from_millis(self.config.flush_timeout_ms);
        match timeout(flush_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
            Err(_) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(MdsError::timeout("batch write"))
            }
        }
    }
}
