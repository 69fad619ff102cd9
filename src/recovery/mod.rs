//! Gap detection and historical backfill.
//!
//! The detector scans every active subscription, compares the latest
//! stored timestamp per (broker, symbol, data type) against now, and turns
//! qualifying gaps into prioritized backfill work. Recovery pulls records
//! from the adapter's historical endpoint (only adapters advertising the
//! capability are eligible), stamps the broker id and persists each gap's
//! records as one idempotent batch.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::registry::BrokerRegistry;
use crate::broker::BrokerFeature;
use crate::error::{MdsError, MdsResult};
use crate::models::{DataType, Timeframe};
use crate::storage::{MetadataStorage, TimeSeriesStorage};


/// Gaps older than this are high priority.
const HIGH_PRIORITY_AGE_HOURS: i64 = 4;
/// Gaps older than this (but younger than high) are medium priority.
const MEDIUM_PRIORITY_AGE_HOURS: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub max_gap_duration_ms: u64,
    pub recovery_batch_size: usize,
    /// Store-write retries per request.
    pub max_retries: u32,
    pub check_interval_ms: u64,
    /// Requests processed per loop cycle.
    pub max_requests_per_cycle: usize,
    pub ticker_min_gap_ms: u64,
    pub candle_min_gap_ms: u64,
    pub orderbook_min_gap_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_gap_duration_ms: 86_400_000,
            recovery_batch_size: 100,
            max_retries: 3,
            check_interval_ms: 60_000,
            max_requests_per_cycle: 10,
            ticker_min_gap_ms: 300_000,
            candle_min_gap_ms: 3_600_000,
            orderbook_min_gap_ms: 600_000,
        }
    }
}

impl RecoveryConfig {
    fn min_gap_for(&self, data_type: DataType) -> ChronoDuration {
        let ms = match data_type {
            DataType::Ticker => self.ticker_min_gap_ms,
            DataType::Candle => self.candle_min_gap_ms,
            DataType::OrderBook => self.orderbook_min_gap_ms,
        };
        ChronoDuration::milliseconds(ms as i64)
    }

    fn max_gap(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.max_gap_duration_ms as i64)
    }
}

/// A missing interval of collected history for one subscription leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub broker_id: String,
    pub symbol: String,
    pub data_type: DataType,
    /// Candle gaps carry the subscription's timeframe.
    pub timeframe: Option<Timeframe>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// 1 = high, 2 = medium, 3 = low.
    pub priority: u8,
}

impl Gap {
    pub fn duration(&self) -> ChronoDuration {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One scheduled backfill job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub id: String,
    pub gap: Gap,
    pub status: RecoveryStatus,
    pub error: Option<String>,
    pub records_recovered: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryRequest {
    fn new(gap: Gap) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            gap,
            status: RecoveryStatus::Pending,
            error: None,
            records_recovered: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, status: RecoveryStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Default)]
pub struct RecoveryStats {
    pub gaps_detected: AtomicU64,
    pub requests_created: AtomicU64,
    pub requests_completed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub records_recovered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStatsSnapshot {
    pub gaps_detected: u64,
    pub requests_created: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub records_recovered: u64,
}

pub struct GapDetector {
    metadata: Arc<dyn MetadataStorage>,
    time_series: Arc<dyn TimeSeriesStorage>,
    config: RecoveryConfig,
}

impl GapDetector {
    pub fn new(
        metadata: Arc<dyn MetadataStorage>,
        time_series: Arc<dyn TimeSeriesStorage>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            metadata,
            time_series,
            config,
        }
    }

    /// Gaps across all active subscriptions, sorted by (priority, start).
    /// Gaps below the per-type minimum or above the maximum are ignored.
    pub async fn detect_gaps(&self) -> MdsResult<Vec<Gap>> {
        let now = Utc::now();
        let mut gaps = Vec::new();

        for sub in self.metadata.list_subscriptions().await? {
            if !sub.is_active {
                continue;
            }
            for data_type in sub.data_types.iter().copied() {
                let latest = match data_type {
                    DataType::Ticker => {
                        self.time_series
                            .latest_ticker_timestamp(&sub.broker_id, &sub.symbol)
                            .await?
                    }
                    DataType::Candle => {
                        self.time_series
                            .latest_candle_timestamp(&sub.broker_id, &sub.symbol)
                            .await?
                    }
                    DataType::OrderBook => {
                        self.time_series
                            .latest_order_book_timestamp(&sub.broker_id, &sub.symbol)
                            .await?
                    }
                };
                let latest = latest.unwrap_or(sub.start_date);
                let age = now - latest;
                if age < self.config.min_gap_for(data_type) || age > self.config.max_gap() {
                    continue;
                }
                let priority = if age > ChronoDuration::hours(HIGH_PRIORITY_AGE_HOURS) {
                    1
                } else if age > ChronoDuration::hours(MEDIUM_PRIORITY_AGE_HOURS) {
                    2
                } else {
                    3
                };
                let timeframe = match data_type {
                    DataType::Candle => Some(subscription_timeframe(&sub)),
                    _ => None,
                };
                gaps.push(Gap {
                    broker_id: sub.broker_id.clone(),
                    symbol: sub.symbol.clone(),
                    data_type,
                    timeframe,
                    start: latest,
                    end: now,
                    priority,
                });
            }
        }

        gaps.sort_by(|a, b| (a.priority, a.start).cmp(&(b.priority, b.start)));
        Ok(gaps)
    }
}

/// Candle subscriptions carry their timeframe in the settings map.
fn subscription_timeframe(sub: &crate::models::InstrumentSubscription) -> Timeframe {
    sub.settings
        .get("timeframe")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Timeframe>().ok())
        .unwrap_or(Timeframe::M1)
}

pub struct RecoveryService {
    detector: GapDetector,
    registry: Arc<BrokerRegistry>,
    time_series: Arc<dyn TimeSeriesStorage>,
    config: RecoveryConfig,
    history: SyncMutex<Vec<RecoveryRequest>>,
    stats: RecoveryStats,
}

impl RecoveryService {
    pub fn new(
        metadata: Arc<dyn MetadataStorage>,
        time_series: Arc<dyn TimeSeriesStorage>,
        registry: Arc<BrokerRegistry>,
        config: RecoveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            detector: GapDetector::new(metadata, Arc::clone(&time_series), config.clone()),
            registry,
            time_series,
            config,
            history: SyncMutex::new(Vec::new()),
            stats: RecoveryStats::default(),
        })
    }

    pub async fn detect_gaps(&self) -> MdsResult<Vec<Gap>> {
        let gaps = self.detector.detect_gaps().await?;
        self.stats
            .gaps_detected
            .fetch_add(gaps.len() as u64, Ordering::Relaxed);
        Ok(gaps)
    }

    /// Detect gaps, build requests for the high and medium priority ones
    /// (up to `max`), and execute them in order. A failed request never
    /// aborts the rest of the queue.
    pub async fn process_queue(&self, max: usize) -> MdsResult<Vec<RecoveryRequest>> {
        let gaps = self.detect_gaps().await?;
        let mut requests: Vec<RecoveryRequest> = gaps
            .into_iter()
            .filter(|g| g.priority <= 2)
            .take(max)
            .map(RecoveryRequest::new)
            .collect();
        self.stats
            .requests_created
            .fetch_add(requests.len() as u64, Ordering::Relaxed);

        for request in requests.iter_mut() {
            request.transition(RecoveryStatus::InProgress);
            match self.execute(&request.gap).await {
                Ok(count) => {
                    request.records_recovered = count;
                    request.transition(RecoveryStatus::Completed);
                    self.stats
                        .requests_completed
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .records_recovered
                        .fetch_add(count as u64, Ordering::Relaxed);
                    info!(
                        request_id = %request.id,
                        broker_id = %request.gap.broker_id,
                        symbol = %request.gap.symbol,
                        kind = %request.gap.data_type,
                        records = count,
                        "gap recovered"
                    );
                }
                Err(err) => {
                    request.error = Some(err.to_string());
                    request.transition(RecoveryStatus::Failed);
                    self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        request_id = %request.id,
                        broker_id = %request.gap.broker_id,
                        symbol = %request.gap.symbol,
                        error = %err,
                        "gap recovery failed"
                    );
                }
            }
        }

        self.history.lock().extend(requests.iter().cloned());
        Ok(requests)
    }

    pub fn stats(&self) -> RecoveryStatsSnapshot {
        RecoveryStatsSnapshot {
            gaps_detected: self.stats.gaps_detected.load(Ordering::Relaxed),
            requests_created: self.stats.requests_created.load(Ordering::Relaxed),
            requests_completed: self.stats.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.stats.requests_failed.load(Ordering::Relaxed),
            records_recovered: self.stats.records_recovered.load(Ordering::Relaxed),
        }
    }

    pub fn history(&self) -> Vec<RecoveryRequest> {
        self.history.lock().clone()
    }

    /// Periodic driver, spawned by the binary when recovery is enabled.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.check_interval_ms.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("recovery loop stopped");
                    return;
                }
                _ = tick.tick() => {
                    match self.process_queue(self.config.max_requests_per_cycle).await {
                        Ok(requests) if !requests.is_empty() => {
                            debug!(count = requests.len(), "recovery cycle finished");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "recovery cycle failed"),
                    }
                }
            }
        }
    }

    async fn execute(&self, gap: &Gap) -> MdsResult<usize> {
        let adapter = self
            .registry
            .get(&gap.broker_id)
            .map_err(|_| MdsError::not_found(format!("broker {}", gap.broker_id)))?;
        if !adapter.info().supports(BrokerFeature::HistoricalData) {
            return Err(MdsError::not_supported(format!(
                "historical data on broker {}",
                gap.broker_id
            )));
        }
        let historical = adapter.as_historical().ok_or_else(|| {
            MdsError::not_supported(format!("historical data on broker {}", gap.broker_id))
        })?;

        let limit = self.config.recovery_batch_size;
        match gap.data_type {
            DataType::Ticker => {
                let mut records = historical
                    .historical_tickers(&gap.symbol, gap.start, gap.end, limit)
                    .await?;
                for r in &mut records {
                    r.broker_id = gap.broker_id.clone();
                }
                if records.is_empty() {
                    return Ok(0);
                }
                self.persist_with_retry(|| self.time_series.save_tickers(&records))
                    .await?;
                Ok(records.len())
            }
            DataType::Candle => {
                let timeframe = gap.timeframe.unwrap_or(Timeframe::M1);
                let mut records = historical
                    .historical_candles(&gap.symbol, timeframe, gap.start, gap.end, limit)
                    .await?;
                for r in &mut records {
                    r.broker_id = gap.broker_id.clone();
                }
                if records.is_empty() {
                    return Ok(0);
                }
                self.persist_with_retry(|| self.time_series.save_candles(&records))
                    .await?;
                Ok(records.len())
            }
            DataType::OrderBook => {
                let mut records = historical
                    .historical_order_books(&gap.symbol, gap.start, gap.end, limit)
                    .await?;
                for r in &mut records {
                    r.broker_id = gap.broker_id.clone();
                }
                if records.is_empty() {
                    return Ok(0);
                }
                self.persist_with_retry(|| self.time_series.save_order_books(&records))
                    .await?;
                Ok(records.len())
            }
        }
    }

    /// Store writes are retried; batches are identity-keyed so a replay is
    /// harmless.
    async fn persist_with_retry<F, Fut>(&self, write: F) -> MdsResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = MdsResult<()>>,
    {
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            match write().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(attempt, error = %err, "recovery persist attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MdsError::store("recovery persist failed")))
    }
}
