use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::processor::{adaptive_batch_size, DataProcessor, ProcessorConfig};
use super::sqlite::SqliteTimeSeriesStorage;
use super::TimeSeriesStorage;
use crate::error::MdsError;
use crate::models::{InstrumentType, MarketType, Ticker, TickerFilter};
use crate::validator::{Validator, ValidatorConfig};

fn config() -> ProcessorConfig {
    ProcessorConfig::default()
}

fn ticker_at(i: usize) -> Ticker {
    let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    let mut t = Ticker::new(
        "BTCUSDT",
        50_000.0 + (i % 3) as f64,
        1.0,
        MarketType::Spot,
        InstrumentType::Spot,
        base + chrono::Duration::milliseconds(i as i64),
    );
    t.broker_id = "b1".into();
    t
}

fn processor(
    cfg: ProcessorConfig,
) -> (Arc<DataProcessor>, Arc<SqliteTimeSeriesStorage>) {
    let store = Arc::new(SqliteTimeSeriesStorage::open_memory().unwrap());
    let proc = DataProcessor::new(
        store.clone(),
        Arc::new(Validator::new(ValidatorConfig::default())),
        cfg,
    );
    (proc, store)
}

#[test]
fn adaptive_size_grows_above_threshold() {
    let cfg = config();
    // u = 0.8 > 0.7 -> round(100 * 1.8) = 180
    assert_eq!(adaptive_batch_size(800, 1000, &cfg), 180);
    // u = 1.0 -> 200
    assert_eq!(adaptive_batch_size(1000, 1000, &cfg), 200);
}

#[test]
fn adaptive_size_shrinks_below_threshold() {
    let cfg = config();
    // u = 0.5 -> round(100 * 0.5) = 50
    assert_eq!(adaptive_batch_size(500, 1000, &cfg), 50);
    // u = 0.02 -> 2, floored at min_batch_size
    assert_eq!(adaptive_batch_size(20, 1000, &cfg), 10);
    assert_eq!(adaptive_batch_size(0, 1000, &cfg), 10);
}

#[test]
fn adaptive_size_caps_at_max() {
    let mut cfg = config();
    cfg.batch_size = 400;
    // u = 0.9 -> round(400 * 1.9) = 760, capped at 500
    assert_eq!(adaptive_batch_size(900, 1000, &cfg), 500);
}

#[test]
fn adaptive_size_stays_in_bounds_for_all_fill_levels() {
    let cfg = config();
    for cap in [1usize, 10, 100, 1000, 4096] {
        for len in 0..=cap {
            let size = adaptive_batch_size(len, cap, &cfg);
            assert!(
                (cfg.min_batch_size..=cfg.max_batch_size).contains(&size),
                "size {size} out of bounds at {len}/{cap}"
            );
        }
    }
    // Degenerate capacity must not divide by zero.
    assert_eq!(adaptive_batch_size(0, 0, &cfg), cfg.min_batch_size);
}

#[test]
fn disabled_adaptive_returns_fixed_size() {
    let mut cfg = config();
    cfg.adaptive_batching = false;
    assert_eq!(adaptive_batch_size(0, 1000, &cfg), 100);
    assert_eq!(adaptive_batch_size(1000, 1000, &cfg), 100);
}

#[tokio::test]
async fn processes_records_through_to_store() {
    let (proc, store) = processor(ProcessorConfig {
        flush_interval_ms: 50,
        ..config()
    });
    proc.start();
    for i in 0..20 {
        proc.process_ticker(ticker_at(i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        store.get_tickers(&TickerFilter::default()).await.unwrap().len(),
        20
    );
    assert_eq!(proc.stats().tickers_processed, 20);
    proc.close().await;
}

#[tokio::test]
async fn full_channel_rejects_without_blocking() {
    // Workers never started, so the channel can only fill up.
    let (proc, _store) = processor(ProcessorConfig {
        channel_capacity: 4,
        ..config()
    });
    for i in 0..4 {
        proc.process_ticker(ticker_at(i)).await.unwrap();
    }
    let err = proc.process_ticker(ticker_at(5)).await.unwrap_err();
    assert!(matches!(err, MdsError::ChannelFull { .. }));
    assert_eq!(proc.stats().errors, 1);
}

#[tokio::test]
async fn invalid_record_rejected_before_enqueue() {
    let (proc, _store) = processor(config());
    let mut bad = ticker_at(0);
    bad.price = 0.0;
    assert!(proc.process_ticker(bad).await.unwrap_err().is_invalid_input());
    assert_eq!(proc.utilization()[0].0, 0);
}

#[tokio::test]
async fn health_fails_when_a_channel_is_nearly_full() {
    let (proc, _store) = processor(ProcessorConfig {
        channel_capacity: 10,
        ..config()
    });
    assert!(proc.health().is_ok());
    for i in 0..10 {
        proc.process_ticker(ticker_at(i)).await.unwrap();
    }
    assert!(proc.health().is_err());
}

#[tokio::test]
async fn close_drains_pending_records() {
    let (proc, store) = processor(ProcessorConfig {
        flush_interval_ms: 3_600_000, // only the shutdown path may flush
        ..config()
    });
    for i in 0..30 {
        proc.process_ticker(ticker_at(i)).await.unwrap();
    }
    proc.start();
    // Give workers a moment to pick up the queue, then close.
    tokio::time::sleep(Duration::from_millis(50)).await;
    proc.close().await;
    assert_eq!(
        store.get_tickers(&TickerFilter::default()).await.unwrap().len(),
        30
    );
}

#[tokio::test]
async fn priority_buffering_widens_ticker_channel() {
    let (proc, _store) = processor(ProcessorConfig {
        channel_capacity: 8,
        priority_buffering: true,
        ..config()
    });
    let [(_, ticker_cap), (_, candle_cap), _] = proc.utilization();
    assert_eq!(ticker_cap, 16);
    assert_eq!(candle_cap, 8);
}
