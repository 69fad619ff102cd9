use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::integration::{BrokerStorageIntegration, IntegrationConfig};
use super::{DataPipeline, PipelineConfig};
use crate::broker::mock::{MockAdapterOptions, MockBrokerAdapter};
use crate::broker::registry::BrokerRegistry;
use crate::broker::{BrokerAdapter, BrokerConfig, BrokerKind};
use crate::config::BrokerSection;
use crate::models::{InstrumentType, MarketType, Ticker, TickerFilter};
use crate::storage::service::{StorageService, StorageServiceConfig};
use crate::storage::sqlite::SqliteTimeSeriesStorage;
use crate::storage::TimeSeriesStorage;
use crate::validator::{Validator, ValidatorConfig};

struct Stack {
    store: Arc<SqliteTimeSeriesStorage>,
    service: Arc<StorageService>,
    integration: Arc<BrokerStorageIntegration>,
    registry: Arc<BrokerRegistry>,
    pipeline: Arc<DataPipeline>,
}

fn stack(pipeline_config: PipelineConfig) -> Stack {
    let store = Arc::new(SqliteTimeSeriesStorage::open_memory().unwrap());
    let service = StorageService::new(
        store.clone(),
        Arc::new(Validator::new(ValidatorConfig::default())),
        StorageServiceConfig {
            batch_size: 10_000,
            flush_interval_ms: 3_600_000,
            flush_timeout_ms: 5_000,
        },
    );
    let integration = BrokerStorageIntegration::new(service.clone(), IntegrationConfig::default());
    let registry = BrokerRegistry::new(BrokerSection::default());
    let pipeline = DataPipeline::new(registry.clone(), integration.clone(), pipeline_config);
    Stack {
        store,
        service,
        integration,
        registry,
        pipeline,
    }
}

fn quiet_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        auto_connect_brokers: false,
        auto_reconnect: false,
        health_check_interval_ms: 3_600_000,
        reconnect_interval_ms: 3_600_000,
        operation_timeout_ms: 5_000,
    }
}

fn manual_adapter(id: &str) -> Arc<MockBrokerAdapter> {
    MockBrokerAdapter::new(
        id,
        format!("mock {id}"),
        BrokerKind::Crypto,
        MockAdapterOptions {
            tick_interval: Duration::ZERO,
            ..MockAdapterOptions::default()
        },
    )
}

fn unstamped_ticker(price: f64, offset_ms: i64) -> Ticker {
    Ticker::new(
        "BTCUSDT",
        price,
        1.0,
        MarketType::Spot,
        InstrumentType::Spot,
        Utc::now() + chrono::Duration::milliseconds(offset_ms - 10_000),
    )
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_buffered(service: &Arc<StorageService>, want: usize) {
    for _ in 0..200 {
        if service.buffered().await.0 == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {want} buffered records");
}

#[tokio::test]
async fn records_are_stamped_with_the_integration_broker_id() {
    let s = stack(quiet_pipeline_config());
    let adapter = manual_adapter("b1");
    s.pipeline.add_adapter(adapter.clone()).await.unwrap();

    // Adapter leaves broker_id empty; the worker must fill it.
    adapter.inject_ticker(unstamped_ticker(50_000.0, 0)).unwrap();

    wait_for_buffered(&s.service, 1).await;

    s.service.flush_all().await.unwrap();
    let stored = s.store.get_tickers(&TickerFilter::default()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].broker_id, "b1");

    s.pipeline.stop().await;
}

#[tokio::test]
async fn per_broker_order_is_preserved_to_the_store() {
    let s = stack(quiet_pipeline_config());
    let adapter = manual_adapter("b1");
    s.pipeline.add_adapter(adapter.clone()).await.unwrap();

    for i in 0..25 {
        adapter
            .inject_ticker(unstamped_ticker(50_000.0 + i as f64 * 0.5, i))
            .unwrap();
    }
    wait_for_buffered(&s.service, 25).await;
    s.service.flush_all().await.unwrap();

    let stored = s
        .store
        .get_tickers(&TickerFilter::for_pair("b1", "BTCUSDT"))
        .await
        .unwrap();
    let prices: Vec<f64> = stored.iter().map(|t| t.price).collect();
    let expected: Vec<f64> = (0..25).map(|i| 50_000.0 + i as f64 * 0.5).collect();
    assert_eq!(prices, expected);

    s.pipeline.stop().await;
}

#[tokio::test]
async fn invalid_records_bump_error_counters_and_are_dropped() {
    let s = stack(quiet_pipeline_config());
    let adapter = manual_adapter("b1");
    s.pipeline.add_adapter(adapter.clone()).await.unwrap();

    adapter.inject_ticker(unstamped_ticker(50_000.0, 0)).unwrap();
    // 100% move against the 50% anomaly ceiling.
    adapter.inject_ticker(unstamped_ticker(100_000.0, 1)).unwrap();

    let integration = s.integration.clone();
    wait_for("error counter", || integration.stats().errors == 1).await;
    assert_eq!(s.integration.stats().tickers, 1);

    s.service.flush_all().await.unwrap();
    let stored = s.store.get_tickers(&TickerFilter::default()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].price, 50_000.0);

    s.pipeline.stop().await;
}

#[tokio::test]
async fn reconnect_loop_restores_a_dropped_broker() {
    let s = stack(PipelineConfig {
        auto_connect_brokers: false,
        auto_reconnect: true,
        health_check_interval_ms: 3_600_000,
        reconnect_interval_ms: 50,
        operation_timeout_ms: 5_000,
    });
    let adapter = manual_adapter("b2");
    s.pipeline.add_adapter(adapter.clone()).await.unwrap();
    s.pipeline.start().await.unwrap();
    assert_eq!(s.pipeline.connected_brokers(), 1);

    adapter.simulate_connection_loss();
    assert_eq!(s.pipeline.connected_brokers(), 0);

    let probe = adapter.clone();
    wait_for("reconnect", || probe.is_connected()).await;
    assert_eq!(s.pipeline.connected_brokers(), 1);
    assert!(s.integration.is_registered("b2").await);

    // The fresh streams feed the replacement workers.
    adapter.inject_ticker(unstamped_ticker(50_000.0, 0)).unwrap();
    wait_for_buffered(&s.service, 1).await;

    s.pipeline.stop().await;
}

#[tokio::test]
async fn concurrent_add_broker_with_distinct_ids_all_succeed() {
    let s = stack(quiet_pipeline_config());

    let mut tasks = Vec::new();
    for i in 0..5 {
        let pipeline = s.pipeline.clone();
        tasks.push(tokio::spawn(async move {
            let cfg = BrokerConfig {
                id: format!("b{i}"),
                name: format!("mock b{i}"),
                settings: [(
                    "tick_interval_ms".to_string(),
                    serde_json::json!(0),
                )]
                .into_iter()
                .collect(),
                ..BrokerConfig::default()
            };
            pipeline.add_broker(&cfg).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(s.registry.len(), 5);
    assert_eq!(s.pipeline.connected_brokers(), 5);
    assert_eq!(s.integration.active_brokers().await.len(), 5);

    let health = s.pipeline.health().await;
    assert!(health.healthy, "unexpected health: {health:?}");

    s.pipeline.stop().await;
}

#[tokio::test]
async fn duplicate_add_broker_fails_cleanly() {
    let s = stack(quiet_pipeline_config());
    let cfg = BrokerConfig {
        id: "b1".into(),
        settings: [("tick_interval_ms".to_string(), serde_json::json!(0))]
            .into_iter()
            .collect(),
        ..BrokerConfig::default()
    };
    s.pipeline.add_broker(&cfg).await.unwrap();
    assert!(s.pipeline.add_broker(&cfg).await.is_err());
    assert_eq!(s.pipeline.connected_brokers(), 1);
    s.pipeline.stop().await;
}

#[tokio::test]
async fn remove_broker_unregisters_and_disconnects() {
    let s = stack(quiet_pipeline_config());
    let adapter = manual_adapter("b1");
    s.pipeline.add_adapter(adapter.clone()).await.unwrap();
    assert!(s.integration.is_registered("b1").await);

    s.pipeline.remove_broker("b1").await.unwrap();
    assert!(!s.integration.is_registered("b1").await);
    assert!(!adapter.is_connected());
    assert_eq!(s.pipeline.connected_brokers(), 0);
    assert!(s.registry.get("b1").is_err());
}

#[tokio::test]
async fn health_requires_at_least_one_integration() {
    let s = stack(quiet_pipeline_config());
    let health = s.pipeline.health().await;
    assert!(!health.healthy);
    assert!(health.integration.is_some());

    let adapter = manual_adapter("b1");
    s.pipeline.add_adapter(adapter).await.unwrap();
    let health = s.pipeline.health().await;
    assert!(health.healthy);

    s.pipeline.stop().await;
}

#[tokio::test]
async fn subscribe_delegates_to_the_adapter() {
    let s = stack(quiet_pipeline_config());
    let adapter = manual_adapter("b1");
    s.pipeline.add_adapter(adapter.clone()).await.unwrap();

    let sub = crate::models::InstrumentSubscription::new(
        "BTCUSDT",
        InstrumentType::Spot,
        MarketType::Spot,
        vec![crate::models::DataType::Ticker],
        "b1",
        Utc::now() - chrono::Duration::days(1),
    );
    s.pipeline.subscribe("b1", &[sub.clone()]).await.unwrap();
    assert_eq!(adapter.subscription_count(), 1);
    s.pipeline.unsubscribe("b1", &[sub]).await.unwrap();
    assert_eq!(adapter.subscription_count(), 0);

    assert!(s.pipeline.subscribe("nope", &[]).await.is_err());
    s.pipeline.stop().await;
}
