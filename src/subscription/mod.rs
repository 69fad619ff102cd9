//! Subscription and instrument management.
//!
//! The metadata store is the single source of truth; an in-memory index
//! mirrors it for hot-path reads. All mutations go through this manager,
//! and tracking state changes are pushed to the adapters via the pipeline
//! before they are persisted.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{MdsError, MdsResult};
use crate::models::{InstrumentInfo, InstrumentSubscription};
use crate::pipeline::DataPipeline;
use crate::storage::MetadataStorage;
use crate::validator::Validator;

pub struct InstrumentManager {
    metadata: Arc<dyn MetadataStorage>,
    pipeline: Arc<DataPipeline>,
    validator: Arc<Validator>,
    index: RwLock<HashMap<String, InstrumentSubscription>>,
}

impl InstrumentManager {
    pub fn new(
        metadata: Arc<dyn MetadataStorage>,
        pipeline: Arc<DataPipeline>,
        validator: Arc<Validator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            pipeline,
            validator,
            index: RwLock::new(HashMap::new()),
        })
    }

    /// Load every stored subscription into the index.
    pub async fn start(&self) -> MdsResult<()> {
        let subs = self.metadata.list_subscriptions().await?;
        let mut index = self.index.write();
        index.clear();
        for sub in subs {
            index.insert(sub.id.clone(), sub);
        }
        info!(count = index.len(), "subscription index loaded");
        Ok(())
    }

    /// Push every active subscription back to its adapter; used at startup
    /// after brokers are connected.
    pub async fn resume_active(&self) -> MdsResult<()> {
        let active: Vec<InstrumentSubscription> = self
            .index
            .read()
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        for sub in active {
            if let Err(err) = self.pipeline.subscribe(&sub.broker_id, &[sub.clone()]).await {
                warn!(
                    subscription_id = %sub.id,
                    broker_id = %sub.broker_id,
                    error = %err,
                    "failed to resume tracking"
                );
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    pub async fn add_instrument(&self, info: &InstrumentInfo) -> MdsResult<()> {
        self.validator.validate_instrument(info)?;
        self.metadata.save_instrument(info).await
    }

    pub async fn get_instrument(&self, symbol: &str) -> MdsResult<Option<InstrumentInfo>> {
        self.metadata.get_instrument(symbol).await
    }

    pub async fn list_instruments(&self) -> MdsResult<Vec<InstrumentInfo>> {
        self.metadata.list_instruments().await
    }

    pub async fn delete_instrument(&self, symbol: &str) -> MdsResult<()> {
        self.metadata.delete_instrument(symbol).await
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Validate, check the referenced instrument exists, persist, index.
    pub async fn add_subscription(
        &self,
        mut sub: InstrumentSubscription,
    ) -> MdsResult<InstrumentSubscription> {
        self.validator.validate_subscription(&sub)?;
        if self.metadata.get_instrument(&sub.symbol).await?.is_none() {
            return Err(MdsError::not_found(format!("instrument {}", sub.symbol)));
        }
        if sub.id.is_empty() {
            sub.id = uuid::Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        sub.created_at = now;
        sub.updated_at = now;

        self.metadata.save_subscription(&sub).await?;
        self.index.write().insert(sub.id.clone(), sub.clone());
        info!(subscription_id = %sub.id, symbol = %sub.symbol, "subscription added");
        Ok(sub)
    }

    pub async fn update_subscription(&self, mut sub: InstrumentSubscription) -> MdsResult<()> {
        self.validator.validate_subscription(&sub)?;
        sub.updated_at = Utc::now();
        self.metadata.update_subscription(&sub).await?;
        self.index.write().insert(sub.id.clone(), sub);
        Ok(())
    }

    /// Stop tracking first when active, then delete from store and index.
    pub async fn remove_subscription(&self, id: &str) -> MdsResult<()> {
        let sub = self
            .get_subscription(id)
            .await?
            .ok_or_else(|| MdsError::not_found(format!("subscription {id}")))?;
        if sub.is_active {
            self.stop_tracking(id).await?;
        }
        self.metadata.delete_subscription(id).await?;
        self.index.write().remove(id);
        info!(subscription_id = %id, "subscription removed");
        Ok(())
    }

    /// Index-first read; on miss the store is consulted and the index
    /// back-filled.
    pub async fn get_subscription(&self, id: &str) -> MdsResult<Option<InstrumentSubscription>> {
        if let Some(sub) = self.index.read().get(id) {
            return Ok(Some(sub.clone()));
        }
        match self.metadata.get_subscription(id).await? {
            Some(sub) => {
                self.index.write().insert(sub.id.clone(), sub.clone());
                Ok(Some(sub))
            }
            None => Ok(None),
        }
    }

    pub async fn list_subscriptions(&self) -> MdsResult<Vec<InstrumentSubscription>> {
        self.metadata.list_subscriptions().await
    }

    /// Subscribe at the broker, then flip and persist `is_active`.
    pub async fn start_tracking(&self, id: &str) -> MdsResult<()> {
        let mut sub = self
            .get_subscription(id)
            .await?
            .ok_or_else(|| MdsError::not_found(format!("subscription {id}")))?;
        if sub.is_active {
            return Ok(());
        }
        self.pipeline.subscribe(&sub.broker_id, &[sub.clone()]).await?;
        sub.is_active = true;
        sub.updated_at = Utc::now();
        self.metadata.update_subscription(&sub).await?;
        self.index.write().insert(sub.id.clone(), sub);
        info!(subscription_id = %id, "tracking started");
        Ok(())
    }

    pub async fn stop_tracking(&self, id: &str) -> MdsResult<()> {
        let mut sub = self
            .get_subscription(id)
            .await?
            .ok_or_else(|| MdsError::not_found(format!("subscription {id}")))?;
        if !sub.is_active {
            return Ok(());
        }
        self.pipeline
            .unsubscribe(&sub.broker_id, &[sub.clone()])
            .await?;
        sub.is_active = false;
        sub.updated_at = Utc::now();
        self.metadata.update_subscription(&sub).await?;
        self.index.write().insert(sub.id.clone(), sub);
        info!(subscription_id = %id, "tracking stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{MockAdapterOptions, MockBrokerAdapter};
    use crate::broker::registry::BrokerRegistry;
    use crate::broker::BrokerKind;
    use crate::config::BrokerSection;
    use crate::models::{DataType, InstrumentType, MarketType};
    use crate::pipeline::integration::{BrokerStorageIntegration, IntegrationConfig};
    use crate::pipeline::PipelineConfig;
    use crate::storage::service::{StorageService, StorageServiceConfig};
    use crate::storage::sqlite::{SqliteMetadataStorage, SqliteTimeSeriesStorage};
    use crate::validator::ValidatorConfig;
    use std::time::Duration;

    struct Fixture {
        manager: Arc<InstrumentManager>,
        metadata: Arc<SqliteMetadataStorage>,
        adapter: Arc<MockBrokerAdapter>,
        pipeline: Arc<DataPipeline>,
    }

    async fn fixture() -> Fixture {
        let metadata = Arc::new(SqliteMetadataStorage::open_memory().unwrap());
        let store = Arc::new(SqliteTimeSeriesStorage::open_memory().unwrap());
        let validator = Arc::new(Validator::new(ValidatorConfig::default()));
        let service = StorageService::new(
            store,
            validator.clone(),
            StorageServiceConfig::default(),
        );
        let integration =
            BrokerStorageIntegration::new(service, IntegrationConfig::default());
        let registry = BrokerRegistry::new(BrokerSection::default());
        let pipeline = DataPipeline::new(
            registry,
            integration,
            PipelineConfig {
                auto_connect_brokers: false,
                auto_reconnect: false,
                ..PipelineConfig::default()
            },
        );
        let adapter = MockBrokerAdapter::new(
            "b1",
            "mock",
            BrokerKind::Crypto,
            MockAdapterOptions {
                tick_interval: Duration::ZERO,
                ..MockAdapterOptions::default()
            },
        );
        pipeline.add_adapter(adapter.clone()).await.unwrap();

        let manager = InstrumentManager::new(metadata.clone(), pipeline.clone(), validator);
        Fixture {
            manager,
            metadata,
            adapter,
            pipeline,
        }
    }

    fn instrument() -> InstrumentInfo {
        InstrumentInfo {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            instrument_type: InstrumentType::Spot,
            market: MarketType::Spot,
            price_precision: 2,
            quantity_precision: 8,
            min_price: 0.01,
            max_price: 0.0,
            min_quantity: 0.0001,
            max_quantity: 0.0,
            is_active: true,
        }
    }

    fn subscription() -> InstrumentSubscription {
        InstrumentSubscription::new(
            "BTCUSDT",
            InstrumentType::Spot,
            MarketType::Spot,
            vec![DataType::Ticker, DataType::Candle],
            "b1",
            Utc::now() - chrono::Duration::days(1),
        )
    }

    #[tokio::test]
    async fn subscription_requires_existing_instrument() {
        let f = fixture().await;
        let err = f.manager.add_subscription(subscription()).await.unwrap_err();
        assert!(matches!(err, MdsError::NotFound { .. }));

        f.manager.add_instrument(&instrument()).await.unwrap();
        let sub = f.manager.add_subscription(subscription()).await.unwrap();
        assert!(!sub.id.is_empty());
        assert_eq!(
            f.metadata.get_subscription(&sub.id).await.unwrap().unwrap().symbol,
            "BTCUSDT"
        );
    }

    #[tokio::test]
    async fn tracking_flips_active_flag_and_reaches_the_adapter() {
        let f = fixture().await;
        f.manager.add_instrument(&instrument()).await.unwrap();
        let sub = f.manager.add_subscription(subscription()).await.unwrap();
        assert!(!sub.is_active);

        f.manager.start_tracking(&sub.id).await.unwrap();
        assert_eq!(f.adapter.subscription_count(), 1);
        let stored = f
            .metadata
            .get_subscription(&sub.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_active);

        // Idempotent.
        f.manager.start_tracking(&sub.id).await.unwrap();
        assert_eq!(f.adapter.subscription_count(), 1);

        f.manager.stop_tracking(&sub.id).await.unwrap();
        assert_eq!(f.adapter.subscription_count(), 0);
        assert!(!f
            .metadata
            .get_subscription(&sub.id)
            .await
            .unwrap()
            .unwrap()
            .is_active);
    }

    #[tokio::test]
    async fn remove_active_subscription_stops_tracking_first() {
        let f = fixture().await;
        f.manager.add_instrument(&instrument()).await.unwrap();
        let sub = f.manager.add_subscription(subscription()).await.unwrap();
        f.manager.start_tracking(&sub.id).await.unwrap();

        f.manager.remove_subscription(&sub.id).await.unwrap();
        assert_eq!(f.adapter.subscription_count(), 0);
        assert!(f.metadata.get_subscription(&sub.id).await.unwrap().is_none());
        assert!(f.manager.get_subscription(&sub.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_populates_index_from_store_on_miss() {
        let f = fixture().await;
        // Written behind the manager's back.
        let sub = subscription();
        f.metadata.save_subscription(&sub).await.unwrap();

        let loaded = f.manager.get_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, sub.id);
    }

    #[tokio::test]
    async fn start_loads_index_and_resume_pushes_active_subs() {
        let f = fixture().await;
        f.manager.add_instrument(&instrument()).await.unwrap();
        let mut sub = subscription();
        sub.is_active = true;
        f.metadata.save_subscription(&sub).await.unwrap();

        f.manager.start().await.unwrap();
        f.manager.resume_active().await.unwrap();
        assert_eq!(f.adapter.subscription_count(), 1);

        f.pipeline.stop().await;
    }

    #[tokio::test]
    async fn invalid_subscription_rejected() {
        let f = fixture().await;
        f.manager.add_instrument(&instrument()).await.unwrap();
        let mut sub = subscription();
        sub.data_types.clear();
        assert!(f
            .manager
            .add_subscription(sub)
            .await
            .unwrap_err()
            .is_invalid_input());
    }
}
