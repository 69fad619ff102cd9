//! Broker registry: id to adapter, with lifecycle bounded by membership.
//!
//! Writers take the map lock only on add/remove. Per-id operation guards
//! serialize connect-style operations so the reconnect loop can never
//! interleave with an in-progress add for the same broker.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::BrokerSection;
use crate::error::{MdsError, MdsResult};

use super::mock::MockBrokerAdapter;
use super::{BrokerAdapter, BrokerConfig};

pub struct BrokerRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn BrokerAdapter>>>,
    op_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    defaults: BrokerSection,
}

impl BrokerRegistry {
    pub fn new(defaults: BrokerSection) -> Arc<Self> {
        Arc::new(Self {
            adapters: RwLock::new(HashMap::new()),
            op_guards: Mutex::new(HashMap::new()),
            defaults,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.defaults.connection.timeout_ms)
    }

    /// Construct the adapter named by `config` and register it.
    /// Fails with `AlreadyExists` when the id is taken.
    pub fn add(&self, config: &BrokerConfig) -> MdsResult<Arc<dyn BrokerAdapter>> {
        if config.id.is_empty() {
            return Err(MdsError::not_found("broker config without id"));
        }
        let adapter = self.build_adapter(config)?;
        self.insert(adapter)
    }

    /// Register an already-built adapter (tests plug custom ones in here).
    pub fn insert(&self, adapter: Arc<dyn BrokerAdapter>) -> MdsResult<Arc<dyn BrokerAdapter>> {
        let id = adapter.id().to_string();
        let mut adapters = self.adapters.write();
        if adapters.contains_key(&id) {
            return Err(MdsError::already_exists(format!("broker {id}")));
        }
        adapters.insert(id.clone(), Arc::clone(&adapter));
        info!(broker_id = %id, "broker registered");
        Ok(adapter)
    }

    /// Stop the adapter and drop it from the registry.
    pub async fn remove(&self, id: &str) -> MdsResult<()> {
        let adapter = self
            .adapters
            .write()
            .remove(id)
            .ok_or_else(|| MdsError::not_found(format!("broker {id}")))?;
        if let Err(err) = adapter.disconnect().await {
            warn!(broker_id = %id, error = %err, "disconnect on removal failed");
        }
        self.op_guards.lock().remove(id);
        info!(broker_id = %id, "broker removed");
        Ok(())
    }

    pub fn get(&self, id: &str) -> MdsResult<Arc<dyn BrokerAdapter>> {
        self.adapters
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| MdsError::not_found(format!("broker {id}")))
    }

    pub fn all(&self) -> Vec<Arc<dyn BrokerAdapter>> {
        self.adapters.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    /// Connect every registered adapter. Errors are collected per broker,
    /// not short-circuited.
    pub async fn start_all(&self) -> HashMap<String, MdsError> {
        let timeout = self.connect_timeout();
        let mut failures = HashMap::new();
        for adapter in self.all() {
            if adapter.is_connected() {
                continue;
            }
            if let Err(err) = adapter.connect(timeout).await {
                warn!(broker_id = %adapter.id(), error = %err, "connect failed");
                failures.insert(adapter.id().to_string(), err);
            }
        }
        failures
    }

    pub async fn stop_all(&self) {
        for adapter in self.all() {
            if let Err(err) = adapter.disconnect().await {
                warn!(broker_id = %adapter.id(), error = %err, "disconnect failed");
            }
        }
    }

    /// Per-broker health; `None` means healthy.
    pub fn health(&self) -> HashMap<String, Option<String>> {
        self.adapters
            .read()
            .iter()
            .map(|(id, adapter)| (id.clone(), adapter.health().err().map(|e| e.to_string())))
            .collect()
    }

    /// Guard serializing connect/reconnect/add operations for one broker id.
    pub fn op_guard(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.op_guards
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn build_adapter(&self, config: &BrokerConfig) -> MdsResult<Arc<dyn BrokerAdapter>> {
        match config.adapter.as_str() {
            "mock" | "" => Ok(MockBrokerAdapter::from_config(
                config,
                self.defaults.defaults.buffer_size,
            )),
            other => Err(MdsError::not_supported(format!("adapter kind {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> BrokerConfig {
        BrokerConfig {
            id: id.into(),
            name: format!("mock {id}"),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn add_rejects_duplicate_ids() {
        let registry = BrokerRegistry::new(BrokerSection::default());
        registry.add(&config("b1")).unwrap();
        assert!(matches!(
            registry.add(&config("b1")),
            Err(MdsError::AlreadyExists { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_stops_and_deletes() {
        let registry = BrokerRegistry::new(BrokerSection::default());
        let adapter = registry.add(&config("b1")).unwrap();
        adapter.connect(Duration::from_secs(1)).await.unwrap();
        assert!(adapter.is_connected());

        registry.remove("b1").await.unwrap();
        assert!(!adapter.is_connected());
        assert!(registry.get("b1").is_err());
        assert!(matches!(
            registry.remove("b1").await,
            Err(MdsError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn start_all_and_health() {
        let registry = BrokerRegistry::new(BrokerSection::default());
        registry.add(&config("b1")).unwrap();
        registry.add(&config("b2")).unwrap();

        let health = registry.health();
        assert!(health.values().all(|h| h.is_some())); // not connected yet

        let failures = registry.start_all().await;
        assert!(failures.is_empty());
        let health = registry.health();
        assert!(health.values().all(|h| h.is_none()));

        registry.stop_all().await;
        assert!(registry.health().values().all(|h| h.is_some()));
    }

    #[tokio::test]
    async fn unknown_adapter_kind_refused() {
        let registry = BrokerRegistry::new(BrokerSection::default());
        let mut cfg = config("b1");
        cfg.adapter = "binance".into();
        assert!(matches!(
            registry.add(&cfg),
            Err(MdsError::NotSupported { .. })
        ));
    }
}
