//! Data pipeline: supervises the broker registry and the storage
//! integration.
//!
//! Owns the two background loops: a periodic health check and, when
//! enabled, a reconnect sweep that brings dropped adapters back and
//! re-registers their worker triples. Connect-style operations for one
//! broker id are serialized through the registry's per-id guard, so a
//! reconnect can never interleave with an in-flight add for the same id.

pub mod integration;

#[cfg(test)]
mod pipeline_tests;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::registry::BrokerRegistry;
use crate::broker::{BrokerAdapter, BrokerConfig};
use crate::error::MdsResult;
use crate::models::InstrumentSubscription;

use integration::BrokerStorageIntegration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub auto_connect_brokers: bool,
    pub auto_reconnect: bool,
    pub health_check_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    /// Deadline for one connect-and-register attempt.
    pub operation_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_connect_brokers: true,
            auto_reconnect: true,
            health_check_interval_ms: 30_000,
            reconnect_interval_ms: 5_000,
            operation_timeout_ms: 10_000,
        }
    }
}

/// Aggregated pipeline health; `healthy` is the conjunction of every
/// component check.
#[derive(Debug, Clone)]
pub struct PipelineHealth {
    pub healthy: bool,
    pub integration: Option<String>,
    pub brokers: HashMap<String, Option<String>>,
}

pub struct DataPipeline {
    registry: Arc<BrokerRegistry>,
    integration: Arc<BrokerStorageIntegration>,
    config: PipelineConfig,
    reconnect_errors: AtomicU64,
    shutdown_tx: SyncMutex<Option<watch::Sender<bool>>>,
    loops: SyncMutex<Vec<JoinHandle<()>>>,
}

impl DataPipeline {
    pub fn new(
        registry: Arc<BrokerRegistry>,
        integration: Arc<BrokerStorageIntegration>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            integration,
            config,
            reconnect_errors: AtomicU64::new(0),
            shutdown_tx: SyncMutex::new(None),
            loops: SyncMutex::new(Vec::new()),
        })
    }

    /// Connect pre-registered brokers (when configured) and launch the
    /// background loops. Idempotent.
    pub async fn start(self: &Arc<Self>) -> MdsResult<()> {
        let rx = {
            let mut guard = self.shutdown_tx.lock();
            if guard.is_some() {
                return Ok(());
            }
            let (tx, rx) = watch::channel(false);
            *guard = Some(tx);
            rx
        };

        if self.config.auto_connect_brokers {
            for adapter in self.registry.all() {
                if adapter.is_connected() {
                    continue;
                }
                if let Err(err) = self.attach(Arc::clone(&adapter)).await {
                    warn!(broker_id = %adapter.id(), error = %err, "startup connect failed");
                }
            }
        }

        let mut loops = self.loops.lock();
        loops.push(tokio::spawn(Arc::clone(self).health_loop(rx.clone())));
        if self.config.auto_reconnect {
            loops.push(tokio::spawn(Arc::clone(self).reconnect_loop(rx)));
        }
        info!("data pipeline started");
        Ok(())
    }

    /// Cancel the loops, then stop the integration workers.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }
        self.integration.stop().await;
        info!("data pipeline stopped");
    }

    /// Register, connect and integrate a new broker. When the connect or
    /// the integration step fails the broker stays registered (the
    /// reconnect loop will retry) and the error is returned.
    pub async fn add_broker(&self, config: &BrokerConfig) -> MdsResult<()> {
        let guard = self.registry.op_guard(&config.id);
        let _g = guard.lock().await;

        let adapter = self.registry.add(config)?;
        self.attach(adapter).await
    }

    /// Like `add_broker`, for an adapter built outside the registry's
    /// factory (custom implementations, test fixtures).
    pub async fn add_adapter(&self, adapter: Arc<dyn BrokerAdapter>) -> MdsResult<()> {
        let guard = self.registry.op_guard(adapter.id());
        let _g = guard.lock().await;

        let adapter = self.registry.insert(adapter)?;
        self.attach(adapter).await
    }

    /// Remove a broker: integration first (best effort), then registry.
    pub async fn remove_broker(&self, broker_id: &str) -> MdsResult<()> {
        if let Err(err) = self.integration.unregister_broker(broker_id).await {
            debug!(broker_id = %broker_id, error = %err, "no integration to stop");
        }
        self.registry.remove(broker_id).await
    }

    pub async fn subscribe(
        &self,
        broker_id: &str,
        subs: &[InstrumentSubscription],
    ) -> MdsResult<()> {
        self.registry.get(broker_id)?.subscribe(subs).await
    }

    pub async fn unsubscribe(
        &self,
        broker_id: &str,
        subs: &[InstrumentSubscription],
    ) -> MdsResult<()> {
        self.registry.get(broker_id)?.unsubscribe(subs).await
    }

    pub fn registry(&self) -> Arc<BrokerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn integration(&self) -> Arc<BrokerStorageIntegration> {
        Arc::clone(&self.integration)
    }

    /// Brokers currently connected at their adapters.
    pub fn connected_brokers(&self) -> usize {
        self.registry
            .all()
            .iter()
            .filter(|a| a.is_connected())
            .count()
    }

    pub fn reconnect_errors(&self) -> u64 {
        self.reconnect_errors.load(Ordering::Relaxed)
    }

    pub async fn health(&self) -> PipelineHealth {
        let integration = self.integration.health().await.err().map(|e| e.to_string());
        let brokers = self.registry.health();
        let healthy = integration.is_none() && brokers.values().all(|h| h.is_none());
        PipelineHealth {
            healthy,
            integration,
            brokers,
        }
    }

    /// Connect (if needed) and register the adapter with the integration.
    async fn attach(&self, adapter: Arc<dyn BrokerAdapter>) -> MdsResult<()> {
        adapter.connect(self.registry.connect_timeout()).await?;
        self.integration.register_broker(adapter).await
    }

    async fn health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.health_check_interval_ms.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {
                    let health = self.health().await;
                    if health.healthy {
                        debug!(connected = self.connected_brokers(), "pipeline healthy");
                    } else {
                        warn!(
                            integration = ?health.integration,
                            brokers = ?health.brokers,
                            "pipeline unhealthy"
                        );
                    }
                }
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.reconnect_interval_ms.max(1));
        let op_deadline = Duration::from_millis(self.config.operation_timeout_ms.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {
                    for adapter in self.registry.all() {
                        if adapter.is_connected() {
                            continue;
                        }
                        let guard = self.registry.op_guard(adapter.id());
                        let _g = guard.lock().await;
                        if adapter.is_connected() {
                            continue;
                        }
                        match timeout(op_deadline, self.attach(Arc::clone(&adapter))).await {
                            Ok(Ok(())) => {
                                info!(broker_id = %adapter.id(), "broker reconnected");
                            }
                            Ok(Err(err)) => {
                                self.reconnect_errors.fetch_add(1, Ordering::Relaxed);
                                warn!(broker_id = %adapter.id(), error = %err, "reconnect failed");
                            }
                            Err(_) => {
                                self.reconnect_errors.fetch_add(1, Ordering::Relaxed);
                                warn!(broker_id = %adapter.id(), "reconnect timed out");
                            }
                        }
                    }
                }
            }
        }
    }
}
