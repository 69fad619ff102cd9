//! Application configuration.
//!
//! Loaded from a TOML file (`--config <path>`), with `.env` / environment
//! overrides applied on top. Every section has working defaults so the
//! binary starts with no file at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerConfig;
use crate::pipeline::integration::IntegrationConfig;
use crate::pipeline::PipelineConfig;
use crate::recovery::RecoveryConfig;
use crate::storage::processor::ProcessorConfig;
use crate::storage::service::StorageServiceConfig;
use crate::validator::ValidatorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default tracing filter; `RUST_LOG` wins when set.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Sqlite file backing both the time-series and metadata stores.
    /// `:memory:` is accepted for throwaway runs.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./mdstore.db".into(),
        }
    }
}

/// Connection policy applied to every adapter unless its own config says
/// otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterDefaults {
    /// Adapter-internal stream buffer capacity (drop-oldest on overflow).
    pub buffer_size: usize,
    pub batch_size: usize,
}

impl Default for AdapterDefaults {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterLimits {
    pub max_subscriptions: usize,
    pub requests_per_sec: u32,
    pub requests_per_min: u32,
}

impl Default for AdapterLimits {
    fn default() -> Self {
        Self {
            max_subscriptions: 100,
            requests_per_sec: 10,
            requests_per_min: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub connection: ConnectionConfig,
    pub defaults: AdapterDefaults,
    pub limits: AdapterLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Budget for the final flush once SIGINT/SIGTERM lands.
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerSection,
    /// Brokers added to the pipeline at startup.
    pub brokers: Vec<BrokerConfig>,
    pub pipeline: PipelineConfig,
    pub integration: IntegrationConfig,
    pub storage: StorageServiceConfig,
    pub processor: ProcessorConfig,
    pub validator: ValidatorConfig,
    pub recovery: RecoveryConfig,
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        let mut cfg: AppConfig =
            toml::from_str(&raw).with_context(|| format!("failed to parse config file: {path}"))?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("MDSTORE_DATABASE_PATH") {
            self.database.path = path;
        }
        if let Ok(level) = std::env::var("MDSTORE_LOG_LEVEL") {
            self.log.level = level;
        }
    }
}
