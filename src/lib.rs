//! Market-data ingestion and storage backend.
//!
//! Multiplexes live streams from several broker adapters into a unified
//! pipeline that validates, batches and persists tickers, candles and
//! order book snapshots, serves filtered historical queries, and detects
//! and backfills gaps in collected history.
//!
//! Data flow: adapter stream -> per-broker worker (stamps `broker_id`) ->
//! buffered storage service or channel-fed processor -> durable store.
//! Control flow: the pipeline supervises the registry and the integration
//! workers; the subscription manager pushes desired subscriptions through
//! the pipeline to the adapters.

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod recovery;
pub mod storage;
pub mod subscription;
pub mod validator;

pub use config::AppConfig;
pub use error::{MdsError, MdsResult, ValidationError};
