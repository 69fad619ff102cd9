//! Historical query filters.
//!
//! Empty symbol/broker lists mean "no constraint on that dimension".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::market::Timeframe;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickerFilter {
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub broker_ids: Vec<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandleFilter {
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub broker_ids: Vec<String>,
    #[serde(default)]
    pub timeframes: Vec<Timeframe>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookFilter {
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub broker_ids: Vec<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl TickerFilter {
    pub fn for_pair(broker_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            symbols: vec![symbol.into()],
            broker_ids: vec![broker_id.into()],
            ..Self::default()
        }
    }
}

impl CandleFilter {
    pub fn for_pair(broker_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            symbols: vec![symbol.into()],
            broker_ids: vec![broker_id.into()],
            ..Self::default()
        }
    }
}

impl OrderBookFilter {
    pub fn for_pair(broker_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            symbols: vec![symbol.into()],
            broker_ids: vec![broker_id.into()],
            ..Self::default()
        }
    }
}
