//! Instrument reference data and ingestion subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::market::{InstrumentType, MarketType};

/// Precisions above this are rejected by the validator.
pub const MAX_PRECISION: u8 = 18;

/// Primitive record families a subscription can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Ticker,
    Candle,
    #[serde(rename = "orderbook")]
    OrderBook,
}

impl DataType {
    pub const ALL: [DataType; 3] = [DataType::Ticker, DataType::Candle, DataType::OrderBook];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Ticker => "ticker",
            DataType::Candle => "candle",
            DataType::OrderBook => "orderbook",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a tradable instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    /// Required unless `instrument_type` is `stock`.
    #[serde(default)]
    pub base_asset: String,
    #[serde(default)]
    pub quote_asset: String,
    #[serde(rename = "type")]
    pub instrument_type: InstrumentType,
    pub market: MarketType,
    pub price_precision: u8,
    pub quantity_precision: u8,
    #[serde(default)]
    pub min_price: f64,
    #[serde(default)]
    pub max_price: f64,
    #[serde(default)]
    pub min_quantity: f64,
    #[serde(default)]
    pub max_quantity: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Declaration that the system ingests a given (symbol, type, market,
/// data-types) from one broker from `start_date` onward.
///
/// Owned by the subscription manager; the metadata store is the source of
/// truth and the in-memory index mirrors it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSubscription {
    #[serde(default)]
    pub id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub instrument_type: InstrumentType,
    pub market: MarketType,
    pub data_types: Vec<DataType>,
    pub broker_id: String,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl InstrumentSubscription {
    pub fn new(
        symbol: impl Into<String>,
        instrument_type: InstrumentType,
        market: MarketType,
        data_types: Vec<DataType>,
        broker_id: impl Into<String>,
        start_date: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            instrument_type,
            market,
            data_types,
            broker_id: broker_id.into(),
            start_date,
            is_active: false,
            settings: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn wants(&self, data_type: DataType) -> bool {
        self.data_types.contains(&data_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn data_type_codes() {
        assert_eq!(serde_json::to_string(&DataType::OrderBook).unwrap(), "\"orderbook\"");
        assert_eq!(serde_json::to_string(&DataType::Ticker).unwrap(), "\"ticker\"");
        let back: DataType = serde_json::from_str("\"candle\"").unwrap();
        assert_eq!(back, DataType::Candle);
    }

    #[test]
    fn subscription_round_trip() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut sub = InstrumentSubscription::new(
            "BTCUSDT",
            InstrumentType::Spot,
            MarketType::Spot,
            vec![DataType::Ticker, DataType::Candle],
            "b1",
            start,
        );
        sub.settings
            .insert("timeframe".into(), serde_json::json!("1m"));
        let json = serde_json::to_string(&sub).unwrap();
        let back: InstrumentSubscription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sub);
        assert!(back.wants(DataType::Ticker));
        assert!(!back.wants(DataType::OrderBook));
    }
}
