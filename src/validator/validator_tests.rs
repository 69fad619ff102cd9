use chrono::{Duration, Utc};

use super::*;
use crate::models::{
    Candle, DataType, InstrumentInfo, InstrumentSubscription, InstrumentType, MarketType,
    OrderBook, PriceLevel, Ticker, Timeframe,
};

fn validator() -> Validator {
    Validator::new(ValidatorConfig::default())
}

fn ticker(symbol: &str, price: f64) -> Ticker {
    let mut t = Ticker::new(
        symbol,
        price,
        1.0,
        MarketType::Spot,
        InstrumentType::Spot,
        Utc::now(),
    );
    t.broker_id = "b1".into();
    t
}

fn candle(close: f64) -> Candle {
    Candle {
        symbol: "BTCUSDT".into(),
        open: close * 0.99,
        high: close * 1.01,
        low: close * 0.98,
        close,
        volume: 10.0,
        timeframe: Timeframe::M1,
        timestamp: Utc::now(),
        broker_id: "b1".into(),
        trades: 5,
        quote_volume: 100.0,
        open_interest: 0.0,
    }
}

fn book(bid: f64, ask: f64) -> OrderBook {
    OrderBook {
        symbol: "BTCUSDT".into(),
        bids: vec![PriceLevel::new(bid, 1.0)],
        asks: vec![PriceLevel::new(ask, 1.0)],
        market: MarketType::Spot,
        instrument_type: InstrumentType::Spot,
        timestamp: Utc::now(),
        broker_id: "b1".into(),
    }
}

#[test]
fn accepts_valid_ticker() {
    assert!(validator().validate_ticker(&ticker("BTCUSDT", 50000.0)).is_ok());
}

#[test]
fn rejects_non_positive_price() {
    let v = validator();
    let mut t = ticker("BTCUSDT", 0.0);
    assert!(matches!(
        v.validate_ticker(&t),
        Err(ValidationError::NonPositive { field: "price", .. })
    ));
    t.price = -1.0;
    assert!(v.validate_ticker(&t).is_err());
}

#[test]
fn rejects_negative_volume() {
    let v = validator();
    let mut t = ticker("BTCUSDT", 100.0);
    t.volume = -0.5;
    assert!(matches!(
        v.validate_ticker(&t),
        Err(ValidationError::Negative { field: "volume", .. })
    ));
}

#[test]
fn rejects_empty_symbol() {
    assert!(matches!(
        validator().validate_ticker(&ticker("", 1.0)),
        Err(ValidationError::EmptySymbol)
    ));
}

#[test]
fn stock_bid_must_be_below_ask() {
    let v = validator();
    let mut t = ticker("AAPL", 200.0);
    t.instrument_type = InstrumentType::Stock;
    t.market = MarketType::Stock;
    t.bid = Some(201.0);
    t.ask = Some(200.5);
    assert!(matches!(
        v.validate_ticker(&t),
        Err(ValidationError::BidAskInverted { .. })
    ));
    t.bid = Some(199.0);
    assert!(v.validate_ticker(&t).is_ok());
}

#[test]
fn price_must_sit_inside_daily_range() {
    let v = validator();
    let mut t = ticker("BTCUSDT", 60000.0);
    t.high_24h = Some(55000.0);
    t.low_24h = Some(48000.0);
    assert!(matches!(
        v.validate_ticker(&t),
        Err(ValidationError::OutsideDailyRange { .. })
    ));
}

#[test]
fn rejects_future_and_ancient_timestamps() {
    let v = validator();
    let mut t = ticker("BTCUSDT", 100.0);
    t.timestamp = Utc::now() + Duration::minutes(6);
    assert!(matches!(
        v.validate_ticker(&t),
        Err(ValidationError::TimestampInFuture { .. })
    ));
    t.timestamp = Utc::now() - Duration::days(366);
    assert!(matches!(
        v.validate_ticker(&t),
        Err(ValidationError::TimestampTooOld { .. })
    ));
    // Just inside both bounds.
    t.timestamp = Utc::now() + Duration::minutes(4);
    assert!(v.validate_ticker(&t).is_ok());
}

#[test]
fn anomaly_rejection_matches_deviation_threshold() {
    let v = validator();
    assert!(v.validate_ticker(&ticker("BTCUSDT", 50000.0)).is_ok());

    // 100% jump against a 50% ceiling.
    let spike = ticker("BTCUSDT", 100000.0);
    assert!(matches!(
        v.validate_ticker(&spike),
        Err(ValidationError::Anomaly { .. })
    ));

    // Last accepted price is still 50000, so a 40% move passes.
    assert!(v.validate_ticker(&ticker("BTCUSDT", 70000.0)).is_ok());

    let stats = v.stats();
    assert_eq!(stats.anomalies, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.validated, 2);
}

#[test]
fn anomaly_tracking_is_per_broker_and_symbol() {
    let v = validator();
    assert!(v.validate_ticker(&ticker("BTCUSDT", 50000.0)).is_ok());

    let mut other_broker = ticker("BTCUSDT", 100000.0);
    other_broker.broker_id = "b2".into();
    assert!(v.validate_ticker(&other_broker).is_ok());

    assert!(v.validate_ticker(&ticker("ETHUSDT", 3000.0)).is_ok());
}

#[test]
fn anomaly_detection_can_be_disabled_at_runtime() {
    let v = validator();
    assert!(v.validate_ticker(&ticker("BTCUSDT", 50000.0)).is_ok());

    v.set_config(ValidatorConfig {
        anomaly_detection: false,
        ..ValidatorConfig::default()
    });
    assert!(v.validate_ticker(&ticker("BTCUSDT", 500000.0)).is_ok());
}

#[test]
fn volume_spike_rejected() {
    let v = validator();
    let mut t = ticker("BTCUSDT", 100.0);
    t.volume = 1.0;
    assert!(v.validate_ticker(&t).is_ok());

    let mut spike = ticker("BTCUSDT", 101.0);
    spike.volume = 50.0; // > 10x previous
    assert!(matches!(
        v.validate_ticker(&spike),
        Err(ValidationError::VolumeSpike { .. })
    ));
}

#[test]
fn duplicate_ticker_rejected_until_cleared() {
    let v = validator();
    let t = ticker("BTCUSDT", 50000.0);
    assert!(v.validate_ticker(&t).is_ok());
    assert!(matches!(
        v.validate_ticker(&t),
        Err(ValidationError::Duplicate { .. })
    ));
    assert_eq!(v.stats().duplicates, 1);

    v.clear_tracking();
    assert!(v.validate_ticker(&t).is_ok());
}

#[test]
fn candle_identity_includes_timeframe() {
    let v = validator();
    let c = candle(50000.0);
    assert!(v.validate_candle(&c).is_ok());

    let mut other_tf = c.clone();
    other_tf.timeframe = Timeframe::M5;
    assert!(v.validate_candle(&other_tf).is_ok());

    assert!(matches!(
        v.validate_candle(&c),
        Err(ValidationError::Duplicate { .. })
    ));
}

#[test]
fn ohlc_ordering_enforced() {
    let v = validator();
    let mut c = candle(100.0);
    c.low = 99.5; // above open (99.0)
    assert!(matches!(
        v.validate_candle(&c),
        Err(ValidationError::OhlcOutOfOrder { .. })
    ));

    let mut c2 = candle(100.0);
    c2.high = 99.9; // below close
    assert!(v.validate_candle(&c2).is_err());

    assert!(v.validate_candle(&candle(100.0)).is_ok());
}

#[test]
fn candle_requires_positive_ohlc() {
    let v = validator();
    let mut c = candle(100.0);
    c.low = 0.0;
    assert!(matches!(
        v.validate_candle(&c),
        Err(ValidationError::NonPositive { .. })
    ));
}

#[test]
fn crossed_book_rejected() {
    let v = validator();
    assert!(v.validate_order_book(&book(100.0, 101.0)).is_ok());
    assert!(matches!(
        v.validate_order_book(&book(101.0, 100.0)),
        Err(ValidationError::CrossedBook { .. })
    ));
    // Equal is crossed too.
    let mut b = book(100.0, 100.0);
    b.timestamp = Utc::now();
    assert!(v.validate_order_book(&b).is_err());
}

#[test]
fn one_sided_book_is_fine() {
    let v = validator();
    let mut b = book(100.0, 101.0);
    b.asks.clear();
    assert!(v.validate_order_book(&b).is_ok());
}

#[test]
fn book_depth_capped() {
    let v = validator();
    let mut b = book(100.0, 101.0);
    b.bids = (0..=MAX_BOOK_DEPTH)
        .map(|i| PriceLevel::new(100.0 - i as f64 * 0.01, 1.0))
        .collect();
    assert!(matches!(
        v.validate_order_book(&b),
        Err(ValidationError::TooManyLevels { side: "bid", .. })
    ));
}

#[test]
fn book_level_fields_positive() {
    let v = validator();
    let mut b = book(100.0, 101.0);
    b.asks[0].quantity = 0.0;
    assert!(v.validate_order_book(&b).is_err());
}

#[test]
fn instrument_asset_requirements() {
    let v = validator();
    let mut info = InstrumentInfo {
        symbol: "BTCUSDT".into(),
        base_asset: "BTC".into(),
        quote_asset: "USDT".into(),
        instrument_type: InstrumentType::Spot,
        market: MarketType::Spot,
        price_precision: 2,
        quantity_precision: 8,
        min_price: 0.01,
        max_price: 1_000_000.0,
        min_quantity: 0.0001,
        max_quantity: 1000.0,
        is_active: true,
    };
    assert!(v.validate_instrument(&info).is_ok());

    info.base_asset.clear();
    assert!(matches!(
        v.validate_instrument(&info),
        Err(ValidationError::MissingField { field: "base_asset" })
    ));

    // Stocks get a pass on base/quote assets.
    info.instrument_type = InstrumentType::Stock;
    info.quote_asset.clear();
    assert!(v.validate_instrument(&info).is_ok());

    info.price_precision = 19;
    assert!(matches!(
        v.validate_instrument(&info),
        Err(ValidationError::PrecisionOutOfRange { .. })
    ));
    info.price_precision = 2;

    info.min_price = 10.0;
    info.max_price = 5.0;
    assert!(matches!(
        v.validate_instrument(&info),
        Err(ValidationError::BoundsInverted { field: "price", .. })
    ));
    // max == 0 means unbounded.
    info.max_price = 0.0;
    assert!(v.validate_instrument(&info).is_ok());
}

#[test]
fn subscription_checks() {
    let v = validator();
    let mut sub = InstrumentSubscription::new(
        "BTCUSDT",
        InstrumentType::Spot,
        MarketType::Spot,
        vec![DataType::Ticker],
        "b1",
        Utc::now() - Duration::days(1),
    );
    assert!(v.validate_subscription(&sub).is_ok());

    sub.data_types.clear();
    assert!(matches!(
        v.validate_subscription(&sub),
        Err(ValidationError::EmptyDataTypes)
    ));
    sub.data_types.push(DataType::Candle);

    sub.start_date = chrono::DateTime::from_timestamp_millis(0).unwrap();
    assert!(matches!(
        v.validate_subscription(&sub),
        Err(ValidationError::ZeroStartDate)
    ));
    sub.start_date = Utc::now();

    sub.broker_id.clear();
    assert!(matches!(
        v.validate_subscription(&sub),
        Err(ValidationError::MissingField { field: "broker_id" })
    ));
}
