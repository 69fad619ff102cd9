//! Core data model shared across the ingestion pipeline and storage layers.

pub mod filters;
pub mod instrument;
pub mod market;

pub use filters::{CandleFilter, OrderBookFilter, TickerFilter};
pub use instrument::{DataType, InstrumentInfo, InstrumentSubscription, MAX_PRECISION};
pub use market::{
    Candle, InstrumentType, MarketType, OrderBook, PriceLevel, Ticker, Timeframe, MAX_BOOK_DEPTH,
};
