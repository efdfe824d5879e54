//! Aurora Connect: normalized REST and streaming access to crypto derivatives
//! exchanges, plus trade-to-candle aggregation for strategies.

pub mod error;
pub mod exchange;
pub mod market_data;
pub mod runtime_config;
pub mod strategy;
pub mod types;

pub use error::{ConnectorError, RestError};
pub use exchange::{BinanceConnector, BitmexConnector, Connector, ConnectorOptions, Credentials};
pub use market_data::{Candle, CandleAggregator, FeedState, IngestOutcome, PriceCache};
pub use runtime_config::RuntimeConfig;
pub use strategy::{Strategy, StrategyConfig, StrategyKind};
pub use types::{
    BidAsk, Channel, Contract, Exchange, OrderRequest, OrderSide, OrderStatus, OrderType,
    TimeInForce, Timeframe,
};
