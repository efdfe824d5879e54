pub mod candle_aggregator;
pub mod feed;
pub mod price_cache;

pub use candle_aggregator::{AggregatorRegistry, Candle, CandleAggregator, IngestOutcome};
pub use feed::{
    FeedSettings, FeedSinks, FeedState, StreamEvent, StreamProtocol, Subscriptions, WebSocketFeed,
};
pub use price_cache::PriceCache;
