// =============================================================================
// Exchange connectors — one normalized surface over heterogeneous venues
// =============================================================================
//
// Each venue implements `Connector` with its own signer, endpoints, wire
// schema and field mapping. Shared plumbing (caches, feed handle, logging
// span) lives in `ConnectorCore`, which every connector owns exactly once.
// =============================================================================

pub mod binance;
pub mod bitmex;
pub mod rest;
pub mod signer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, info_span, warn, Span};

use crate::market_data::{
    AggregatorRegistry, Candle, CandleAggregator, FeedSettings, FeedSinks, FeedState, PriceCache,
    StreamProtocol, Subscriptions, WebSocketFeed,
};
use crate::types::{Balance, BidAsk, Channel, Contract, Exchange, OrderRequest, OrderStatus, Timeframe};

pub use binance::BinanceConnector;
pub use bitmex::BitmexConnector;
pub use rest::{HttpMethod, RestClient};
pub use signer::{Credentials, ExpirySigner, Params, QuerySigner, RequestSigner};

/// REST and WebSocket base URLs of one deployment (mainnet, testnet, mock).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub rest: String,
    pub ws: String,
}

/// Tunables shared by every connector.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorOptions {
    pub rest_timeout: Duration,
    pub feed: FeedSettings,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            rest_timeout: Duration::from_secs(10),
            feed: FeedSettings::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// Connector trait
// -----------------------------------------------------------------------------

/// Normalized operations against one exchange.
///
/// REST operations never return errors: a failed call is logged and yields an
/// empty collection or `None`.
#[async_trait]
pub trait Connector: Send + Sync {
    fn core(&self) -> &ConnectorCore;

    fn exchange(&self) -> Exchange {
        self.core().exchange()
    }

    /// Last fetched contract map.
    fn contracts(&self) -> HashMap<String, Contract> {
        self.core().contracts.read().clone()
    }

    fn contract(&self, symbol: &str) -> Option<Contract> {
        self.core().contracts.read().get(symbol).cloned()
    }

    /// Last fetched balances, keyed by asset.
    fn balances(&self) -> HashMap<String, Balance> {
        self.core().balances.read().clone()
    }

    /// Latest cached bid/ask, from either the stream or a REST poll.
    fn price(&self, symbol: &str) -> Option<BidAsk> {
        self.core().prices.get(symbol)
    }

    fn prices(&self) -> Arc<PriceCache> {
        self.core().prices.clone()
    }

    /// Fetch the tradable contracts and replace the cached map.
    async fn get_contracts(&self) -> HashMap<String, Contract>;

    /// Fetch margin balances and replace the cached map.
    async fn get_balances(&self) -> HashMap<String, Balance>;

    /// Poll best bid/ask over REST; a result is also written to the cache.
    async fn get_bid_ask(&self, contract: &Contract) -> Option<BidAsk>;

    /// Up to `limit` most recent candles, oldest first.
    async fn get_historical_candles(
        &self,
        contract: &Contract,
        timeframe: Timeframe,
        limit: u32,
    ) -> Vec<Candle>;

    /// Submit an order with price and quantity snapped to the contract grid.
    async fn place_order(&self, order: &OrderRequest) -> Option<OrderStatus>;

    async fn cancel_order(&self, contract: &Contract, order_id: &str) -> Option<OrderStatus>;

    async fn get_order_status(&self, contract: &Contract, order_id: &str) -> Option<OrderStatus>;

    /// Add the contracts to the stream subscription set. Returns how many
    /// (symbol, channel) pairs were new.
    fn subscribe(&self, contracts: &[Contract], channel: Channel) -> usize {
        let symbols: Vec<String> = contracts.iter().map(|c| c.symbol.clone()).collect();
        self.core().feed.subscribe(&symbols, channel)
    }

    /// Route live trades of the aggregator's symbol into it.
    fn register_aggregator(&self, aggregator: Arc<CandleAggregator>) {
        self.core().aggregators.register(aggregator);
    }

    fn feed_state(&self) -> FeedState {
        self.core().feed.state()
    }

    /// Stop the stream for good. REST operations keep working.
    async fn shutdown(&self) {
        info!(parent: self.core().span(), "shutting down stream");
        self.core().feed.shutdown().await;
    }
}

// -----------------------------------------------------------------------------
// ConnectorCore
// -----------------------------------------------------------------------------

/// State every connector carries regardless of venue.
pub struct ConnectorCore {
    exchange: Exchange,
    rest: RestClient,
    contracts: RwLock<HashMap<String, Contract>>,
    balances: RwLock<HashMap<String, Balance>>,
    prices: Arc<PriceCache>,
    aggregators: Arc<AggregatorRegistry>,
    subscriptions: Arc<Subscriptions>,
    feed: WebSocketFeed,
    span: Span,
}

impl ConnectorCore {
    /// Build the REST client and spawn the stream task.
    pub fn new(
        exchange: Exchange,
        rest_url: &str,
        signer: Arc<dyn RequestSigner>,
        protocol: Arc<dyn StreamProtocol>,
        options: &ConnectorOptions,
    ) -> Result<Self, crate::error::ConnectorError> {
        let span = info_span!("connector", exchange = %exchange);
        let rest = RestClient::new(exchange, rest_url, signer, options.rest_timeout)?
            .with_span(span.clone());

        let prices = Arc::new(PriceCache::new());
        let aggregators = Arc::new(AggregatorRegistry::new());
        let subscriptions = Arc::new(Subscriptions::new());
        let feed = WebSocketFeed::spawn(
            protocol,
            FeedSinks::new(prices.clone(), aggregators.clone()),
            subscriptions.clone(),
            options.feed,
            span.clone(),
        );

        Ok(Self {
            exchange,
            rest,
            contracts: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            prices,
            aggregators,
            subscriptions,
            feed,
            span,
        })
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }

    pub fn replace_contracts(&self, contracts: HashMap<String, Contract>) {
        info!(parent: &self.span, count = contracts.len(), "contracts loaded");
        *self.contracts.write() = contracts;
    }

    pub fn replace_balances(&self, balances: HashMap<String, Balance>) {
        info!(parent: &self.span, assets = balances.len(), "balances loaded");
        *self.balances.write() = balances;
    }
}

impl std::fmt::Debug for ConnectorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorCore")
            .field("exchange", &self.exchange)
            .field("rest", &self.rest)
            .field("feed_state", &self.feed.state())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Field-mapping helpers shared by the venue modules
// -----------------------------------------------------------------------------

/// Parse a JSON value that may be either a decimal string or a number.
pub(crate) fn parse_str_f64(val: &Value, name: &str) -> Result<f64> {
    match val {
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        Value::Null => anyhow::bail!("missing field {name}"),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Order ids arrive as numbers on some venues and strings on others.
pub(crate) fn parse_id(val: &Value, name: &str) -> Result<String> {
    match val {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => anyhow::bail!("missing field {name}"),
    }
}

pub(crate) fn parse_str<'a>(val: &'a Value, name: &str) -> Result<&'a str> {
    val.as_str()
        .with_context(|| format!("missing field {name}"))
}

/// Map every raw instrument with `parse`, dropping (and logging) entries that
/// fail to parse or whose tick / lot size is not positive.
pub(crate) fn collect_contracts(
    span: &Span,
    entries: &[Value],
    parse: impl Fn(&Value) -> Result<Contract>,
) -> HashMap<String, Contract> {
    let mut contracts = HashMap::with_capacity(entries.len());
    for entry in entries {
        match parse(entry) {
            Ok(c) if c.tick_size > 0.0 && c.lot_size > 0.0 => {
                contracts.insert(c.symbol.clone(), c);
            }
            Ok(c) => warn!(
                parent: span,
                symbol = %c.symbol,
                tick_size = c.tick_size,
                lot_size = c.lot_size,
                "dropping contract with non-positive step"
            ),
            Err(e) => warn!(parent: span, error = %e, "skipping malformed contract entry"),
        }
    }
    contracts
}
