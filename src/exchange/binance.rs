// =============================================================================
// Binance USDⓈ-M Futures connector
// =============================================================================
//
// REST:   https://fapi.binance.com            (testnet.binancefuture.com)
// Stream: wss://fstream.binance.com/ws        (stream.binancefuture.com/ws)
//
// Numeric fields arrive as decimal strings. Signed endpoints use the query
// signature scheme (`QuerySigner`).
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::rest::HttpMethod;
use super::signer::{Credentials, Params, QuerySigner};
use super::{
    collect_contracts, parse_id, parse_str, parse_str_f64, Connector, ConnectorCore,
    ConnectorOptions, Endpoints,
};
use crate::error::ConnectorError;
use crate::market_data::{Candle, StreamEvent, StreamProtocol};
use crate::types::{
    decimals_for_step, Balance, BidAsk, Channel, Contract, Exchange, OrderRequest, OrderSide,
    OrderStatus, OrderType, TimeInForce, Timeframe,
};

const MAINNET_REST: &str = "https://fapi.binance.com";
const MAINNET_WS: &str = "wss://fstream.binance.com/ws";
const TESTNET_REST: &str = "https://testnet.binancefuture.com";
const TESTNET_WS: &str = "wss://stream.binancefuture.com/ws";

pub struct BinanceConnector {
    core: ConnectorCore,
}

impl BinanceConnector {
    pub fn endpoints(testnet: bool) -> Endpoints {
        if testnet {
            Endpoints {
                rest: TESTNET_REST.into(),
                ws: TESTNET_WS.into(),
            }
        } else {
            Endpoints {
                rest: MAINNET_REST.into(),
                ws: MAINNET_WS.into(),
            }
        }
    }

    pub async fn connect(
        credentials: Credentials,
        testnet: bool,
        options: &ConnectorOptions,
    ) -> Result<Self, ConnectorError> {
        Self::connect_to(Self::endpoints(testnet), credentials, options).await
    }

    /// Build the connector against explicit endpoints, load contracts and
    /// balances once and start the stream.
    pub async fn connect_to(
        endpoints: Endpoints,
        credentials: Credentials,
        options: &ConnectorOptions,
    ) -> Result<Self, ConnectorError> {
        let core = ConnectorCore::new(
            Exchange::Binance,
            &endpoints.rest,
            Arc::new(QuerySigner::new(credentials)),
            Arc::new(BinanceStream::new(endpoints.ws.clone())),
            options,
        )?;
        let connector = Self { core };

        connector.get_contracts().await;
        connector.get_balances().await;

        info!(
            parent: connector.core.span(),
            rest = %endpoints.rest,
            ws = %endpoints.ws,
            "Binance futures connector initialised"
        );
        Ok(connector)
    }
}

#[async_trait]
impl Connector for BinanceConnector {
    fn core(&self) -> &ConnectorCore {
        &self.core
    }

    #[instrument(skip(self), name = "binance::get_contracts")]
    async fn get_contracts(&self) -> HashMap<String, Contract> {
        let Some(body) = self
            .core
            .rest()
            .request(HttpMethod::Get, "/fapi/v1/exchangeInfo", Params::new())
            .await
        else {
            return HashMap::new();
        };

        let entries = body["symbols"].as_array().cloned().unwrap_or_default();
        let contracts = collect_contracts(self.core.span(), &entries, parse_contract);
        self.core.replace_contracts(contracts.clone());
        contracts
    }

    #[instrument(skip(self), name = "binance::get_balances")]
    async fn get_balances(&self) -> HashMap<String, Balance> {
        let Some(body) = self
            .core
            .rest()
            .signed_request(HttpMethod::Get, "/fapi/v1/account", Params::new())
            .await
        else {
            return HashMap::new();
        };

        let mut balances = HashMap::new();
        for asset in body["assets"].as_array().map(Vec::as_slice).unwrap_or_default() {
            match parse_balance(asset) {
                Ok((name, balance)) => {
                    balances.insert(name, balance);
                }
                Err(e) => warn!(error = %e, "skipping malformed asset entry"),
            }
        }
        self.core.replace_balances(balances.clone());
        balances
    }

    #[instrument(skip(self, contract), fields(symbol = %contract.symbol), name = "binance::get_bid_ask")]
    async fn get_bid_ask(&self, contract: &Contract) -> Option<BidAsk> {
        let body = self
            .core
            .rest()
            .request(
                HttpMethod::Get,
                "/fapi/v1/ticker/bookTicker",
                vec![("symbol".into(), contract.symbol.clone())],
            )
            .await?;

        let quote = match parse_book_ticker(&body) {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "malformed bookTicker response");
                return None;
            }
        };
        self.core.prices().set(&contract.symbol, quote);
        Some(quote)
    }

    #[instrument(skip(self, contract), fields(symbol = %contract.symbol), name = "binance::get_historical_candles")]
    async fn get_historical_candles(
        &self,
        contract: &Contract,
        timeframe: Timeframe,
        limit: u32,
    ) -> Vec<Candle> {
        let params = vec![
            ("symbol".into(), contract.symbol.clone()),
            ("interval".into(), timeframe.as_str().to_string()),
            ("limit".into(), limit.to_string()),
        ];
        let Some(body) = self
            .core
            .rest()
            .request(HttpMethod::Get, "/fapi/v1/klines", params)
            .await
        else {
            return Vec::new();
        };

        let raw = body.as_array().map(Vec::as_slice).unwrap_or_default();
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            match parse_kline(entry) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(error = %e, "skipping malformed kline entry"),
            }
        }
        debug!(count = candles.len(), "klines fetched");
        candles
    }

    #[instrument(skip(self, order), fields(symbol = %order.contract.symbol), name = "binance::place_order")]
    async fn place_order(&self, order: &OrderRequest) -> Option<OrderStatus> {
        let body = self
            .core
            .rest()
            .signed_request(HttpMethod::Post, "/fapi/v1/order", order_params(order))
            .await?;
        order_status_or_log(&body)
    }

    #[instrument(skip(self, contract), fields(symbol = %contract.symbol), name = "binance::cancel_order")]
    async fn cancel_order(&self, contract: &Contract, order_id: &str) -> Option<OrderStatus> {
        let body = self
            .core
            .rest()
            .signed_request(HttpMethod::Delete, "/fapi/v1/order", order_ref(contract, order_id))
            .await?;
        order_status_or_log(&body)
    }

    #[instrument(skip(self, contract), fields(symbol = %contract.symbol), name = "binance::get_order_status")]
    async fn get_order_status(&self, contract: &Contract, order_id: &str) -> Option<OrderStatus> {
        let body = self
            .core
            .rest()
            .signed_request(HttpMethod::Get, "/fapi/v1/order", order_ref(contract, order_id))
            .await?;
        order_status_or_log(&body)
    }
}

impl std::fmt::Debug for BinanceConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceConnector").field("core", &self.core).finish()
    }
}

// -----------------------------------------------------------------------------
// Wire mapping
// -----------------------------------------------------------------------------

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
    }
}

fn tif_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::GoodTillCancel => "GTC",
        TimeInForce::ImmediateOrCancel => "IOC",
        TimeInForce::FillOrKill => "FOK",
    }
}

fn order_params(order: &OrderRequest) -> Params {
    let contract = &order.contract;
    let mut params: Params = vec![
        ("symbol".into(), contract.symbol.clone()),
        ("side".into(), side_str(order.side).into()),
        ("quantity".into(), contract.format_quantity(order.quantity)),
        ("type".into(), type_str(order.order_type).into()),
    ];
    if let Some(price) = order.price {
        params.push(("price".into(), contract.format_price(price)));
    }
    if let Some(tif) = order.time_in_force {
        params.push(("timeInForce".into(), tif_str(tif).into()));
    }
    params
}

fn order_ref(contract: &Contract, order_id: &str) -> Params {
    vec![
        ("symbol".into(), contract.symbol.clone()),
        ("orderId".into(), order_id.to_string()),
    ]
}

/// Value of `key` inside the filter whose `filterType` is `filter_type`.
fn filter_value(entry: &Value, filter_type: &str, key: &str) -> Option<f64> {
    entry["filters"]
        .as_array()?
        .iter()
        .find(|f| f["filterType"].as_str() == Some(filter_type))
        .and_then(|f| parse_str_f64(&f[key], key).ok())
}

fn parse_contract(entry: &Value) -> Result<Contract> {
    let price_precision = entry["pricePrecision"]
        .as_u64()
        .context("missing field pricePrecision")? as u32;
    let quantity_precision = entry["quantityPrecision"]
        .as_u64()
        .context("missing field quantityPrecision")? as u32;

    let tick_size = filter_value(entry, "PRICE_FILTER", "tickSize")
        .unwrap_or_else(|| 10f64.powi(-(price_precision as i32)));
    let lot_size = filter_value(entry, "LOT_SIZE", "stepSize")
        .unwrap_or_else(|| 10f64.powi(-(quantity_precision as i32)));

    // The filters can be finer than the advertised precision; printing with
    // fewer decimals than the step would round a second time off the grid.
    let price_decimals = price_precision.max(decimals_for_step(tick_size));
    let quantity_decimals = quantity_precision.max(decimals_for_step(lot_size));

    Ok(Contract {
        symbol: parse_str(&entry["symbol"], "symbol")?.to_string(),
        base_asset: parse_str(&entry["baseAsset"], "baseAsset")?.to_string(),
        quote_asset: parse_str(&entry["quoteAsset"], "quoteAsset")?.to_string(),
        tick_size,
        lot_size,
        price_decimals,
        quantity_decimals,
        exchange: Exchange::Binance,
    })
}

fn parse_balance(asset: &Value) -> Result<(String, Balance)> {
    let name = parse_str(&asset["asset"], "asset")?.to_string();
    let balance = Balance {
        initial_margin: parse_str_f64(&asset["initialMargin"], "initialMargin")?,
        maintenance_margin: parse_str_f64(&asset["maintMargin"], "maintMargin")?,
        margin_balance: parse_str_f64(&asset["marginBalance"], "marginBalance")?,
        wallet_balance: parse_str_f64(&asset["walletBalance"], "walletBalance")?,
        unrealized_profit: parse_str_f64(&asset["unrealizedProfit"], "unrealizedProfit")?,
    };
    Ok((name, balance))
}

fn parse_book_ticker(body: &Value) -> Result<BidAsk> {
    Ok(BidAsk {
        bid: parse_str_f64(&body["bidPrice"], "bidPrice")?,
        ask: parse_str_f64(&body["askPrice"], "askPrice")?,
    })
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_kline(entry: &Value) -> Result<Candle> {
    let arr = entry.as_array().context("kline entry is not an array")?;
    if arr.len() < 6 {
        anyhow::bail!("kline entry has {} elements", arr.len());
    }
    Ok(Candle::new(
        arr[0].as_i64().context("missing kline open time")?,
        parse_str_f64(&arr[1], "open")?,
        parse_str_f64(&arr[2], "high")?,
        parse_str_f64(&arr[3], "low")?,
        parse_str_f64(&arr[4], "close")?,
        parse_str_f64(&arr[5], "volume")?,
    ))
}

fn parse_order_status(body: &Value) -> Result<OrderStatus> {
    Ok(OrderStatus {
        order_id: parse_id(&body["orderId"], "orderId")?,
        status: parse_str(&body["status"], "status")?.to_string(),
        avg_price: parse_str_f64(&body["avgPrice"], "avgPrice").unwrap_or(0.0),
    })
}

fn order_status_or_log(body: &Value) -> Option<OrderStatus> {
    match parse_order_status(body) {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(error = %e, body = %body, "unexpected order response");
            None
        }
    }
}

// -----------------------------------------------------------------------------
// Stream protocol
// -----------------------------------------------------------------------------

/// Raw `/ws` endpoint: JSON-RPC style SUBSCRIBE frames, events tagged by `"e"`.
pub struct BinanceStream {
    url: String,
    next_id: AtomicU64,
}

impl BinanceStream {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    fn stream_name(channel: Channel) -> &'static str {
        match channel {
            Channel::BookTicker => "bookTicker",
            Channel::Trades => "aggTrade",
        }
    }
}

impl StreamProtocol for BinanceStream {
    fn url(&self) -> &str {
        &self.url
    }

    fn subscribe_message(&self, symbols: &[String], channel: Channel) -> String {
        let params: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@{}", s.to_lowercase(), Self::stream_name(channel)))
            .collect();
        json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        })
        .to_string()
    }

    fn decode(&self, text: &str) -> Result<Vec<StreamEvent>> {
        let v: Value = serde_json::from_str(text).context("failed to parse stream JSON")?;

        let event = match v["e"].as_str() {
            Some("bookTicker") => StreamEvent::Quote {
                symbol: parse_str(&v["s"], "s")?.to_string(),
                bid: Some(parse_str_f64(&v["b"], "b")?),
                ask: Some(parse_str_f64(&v["a"], "a")?),
            },
            Some("aggTrade") | Some("trade") => StreamEvent::Trade {
                symbol: parse_str(&v["s"], "s")?.to_string(),
                price: parse_str_f64(&v["p"], "p")?,
                size: parse_str_f64(&v["q"], "q")?,
                timestamp: v["T"].as_i64().context("missing field T")?,
            },
            // Subscription acks ({"result":null,"id":1}) and other events.
            _ => return Ok(Vec::new()),
        };
        Ok(vec![event])
    }
}
