// =============================================================================
// BitMEX connector
// =============================================================================
//
// REST:   https://www.bitmex.com/api/v1      (testnet.bitmex.com)
// Stream: wss://www.bitmex.com/realtime      (testnet.bitmex.com/realtime)
//
// Margin figures are integer satoshis (XBt); they are scaled to XBT here.
// Bucketed trades are stamped with the bucket END and are shifted back by
// one bucket so every `Candle` carries its start time.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::rest::HttpMethod;
use super::signer::{Credentials, ExpirySigner, Params};
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

const MAINNET_REST: &str = "https://www.bitmex.com";
const MAINNET_WS: &str = "wss://www.bitmex.com/realtime";
const TESTNET_REST: &str = "https://testnet.bitmex.com";
const TESTNET_WS: &str = "wss://testnet.bitmex.com/realtime";

/// XBt -> XBT.
const SATOSHI: f64 = 1e-8;

/// `binSize` of `/trade/bucketed`; BitMEX only buckets 1m, 5m, 1h (and 1d).
pub fn bin_size(timeframe: Timeframe) -> Option<&'static str> {
    match timeframe {
        Timeframe::M1 => Some("1m"),
        Timeframe::M5 => Some("5m"),
        Timeframe::H1 => Some("1h"),
        Timeframe::M15 | Timeframe::M30 | Timeframe::H4 => None,
    }
}

pub struct BitmexConnector {
    core: ConnectorCore,
}

impl BitmexConnector {
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

    pub async fn connect_to(
        endpoints: Endpoints,
        credentials: Credentials,
        options: &ConnectorOptions,
    ) -> Result<Self, ConnectorError> {
        let core = ConnectorCore::new(
            Exchange::Bitmex,
            &endpoints.rest,
            Arc::new(ExpirySigner::new(credentials)),
            Arc::new(BitmexStream::new(endpoints.ws.clone())),
            options,
        )?;
        let connector = Self { core };

        connector.get_contracts().await;
        connector.get_balances().await;

        info!(
            parent: connector.core.span(),
            rest = %endpoints.rest,
            ws = %endpoints.ws,
            "BitMEX connector initialised"
        );
        Ok(connector)
    }
}

#[async_trait]
impl Connector for BitmexConnector {
    fn core(&self) -> &ConnectorCore {
        &self.core
    }

    #[instrument(skip(self), name = "bitmex::get_contracts")]
    async fn get_contracts(&self) -> HashMap<String, Contract> {
        let Some(body) = self
            .core
            .rest()
            .request(HttpMethod::Get, "/api/v1/instrument/active", Params::new())
            .await
        else {
            return HashMap::new();
        };

        let entries = body.as_array().cloned().unwrap_or_default();
        let contracts = collect_contracts(self.core.span(), &entries, parse_contract);
        self.core.replace_contracts(contracts.clone());
        contracts
    }

    #[instrument(skip(self), name = "bitmex::get_balances")]
    async fn get_balances(&self) -> HashMap<String, Balance> {
        let Some(body) = self
            .core
            .rest()
            .signed_request(
                HttpMethod::Get,
                "/api/v1/user/margin",
                vec![("currency".into(), "all".into())],
            )
            .await
        else {
            return HashMap::new();
        };

        let mut balances = HashMap::new();
        for margin in body.as_array().map(Vec::as_slice).unwrap_or_default() {
            match parse_margin(margin) {
                Ok((currency, balance)) => {
                    balances.insert(currency, balance);
                }
                Err(e) => warn!(error = %e, "skipping malformed margin entry"),
            }
        }
        self.core.replace_balances(balances.clone());
        balances
    }

    #[instrument(skip(self, contract), fields(symbol = %contract.symbol), name = "bitmex::get_bid_ask")]
    async fn get_bid_ask(&self, contract: &Contract) -> Option<BidAsk> {
        let body = self
            .core
            .rest()
            .request(
                HttpMethod::Get,
                "/api/v1/instrument",
                vec![("symbol".into(), contract.symbol.clone())],
            )
            .await?;

        let quote = body
            .as_array()
            .and_then(|list| list.first())
            .context("empty instrument response")
            .and_then(|instrument| {
                Ok(BidAsk {
                    bid: parse_str_f64(&instrument["bidPrice"], "bidPrice")?,
                    ask: parse_str_f64(&instrument["askPrice"], "askPrice")?,
                })
            });
        match quote {
            Ok(quote) => {
                self.core.prices().set(&contract.symbol, quote);
                Some(quote)
            }
            Err(e) => {
                warn!(error = %e, "no bid/ask in instrument response");
                None
            }
        }
    }

    #[instrument(skip(self, contract), fields(symbol = %contract.symbol), name = "bitmex::get_historical_candles")]
    async fn get_historical_candles(
        &self,
        contract: &Contract,
        timeframe: Timeframe,
        limit: u32,
    ) -> Vec<Candle> {
        let Some(bin) = bin_size(timeframe) else {
            warn!(%timeframe, "timeframe not bucketed by BitMEX; no history");
            return Vec::new();
        };

        let params = vec![
            ("symbol".into(), contract.symbol.clone()),
            ("binSize".into(), bin.to_string()),
            ("count".into(), limit.to_string()),
            ("partial".into(), "true".into()),
            ("reverse".into(), "true".into()),
        ];
        let Some(body) = self
            .core
            .rest()
            .request(HttpMethod::Get, "/api/v1/trade/bucketed", params)
            .await
        else {
            return Vec::new();
        };

        let raw = body.as_array().map(Vec::as_slice).unwrap_or_default();
        let mut candles = Vec::with_capacity(raw.len());
        // reverse=true returns newest first.
        for entry in raw.iter().rev() {
            match parse_bucket(entry, timeframe.duration_ms()) {
                Ok(c) => candles.push(c),
                Err(e) => debug!(error = %e, "skipping bucket without trades"),
            }
        }
        debug!(count = candles.len(), "buckets fetched");
        candles
    }

    #[instrument(skip(self, order), fields(symbol = %order.contract.symbol), name = "bitmex::place_order")]
    async fn place_order(&self, order: &OrderRequest) -> Option<OrderStatus> {
        let body = self
            .core
            .rest()
            .signed_request(HttpMethod::Post, "/api/v1/order", order_params(order))
            .await?;
        order_status_or_log(&body)
    }

    #[instrument(skip(self, contract), fields(symbol = %contract.symbol), name = "bitmex::cancel_order")]
    async fn cancel_order(&self, contract: &Contract, order_id: &str) -> Option<OrderStatus> {
        let body = self
            .core
            .rest()
            .signed_request(
                HttpMethod::Delete,
                "/api/v1/order",
                vec![("orderID".into(), order_id.to_string())],
            )
            .await?;

        let Some(first) = body.as_array().and_then(|list| list.first()) else {
            warn!(order_id, "cancel returned no orders");
            return None;
        };
        order_status_or_log(first)
    }

    #[instrument(skip(self, contract), fields(symbol = %contract.symbol), name = "bitmex::get_order_status")]
    async fn get_order_status(&self, contract: &Contract, order_id: &str) -> Option<OrderStatus> {
        let params = vec![
            ("symbol".into(), contract.symbol.clone()),
            ("filter".into(), json!({ "orderID": order_id }).to_string()),
        ];
        let body = self
            .core
            .rest()
            .signed_request(HttpMethod::Get, "/api/v1/order", params)
            .await?;

        let Some(first) = body.as_array().and_then(|list| list.first()) else {
            warn!(order_id, "order not found");
            return None;
        };
        order_status_or_log(first)
    }
}

impl std::fmt::Debug for BitmexConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmexConnector").field("core", &self.core).finish()
    }
}

// -----------------------------------------------------------------------------
// Wire mapping
// -----------------------------------------------------------------------------

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

fn type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "Market",
        OrderType::Limit => "Limit",
    }
}

fn tif_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::GoodTillCancel => "GoodTillCancel",
        TimeInForce::ImmediateOrCancel => "ImmediateOrCancel",
        TimeInForce::FillOrKill => "FillOrKill",
    }
}

fn order_params(order: &OrderRequest) -> Params {
    let contract = &order.contract;
    let mut params: Params = vec![
        ("symbol".into(), contract.symbol.clone()),
        ("side".into(), side_str(order.side).into()),
        ("orderQty".into(), contract.format_quantity(order.quantity)),
        ("ordType".into(), type_str(order.order_type).into()),
    ];
    if let Some(price) = order.price {
        params.push(("price".into(), contract.format_price(price)));
    }
    if let Some(tif) = order.time_in_force {
        params.push(("timeInForce".into(), tif_str(tif).into()));
    }
    params
}

fn parse_timestamp_ms(val: &Value, name: &str) -> Result<i64> {
    let s = parse_str(val, name)?;
    let ts = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("failed to parse {name} as RFC 3339: {s}"))?;
    Ok(ts.timestamp_millis())
}

fn parse_contract(entry: &Value) -> Result<Contract> {
    let tick_size = parse_str_f64(&entry["tickSize"], "tickSize")?;
    let lot_size = parse_str_f64(&entry["lotSize"], "lotSize")?;
    Ok(Contract {
        symbol: parse_str(&entry["symbol"], "symbol")?.to_string(),
        base_asset: parse_str(&entry["rootSymbol"], "rootSymbol")?.to_string(),
        quote_asset: parse_str(&entry["quoteCurrency"], "quoteCurrency")?.to_string(),
        tick_size,
        lot_size,
        price_decimals: decimals_for_step(tick_size),
        quantity_decimals: decimals_for_step(lot_size),
        exchange: Exchange::Bitmex,
    })
}

fn parse_margin(margin: &Value) -> Result<(String, Balance)> {
    let xbt = |name: &str| -> Result<f64> { Ok(parse_str_f64(&margin[name], name)? * SATOSHI) };
    let currency = parse_str(&margin["currency"], "currency")?.to_string();
    let balance = Balance {
        initial_margin: xbt("initMargin")?,
        maintenance_margin: xbt("maintMargin")?,
        margin_balance: xbt("marginBalance")?,
        wallet_balance: xbt("walletBalance")?,
        unrealized_profit: xbt("unrealisedPnl")?,
    };
    Ok((currency, balance))
}

fn parse_bucket(entry: &Value, duration_ms: i64) -> Result<Candle> {
    let end = parse_timestamp_ms(&entry["timestamp"], "timestamp")?;
    Ok(Candle::new(
        end - duration_ms,
        parse_str_f64(&entry["open"], "open")?,
        parse_str_f64(&entry["high"], "high")?,
        parse_str_f64(&entry["low"], "low")?,
        parse_str_f64(&entry["close"], "close")?,
        parse_str_f64(&entry["volume"], "volume")?,
    ))
}

fn parse_order_status(body: &Value) -> Result<OrderStatus> {
    Ok(OrderStatus {
        order_id: parse_id(&body["orderID"], "orderID")?,
        status: parse_str(&body["ordStatus"], "ordStatus")?.to_string(),
        avg_price: parse_str_f64(&body["avgPx"], "avgPx").unwrap_or(0.0),
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

/// `/realtime` endpoint: `{"op":"subscribe"}` frames, data tagged by `"table"`.
pub struct BitmexStream {
    url: String,
}

impl BitmexStream {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn table(channel: Channel) -> &'static str {
        match channel {
            Channel::BookTicker => "instrument",
            Channel::Trades => "trade",
        }
    }

    fn rows(v: &Value) -> &[Value] {
        v["data"].as_array().map(Vec::as_slice).unwrap_or_default()
    }
}

impl StreamProtocol for BitmexStream {
    fn url(&self) -> &str {
        &self.url
    }

    fn subscribe_message(&self, symbols: &[String], channel: Channel) -> String {
        let args: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}:{s}", Self::table(channel)))
            .collect();
        json!({ "op": "subscribe", "args": args }).to_string()
    }

    fn decode(&self, text: &str) -> Result<Vec<StreamEvent>> {
        let v: Value = serde_json::from_str(text).context("failed to parse stream JSON")?;

        match v["table"].as_str() {
            // Partial and update rows only carry the fields that changed.
            Some("instrument") => {
                let mut events = Vec::new();
                for row in Self::rows(&v) {
                    let bid = row["bidPrice"].as_f64();
                    let ask = row["askPrice"].as_f64();
                    if bid.is_none() && ask.is_none() {
                        continue;
                    }
                    events.push(StreamEvent::Quote {
                        symbol: parse_str(&row["symbol"], "symbol")?.to_string(),
                        bid,
                        ask,
                    });
                }
                Ok(events)
            }
            Some("trade") => Self::rows(&v)
                .iter()
                .map(|row| -> Result<StreamEvent> {
                    Ok(StreamEvent::Trade {
                        symbol: parse_str(&row["symbol"], "symbol")?.to_string(),
                        price: parse_str_f64(&row["price"], "price")?,
                        size: parse_str_f64(&row["size"], "size")?,
                        timestamp: parse_timestamp_ms(&row["timestamp"], "timestamp")?,
                    })
                })
                .collect(),
            // Welcome banner ("info"), subscription acks ("success"), others.
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn connect(server: &MockServer) -> BitmexConnector {
        let endpoints = Endpoints {
            rest: server.uri(),
            ws: "ws://127.0.0.1:9".into(),
        };
        let options = ConnectorOptions {
            rest_timeout: Duration::from_secs(2),
            ..ConnectorOptions::default()
        };
        BitmexConnector::connect_to(endpoints, Credentials::new("key", "secret").unwrap(), &options)
            .await
            .unwrap()
    }

    fn xbtusd() -> Contract {
        Contract {
            symbol: "XBTUSD".into(),
            base_asset: "XBT".into(),
            quote_asset: "USD".into(),
            tick_size: 0.5,
            lot_size: 100.0,
            price_decimals: 1,
            quantity_decimals: 0,
            exchange: Exchange::Bitmex,
        }
    }

    #[tokio::test]
    async fn contracts_derive_decimals_from_steps() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/instrument/active"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "XBTUSD", "rootSymbol": "XBT", "quoteCurrency": "USD", "tickSize": 0.5, "lotSize": 100},
                {"symbol": "ETHUSD", "rootSymbol": "ETH", "quoteCurrency": "USD", "tickSize": 0.05, "lotSize": 1},
                {"symbol": "BROKEN", "rootSymbol": "BRK", "quoteCurrency": "USD", "tickSize": 0, "lotSize": 1}
            ])))
            .mount(&server)
            .await;

        let connector = connect(&server).await;
        let contracts = connector.contracts();
        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts["XBTUSD"], xbtusd());
        assert_eq!(contracts["ETHUSD"].price_decimals, 2);
    }

    #[tokio::test]
    async fn margins_are_converted_from_satoshi() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/user/margin"))
            .and(query_param("currency", "all"))
            .and(header_exists("api-signature"))
            .and(header_exists("api-expires"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "currency": "XBt",
                "initMargin": 150000000i64,
                "maintMargin": 2000000,
                "marginBalance": 100000000,
                "walletBalance": 99000000,
                "unrealisedPnl": -500000
            }])))
            .mount(&server)
            .await;

        let connector = connect(&server).await;
        let xbt = connector.balances()["XBt"].clone();
        assert!((xbt.initial_margin - 1.5).abs() < 1e-12);
        assert!((xbt.margin_balance - 1.0).abs() < 1e-12);
        assert!((xbt.unrealized_profit + 0.005).abs() < 1e-12);
    }

    #[tokio::test]
    async fn buckets_are_shifted_to_start_and_ordered_oldest_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/trade/bucketed"))
            .and(query_param("binSize", "1m"))
            .and(query_param("count", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"timestamp": "2024-01-01T00:03:00.000Z", "open": 3.0, "high": 3.0, "low": 3.0, "close": 3.0, "volume": 1},
                {"timestamp": "2024-01-01T00:02:00.000Z", "open": null, "high": null, "low": null, "close": null, "volume": 0},
                {"timestamp": "2024-01-01T00:01:00.000Z", "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 7}
            ])))
            .mount(&server)
            .await;

        let connector = connect(&server).await;
        let candles = connector
            .get_historical_candles(&xbtusd(), Timeframe::M1, 3)
            .await;

        let midnight = 1_704_067_200_000i64;
        assert_eq!(
            candles,
            vec![
                Candle::new(midnight, 1.0, 2.0, 0.5, 1.5, 7.0),
                Candle::new(midnight + 120_000, 3.0, 3.0, 3.0, 3.0, 1.0),
            ]
        );
    }

    #[tokio::test]
    async fn unsupported_bin_size_yields_empty_history_without_request() {
        let server = MockServer::start().await;
        Mock::given(path("/api/v1/trade/bucketed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let connector = connect(&server).await;
        assert!(connector
            .get_historical_candles(&xbtusd(), Timeframe::M15, 10)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn place_order_uses_bitmex_field_names() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/order"))
            .and(query_param("side", "Sell"))
            .and(query_param("orderQty", "200"))
            .and(query_param("ordType", "Limit"))
            .and(query_param("price", "101.5"))
            .and(query_param("timeInForce", "GoodTillCancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "orderID": "7c9a-11", "ordStatus": "New", "avgPx": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let connector = connect(&server).await;
        let order = OrderRequest::limit(xbtusd(), OrderSide::Sell, 150.0, 101.3);
        let status = connector.place_order(&order).await.unwrap();
        assert_eq!(
            status,
            OrderStatus {
                order_id: "7c9a-11".into(),
                status: "New".into(),
                avg_price: 0.0,
            }
        );
    }

    #[tokio::test]
    async fn cancel_with_empty_list_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/order"))
            .and(query_param("orderID", "gone"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/order"))
            .and(query_param("orderID", "live"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"orderID": "live", "ordStatus": "Canceled", "avgPx": 0}
            ])))
            .mount(&server)
            .await;

        let connector = connect(&server).await;
        assert!(connector.cancel_order(&xbtusd(), "gone").await.is_none());
        let cancelled = connector.cancel_order(&xbtusd(), "live").await.unwrap();
        assert_eq!(cancelled.status, "Canceled");
    }

    #[tokio::test]
    async fn order_status_filters_by_order_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/order"))
            .and(query_param("filter", r#"{"orderID":"abc"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"orderID": "abc", "ordStatus": "Filled", "avgPx": 43000.5}
            ])))
            .mount(&server)
            .await;

        let connector = connect(&server).await;
        let status = connector.get_order_status(&xbtusd(), "abc").await.unwrap();
        assert_eq!((status.status.as_str(), status.avg_price), ("Filled", 43000.5));
    }

    #[test]
    fn subscribe_frame_uses_table_prefix() {
        let stream = BitmexStream::new("wss://example");
        let frame: Value = serde_json::from_str(
            &stream.subscribe_message(&["XBTUSD".into(), "ETHUSD".into()], Channel::BookTicker),
        )
        .unwrap();
        assert_eq!(
            frame,
            json!({"op": "subscribe", "args": ["instrument:XBTUSD", "instrument:ETHUSD"]})
        );
    }

    #[test]
    fn instrument_updates_may_be_one_sided() {
        let stream = BitmexStream::new("wss://example");
        let events = stream
            .decode(
                r#"{"table":"instrument","action":"update","data":[
                    {"symbol":"XBTUSD","askPrice":43001.5},
                    {"symbol":"XBTUSD","fundingRate":0.0001}
                ]}"#,
            )
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Quote {
                symbol: "XBTUSD".into(),
                bid: None,
                ask: Some(43001.5),
            }]
        );
    }

    #[test]
    fn trades_carry_millisecond_timestamps() {
        let stream = BitmexStream::new("wss://example");
        let events = stream
            .decode(
                r#"{"table":"trade","action":"insert","data":[
                    {"timestamp":"2024-01-01T00:00:01.250Z","symbol":"XBTUSD","side":"Buy","size":300,"price":43000.5}
                ]}"#,
            )
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Trade {
                symbol: "XBTUSD".into(),
                price: 43000.5,
                size: 300.0,
                timestamp: 1_704_067_201_250,
            }]
        );
    }

    #[test]
    fn banners_and_acks_are_ignored() {
        let stream = BitmexStream::new("wss://example");
        assert!(stream
            .decode(r#"{"info":"Welcome to the BitMEX Realtime API.","version":"2.0"}"#)
            .unwrap()
            .is_empty());
        assert!(stream
            .decode(r#"{"success":true,"subscribe":"trade:XBTUSD"}"#)
            .unwrap()
            .is_empty());
        assert!(stream.decode("{").is_err());
    }
}
