// =============================================================================
// WebSocket Feed — one self-healing stream connection per exchange
// =============================================================================
//
// State machine:
//
//   Disconnected -> Connecting -> Open -> Reconnecting -> Connecting -> ...
//                                     \-> Closed (only on shutdown())
//
// The subscription set is owned by the connector and outlives any single
// socket. Every successful connect replays the whole set; pairs added while
// the socket is up are sent once, and pairs already sent on the current
// socket are never sent again.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn, Instrument, Span};

use super::candle_aggregator::AggregatorRegistry;
use super::price_cache::PriceCache;
use crate::types::Channel;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

// ---------------------------------------------------------------------------
// Protocol seam
// ---------------------------------------------------------------------------

/// A decoded inbound message the feed knows how to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Best bid/ask; either side may be missing on incremental updates.
    Quote {
        symbol: String,
        bid: Option<f64>,
        ask: Option<f64>,
    },
    /// A public trade; `timestamp` in epoch milliseconds.
    Trade {
        symbol: String,
        price: f64,
        size: f64,
        timestamp: i64,
    },
}

/// Exchange-specific wire schema of a streaming endpoint.
pub trait StreamProtocol: Send + Sync {
    fn url(&self) -> &str;

    /// One subscribe frame covering `symbols` on `channel`.
    fn subscribe_message(&self, symbols: &[String], channel: Channel) -> String;

    /// `Ok(vec![])` for messages that are valid but not interesting
    /// (acks, heartbeats, unknown tables); `Err` for malformed ones.
    fn decode(&self, text: &str) -> anyhow::Result<Vec<StreamEvent>>;
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Every (symbol, channel) pair requested so far.
#[derive(Debug, Default)]
pub struct Subscriptions {
    pairs: RwLock<BTreeSet<(String, Channel)>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `symbols` on `channel`; returns only the symbols that were new.
    pub fn add(&self, symbols: &[String], channel: Channel) -> Vec<String> {
        let mut pairs = self.pairs.write();
        symbols
            .iter()
            .filter(|s| pairs.insert(((*s).clone(), channel)))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(String, Channel)> {
        self.pairs.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.read().is_empty()
    }
}

/// Where decoded events go.
#[derive(Clone, Default)]
pub struct FeedSinks {
    pub prices: Arc<PriceCache>,
    pub aggregators: Arc<AggregatorRegistry>,
}

impl FeedSinks {
    pub fn new(prices: Arc<PriceCache>, aggregators: Arc<AggregatorRegistry>) -> Self {
        Self {
            prices,
            aggregators,
        }
    }

    fn apply(&self, event: StreamEvent) {
        match event {
            StreamEvent::Quote { symbol, bid, ask } => {
                self.prices.apply(&symbol, bid, ask);
            }
            StreamEvent::Trade {
                symbol,
                price,
                size,
                timestamp,
            } => {
                self.aggregators.dispatch(&symbol, price, size, timestamp);
            }
        }
    }
}

/// Reconnect delay policy: starts at `reconnect_base`, doubles per failed
/// attempt up to `reconnect_max`, resets after a successful connect.
/// A handshake that takes longer than `connect_timeout` is a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct FeedSettings {
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Caller-side handle of a running feed task.
pub struct WebSocketFeed {
    subscriptions: Arc<Subscriptions>,
    commands: mpsc::UnboundedSender<Vec<(String, Channel)>>,
    state: watch::Receiver<FeedState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl WebSocketFeed {
    /// Spawn the feed task on the current tokio runtime. Returns at once.
    pub fn spawn(
        protocol: Arc<dyn StreamProtocol>,
        sinks: FeedSinks,
        subscriptions: Arc<Subscriptions>,
        settings: FeedSettings,
        span: Span,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = FeedTask {
            protocol,
            sinks,
            subscriptions: subscriptions.clone(),
            settings,
            commands: cmd_rx,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(task.run().instrument(span.clone()));

        Self {
            subscriptions,
            commands: cmd_tx,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(handle)),
            span,
        }
    }

    /// Add `symbols` on `channel` to the subscription set and send one
    /// subscribe frame for the new ones. Returns how many pairs were new.
    ///
    /// If the socket is down the frame is not queued for retry; the next
    /// connect replays the full set instead.
    pub fn subscribe(&self, symbols: &[String], channel: Channel) -> usize {
        let _entered = self.span.enter();

        let fresh = self.subscriptions.add(symbols, channel);
        if fresh.is_empty() {
            return 0;
        }
        let count = fresh.len();

        if self.state() != FeedState::Open {
            info!(?channel, symbols = ?fresh, state = %self.state(), "feed not open; subscription deferred to next connect");
        }
        let pairs = fresh.into_iter().map(|s| (s, channel)).collect();
        if self.commands.send(pairs).is_err() {
            warn!(?channel, "feed task has stopped; subscription recorded only");
        }
        count
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// Wait until the feed reaches `target`. Returns `false` if the task is gone.
    pub async fn wait_for_state(&self, target: FeedState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| *s == target).await.is_ok();
        reached
    }

    /// Stop reconnecting, close the socket and wait for the task to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(parent: &self.span, error = %e, "feed task ended abnormally");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

enum SessionEnd {
    Dropped,
    Shutdown,
}

struct FeedTask {
    protocol: Arc<dyn StreamProtocol>,
    sinks: FeedSinks,
    subscriptions: Arc<Subscriptions>,
    settings: FeedSettings,
    commands: mpsc::UnboundedReceiver<Vec<(String, Channel)>>,
    state: watch::Sender<FeedState>,
    shutdown: watch::Receiver<bool>,
}

impl FeedTask {
    async fn run(mut self) {
        let mut delay = self.settings.reconnect_base;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.set_state(FeedState::Connecting);
            let url = self.protocol.url().to_string();
            let connect = tokio::time::timeout(
                self.settings.connect_timeout,
                connect_async(url.as_str()),
            );
            let connected = tokio::select! {
                res = connect => res,
                _ = self.shutdown.changed() => break,
            };

            match connected {
                Ok(Ok((ws, _response))) => {
                    info!(url = %url, "stream connected");
                    self.set_state(FeedState::Open);
                    delay = self.settings.reconnect_base;
                    if let SessionEnd::Shutdown = self.session(ws).await {
                        break;
                    }
                }
                Ok(Err(e)) => warn!(url = %url, error = %e, "stream connect failed"),
                Err(_) => warn!(
                    url = %url,
                    timeout_ms = self.settings.connect_timeout.as_millis() as u64,
                    "stream handshake timed out"
                ),
            }

            self.set_state(FeedState::Reconnecting);
            info!(delay_ms = delay.as_millis() as u64, "stream reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
            delay = (delay * 2).min(self.settings.reconnect_max);
        }

        self.set_state(FeedState::Closed);
        info!("stream closed");
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut sent = BTreeSet::new();

        let everything = self.subscriptions.snapshot();
        if let Err(e) = self.send_subscriptions(&mut write, everything, &mut sent).await {
            warn!(error = %e, "resubscribe failed");
            return SessionEnd::Dropped;
        }

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        warn!(?frame, "stream closed by peer");
                        return SessionEnd::Dropped;
                    }
                    // Ping / Pong / Binary: tungstenite answers pings itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "stream read error");
                        return SessionEnd::Dropped;
                    }
                    None => {
                        warn!("stream ended");
                        return SessionEnd::Dropped;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(pairs) => {
                        if let Err(e) = self.send_subscriptions(&mut write, pairs, &mut sent).await {
                            warn!(error = %e, "subscribe send failed");
                            return SessionEnd::Dropped;
                        }
                    }
                    None => {
                        let _ = write.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                _ = self.shutdown.changed() => {
                    let _ = write.close().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    async fn send_subscriptions(
        &self,
        write: &mut WsSink,
        pairs: Vec<(String, Channel)>,
        sent: &mut BTreeSet<(String, Channel)>,
    ) -> Result<(), tungstenite::Error> {
        let mut by_channel: BTreeMap<Channel, BTreeSet<String>> = BTreeMap::new();
        for (symbol, channel) in pairs {
            if !sent.contains(&(symbol.clone(), channel)) {
                by_channel.entry(channel).or_default().insert(symbol);
            }
        }

        for (channel, symbols) in by_channel {
            let symbols: Vec<String> = symbols.into_iter().collect();
            let frame = self.protocol.subscribe_message(&symbols, channel);
            debug!(?channel, symbols = ?symbols, "subscribing");
            write.send(Message::Text(frame)).await?;
            sent.extend(symbols.into_iter().map(|s| (s, channel)));
        }
        Ok(())
    }

    fn handle_text(&self, text: &str) {
        match self.protocol.decode(text) {
            Ok(events) => {
                for event in events {
                    self.sinks.apply(event);
                }
            }
            Err(e) => warn!(error = %e, "dropping undecodable stream message"),
        }
    }

    fn set_state(&self, next: FeedState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "feed state");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::CandleAggregator;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    struct TestProtocol {
        url: String,
    }

    impl StreamProtocol for TestProtocol {
        fn url(&self) -> &str {
            &self.url
        }

        fn subscribe_message(&self, symbols: &[String], channel: Channel) -> String {
            json!({ "channel": format!("{channel:?}"), "symbols": symbols }).to_string()
        }

        fn decode(&self, text: &str) -> anyhow::Result<Vec<StreamEvent>> {
            let v: Value = serde_json::from_str(text)?;
            let symbol = v["symbol"].as_str().unwrap_or_default().to_string();
            Ok(match v["kind"].as_str() {
                Some("quote") => vec![StreamEvent::Quote {
                    symbol,
                    bid: v["bid"].as_f64(),
                    ask: v["ask"].as_f64(),
                }],
                Some("trade") => vec![StreamEvent::Trade {
                    symbol,
                    price: v["price"].as_f64().unwrap_or_default(),
                    size: v["size"].as_f64().unwrap_or_default(),
                    timestamp: v["ts"].as_i64().unwrap_or_default(),
                }],
                _ => Vec::new(),
            })
        }
    }

    fn fast() -> FeedSettings {
        FeedSettings {
            reconnect_base: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn strings(symbols: &[&str]) -> Vec<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    fn spawn_feed(url: String, subs: Arc<Subscriptions>, sinks: FeedSinks) -> WebSocketFeed {
        spawn_with(url, subs, sinks, fast())
    }

    fn spawn_with(
        url: String,
        subs: Arc<Subscriptions>,
        sinks: FeedSinks,
        settings: FeedSettings,
    ) -> WebSocketFeed {
        WebSocketFeed::spawn(Arc::new(TestProtocol { url }), sinks, subs, settings, Span::none())
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    /// Read subscribe frames until `want` (symbol, channel) pairs arrived.
    async fn read_pairs(ws: &mut WebSocketStream<TcpStream>, want: usize) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        while pairs.len() < want {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let v: Value = serde_json::from_str(&text).unwrap();
                    let channel = v["channel"].as_str().unwrap().to_string();
                    for s in v["symbols"].as_array().unwrap() {
                        pairs.push((s.as_str().unwrap().to_string(), channel.clone()));
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        pairs.sort();
        pairs
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn forced_close_reconnects_and_replays_every_subscription_once() {
        let (listener, url) = bind().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            tx.send(read_pairs(&mut ws, 3).await).unwrap();
            let _ = ws.close(None).await;
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            tx.send(read_pairs(&mut ws, 3).await).unwrap();
            ws.send(Message::Text(
                r#"{"kind":"quote","symbol":"AAA","bid":1.0,"ask":2.0}"#.into(),
            ))
            .await
            .unwrap();

            // Anything further on this socket would be a duplicate.
            timeout(Duration::from_millis(300), ws.next()).await.is_err()
        });

        let subs = Arc::new(Subscriptions::new());
        subs.add(&strings(&["AAA", "BBB"]), Channel::BookTicker);
        subs.add(&strings(&["AAA"]), Channel::Trades);
        let sinks = FeedSinks::default();
        let feed = spawn_feed(url, subs, sinks.clone());

        let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();

        let expected = vec![
            ("AAA".to_string(), "BookTicker".to_string()),
            ("AAA".to_string(), "Trades".to_string()),
            ("BBB".to_string(), "BookTicker".to_string()),
        ];
        assert_eq!(first, expected);
        assert_eq!(second, expected);

        assert!(eventually(|| sinks.prices.get("AAA").is_some()).await);
        assert!(server.await.unwrap(), "duplicate subscribe frame after reconnect");

        feed.shutdown().await;
        assert_eq!(feed.state(), FeedState::Closed);
    }

    #[tokio::test]
    async fn subscribe_while_open_sends_only_new_pairs() {
        let (listener, url) = bind().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            tx.send(read_pairs(&mut ws, 1).await).unwrap();
            tx.send(read_pairs(&mut ws, 1).await).unwrap();
            let _ = ws.next().await;
        });

        let subs = Arc::new(Subscriptions::new());
        subs.add(&strings(&["AAA"]), Channel::BookTicker);
        let feed = spawn_feed(url, subs.clone(), FeedSinks::default());

        let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, vec![("AAA".to_string(), "BookTicker".to_string())]);
        assert!(feed.wait_for_state(FeedState::Open).await);

        assert_eq!(feed.subscribe(&strings(&["AAA", "BBB"]), Channel::BookTicker), 1);
        let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second, vec![("BBB".to_string(), "BookTicker".to_string())]);
        assert_eq!(subs.len(), 2);

        feed.shutdown().await;
    }

    #[tokio::test]
    async fn bad_and_unknown_messages_are_dropped_trades_are_routed() {
        let (listener, url) = bind().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            read_pairs(&mut ws, 1).await;
            for frame in [
                "definitely not json",
                r#"{"kind":"heartbeat"}"#,
                r#"{"kind":"trade","symbol":"AAA","price":10.0,"size":2.0,"ts":60000}"#,
            ] {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }
            let _ = ws.next().await;
        });

        let subs = Arc::new(Subscriptions::new());
        subs.add(&strings(&["AAA"]), Channel::Trades);
        let sinks = FeedSinks::default();
        let agg = Arc::new(CandleAggregator::with_duration("AAA", 60_000));
        sinks.aggregators.register(agg.clone());
        let feed = spawn_feed(url, subs, sinks);

        assert!(eventually(|| agg.len() == 1).await);
        let candle = agg.last().unwrap();
        assert_eq!((candle.timestamp, candle.close, candle.volume), (60_000, 10.0, 2.0));
        assert_eq!(feed.state(), FeedState::Open);

        feed.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_reconnect_loop() {
        let (listener, url) = bind().await;
        drop(listener);

        let feed = spawn_feed(url, Arc::new(Subscriptions::new()), FeedSinks::default());
        let reached = timeout(
            Duration::from_secs(5),
            feed.wait_for_state(FeedState::Reconnecting),
        )
        .await
        .unwrap();
        assert!(reached);

        timeout(Duration::from_secs(1), feed.shutdown()).await.unwrap();
        assert_eq!(feed.state(), FeedState::Closed);
    }

    #[tokio::test]
    async fn subscribe_while_reconnecting_is_replayed_once() {
        let (listener, url) = bind().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            tx.send(read_pairs(&mut ws, 1).await).unwrap();

            // The queued command repeats the replayed pair and must not be sent.
            timeout(Duration::from_millis(300), ws.next()).await.is_err()
        });

        let subs = Arc::new(Subscriptions::new());
        let settings = FeedSettings {
            reconnect_base: Duration::from_millis(300),
            ..fast()
        };
        let feed = spawn_with(url, subs.clone(), FeedSinks::default(), settings);

        let down = timeout(
            Duration::from_secs(5),
            feed.wait_for_state(FeedState::Reconnecting),
        )
        .await
        .unwrap();
        assert!(down);
        assert_eq!(feed.subscribe(&strings(&["AAA"]), Channel::Trades), 1);
        assert_eq!(subs.snapshot(), vec![("AAA".to_string(), Channel::Trades)]);

        let replayed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(replayed, vec![("AAA".to_string(), "Trades".to_string())]);
        assert!(server.await.unwrap(), "subscribe frame sent twice after reconnect");

        feed.shutdown().await;
    }

    #[tokio::test]
    async fn stalled_handshake_counts_as_failed_attempt() {
        // Bound but never accepted: TCP connects, the HTTP upgrade never answers.
        let (listener, url) = bind().await;

        let settings = FeedSettings {
            connect_timeout: Duration::from_millis(100),
            ..fast()
        };
        let feed = spawn_with(url, Arc::new(Subscriptions::new()), FeedSinks::default(), settings);

        let reached = timeout(
            Duration::from_secs(2),
            feed.wait_for_state(FeedState::Reconnecting),
        )
        .await
        .unwrap();
        assert!(reached);

        feed.shutdown().await;
        assert_eq!(feed.state(), FeedState::Closed);
        drop(listener);
    }
}
