// =============================================================================
// Aurora Connect — Main Entry Point
// =============================================================================
//
// Connects to every enabled exchange, streams quotes and trades for the
// configured symbols, keeps one candle series per symbol and logs a status
// line until Ctrl+C.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aurora_connect::runtime_config::ExchangeSettings;
use aurora_connect::{
    BinanceConnector, BitmexConnector, CandleAggregator, Channel, Connector, Credentials, Exchange,
    RuntimeConfig, Strategy, Timeframe,
};

const CONFIG_PATH: &str = "aurora_connect.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Aurora Connect starting up");

    let config_path = std::env::var("AURORA_CONFIG").unwrap_or_else(|_| CONFIG_PATH.into());
    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    let options = config.connector_options();

    // ── 2. Connectors ────────────────────────────────────────────────────
    let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();

    if config.binance.enabled {
        match credentials("BINANCE_API_KEY", "BINANCE_API_SECRET") {
            Some(creds) => {
                match BinanceConnector::connect(creds, config.binance.testnet, &options).await {
                    Ok(c) => connectors.push(Arc::new(c)),
                    Err(e) => error!(error = %e, "Binance connector failed to start"),
                }
            }
            None => warn!("Binance enabled but credentials missing; skipping"),
        }
    }

    if config.bitmex.enabled {
        match credentials("BITMEX_API_KEY", "BITMEX_API_SECRET") {
            Some(creds) => {
                match BitmexConnector::connect(creds, config.bitmex.testnet, &options).await {
                    Ok(c) => connectors.push(Arc::new(c)),
                    Err(e) => error!(error = %e, "BitMEX connector failed to start"),
                }
            }
            None => warn!("BitMEX enabled but credentials missing; skipping"),
        }
    }

    if connectors.is_empty() {
        anyhow::bail!("no exchange connector could be started");
    }

    // ── 3. Streams & candle series ───────────────────────────────────────
    let mut series: Vec<(Exchange, Arc<CandleAggregator>)> = Vec::new();
    for connector in &connectors {
        let settings = settings_for(&config, connector.exchange());
        for agg in watch_symbols(
            connector.as_ref(),
            settings,
            config.timeframe,
            config.history_limit,
        )
        .await
        {
            series.push((connector.exchange(), agg));
        }
    }

    // ── 4. Strategies ────────────────────────────────────────────────────
    let mut strategies = Vec::new();
    for definition in config.strategies.iter().cloned() {
        let Some(connector) = connectors
            .iter()
            .find(|c| c.exchange() == definition.config.exchange)
        else {
            warn!(exchange = %definition.config.exchange, symbol = %definition.config.symbol, "strategy exchange not connected; skipping");
            continue;
        };
        match Strategy::from_definition(definition, connector.as_ref()) {
            Ok(strategy) => {
                strategy.start(connector.as_ref(), config.history_limit).await;
                strategies.push(strategy);
            }
            Err(e) => error!(error = %e, "strategy rejected"),
        }
    }

    // ── 5. Status log ────────────────────────────────────────────────────
    let status_connectors = connectors.clone();
    let status_series = series.clone();
    let status = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            for connector in &status_connectors {
                info!(exchange = %connector.exchange(), feed = %connector.feed_state(), "feed status");
            }
            for (exchange, agg) in &status_series {
                let connector = status_connectors.iter().find(|c| c.exchange() == *exchange);
                let quote = connector.and_then(|c| c.price(agg.symbol()));
                info!(
                    %exchange,
                    symbol = agg.symbol(),
                    bid = quote.map(|q| q.bid),
                    ask = quote.map(|q| q.ask),
                    candles = agg.len(),
                    close = agg.last().map(|c| c.close),
                    "market status"
                );
            }
        }
    });

    info!(
        connectors = connectors.len(),
        series = series.len(),
        strategies = strategies.len(),
        "All subsystems running. Press Ctrl+C to stop."
    );

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    status.abort();
    for connector in &connectors {
        connector.shutdown().await;
    }

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "Failed to save config on shutdown");
    }

    info!("Aurora Connect shut down complete.");
    Ok(())
}

fn credentials(key_var: &str, secret_var: &str) -> Option<Credentials> {
    let key = std::env::var(key_var).unwrap_or_default();
    let secret = std::env::var(secret_var).unwrap_or_default();
    match Credentials::new(key, secret) {
        Ok(creds) => Some(creds),
        Err(e) => {
            warn!(key_var, error = %e, "credentials unavailable");
            None
        }
    }
}

fn settings_for(config: &RuntimeConfig, exchange: Exchange) -> &ExchangeSettings {
    match exchange {
        Exchange::Binance => &config.binance,
        Exchange::Bitmex => &config.bitmex,
    }
}

/// Subscribe quotes and trades for every configured symbol the exchange
/// lists, and build one history-seeded candle series per symbol.
async fn watch_symbols(
    connector: &dyn Connector,
    settings: &ExchangeSettings,
    timeframe: Timeframe,
    history_limit: u32,
) -> Vec<Arc<CandleAggregator>> {
    let mut contracts = Vec::new();
    for symbol in &settings.symbols {
        match connector.contract(symbol) {
            Some(c) => contracts.push(c),
            None => warn!(exchange = %connector.exchange(), %symbol, "symbol not listed; skipping"),
        }
    }

    let mut series = Vec::with_capacity(contracts.len());
    for contract in &contracts {
        let agg = Arc::new(CandleAggregator::new(contract.symbol.clone(), timeframe));
        agg.seed(
            connector
                .get_historical_candles(contract, timeframe, history_limit)
                .await,
        );
        connector.register_aggregator(agg.clone());
        series.push(agg);
    }

    connector.subscribe(&contracts, Channel::BookTicker);
    connector.subscribe(&contracts, Channel::Trades);
    series
}
