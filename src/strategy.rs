// =============================================================================
// Strategies — parameter holders bound to one contract's candle series
// =============================================================================
//
// A strategy is a shared base configuration plus a variant payload. It owns
// the `CandleAggregator` for its (contract, timeframe), seeds it from REST
// history and receives live trades through the connector's registry.
//
// Signal generation is not implemented here; strategies only carry their
// parameters and keep their candle series current.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::exchange::Connector;
use crate::market_data::{Candle, CandleAggregator, IngestOutcome};
use crate::types::{Channel, Contract, Exchange, Timeframe};

// =============================================================================
// Configuration
// =============================================================================

/// Parameters every strategy variant shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub exchange: Exchange,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Share of the available balance committed per trade, in percent.
    pub balance_percentage: f64,
    /// Take-profit distance from entry, in percent.
    pub take_profit: f64,
    /// Stop-loss distance from entry, in percent.
    pub stop_loss: f64,
}

/// Variant-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyKind {
    /// MACD-style EMA crossover parameters.
    Technical {
        ema_fast: u32,
        ema_slow: u32,
        ema_signal: u32,
    },
    /// Range breakout gated by a minimum candle volume.
    Breakout { min_volume: f64 },
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Technical { .. } => "technical",
            Self::Breakout { .. } => "breakout",
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            Self::Technical {
                ema_fast,
                ema_slow,
                ema_signal,
            } => {
                if ema_fast == 0 || ema_slow == 0 || ema_signal == 0 {
                    anyhow::bail!("EMA periods must be positive");
                }
                if ema_fast >= ema_slow {
                    anyhow::bail!("ema_fast ({ema_fast}) must be shorter than ema_slow ({ema_slow})");
                }
            }
            Self::Breakout { min_volume } => {
                if !(min_volume >= 0.0) {
                    anyhow::bail!("min_volume must be non-negative, got {min_volume}");
                }
            }
        }
        Ok(())
    }
}

/// One strategy as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    #[serde(flatten)]
    pub config: StrategyConfig,
    pub kind: StrategyKind,
}

impl StrategyConfig {
    fn validate(&self) -> Result<()> {
        if !(self.balance_percentage > 0.0 && self.balance_percentage <= 100.0) {
            anyhow::bail!(
                "balance_percentage must be in (0, 100], got {}",
                self.balance_percentage
            );
        }
        if !(self.take_profit > 0.0) {
            anyhow::bail!("take_profit must be positive, got {}", self.take_profit);
        }
        if !(self.stop_loss > 0.0) {
            anyhow::bail!("stop_loss must be positive, got {}", self.stop_loss);
        }
        Ok(())
    }
}

// =============================================================================
// Strategy
// =============================================================================

#[derive(Debug)]
pub struct Strategy {
    config: StrategyConfig,
    kind: StrategyKind,
    contract: Contract,
    candles: Arc<CandleAggregator>,
}

impl Strategy {
    /// Validate parameters and create an empty candle series for `contract`.
    pub fn new(config: StrategyConfig, kind: StrategyKind, contract: Contract) -> Result<Self> {
        config
            .validate()
            .with_context(|| format!("invalid {} strategy on {}", kind.name(), config.symbol))?;
        kind.validate()
            .with_context(|| format!("invalid {} strategy on {}", kind.name(), config.symbol))?;
        if contract.symbol != config.symbol || contract.exchange != config.exchange {
            anyhow::bail!(
                "contract {}@{} does not match strategy {}@{}",
                contract.symbol,
                contract.exchange,
                config.symbol,
                config.exchange
            );
        }

        let candles = Arc::new(CandleAggregator::new(contract.symbol.clone(), config.timeframe));
        Ok(Self {
            config,
            kind,
            contract,
            candles,
        })
    }

    /// Build from a config-file definition, resolving the contract on `connector`.
    pub fn from_definition(definition: StrategyDefinition, connector: &dyn Connector) -> Result<Self> {
        let contract = connector.contract(&definition.config.symbol).with_context(|| {
            format!(
                "unknown contract {} on {}",
                definition.config.symbol,
                connector.exchange()
            )
        })?;
        Self::new(definition.config, definition.kind, contract)
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn kind(&self) -> &StrategyKind {
        &self.kind
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn candles(&self) -> &Arc<CandleAggregator> {
        &self.candles
    }

    /// Seed history, route live trades into the series and subscribe to the
    /// contract's trade stream.
    pub async fn start(&self, connector: &dyn Connector, history_limit: u32) {
        let history = connector
            .get_historical_candles(&self.contract, self.config.timeframe, history_limit)
            .await;
        if history.is_empty() {
            warn!(
                symbol = %self.contract.symbol,
                timeframe = %self.config.timeframe,
                "no candle history; series starts at the first trade"
            );
        }
        self.seed(history);

        connector.register_aggregator(self.candles.clone());
        connector.subscribe(std::slice::from_ref(&self.contract), Channel::Trades);

        info!(
            strategy = self.kind.name(),
            exchange = %self.config.exchange,
            symbol = %self.contract.symbol,
            timeframe = %self.config.timeframe,
            candles = self.candles.len(),
            "strategy started"
        );
    }

    pub fn seed(&self, history: Vec<Candle>) {
        self.candles.seed(history);
    }

    /// Fold one trade into this strategy's series.
    pub fn parse_trade(&self, price: f64, size: f64, timestamp: i64) -> IngestOutcome {
        self.candles.ingest(price, size, timestamp)
    }
}
