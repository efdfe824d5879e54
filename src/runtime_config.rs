// =============================================================================
// Runtime Configuration — connector settings with atomic save
// =============================================================================
//
// Which exchanges to connect to, which symbols to stream, and the timing
// knobs of the REST client and the stream reconnect loop.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.
//
// Credentials are NOT part of this file; they come from the environment.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exchange::ConnectorOptions;
use crate::market_data::FeedSettings;
use crate::strategy::StrategyDefinition;
use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_binance_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_bitmex_symbols() -> Vec<String> {
    vec!["XBTUSD".to_string()]
}

fn default_timeframe() -> Timeframe {
    Timeframe::M1
}

fn default_history_limit() -> u32 {
    1000
}

fn default_rest_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_reconnect_base_ms() -> u64 {
    2_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

// =============================================================================
// ExchangeSettings
// =============================================================================

/// Per-exchange switch, network and watched symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Talk to the exchange's testnet instead of production.
    #[serde(default = "default_true")]
    pub testnet: bool,

    /// Symbols whose quotes and trades are streamed.
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl ExchangeSettings {
    fn with_symbols(symbols: Vec<String>) -> Self {
        Self {
            enabled: true,
            testnet: true,
            symbols,
        }
    }
}

fn default_binance() -> ExchangeSettings {
    ExchangeSettings::with_symbols(default_binance_symbols())
}

fn default_bitmex() -> ExchangeSettings {
    ExchangeSettings::with_symbols(default_bitmex_symbols())
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Exchanges ----------------------------------------------------------
    #[serde(default = "default_binance")]
    pub binance: ExchangeSettings,

    #[serde(default = "default_bitmex")]
    pub bitmex: ExchangeSettings,

    // --- Candles ------------------------------------------------------------

    /// Interval of the candle series built for every streamed symbol.
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,

    /// Number of historical candles requested to seed each series.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    // --- Timing -------------------------------------------------------------
    #[serde(default = "default_rest_timeout_secs")]
    pub rest_timeout_secs: u64,

    /// Stream handshakes slower than this count as a failed connect.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// First reconnect delay after the stream drops; doubles per failure.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Upper bound for the reconnect delay.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    // --- Strategies ---------------------------------------------------------
    #[serde(default)]
    pub strategies: Vec<StrategyDefinition>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binance: default_binance(),
            bitmex: default_bitmex(),
            timeframe: default_timeframe(),
            history_limit: default_history_limit(),
            rest_timeout_secs: default_rest_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            strategies: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            binance = config.binance.enabled,
            bitmex = config.bitmex.enabled,
            timeframe = %config.timeframe,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` with an atomic write (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// REST timeout and reconnect policy in the form connectors take.
    ///
    /// A zero timeout is raised to one second; a cap below the base delay is
    /// raised to the base.
    pub fn connector_options(&self) -> ConnectorOptions {
        let base = Duration::from_millis(self.reconnect_base_ms.max(1));
        ConnectorOptions {
            rest_timeout: Duration::from_secs(self.rest_timeout_secs.max(1)),
            feed: FeedSettings {
                reconnect_base: base,
                reconnect_max: Duration::from_millis(self.reconnect_max_ms).max(base),
                connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            },
        }
    }
}
