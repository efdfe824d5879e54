// =============================================================================
// Shared types used across the Aurora connectors
// =============================================================================
//
// Everything here is exchange-agnostic. Field mapping from raw exchange JSON
// lives next to each connector (`exchange::binance`, `exchange::bitmex`).
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Exchanges with a connector implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    Binance,
    Bitmex,
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binance => write!(f, "binance"),
            Self::Bitmex => write!(f, "bitmex"),
        }
    }
}

// -----------------------------------------------------------------------------
// Contract
// -----------------------------------------------------------------------------

/// A tradable derivatives contract as listed by one exchange.
///
/// Built once from the exchange's instrument snapshot and never mutated; a
/// refresh replaces the whole contract map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// Minimum price increment. Always > 0.
    pub tick_size: f64,
    /// Minimum quantity increment. Always > 0.
    pub lot_size: f64,
    pub price_decimals: u32,
    pub quantity_decimals: u32,
    pub exchange: Exchange,
}

impl Contract {
    /// Snap `price` onto the tick grid and render it for the wire.
    pub fn format_price(&self, price: f64) -> String {
        format!(
            "{:.*}",
            self.price_decimals as usize,
            round_to_step(price, self.tick_size)
        )
    }

    /// Snap `quantity` onto the lot grid and render it for the wire.
    pub fn format_quantity(&self, quantity: f64) -> String {
        format!(
            "{:.*}",
            self.quantity_decimals as usize,
            round_to_step(quantity, self.lot_size)
        )
    }
}

/// `round(value / step) * step`, rounding half away from zero.
///
/// A non-positive step leaves the value untouched.
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !step.is_finite() {
        return value;
    }
    (value / step).round() * step
}

/// Number of decimals needed to print multiples of `step` exactly
/// (0.01 -> 2, 0.5 -> 1, 25 -> 0).
pub fn decimals_for_step(step: f64) -> u32 {
    let mut scaled = step;
    for decimals in 0..=12 {
        if scaled.round() >= 1.0 && (scaled - scaled.round()).abs() < 1e-6 {
            return decimals;
        }
        scaled *= 10.0;
    }
    12
}

// -----------------------------------------------------------------------------
// Account
// -----------------------------------------------------------------------------

/// Margin figures for one asset, in the asset's major unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub initial_margin: f64,
    pub maintenance_margin: f64,
    pub margin_balance: f64,
    pub wallet_balance: f64,
    pub unrealized_profit: f64,
}

/// Snapshot of an order as last reported by the exchange.
///
/// `status` keeps the exchange's own vocabulary ("NEW", "PartiallyFilled",
/// ...). A fresh status requires a fresh query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: String,
    pub status: String,
    pub avg_price: f64,
}

// -----------------------------------------------------------------------------
// Orders
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GoodTillCancel,
    ImmediateOrCancel,
    FillOrKill,
}

/// Everything a connector needs to submit one order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub contract: Contract,
    pub side: OrderSide,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub time_in_force: Option<TimeInForce>,
}

impl OrderRequest {
    pub fn market(contract: Contract, side: OrderSide, quantity: f64) -> Self {
        Self {
            contract,
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            time_in_force: None,
        }
    }

    pub fn limit(contract: Contract, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            contract,
            side,
            quantity,
            order_type: OrderType::Limit,
            price: Some(price),
            time_in_force: Some(TimeInForce::GoodTillCancel),
        }
    }
}

// -----------------------------------------------------------------------------
// Market data
// -----------------------------------------------------------------------------

/// Best bid / best ask for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BidAsk {
    pub bid: f64,
    pub ask: f64,
}

/// Logical stream channels; each connector maps them to its wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    BookTicker,
    Trades,
}

/// Candle interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
        }
    }

    pub fn duration_secs(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
        }
    }

    /// Bucket length in milliseconds, the unit of every trade timestamp.
    pub fn duration_ms(self) -> i64 {
        self.duration_secs() * 1_000
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unsupported timeframe '{s}'"))
    }
}
