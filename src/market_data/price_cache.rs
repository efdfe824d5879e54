// =============================================================================
// Price Cache — best bid / best ask per symbol
// =============================================================================
//
// Written by the feed task (push) and by REST ticker polls (pull). Last
// writer wins; there is no ordering between the two sources.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::BidAsk;

/// Thread-safe bid/ask table for one exchange.
#[derive(Default)]
pub struct PriceCache {
    prices: RwLock<HashMap<String, BidAsk>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite both sides for `symbol`.
    pub fn set(&self, symbol: &str, quote: BidAsk) {
        self.prices.write().insert(symbol.to_string(), quote);
    }

    /// Apply a possibly one-sided update.
    ///
    /// A symbol is only inserted once both sides are known; afterwards either
    /// side may be updated alone. Returns the resulting quote, if any.
    pub fn apply(&self, symbol: &str, bid: Option<f64>, ask: Option<f64>) -> Option<BidAsk> {
        let mut prices = self.prices.write();
        match prices.get_mut(symbol) {
            Some(quote) => {
                if let Some(bid) = bid {
                    quote.bid = bid;
                }
                if let Some(ask) = ask {
                    quote.ask = ask;
                }
                Some(*quote)
            }
            None => {
                let quote = BidAsk {
                    bid: bid?,
                    ask: ask?,
                };
                prices.insert(symbol.to_string(), quote);
                Some(quote)
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<BidAsk> {
        self.prices.read().get(symbol).copied()
    }

    /// Mid price, if both sides are known.
    pub fn mid(&self, symbol: &str) -> Option<f64> {
        self.get(symbol).map(|q| (q.bid + q.ask) / 2.0)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.prices.read().keys().cloned().collect()
    }
}
