// =============================================================================
// Candle Aggregator — trade stream to contiguous OHLCV series
// =============================================================================
//
// One series per (symbol, timeframe), seeded from REST history and extended
// by live trades. The registry fans each trade out to every series of its
// symbol.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One OHLCV bucket. `timestamp` is the bucket start in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Candle whose four prices are all `price`.
    pub fn flat(timestamp: i64, price: f64, volume: f64) -> Self {
        Self::new(timestamp, price, price, price, price, volume)
    }

    fn apply_trade(&mut self, price: f64, size: f64) {
        self.close = price;
        self.volume += size;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
    }
}

/// What a single trade did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The series was empty; the trade opened its first candle.
    Seeded,
    SameCandle,
    NewCandle,
    /// `synthetic` flat candles were inserted before the trade's own candle.
    GapFilled { synthetic: usize },
}

// ---------------------------------------------------------------------------
// CandleAggregator -- one per (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Folds a trade stream into a contiguous candle series.
///
/// Bucket boundaries are always derived from the previous candle's
/// timestamp, never from the wall clock, so an outage does not shift the
/// alignment of an existing series. Buckets without trades are filled with
/// flat zero-volume candles: strategies address candles by position.
pub struct CandleAggregator {
    symbol: String,
    duration: i64,
    series: Mutex<Vec<Candle>>,
}

impl CandleAggregator {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self::with_duration(symbol, timeframe.duration_ms())
    }

    /// Aggregator over buckets of `duration` in the trade timestamps' unit.
    pub fn with_duration(symbol: impl Into<String>, duration: i64) -> Self {
        Self {
            symbol: symbol.into(),
            duration: duration.max(1),
            series: Mutex::new(Vec::new()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    /// Replace the series with historical candles (e.g. from REST).
    pub fn seed(&self, mut history: Vec<Candle>) {
        history.sort_by_key(|c| c.timestamp);
        history.dedup_by_key(|c| c.timestamp);
        debug!(symbol = %self.symbol, count = history.len(), "candle series seeded from history");
        *self.series.lock() = history;
    }

    /// Fold one trade into the series.
    pub fn ingest(&self, price: f64, size: f64, timestamp: i64) -> IngestOutcome {
        let d = self.duration;
        let mut series = self.series.lock();

        let Some(last) = series.last_mut() else {
            let start = timestamp - timestamp.rem_euclid(d);
            series.push(Candle::flat(start, price, size));
            return IngestOutcome::Seeded;
        };

        if timestamp < last.timestamp + d {
            last.apply_trade(price, size);
            return IngestOutcome::SameCandle;
        }

        let last = *last;

        if timestamp < last.timestamp + 2 * d {
            series.push(Candle::flat(last.timestamp + d, price, size));
            debug!(symbol = %self.symbol, ts = last.timestamp + d, "new candle");
            return IngestOutcome::NewCandle;
        }

        let missing = (timestamp - last.timestamp) / d - 1;
        info!(
            symbol = %self.symbol,
            missing,
            last_ts = last.timestamp,
            trade_ts = timestamp,
            "filling missing candles"
        );

        let mut prev = last;
        for _ in 0..missing {
            let filler = Candle::flat(prev.timestamp + d, prev.close, 0.0);
            series.push(filler);
            prev = filler;
        }
        series.push(Candle::flat(prev.timestamp + d, price, size));

        IngestOutcome::GapFilled {
            synthetic: missing as usize,
        }
    }

    /// Copy of the whole series, oldest first.
    pub fn candles(&self) -> Vec<Candle> {
        self.series.lock().clone()
    }

    /// The current (still mutable) candle.
    pub fn last(&self) -> Option<Candle> {
        self.series.lock().last().copied()
    }

    pub fn len(&self) -> usize {
        self.series.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.lock().is_empty()
    }
}

impl std::fmt::Debug for CandleAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleAggregator")
            .field("symbol", &self.symbol)
            .field("duration", &self.duration)
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AggregatorRegistry -- routes trades to every aggregator of a symbol
// ---------------------------------------------------------------------------

/// Symbol -> aggregators table read by the feed task for every trade.
#[derive(Default)]
pub struct AggregatorRegistry {
    by_symbol: RwLock<HashMap<String, Vec<Arc<CandleAggregator>>>>,
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `aggregator`; registering the same instance twice is a no-op.
    pub fn register(&self, aggregator: Arc<CandleAggregator>) {
        let mut map = self.by_symbol.write();
        let list = map.entry(aggregator.symbol().to_string()).or_default();
        if !list.iter().any(|a| Arc::ptr_eq(a, &aggregator)) {
            list.push(aggregator);
        }
    }

    /// Feed one trade to every aggregator registered for `symbol`.
    /// Returns how many aggregators received it.
    pub fn dispatch(&self, symbol: &str, price: f64, size: f64, timestamp: i64) -> usize {
        let map = self.by_symbol.read();
        match map.get(symbol) {
            Some(list) => {
                for aggregator in list {
                    aggregator.ingest(price, size, timestamp);
                }
                list.len()
            }
            None => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIN: i64 = 60_000;

    fn one_minute() -> CandleAggregator {
        CandleAggregator::new("BTCUSDT", Timeframe::M1)
    }

    #[test]
    fn first_trade_seeds_aligned_candle() {
        let agg = one_minute();
        assert_eq!(agg.ingest(10.0, 1.0, 90_500), IngestOutcome::Seeded);
        assert_eq!(agg.last(), Some(Candle::flat(60_000, 10.0, 1.0)));
    }

    #[test]
    fn three_trades_make_two_candles() {
        let agg = CandleAggregator::with_duration("BTCUSDT", 60);
        assert_eq!(agg.ingest(10.0, 1.0, 0), IngestOutcome::Seeded);
        assert_eq!(agg.ingest(11.0, 2.0, 30), IngestOutcome::SameCandle);
        assert_eq!(agg.ingest(12.0, 3.0, 65), IngestOutcome::NewCandle);

        assert_eq!(
            agg.candles(),
            vec![
                Candle::new(0, 10.0, 11.0, 10.0, 11.0, 3.0),
                Candle::new(60, 12.0, 12.0, 12.0, 12.0, 3.0),
            ]
        );
    }

    #[test]
    fn gap_is_filled_with_flat_candles() {
        let agg = CandleAggregator::with_duration("BTCUSDT", 60);
        agg.ingest(10.0, 1.0, 0);
        assert_eq!(
            agg.ingest(20.0, 4.0, 200),
            IngestOutcome::GapFilled { synthetic: 2 }
        );

        assert_eq!(
            agg.candles(),
            vec![
                Candle::flat(0, 10.0, 1.0),
                Candle::flat(60, 10.0, 0.0),
                Candle::flat(120, 10.0, 0.0),
                Candle::flat(180, 20.0, 4.0),
            ]
        );
    }

    #[test]
    fn same_candle_tracks_high_and_low() {
        let agg = one_minute();
        agg.ingest(100.0, 1.0, 0);
        agg.ingest(105.0, 1.0, 1_000);
        agg.ingest(95.0, 1.0, 2_000);
        agg.ingest(101.0, 1.0, 3_000);
        let c = agg.last().unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 105.0, 95.0, 101.0));
        assert_eq!(c.volume, 4.0);
    }

    #[test]
    fn buckets_follow_seeded_history_not_wall_clock() {
        let agg = one_minute();
        // History aligned on an odd offset; live trades keep that alignment.
        agg.seed(vec![
            Candle::flat(7_000 + MIN, 2.0, 1.0),
            Candle::flat(7_000, 1.0, 1.0),
        ]);
        assert_eq!(agg.ingest(3.0, 1.0, 7_000 + 2 * MIN + 10), IngestOutcome::NewCandle);
        let ts: Vec<i64> = agg.candles().iter().map(|c| c.timestamp).collect();
        assert_eq!(ts, vec![7_000, 7_000 + MIN, 7_000 + 2 * MIN]);
    }

    #[test]
    fn trade_exactly_on_two_bucket_boundary_fills_one() {
        let agg = one_minute();
        agg.ingest(1.0, 1.0, 0);
        assert_eq!(
            agg.ingest(2.0, 1.0, 2 * MIN),
            IngestOutcome::GapFilled { synthetic: 1 }
        );
        assert_eq!(agg.len(), 3);
    }

    #[test]
    fn registry_routes_by_symbol() {
        let registry = AggregatorRegistry::new();
        let m1 = Arc::new(CandleAggregator::new("ETHUSDT", Timeframe::M1));
        let m5 = Arc::new(CandleAggregator::new("ETHUSDT", Timeframe::M5));
        registry.register(m1.clone());
        registry.register(m5.clone());
        registry.register(m1.clone());

        assert_eq!(registry.dispatch("ETHUSDT", 1.0, 1.0, 0), 2);
        assert_eq!(registry.dispatch("BTCUSDT", 1.0, 1.0, 0), 0);
        assert_eq!(m1.len(), 1);
        assert_eq!(m5.len(), 1);
    }

    proptest! {
        #[test]
        fn series_is_contiguous_and_ohlc_ordered(
            start in 0i64..10_000_000,
            trades in prop::collection::vec((1.0f64..1_000.0, 0.0f64..10.0, 0i64..(10 * MIN)), 1..200),
        ) {
            let agg = one_minute();
            let mut ts = start;
            for (price, size, delta) in trades {
                ts += delta;
                agg.ingest(price, size, ts);

                let last = agg.last().unwrap();
                prop_assert!(last.low <= last.open && last.open <= last.high);
                prop_assert!(last.low <= last.close && last.close <= last.high);
                prop_assert!(last.timestamp <= ts && ts < last.timestamp + MIN);
            }

            let candles = agg.candles();
            for pair in candles.windows(2) {
                prop_assert_eq!(pair[1].timestamp - pair[0].timestamp, MIN);
            }
            for c in &candles {
                prop_assert!(c.low <= c.open.min(c.close));
                prop_assert!(c.open.max(c.close) <= c.high);
            }
        }
    }
}
