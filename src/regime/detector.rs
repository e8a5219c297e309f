// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Classifies each symbol from its 5m series using trend strength (ADX) and
// volatility expansion (Bollinger band width):
//
//   TRENDING — ADX >= 25: persistent directional move.
//   CHOPPY   — ADX < 20 with expanded bands: directionless volatility.
//   RANGING  — everything else: sideways, mean-reverting.
//   UNKNOWN  — not enough closed candles yet.
//
// Most adaptive parameters key off this label, so the detector runs on the
// orchestrator cadence and transitions are journaled by the caller.

use std::sync::Arc;

use tracing::debug;

use crate::indicators::adx::calculate_adx;
use crate::indicators::bollinger::calculate_bollinger;
use crate::registry::DataRegistry;
use crate::types::{Regime, Timeframe};

/// Candles required before the classifier trusts its inputs.
const MIN_CANDLES: usize = 50;
/// ADX above this reads as a trend.
const TRENDING_ADX: f64 = 25.0;
/// ADX below this reads as no trend at all.
const FLAT_ADX: f64 = 20.0;
/// Band width separating quiet ranges from volatile chop.
const CHOPPY_BBW: f64 = 3.0;

pub struct RegimeDetector {
    data: Arc<DataRegistry>,
}

impl RegimeDetector {
    pub fn new(data: Arc<DataRegistry>) -> Self {
        Self { data }
    }

    /// Classify one symbol from its current 5m series.
    pub fn detect(&self, symbol: &str) -> Regime {
        let candles = self.data.latest_candles(symbol, Timeframe::M5, 120);
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        classify_series(&candles, &closes)
    }

    /// Refresh the per-symbol regimes plus the global regime (the first
    /// configured symbol's label, the original behavior). Returns the
    /// transitions `(symbol, old, new)` for journaling.
    pub fn update_all(&self, symbols: &[String]) -> Vec<(String, Regime, Regime)> {
        let mut transitions = Vec::new();
        for (i, symbol) in symbols.iter().enumerate() {
            let regime = self.detect(symbol);
            if regime == Regime::Unknown {
                continue;
            }
            if let Some(prev) = self.data.update_regime(symbol, regime) {
                debug!(symbol, from = %prev, to = %regime, "regime transition");
                transitions.push((symbol.clone(), prev, regime));
            }
            if i == 0 {
                self.data.update_global_regime(regime);
            }
        }
        transitions
    }
}

/// Pure classification used by the detector and its tests.
pub fn classify_series(candles: &[crate::market_data::Candle], closes: &[f64]) -> Regime {
    if candles.len() < MIN_CANDLES {
        return Regime::Unknown;
    }
    let adx = match calculate_adx(candles, 14) {
        Some(v) => v,
        None => return Regime::Unknown,
    };
    let bbw = calculate_bollinger(closes, 20, 2.0)
        .map(|b| b.width)
        .unwrap_or(0.0);

    if adx >= TRENDING_ADX {
        Regime::Trending
    } else if adx < FLAT_ADX && bbw >= CHOPPY_BBW {
        Regime::Choppy
    } else {
        Regime::Ranging
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;

    fn candle(ts: i64, low: f64, high: f64, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: (low + high) / 2.0,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn series(f: impl Fn(usize) -> (f64, f64, f64), n: usize) -> (Vec<Candle>, Vec<f64>) {
        let candles: Vec<Candle> = (0..n)
            .map(|i| {
                let (low, high, close) = f(i);
                candle(300 * i as i64, low, high, close)
            })
            .collect();
        let closes = candles.iter().map(|c| c.close).collect();
        (candles, closes)
    }

    #[test]
    fn short_series_is_unknown() {
        let (candles, closes) = series(|_| (99.0, 101.0, 100.0), 20);
        assert_eq!(classify_series(&candles, &closes), Regime::Unknown);
    }

    #[test]
    fn steady_climb_is_trending() {
        let (candles, closes) = series(
            |i| {
                let base = 100.0 + i as f64;
                (base - 0.5, base + 0.5, base)
            },
            80,
        );
        assert_eq!(classify_series(&candles, &closes), Regime::Trending);
    }

    #[test]
    fn tight_oscillation_is_ranging() {
        let (candles, closes) = series(
            |i| {
                let base = 100.0 + if i % 2 == 0 { 0.1 } else { -0.1 };
                (base - 0.3, base + 0.3, base)
            },
            80,
        );
        assert_eq!(classify_series(&candles, &closes), Regime::Ranging);
    }

    #[test]
    fn wide_directionless_swings_are_choppy() {
        let (candles, closes) = series(
            |i| {
                let base = 100.0 + if i % 2 == 0 { 3.0 } else { -3.0 };
                (base - 1.0, base + 1.0, base)
            },
            80,
        );
        assert_eq!(classify_series(&candles, &closes), Regime::Choppy);
    }

    #[test]
    fn update_all_reports_transitions_and_sets_global() {
        let data = Arc::new(DataRegistry::new(30.0));
        for i in 0..80usize {
            let base = 100.0 + i as f64;
            data.append_candle(
                "BTC-USDT",
                Timeframe::M5,
                candle(300 * i as i64, base - 0.5, base + 0.5, base),
            );
        }
        let detector = RegimeDetector::new(data.clone());
        let transitions = detector.update_all(&["BTC-USDT".to_string()]);

        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].2, Regime::Trending);
        assert_eq!(data.get_regime("BTC-USDT"), Regime::Trending);
        assert_eq!(data.global_regime(), Regime::Trending);

        // No transition when the regime repeats.
        let transitions = detector.update_all(&["BTC-USDT".to_string()]);
        assert!(transitions.is_empty());
    }
}
