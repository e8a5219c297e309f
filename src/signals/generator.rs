// =============================================================================
// Signal Generator — indicator ensemble over the 5m series
// =============================================================================
//
// Five weighted voters: RSI extremes, EMA stack alignment, MACD crossover,
// ADX trend presence, Bollinger band position. The signed weighted score
// becomes the side; `strength` is |score| clamped to [0, 1] and
// `filters_passed` counts the voters agreeing with the final side. A signal
// is emitted only when `strength >= 0.5` and at least 3 filters agree — the
// same bar the Order Coordinator applies when re-validating a timed-out
// limit order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::indicators::bollinger::calculate_bollinger;
use crate::registry::{DataRegistry, MarketSnapshot};
use crate::types::{Regime, Side, Timeframe};

/// Minimum 5m candles before the ensemble runs.
const MIN_CANDLES: usize = 30;
/// Emission bar shared with the limit-order re-validation path.
pub const MIN_STRENGTH: f64 = 0.5;
pub const MIN_FILTERS_PASSED: u32 = 3;

/// A candidate entry.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    /// Ensemble confidence in [0, 1].
    pub strength: f64,
    /// Number of voters agreeing with `side`.
    pub filters_passed: u32,
    /// Reference price at generation time.
    pub price: f64,
    pub regime: Regime,
    pub tp_percent: Option<f64>,
    pub sl_percent: Option<f64>,
    pub source: &'static str,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    /// The bar used both at emission and at limit-order re-validation.
    pub fn is_actionable(&self) -> bool {
        self.strength >= MIN_STRENGTH && self.filters_passed >= MIN_FILTERS_PASSED
    }
}

struct Voter {
    name: &'static str,
    weight: f64,
    /// -1.0 (short), 0.0 (abstain), +1.0 (long).
    direction: f64,
    confidence: f64,
}

pub struct SignalGenerator {
    config: Arc<Config>,
    data: Arc<DataRegistry>,
}

impl SignalGenerator {
    pub fn new(config: Arc<Config>, data: Arc<DataRegistry>) -> Self {
        Self { config, data }
    }

    /// Evaluate every configured symbol.
    pub fn generate_signals(&self) -> Vec<Signal> {
        self.config
            .symbols
            .iter()
            .filter_map(|s| self.generate_for(s))
            .collect()
    }

    /// Evaluate one symbol against the current market snapshot.
    pub fn generate_for(&self, symbol: &str) -> Option<Signal> {
        let snapshot = self.data.get_market_data(symbol);
        self.evaluate(symbol, &snapshot)
    }

    /// Pure evaluation over a snapshot (also used by tests and the
    /// re-validation path).
    pub fn evaluate(&self, symbol: &str, snapshot: &MarketSnapshot) -> Option<Signal> {
        let candles = snapshot.candles.get(&Timeframe::M5)?;
        if candles.len() < MIN_CANDLES {
            return None;
        }
        let price = snapshot.current_price()?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let ind = &snapshot.indicators;

        let mut voters: Vec<Voter> = Vec::with_capacity(5);

        // RSI extremes vote mean-reversion entries.
        if let Some(rsi) = ind.rsi_14 {
            let (direction, confidence) = if rsi < 30.0 {
                (1.0, (30.0 - rsi) / 30.0 + 0.5)
            } else if rsi > 70.0 {
                (-1.0, (rsi - 70.0) / 30.0 + 0.5)
            } else {
                (0.0, 0.0)
            };
            voters.push(Voter {
                name: "rsi",
                weight: 0.25,
                direction,
                confidence: confidence.min(1.0),
            });
        }

        // EMA stack alignment votes trend continuation.
        if let (Some(e9), Some(e21), Some(e55)) = (ind.ema_9, ind.ema_21, ind.ema_55) {
            let bullish = e9 > e21 && e21 > e55 && price > e9;
            let bearish = e9 < e21 && e21 < e55 && price < e9;
            let (direction, confidence) = if bullish {
                (1.0, 0.8)
            } else if bearish {
                (-1.0, 0.8)
            } else {
                (0.0, 0.0)
            };
            voters.push(Voter {
                name: "ema_stack",
                weight: 0.25,
                direction,
                confidence,
            });
        }

        // MACD crossover direction.
        if let (Some(macd), Some(signal_line)) = (ind.macd_line, ind.macd_signal) {
            let direction = if macd > signal_line {
                1.0
            } else if macd < signal_line {
                -1.0
            } else {
                0.0
            };
            let spread = (macd - signal_line).abs() / price * 10_000.0;
            voters.push(Voter {
                name: "macd",
                weight: 0.20,
                direction,
                confidence: (spread / 5.0).clamp(0.2, 1.0),
            });
        }

        // ADX confirms whatever the trend voters say; it abstains on side
        // but scales the ensemble through its confidence.
        if let Some(adx) = ind.adx_14 {
            let trend_dir = match (ind.ema_9, ind.ema_21) {
                (Some(e9), Some(e21)) if e9 > e21 => 1.0,
                (Some(e9), Some(e21)) if e9 < e21 => -1.0,
                _ => 0.0,
            };
            voters.push(Voter {
                name: "adx",
                weight: 0.15,
                direction: if adx > 20.0 { trend_dir } else { 0.0 },
                confidence: (adx / 50.0).min(1.0),
            });
        }

        // Bollinger band touches vote reversion.
        if let Some(bands) = calculate_bollinger(&closes, 20, 2.0) {
            let direction = if price < bands.lower {
                1.0
            } else if price > bands.upper {
                -1.0
            } else {
                0.0
            };
            voters.push(Voter {
                name: "bollinger",
                weight: 0.15,
                direction,
                confidence: 0.7,
            });
        }

        if voters.is_empty() {
            return None;
        }

        let score: f64 = voters
            .iter()
            .map(|v| v.weight * v.direction * v.confidence)
            .sum();
        let weight_sum: f64 = voters.iter().map(|v| v.weight).sum();
        let strength = (score.abs() / weight_sum.max(f64::EPSILON) * 2.0).min(1.0);

        let side = if score > 0.0 { Side::Long } else { Side::Short };
        let agreeing_names: Vec<&'static str> = voters
            .iter()
            .filter(|v| v.direction == side.dir())
            .map(|v| v.name)
            .collect();
        let agreeing = agreeing_names.len() as u32;

        debug!(
            symbol,
            score = format!("{score:.4}"),
            strength = format!("{strength:.2}"),
            filters_passed = agreeing,
            filters = ?agreeing_names,
            "ensemble evaluated"
        );

        let regime = snapshot.regime;
        let signal = Signal {
            symbol: symbol.to_string(),
            side,
            strength,
            filters_passed: agreeing,
            price,
            regime,
            tp_percent: self.config.resolve(symbol, regime, |p| p.tp_percent),
            sl_percent: self.config.resolve(symbol, regime, |p| p.sl_percent),
            source: "ensemble",
            generated_at: Utc::now(),
        };

        signal.is_actionable().then_some(signal)
    }

    /// Re-validate the originating signal of a resting order: still the same
    /// side and still above the emission bar.
    pub fn revalidate(&self, symbol: &str, side: Side) -> Option<Signal> {
        self.generate_for(symbol).filter(|s| s.side == side)
    }
}
