// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the engine uses
// for signal generation, regime detection, and smart exits. Every public
// function returns `Option<T>` / an empty series so callers must handle
// insufficient data explicitly.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;

/// Snapshot of the indicator values the engine caches per symbol. Attached to
/// market-data snapshots handed out by the Data Registry.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi_14: Option<f64>,
    pub ema_9: Option<f64>,
    pub ema_21: Option<f64>,
    pub ema_55: Option<f64>,
    pub adx_14: Option<f64>,
    pub atr_14: Option<f64>,
    /// ATR normalised by the last close, in percent. Feeds the ATR-derived
    /// take-profit target.
    pub atr_pct_14: Option<f64>,
    pub bollinger_width: Option<f64>,
    pub macd_line: Option<f64>,
    pub macd_signal: Option<f64>,
}

impl IndicatorSnapshot {
    /// Compute the full cache from one candle series (oldest first).
    pub fn compute(candles: &[crate::market_data::Candle]) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let macd = macd::calculate_macd(&closes, 12, 26, 9);
        Self {
            rsi_14: rsi::calculate_rsi(&closes, 14).last().copied(),
            ema_9: ema::calculate_ema(&closes, 9).last().copied(),
            ema_21: ema::calculate_ema(&closes, 21).last().copied(),
            ema_55: ema::calculate_ema(&closes, 55).last().copied(),
            adx_14: adx::calculate_adx(candles, 14),
            atr_14: atr::calculate_atr(candles, 14),
            atr_pct_14: atr::calculate_atr_pct(candles, 14),
            bollinger_width: bollinger::calculate_bollinger(&closes, 20, 2.0).map(|b| b.width),
            macd_line: macd.as_ref().map(|m| m.macd),
            macd_signal: macd.as_ref().map(|m| m.signal),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;

    fn candle(ts: i64, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn snapshot_empty_on_short_series() {
        let candles: Vec<Candle> = (0..5).map(|i| candle(i, 100.0)).collect();
        let snap = IndicatorSnapshot::compute(&candles);
        assert!(snap.rsi_14.is_none());
        assert!(snap.atr_14.is_none());
        assert!(snap.atr_pct_14.is_none());
    }

    #[test]
    fn atr_pct_is_atr_over_last_close() {
        let candles: Vec<Candle> = (0..80).map(|i| candle(i, 100.0)).collect();
        let snap = IndicatorSnapshot::compute(&candles);
        let atr = snap.atr_14.unwrap();
        let atr_pct = snap.atr_pct_14.unwrap();
        assert!((atr_pct - atr / 100.0 * 100.0).abs() < 1e-9);
    }
}
