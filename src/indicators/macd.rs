// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   macd_line = EMA(close, fast) - EMA(close, slow)
//   signal    = EMA(macd_line, signal_period)
//   histogram = macd_line - signal
//
// A bearish state (`macd < signal`) lets the smart exit close a long; the
// symmetric crossover closes a short.

use crate::indicators::ema::calculate_ema;

/// Latest MACD values.
#[derive(Debug, Clone, Copy)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

impl MacdResult {
    pub fn is_bearish(&self) -> bool {
        self.macd < self.signal
    }

    pub fn is_bullish(&self) -> bool {
        self.macd > self.signal
    }
}

/// Compute the most recent MACD from `closes` (oldest first).
///
/// Requires at least `slow + signal_period - 1` closes; `None` otherwise or
/// when `fast >= slow`.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period - 1 {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_slow.is_empty() {
        return None;
    }

    // Both series end at the last close; align them from the tail.
    let overlap = ema_slow.len().min(ema_fast.len());
    let fast_tail = &ema_fast[ema_fast.len() - overlap..];
    let slow_tail = &ema_slow[ema_slow.len() - overlap..];

    let macd_series: Vec<f64> = fast_tail
        .iter()
        .zip(slow_tail)
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = calculate_ema(&macd_series, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_series.last()?;

    let result = MacdResult {
        macd,
        signal,
        histogram: macd - signal,
    };
    (result.macd.is_finite() && result.signal.is_finite()).then_some(result)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_on_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn none_on_degenerate_periods() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
    }

    #[test]
    fn flat_market_macd_is_zero() {
        let closes = vec![100.0; 60];
        let m = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd.abs() < 1e-9);
        assert!(m.signal.abs() < 1e-9);
        assert!(m.histogram.abs() < 1e-9);
    }

    #[test]
    fn uptrend_is_bullish() {
        let closes: Vec<f64> = (1..=80).map(|x| 100.0 + x as f64).collect();
        let m = calculate_macd(&closes, 12, 26, 9).unwrap();
        // Fast EMA above slow EMA in a steady rise.
        assert!(m.macd > 0.0);
    }

    #[test]
    fn downtrend_turns_bearish() {
        // Rise then sharp fall: macd should drop below its signal line.
        let mut closes: Vec<f64> = (1..=60).map(|x| 100.0 + x as f64).collect();
        closes.extend((1..=20).map(|x| 160.0 - 3.0 * x as f64));
        let m = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(m.is_bearish());
    }
}
