// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
//   TR    = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR_0 = SMA of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period

use crate::market_data::Candle;

/// Most recent ATR value over `candles` (oldest first).
///
/// Needs `period + 1` candles (each TR consumes the previous close). `None`
/// on short input or non-finite intermediates.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            (w[1].high - w[1].low)
                .max((w[1].high - prev_close).abs())
                .max((w[1].low - prev_close).abs())
        })
        .collect();

    let period_f = period as f64;
    let mut atr: f64 = true_ranges[..period].iter().sum::<f64>() / period_f;

    for &tr in &true_ranges[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
    }

    atr.is_finite().then_some(atr)
}

/// ATR normalised by the last close, in percent. Comparable across symbols.
pub fn calculate_atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last = candles.last()?.close;
    (last > 0.0).then(|| atr / last * 100.0)
}
