// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// Trend strength regardless of direction:
//   1. +DM / -DM and TR per bar.
//   2. Wilder's smoothing of all three over `period`.
//   3. +DI = 100 * smoothed(+DM) / smoothed(TR), -DI symmetric.
//   4. DX  = 100 * |+DI - -DI| / (+DI + -DI)
//   5. ADX = Wilder's smoothed DX.
//
// ADX > 25 reads as trending, ADX < 20 as ranging/choppy.

use crate::market_data::Candle;

/// Most recent ADX value. Needs at least `2 * period + 1` candles; `None`
/// otherwise or when the arithmetic degenerates (zero TR everywhere).
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let transitions = candles.len() - 1;
    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr = Vec::with_capacity(transitions);

    for w in candles.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);

        tr.push(
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs()),
        );

        let up = cur.high - prev.high;
        let down = prev.low - cur.low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let period_f = period as f64;
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = tr[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    dx_values.push(directional_index(sm_plus, sm_minus, sm_tr)?);

    for i in period..transitions {
        sm_plus = sm_plus - sm_plus / period_f + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period_f + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period_f + tr[i];
        dx_values.push(directional_index(sm_plus, sm_minus, sm_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    adx.is_finite().then_some(adx)
}

fn directional_index(sm_plus: f64, sm_minus: f64, sm_tr: f64) -> Option<f64> {
    if sm_tr <= 0.0 {
        return None;
    }
    let plus_di = 100.0 * sm_plus / sm_tr;
    let minus_di = 100.0 * sm_minus / sm_tr;
    let sum = plus_di + minus_di;
    if sum == 0.0 {
        // No directional movement at all: DX is zero by convention.
        return Some(0.0);
    }
    let dx = 100.0 * (plus_di - minus_di).abs() / sum;
    dx.is_finite().then_some(dx)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn none_on_insufficient_data() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(i, 99.0, 101.0, 100.0)).collect();
        assert!(calculate_adx(&candles, 14).is_none());
    }

    #[test]
    fn strong_uptrend_reads_high() {
        // Steadily rising highs and lows: pure +DM.
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(i, base - 0.5, base + 0.5, base)
            })
            .collect();
        let adx = calculate_adx(&candles, 14).unwrap();
        assert!(adx > 25.0, "uptrend ADX should exceed 25, got {adx}");
    }

    #[test]
    fn alternating_chop_reads_low() {
        // Symmetric zig-zag: +DM and -DM cancel out over the window.
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let base = if i % 2 == 0 { 100.0 } else { 101.0 };
                candle(i, base - 1.0, base + 1.0, base)
            })
            .collect();
        let adx = calculate_adx(&candles, 14).unwrap();
        assert!(adx < 25.0, "choppy ADX should stay low, got {adx}");
    }

    #[test]
    fn adx_within_bounds() {
        let candles: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 3.0;
                candle(i, base - 1.0, base + 1.0, base)
            })
            .collect();
        let adx = calculate_adx(&candles, 14).unwrap();
        assert!((0.0..=100.0).contains(&adx));
    }
}
