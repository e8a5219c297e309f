// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle = SMA, bands at ±k standard deviations. The normalised band width
//   BBW = (upper - lower) / middle * 100
// is what the regime detector consumes.

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Bands over the trailing `period` closes. `None` on short input or a zero
/// middle band.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    width.is_finite().then_some(BollingerBands {
        upper,
        middle,
        lower,
        width,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_on_short_input() {
        assert!(calculate_bollinger(&[1.0, 2.0], 20, 2.0).is_none());
        assert!(calculate_bollinger(&[], 20, 2.0).is_none());
    }

    #[test]
    fn flat_series_has_zero_width() {
        let closes = vec![100.0; 25];
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!((bb.width).abs() < 1e-9);
        assert!((bb.upper - bb.lower).abs() < 1e-9);
    }

    #[test]
    fn bands_bracket_the_mean() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn wider_dispersion_means_wider_bands() {
        let calm: Vec<f64> = (0..20).map(|i| 100.0 + (i % 2) as f64 * 0.1).collect();
        let wild: Vec<f64> = (0..20).map(|i| 100.0 + (i % 2) as f64 * 5.0).collect();
        let calm_bb = calculate_bollinger(&calm, 20, 2.0).unwrap();
        let wild_bb = calculate_bollinger(&wild, 20, 2.0).unwrap();
        assert!(wild_bb.width > calm_bb.width);
    }
}
