// =============================================================================
// Bollinger Bands — SMA ± k standard deviations
// =============================================================================
//
// middle = SMA(period)
// upper  = middle + k * stdev
// lower  = middle - k * stdev
//
// Standard deviation is the sample deviation (n - 1) over the window.
// Defaults: period 20, k = 2.
// =============================================================================

use super::ema::calculate_sma;

/// Band triple: upper, middle, lower.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl Bands {
    /// Band width (upper − lower).
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Compute Bollinger Bands over the last `period` closes.
///
/// Returns `None` when `period < 2`, there are fewer than `period` values, or
/// any intermediate value is non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, k: f64) -> Option<Bands> {
    if period < 2 || closes.len() < period {
        return None;
    }

    let middle = calculate_sma(closes, period)?;
    let window = &closes[closes.len() - period..];

    let variance = window
        .iter()
        .map(|&c| {
            let d = c - middle;
            d * d
        })
        .sum::<f64>()
        / (period as f64 - 1.0);
    let stdev = variance.sqrt();

    if !stdev.is_finite() {
        return None;
    }

    Some(Bands {
        upper: middle + stdev * k,
        middle,
        lower: middle - stdev * k,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.0; 10], 20, 2.0).is_none());
        assert!(calculate_bollinger(&[1.0, 2.0], 1, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat_series_collapses_to_middle() {
        let closes = vec![100.0; 25];
        let bands = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!((bands.upper - 100.0).abs() < 1e-10);
        assert!((bands.middle - 100.0).abs() < 1e-10);
        assert!((bands.lower - 100.0).abs() < 1e-10);
        assert!(bands.width().abs() < 1e-10);
    }

    #[test]
    fn bollinger_band_ordering() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64 * 0.9).sin() * 4.0).collect();
        let bands = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bands.upper > bands.middle);
        assert!(bands.middle > bands.lower);
    }

    #[test]
    fn bollinger_wider_k_widens_bands() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let narrow = calculate_bollinger(&closes, 20, 1.0).unwrap();
        let wide = calculate_bollinger(&closes, 20, 3.0).unwrap();
        assert!(wide.width() > narrow.width());
        assert!((wide.middle - narrow.middle).abs() < 1e-10);
    }

    #[test]
    fn bollinger_nan_rejected() {
        let mut closes = vec![100.0; 25];
        closes[24] = f64::NAN;
        assert!(calculate_bollinger(&closes, 20, 2.0).is_none());
    }
}
