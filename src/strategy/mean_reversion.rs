// =============================================================================
// Mean Reversion Strategy — fade extreme moves back to the mean
// =============================================================================
//
// Entry: close outside the Bollinger Bands; an extreme RSI boosts strength
// and confidence. Stop sits 25% of the band width beyond the violated band;
// target is the middle band.
// =============================================================================

use chrono::Utc;

use crate::indicators::{bollinger, rsi};
use crate::types::{round2, Direction, PriceBar, Strength, TradingSignal};

use super::Strategy;

pub struct MeanReversionStrategy {
    pub bb_period: usize,
    pub bb_std: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self {
            bb_period: 20,
            bb_std: 2.0,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
        }
    }
}

impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn description(&self) -> &'static str {
        "Fade extreme moves back to mean"
    }

    fn min_bars(&self) -> usize {
        self.bb_period
    }

    fn evaluate(&self, ticker: &str, bars: &[PriceBar]) -> Option<TradingSignal> {
        if bars.len() < self.bb_period {
            return None;
        }
        let recent = &bars[bars.len().saturating_sub(self.bb_period + 5)..];
        let closes: Vec<f64> = recent.iter().map(|b| b.close).collect();
        let current_price = *closes.last()?;

        let bands = bollinger::calculate_bollinger(&closes, self.bb_period, self.bb_std)?;
        let rsi = rsi::latest_rsi(&closes, 14);
        let band_width = bands.width();

        let mut direction = Direction::Neutral;
        let mut strength = Strength::Weak;
        let mut confidence = 50.0;
        let mut reasoning = Vec::new();

        if current_price < bands.lower {
            direction = Direction::Long;
            let distance_pct = (bands.lower - current_price) / bands.lower * 100.0;
            confidence = (60.0 + distance_pct * 5.0).min(85.0);

            if let Some(r) = rsi {
                if r < 25.0 {
                    strength = Strength::Strong;
                    confidence = (confidence + 10.0).min(90.0);
                    reasoning.push(format!("Extreme oversold: RSI {r:.0}"));
                } else if r < self.rsi_oversold {
                    strength = Strength::Moderate;
                    reasoning.push(format!("Oversold: RSI {r:.0}"));
                }
            }

            reasoning.push(format!("Price {distance_pct:.1}% below lower BB"));
            reasoning.push(format!("Target: {:.2} (middle band)", bands.middle));
        } else if current_price > bands.upper {
            direction = Direction::Short;
            let distance_pct = (current_price - bands.upper) / bands.upper * 100.0;
            confidence = (60.0 + distance_pct * 5.0).min(85.0);

            if let Some(r) = rsi {
                if r > 75.0 {
                    strength = Strength::Strong;
                    confidence = (confidence + 10.0).min(90.0);
                    reasoning.push(format!("Extreme overbought: RSI {r:.0}"));
                } else if r > self.rsi_overbought {
                    strength = Strength::Moderate;
                    reasoning.push(format!("Overbought: RSI {r:.0}"));
                }
            }

            reasoning.push(format!("Price {distance_pct:.1}% above upper BB"));
            reasoning.push(format!("Target: {:.2} (middle band)", bands.middle));
        }

        if direction == Direction::Neutral {
            return None;
        }

        // Stop beyond the violated band; take profit at the middle band.
        let (stop_loss, take_profit) = match direction {
            Direction::Long => (bands.lower - band_width * 0.25, bands.middle),
            _ => (bands.upper + band_width * 0.25, bands.middle),
        };

        Some(TradingSignal {
            ticker: ticker.to_string(),
            strategy: self.name().to_string(),
            direction,
            strength,
            confidence: confidence.clamp(0.0, 90.0),
            entry_price: current_price,
            stop_loss: round2(stop_loss),
            take_profit: round2(take_profit),
            position_size_pct: 0.05,
            reasoning: reasoning.join(" | "),
            timestamp: Utc::now(),
            fractionable: true,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::bars_from_closes;

    #[test]
    fn insufficient_bars_yields_no_signal() {
        let strategy = MeanReversionStrategy::default();
        assert!(strategy.evaluate("AAPL", &bars_from_closes(&[100.0; 10])).is_none());
    }

    #[test]
    fn dip_below_lower_band_goes_long() {
        // Choppy 98/102 alternation, then a close just under the lower band.
        let mut closes: Vec<f64> = (0..24)
            .map(|i| if i % 2 == 0 { 98.0 } else { 102.0 })
            .collect();
        closes.push(95.0);
        let bars = bars_from_closes(&closes);

        let signal = MeanReversionStrategy::default()
            .evaluate("AAPL", &bars)
            .unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.reasoning.contains("below lower BB"));
        assert!(signal.reasoning.contains("middle band"));
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.take_profit > signal.entry_price);
        assert!(signal.confidence >= 60.0);
        assert!(signal.confidence <= 90.0);
    }

    #[test]
    fn pop_above_upper_band_goes_short() {
        let mut closes: Vec<f64> = (0..24)
            .map(|i| if i % 2 == 0 { 98.0 } else { 102.0 })
            .collect();
        closes.push(105.0);
        let bars = bars_from_closes(&closes);

        let signal = MeanReversionStrategy::default()
            .evaluate("AAPL", &bars)
            .unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.reasoning.contains("above upper BB"));
        assert!(signal.stop_loss > signal.entry_price);
        assert!(signal.take_profit < signal.entry_price);
    }

    #[test]
    fn price_inside_bands_is_neutral() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + (i % 4) as f64 * 0.5).collect();
        let bars = bars_from_closes(&closes);
        assert!(MeanReversionStrategy::default().evaluate("AAPL", &bars).is_none());
    }

    #[test]
    fn sustained_selloff_marks_oversold() {
        // Sideways for 20 bars, then five hard down days so RSI is crushed
        // and the close finishes below the band.
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 2) as f64 * 0.4).collect();
        closes.extend([96.0, 92.0, 88.0, 84.0, 78.0]);
        let bars = bars_from_closes(&closes);
        let signal = MeanReversionStrategy::default()
            .evaluate("AAPL", &bars)
            .unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.reasoning.to_lowercase().contains("oversold"));
        assert_eq!(signal.strength, Strength::Strong);
    }
}
