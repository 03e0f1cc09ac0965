// =============================================================================
// Momentum Strategy — quick moves on high-volume stocks
// =============================================================================
//
// Entry: price change over the lookback window beyond a threshold, confirmed
// by above-average volume. Confidence scales with both the move and the
// volume ratio; an extreme RSI trims it back.
// =============================================================================

use chrono::Utc;

use crate::indicators::{atr, rsi};
use crate::types::{round2, Direction, PriceBar, Strength, TradingSignal};

use super::{protective_levels, Strategy};

pub struct MomentumStrategy {
    /// Days over which momentum is measured.
    pub lookback: usize,
    /// Current volume must exceed this multiple of the average.
    pub volume_threshold: f64,
    /// Minimum % move to trigger.
    pub momentum_threshold: f64,
}

impl Default for MomentumStrategy {
    fn default() -> Self {
        Self {
            lookback: 5,
            volume_threshold: 1.5,
            momentum_threshold: 2.0,
        }
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn description(&self) -> &'static str {
        "Capture quick moves on high-momentum stocks"
    }

    fn min_bars(&self) -> usize {
        self.lookback
    }

    fn evaluate(&self, ticker: &str, bars: &[PriceBar]) -> Option<TradingSignal> {
        if bars.len() < self.lookback {
            return None;
        }
        // Most recent lookback + 5 bars are enough for the calculation.
        let recent = &bars[bars.len().saturating_sub(self.lookback + 5)..];

        let current_price = recent.last()?.close;
        let start_price = recent[recent.len() - self.lookback].close;
        if start_price <= 0.0 {
            return None;
        }
        let momentum_pct = (current_price - start_price) / start_price * 100.0;

        let history = &recent[..recent.len() - 1];
        let avg_volume: f64 =
            history.iter().map(|b| b.volume).sum::<f64>() / history.len() as f64;
        let volume_ratio = if avg_volume > 0.0 {
            recent.last()?.volume / avg_volume
        } else {
            0.0
        };

        let closes: Vec<f64> = recent.iter().map(|b| b.close).collect();
        let rsi = rsi::latest_rsi(&closes, 14);

        let mut direction = Direction::Neutral;
        let mut strength = Strength::Weak;
        let mut confidence = 50.0;
        let mut reasoning = Vec::new();

        if momentum_pct > self.momentum_threshold && volume_ratio > self.volume_threshold {
            direction = Direction::Long;
            confidence =
                (50.0 + momentum_pct * 5.0 + (volume_ratio - 1.0) * 10.0).min(80.0);

            if momentum_pct > 5.0 && volume_ratio > 2.0 {
                strength = Strength::Strong;
            } else if momentum_pct > 3.0 || volume_ratio > 1.75 {
                strength = Strength::Moderate;
            }

            reasoning.push(format!(
                "Bullish momentum +{momentum_pct:.1}% in {} days",
                self.lookback
            ));
            reasoning.push(format!("Volume {volume_ratio:.1}x average"));

            if let Some(r) = rsi {
                if r > 70.0 {
                    confidence -= 10.0;
                    reasoning.push(format!("RSI {r:.0} (overbought)"));
                }
            }
        } else if momentum_pct < -self.momentum_threshold && volume_ratio > self.volume_threshold {
            direction = Direction::Short;
            confidence =
                (50.0 + momentum_pct.abs() * 5.0 + (volume_ratio - 1.0) * 10.0).min(80.0);

            if momentum_pct.abs() > 5.0 && volume_ratio > 2.0 {
                strength = Strength::Strong;
            } else if momentum_pct.abs() > 3.0 || volume_ratio > 1.75 {
                strength = Strength::Moderate;
            }

            reasoning.push(format!(
                "Bearish momentum {momentum_pct:.1}% in {} days",
                self.lookback
            ));
            reasoning.push(format!("Volume {volume_ratio:.1}x average"));

            if let Some(r) = rsi {
                if r < 30.0 {
                    confidence -= 10.0;
                    reasoning.push(format!("RSI {r:.0} (oversold)"));
                }
            }
        }

        if direction == Direction::Neutral {
            return None;
        }

        let stop_distance = atr::calculate(bars)
            .map(|a| a * 1.5)
            .unwrap_or(current_price * 0.03);
        let (stop_loss, take_profit) =
            protective_levels(direction, current_price, stop_distance, 2.0);

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
    use crate::testutil::bars_with_volumes;

    #[test]
    fn insufficient_bars_yields_no_signal() {
        let strategy = MomentumStrategy::default();
        let bars = bars_with_volumes(&[100.0, 101.0], &[1e6, 1e6]);
        assert!(strategy.evaluate("AAPL", &bars).is_none());
        assert!(strategy.evaluate("AAPL", &[]).is_none());
    }

    #[test]
    fn rising_price_with_volume_goes_long() {
        // 10 bars of accelerating closes with a volume push at the end.
        let closes = [100.0, 100.0, 101.0, 102.0, 103.0, 104.0, 106.0, 108.0, 110.0, 112.0];
        let volumes = [1e6, 1e6, 1e6, 1e6, 1e6, 1e6, 1.4e6, 1.5e6, 1.7e6, 2.0e6];
        let bars = bars_with_volumes(&closes, &volumes);

        let signal = MomentumStrategy::default().evaluate("AAPL", &bars).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert!(
            (70.0..=85.0).contains(&signal.confidence),
            "confidence {} out of expected range",
            signal.confidence
        );
        assert_eq!(signal.entry_price, 112.0);
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.take_profit > signal.entry_price);
        assert!(signal.reasoning.contains("momentum"));
        assert!(signal.reasoning.contains("Volume"));
        assert_eq!(signal.strength, Strength::Moderate);
    }

    #[test]
    fn falling_price_with_volume_goes_short() {
        let closes = [112.0, 110.0, 108.0, 106.0, 104.0, 103.0, 102.0, 101.0, 100.0, 98.0];
        let volumes = [1e6, 1e6, 1e6, 1e6, 1e6, 1e6, 1.4e6, 1.5e6, 1.7e6, 2.2e6];
        let bars = bars_with_volumes(&closes, &volumes);

        let signal = MomentumStrategy::default().evaluate("AAPL", &bars).unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.stop_loss > signal.entry_price);
        assert!(signal.take_profit < signal.entry_price);
        assert!(signal.reasoning.contains("momentum"));
    }

    #[test]
    fn move_without_volume_is_neutral() {
        let closes = [100.0, 100.0, 101.0, 102.0, 103.0, 104.0, 106.0, 108.0, 110.0, 112.0];
        let volumes = [1e6; 10];
        let bars = bars_with_volumes(&closes, &volumes);
        assert!(MomentumStrategy::default().evaluate("AAPL", &bars).is_none());
    }

    #[test]
    fn flat_market_is_neutral() {
        let bars = bars_with_volumes(&[100.0; 10], &[1e6; 10]);
        assert!(MomentumStrategy::default().evaluate("AAPL", &bars).is_none());
    }

    #[test]
    fn confidence_never_exceeds_cap() {
        // Enormous move and volume spike.
        let closes = [100.0, 100.0, 102.0, 105.0, 110.0, 115.0, 120.0, 130.0, 140.0, 160.0];
        let volumes = [1e6, 1e6, 1e6, 1e6, 1e6, 1e6, 1e6, 1e6, 1e6, 9e6];
        let bars = bars_with_volumes(&closes, &volumes);
        let signal = MomentumStrategy::default().evaluate("AAPL", &bars).unwrap();
        assert!(signal.confidence <= 90.0);
        assert_eq!(signal.strength, Strength::Strong);
    }
}
