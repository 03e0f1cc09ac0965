// =============================================================================
// Breakout Micro Strategy — small-account range breakouts
// =============================================================================
//
// Entry: close escapes the previous N-day closing range by at least 0.3%.
// Stop is half the range (floored at 1.5% of price), 1.5:1 reward,
// confidence capped at 75.
// =============================================================================

use chrono::Utc;

use crate::indicators::rsi;
use crate::types::{round2, Direction, PriceBar, Strength, TradingSignal};

use super::{protective_levels, Strategy};

pub struct BreakoutMicroStrategy {
    /// Days defining the range, excluding the current bar.
    pub lookback: usize,
}

impl Default for BreakoutMicroStrategy {
    fn default() -> Self {
        Self { lookback: 5 }
    }
}

impl Strategy for BreakoutMicroStrategy {
    fn name(&self) -> &'static str {
        "breakout_micro"
    }

    fn description(&self) -> &'static str {
        "Micro-trades on range breakouts"
    }

    fn min_bars(&self) -> usize {
        self.lookback + 2
    }

    fn evaluate(&self, ticker: &str, bars: &[PriceBar]) -> Option<TradingSignal> {
        if bars.len() < self.lookback + 2 {
            return None;
        }
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let current_price = *closes.last()?;

        // Range over the lookback window, excluding the current bar.
        let range_window = &closes[closes.len() - 1 - self.lookback..closes.len() - 1];
        let range_high = range_window.iter().fold(f64::MIN, |a, &b| a.max(b));
        let range_low = range_window.iter().fold(f64::MAX, |a, &b| a.min(b));
        if range_low <= 0.0 {
            return None;
        }
        let range_size = range_high - range_low;
        let range_pct = range_size / range_low * 100.0;

        let rsi = rsi::latest_rsi(&closes, 14);

        let mut direction = Direction::Neutral;
        let mut strength = Strength::Weak;
        let mut confidence = 50.0;
        let mut reasoning = Vec::new();

        if current_price > range_high {
            let breakout_pct = (current_price - range_high) / range_high * 100.0;
            if breakout_pct > 0.3 {
                direction = Direction::Long;
                confidence = 55.0 + (breakout_pct * 10.0).min(20.0);
                strength = if breakout_pct > 1.0 {
                    Strength::Moderate
                } else {
                    Strength::Weak
                };
                reasoning.push(format!(
                    "Breakout above ${range_high:.2} (+{breakout_pct:.2}%)"
                ));
                reasoning.push(format!("Range was {range_pct:.1}%"));

                if let Some(r) = rsi {
                    if r < 70.0 {
                        reasoning.push(format!("RSI {r:.0} (not overbought)"));
                    }
                }
            }
        } else if current_price < range_low {
            let breakdown_pct = (range_low - current_price) / range_low * 100.0;
            if breakdown_pct > 0.3 {
                direction = Direction::Short;
                confidence = 55.0 + (breakdown_pct * 10.0).min(20.0);
                strength = if breakdown_pct > 1.0 {
                    Strength::Moderate
                } else {
                    Strength::Weak
                };
                reasoning.push(format!(
                    "Breakdown below ${range_low:.2} (-{breakdown_pct:.2}%)"
                ));
                reasoning.push(format!("Range was {range_pct:.1}%"));

                if let Some(r) = rsi {
                    if r > 30.0 {
                        reasoning.push(format!("RSI {r:.0} (not oversold)"));
                    }
                }
            }
        }

        if direction == Direction::Neutral {
            return None;
        }

        let stop_distance = (range_size * 0.5).max(current_price * 0.015);
        let (stop_loss, take_profit) =
            protective_levels(direction, current_price, stop_distance, 1.5);

        Some(TradingSignal {
            ticker: ticker.to_string(),
            strategy: self.name().to_string(),
            direction,
            strength,
            confidence: confidence.min(75.0),
            entry_price: current_price,
            stop_loss: round2(stop_loss),
            take_profit: round2(take_profit),
            position_size_pct: 0.03,
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
        let strategy = BreakoutMicroStrategy::default();
        assert!(strategy.evaluate("SOFI", &bars_from_closes(&[10.0; 6])).is_none());
    }

    #[test]
    fn breakout_above_range_goes_long() {
        // Range 99.5..100.5, then a 1%+ breakout.
        let bars = bars_from_closes(&[100.0, 99.5, 100.2, 100.5, 99.8, 100.1, 101.6]);
        let signal = BreakoutMicroStrategy::default().evaluate("SOFI", &bars).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.reasoning.contains("Breakout above"));
        assert!(signal.reasoning.contains("Range was"));
        assert!(signal.confidence <= 75.0);
        assert_eq!(signal.strength, Strength::Moderate);
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.take_profit > signal.entry_price);
    }

    #[test]
    fn breakdown_below_range_goes_short() {
        let bars = bars_from_closes(&[100.0, 100.5, 100.2, 99.9, 100.3, 100.0, 98.4]);
        let signal = BreakoutMicroStrategy::default().evaluate("SOFI", &bars).unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.reasoning.contains("Breakdown below"));
        assert!(signal.stop_loss > signal.entry_price);
        assert!(signal.take_profit < signal.entry_price);
    }

    #[test]
    fn marginal_poke_above_range_is_neutral() {
        // Breakout of only ~0.1%: below the 0.3% requirement.
        let bars = bars_from_closes(&[100.0, 99.5, 100.2, 100.5, 99.8, 100.1, 100.6]);
        assert!(BreakoutMicroStrategy::default().evaluate("SOFI", &bars).is_none());
    }

    #[test]
    fn inside_range_is_neutral() {
        let bars = bars_from_closes(&[100.0, 99.5, 100.2, 100.5, 99.8, 100.1, 100.0]);
        assert!(BreakoutMicroStrategy::default().evaluate("SOFI", &bars).is_none());
    }

    #[test]
    fn stop_respects_minimum_distance() {
        // Tiny range forces the 1.5% floor.
        let bars = bars_from_closes(&[100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.5]);
        let signal = BreakoutMicroStrategy::default().evaluate("SOFI", &bars);
        // 0.5% breakout of a zero-width range.
        let signal = signal.unwrap();
        let stop_distance = signal.entry_price - signal.stop_loss;
        assert!(stop_distance >= signal.entry_price * 0.0149);
    }
}
