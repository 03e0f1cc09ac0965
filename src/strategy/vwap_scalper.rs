// =============================================================================
// VWAP Scalper Strategy — small-account quick scalps
// =============================================================================
//
// Entry: price stretched 0.5%+ away from the 5-day average price (a VWAP
// proxy without intraday volume data) with short-term momentum in the same
// direction. Tight fixed stops, 1.5:1 reward, confidence capped at 75.
// =============================================================================

use chrono::Utc;

use crate::indicators::rsi;
use crate::types::{round2, Direction, PriceBar, Strength, TradingSignal};

use super::{protective_levels, Strategy};

pub struct VwapScalperStrategy {
    /// Days folded into the VWAP proxy.
    pub window: usize,
    /// Fixed stop as a fraction of entry.
    pub stop_loss_pct: f64,
}

impl Default for VwapScalperStrategy {
    fn default() -> Self {
        Self {
            window: 5,
            stop_loss_pct: 0.015,
        }
    }
}

impl Strategy for VwapScalperStrategy {
    fn name(&self) -> &'static str {
        "vwap_scalper"
    }

    fn description(&self) -> &'static str {
        "Quick scalps on VWAP crossovers"
    }

    fn min_bars(&self) -> usize {
        self.window
    }

    fn evaluate(&self, ticker: &str, bars: &[PriceBar]) -> Option<TradingSignal> {
        if bars.len() < self.window {
            return None;
        }
        let recent = &bars[bars.len() - self.window..];
        let closes: Vec<f64> = recent.iter().map(|b| b.close).collect();
        let current_price = *closes.last()?;

        let vwap_approx = closes.iter().sum::<f64>() / closes.len() as f64;
        if vwap_approx <= 0.0 {
            return None;
        }

        let pivot = closes[closes.len() - 3];
        let short_momentum = if pivot > 0.0 {
            (current_price - pivot) / pivot * 100.0
        } else {
            0.0
        };

        let rsi = rsi::latest_rsi(&closes, 14);

        let mut direction = Direction::Neutral;
        let mut strength = Strength::Weak;
        let mut confidence = 50.0;
        let mut reasoning = Vec::new();

        if current_price > vwap_approx * 1.005 && short_momentum > 0.5 {
            direction = Direction::Long;
            confidence = 55.0 + (short_momentum * 5.0).min(20.0);
            strength = if short_momentum > 1.0 {
                Strength::Moderate
            } else {
                Strength::Weak
            };
            reasoning.push(format!(
                "Price above VWAP (+{:.2}%)",
                (current_price / vwap_approx - 1.0) * 100.0
            ));
            reasoning.push(format!("Short momentum: +{short_momentum:.2}%"));

            if let Some(r) = rsi {
                if r < 65.0 {
                    reasoning.push(format!("RSI {r:.0} (room to run)"));
                } else if r > 70.0 {
                    confidence -= 10.0;
                    reasoning.push(format!("RSI {r:.0} (overbought)"));
                }
            }
        } else if current_price < vwap_approx * 0.995 && short_momentum < -0.5 {
            direction = Direction::Short;
            confidence = 55.0 + (short_momentum.abs() * 5.0).min(20.0);
            strength = if short_momentum.abs() > 1.0 {
                Strength::Moderate
            } else {
                Strength::Weak
            };
            reasoning.push(format!(
                "Price below VWAP ({:.2}%)",
                (current_price / vwap_approx - 1.0) * 100.0
            ));
            reasoning.push(format!("Short momentum: {short_momentum:.2}%"));

            if let Some(r) = rsi {
                if r > 35.0 {
                    reasoning.push(format!("RSI {r:.0} (room to fall)"));
                } else if r < 30.0 {
                    confidence -= 10.0;
                    reasoning.push(format!("RSI {r:.0} (oversold)"));
                }
            }
        }

        if direction == Direction::Neutral {
            return None;
        }

        let stop_distance = current_price * self.stop_loss_pct;
        let (stop_loss, take_profit) =
            protective_levels(direction, current_price, stop_distance, 1.5);

        Some(TradingSignal {
            ticker: ticker.to_string(),
            strategy: self.name().to_string(),
            direction,
            strength,
            // Scalps never get high conviction.
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
        let strategy = VwapScalperStrategy::default();
        assert!(strategy.evaluate("F", &bars_from_closes(&[10.0; 3])).is_none());
    }

    #[test]
    fn push_above_average_with_momentum_goes_long() {
        // Average near 100, last close stretched above with momentum.
        let bars = bars_from_closes(&[99.5, 99.8, 100.0, 100.9, 101.8]);
        let signal = VwapScalperStrategy::default().evaluate("F", &bars).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.confidence <= 75.0);
        assert!(signal.reasoning.contains("VWAP"));
        assert!(signal.reasoning.contains("momentum"));
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.take_profit > signal.entry_price);
        assert_eq!(signal.position_size_pct, 0.03);
    }

    #[test]
    fn slide_below_average_with_momentum_goes_short() {
        let bars = bars_from_closes(&[100.5, 100.2, 100.0, 99.1, 98.2]);
        let signal = VwapScalperStrategy::default().evaluate("F", &bars).unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.stop_loss > signal.entry_price);
        assert!(signal.take_profit < signal.entry_price);
    }

    #[test]
    fn stretch_without_momentum_is_neutral() {
        // Above the average but the 3-day momentum is flat.
        let bars = bars_from_closes(&[98.0, 98.2, 101.0, 101.0, 101.1]);
        assert!(VwapScalperStrategy::default().evaluate("F", &bars).is_none());
    }

    #[test]
    fn flat_series_is_neutral() {
        let bars = bars_from_closes(&[100.0; 5]);
        assert!(VwapScalperStrategy::default().evaluate("F", &bars).is_none());
    }
}
