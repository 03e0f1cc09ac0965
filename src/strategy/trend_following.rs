// =============================================================================
// Trend Following Strategy — ride multi-day trends
// =============================================================================
//
// Entry: short EMA above/below the long SMA, with a fresh crossover or a
// wide MA spread raising strength. Proximity to the 20-day extreme adds
// confidence. Wider ATR stop to survive trend noise.
// =============================================================================

use chrono::Utc;

use crate::indicators::{atr, ema};
use crate::types::{round2, Direction, PriceBar, Strength, TradingSignal};

use super::{protective_levels, Strategy};

pub struct TrendFollowingStrategy {
    pub short_ma_period: usize,
    pub long_ma_period: usize,
    /// Window for breakout proximity checks.
    pub breakout_period: usize,
}

impl Default for TrendFollowingStrategy {
    fn default() -> Self {
        Self {
            short_ma_period: 10,
            long_ma_period: 50,
            breakout_period: 20,
        }
    }
}

impl Strategy for TrendFollowingStrategy {
    fn name(&self) -> &'static str {
        "trend_following"
    }

    fn description(&self) -> &'static str {
        "Ride multi-day trends"
    }

    fn min_bars(&self) -> usize {
        self.long_ma_period
    }

    fn evaluate(&self, ticker: &str, bars: &[PriceBar]) -> Option<TradingSignal> {
        if bars.len() < self.long_ma_period {
            return None;
        }
        let recent = &bars[bars.len().saturating_sub(self.long_ma_period + 10)..];
        let closes: Vec<f64> = recent.iter().map(|b| b.close).collect();
        let current_price = *closes.last()?;

        let short_ma = ema::calculate_ema(&closes, self.short_ma_period)?;
        let long_ma = ema::calculate_sma(&closes, self.long_ma_period)?;
        if long_ma == 0.0 {
            return None;
        }
        let ma_diff_pct = (short_ma - long_ma) / long_ma * 100.0;

        // Crossover detection against yesterday's MAs.
        let prev_closes = &closes[..closes.len() - 1];
        let prev_short = ema::calculate_ema(prev_closes, self.short_ma_period);
        let prev_long = ema::calculate_sma(prev_closes, self.long_ma_period);
        let (golden_cross, death_cross) = match (prev_short, prev_long) {
            (Some(ps), Some(pl)) => (ps < pl && short_ma > long_ma, ps > pl && short_ma < long_ma),
            _ => (false, false),
        };

        let window = &recent[recent.len() - self.breakout_period.min(recent.len())..];
        let high_20 = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low_20 = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);

        let mut direction = Direction::Neutral;
        let mut strength = Strength::Weak;
        let mut confidence: f64 = 50.0;
        let mut reasoning = Vec::new();

        if short_ma > long_ma {
            direction = Direction::Long;

            if golden_cross {
                strength = Strength::Strong;
                confidence = 75.0;
                reasoning.push("Golden cross (bullish crossover)".to_string());
            } else if ma_diff_pct > 5.0 {
                strength = Strength::Strong;
                confidence = 70.0;
                reasoning.push(format!("Strong uptrend: {ma_diff_pct:.1}% above 50-day MA"));
            } else if ma_diff_pct > 2.0 {
                strength = Strength::Moderate;
                confidence = 60.0;
                reasoning.push(format!("Moderate uptrend: {ma_diff_pct:.1}% above 50-day MA"));
            } else {
                confidence = 55.0;
                reasoning.push(format!("Weak uptrend: {ma_diff_pct:.1}% above 50-day MA"));
            }

            if current_price >= high_20 * 0.99 {
                confidence += 10.0;
                reasoning.push(format!("Near 20-day high: ${high_20:.2}"));
            }
        } else if short_ma < long_ma {
            direction = Direction::Short;
            let spread = ma_diff_pct.abs();

            if death_cross {
                strength = Strength::Strong;
                confidence = 75.0;
                reasoning.push("Death cross (bearish crossover)".to_string());
            } else if spread > 5.0 {
                strength = Strength::Strong;
                confidence = 70.0;
                reasoning.push(format!("Strong downtrend: {spread:.1}% below 50-day MA"));
            } else if spread > 2.0 {
                strength = Strength::Moderate;
                confidence = 60.0;
                reasoning.push(format!("Moderate downtrend: {spread:.1}% below 50-day MA"));
            } else {
                confidence = 55.0;
                reasoning.push(format!("Weak downtrend: {spread:.1}% below 50-day MA"));
            }

            if current_price <= low_20 * 1.01 {
                confidence += 10.0;
                reasoning.push(format!("Near 20-day low: ${low_20:.2}"));
            }
        }

        if direction == Direction::Neutral {
            return None;
        }

        // Wider stop for trend trades.
        let stop_distance = atr::calculate(recent)
            .map(|a| a * 2.5)
            .unwrap_or(current_price * 0.05);
        let (stop_loss, take_profit) =
            protective_levels(direction, current_price, stop_distance, 2.0);

        Some(TradingSignal {
            ticker: ticker.to_string(),
            strategy: self.name().to_string(),
            direction,
            strength,
            confidence: confidence.min(85.0),
            entry_price: current_price,
            stop_loss: round2(stop_loss),
            take_profit: round2(take_profit),
            position_size_pct: 0.08,
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
        let strategy = TrendFollowingStrategy::default();
        assert!(strategy.evaluate("AAPL", &bars_from_closes(&[100.0; 30])).is_none());
    }

    #[test]
    fn steady_uptrend_goes_long_with_breakout_boost() {
        // 60 bars climbing 0.6% a day: short EMA well above long SMA and the
        // close sits at the 20-day high.
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 1.006_f64.powi(i)).collect();
        let bars = bars_from_closes(&closes);

        let signal = TrendFollowingStrategy::default()
            .evaluate("AAPL", &bars)
            .unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.reasoning.contains("uptrend") || signal.reasoning.contains("cross"));
        assert!(signal.reasoning.contains("Near 20-day high"));
        assert!(signal.confidence <= 85.0);
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.take_profit > signal.entry_price);
        assert_eq!(signal.position_size_pct, 0.08);
    }

    #[test]
    fn steady_downtrend_goes_short() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 0.994_f64.powi(i)).collect();
        let bars = bars_from_closes(&closes);

        let signal = TrendFollowingStrategy::default()
            .evaluate("AAPL", &bars)
            .unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.reasoning.contains("downtrend") || signal.reasoning.contains("cross"));
        assert!(signal.stop_loss > signal.entry_price);
        assert!(signal.take_profit < signal.entry_price);
    }

    #[test]
    fn strong_trend_is_tagged_strong() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 1.01_f64.powi(i)).collect();
        let bars = bars_from_closes(&closes);
        let signal = TrendFollowingStrategy::default()
            .evaluate("AAPL", &bars)
            .unwrap();
        assert_eq!(signal.strength, Strength::Strong);
    }
}
