// =============================================================================
// Risk Engine — small-account mode, position sizing, protective exits
// =============================================================================
//
// Sizing targets a dollar notional: position_size_pct × equity, capped at
// the explicit per-trade notional while small-account mode is active. The
// result is rejected (PreconditionFailed) when it would breach the buying
// power reserve, the per-ticker price cap, or the position cap.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::{Settings, SmallAccountSettings};
use crate::error::{Result, TradingError};
use crate::types::round_qty;

/// ATR multiplier for the protective stop.
const ATR_STOP_MULTIPLIER: f64 = 2.0;
/// ATR multiplier for the take profit.
const ATR_TAKE_PROFIT_MULTIPLIER: f64 = 3.0;

/// A sized order ready for pre-flight checks.
#[derive(Debug, Clone, Serialize)]
pub struct SizedPosition {
    pub qty: f64,
    pub notional: f64,
    pub small_account_mode: bool,
}

/// Inputs to the sizing algorithm.
#[derive(Debug, Clone)]
pub struct SizingInputs {
    pub entry_price: f64,
    /// Strategy-suggested fraction of equity (e.g. 0.05).
    pub position_size_pct: f64,
    pub equity: f64,
    pub buying_power: f64,
    pub fractionable: bool,
    pub open_position_count: usize,
}

/// Position sizing and exit-level policy.
pub struct RiskEngine {
    small: SmallAccountSettings,
    allow_fractional: bool,
    min_buying_power_pct: f64,
}

impl RiskEngine {
    pub fn new(settings: &Settings) -> Self {
        Self {
            small: settings.small_account.clone(),
            allow_fractional: settings.allow_fractional,
            min_buying_power_pct: settings.min_buying_power_pct,
        }
    }

    /// Small-account mode is active at or below the equity threshold.
    pub fn small_account_active(&self, equity: f64) -> bool {
        equity <= self.small.threshold
    }

    /// Cycle overrides while small-account mode is active:
    /// (max_signals, min_confidence).
    pub fn cycle_overrides(&self, equity: f64) -> Option<(usize, f64)> {
        self.small_account_active(equity)
            .then_some((self.small.max_signals, self.small.min_confidence))
    }

    pub fn max_positions(&self) -> usize {
        self.small.max_positions
    }

    pub fn cooldown_minutes(&self) -> i64 {
        self.small.trade_cooldown_minutes
    }

    /// True when a trade on the same ticker happened inside the cooldown
    /// window.
    pub fn cooldown_active(&self, last_trade_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_trade_at {
            Some(ts) => now - ts < Duration::minutes(self.small.trade_cooldown_minutes),
            None => false,
        }
    }

    /// Compute the order quantity for a signal.
    ///
    /// # Errors
    /// `PreconditionFailed` when the position cap, the ticker price cap, the
    /// buying-power reserve, or a zero quantity blocks the trade.
    pub fn size_position(&self, inputs: &SizingInputs) -> Result<SizedPosition> {
        if inputs.entry_price <= 0.0 {
            return Err(TradingError::PreconditionFailed(
                "entry price must be positive".to_string(),
            ));
        }

        let small_mode = self.small_account_active(inputs.equity);

        if small_mode && inputs.open_position_count >= self.small.max_positions {
            return Err(TradingError::PreconditionFailed(format!(
                "position cap reached ({} open, max {})",
                inputs.open_position_count, self.small.max_positions
            )));
        }

        if small_mode && inputs.entry_price > self.small.max_ticker_price {
            return Err(TradingError::PreconditionFailed(format!(
                "ticker price ${:.2} above small-account cap ${:.2}",
                inputs.entry_price, self.small.max_ticker_price
            )));
        }

        // Dollar target: % of equity, capped at the explicit per-trade
        // notional in small-account mode.
        let mut target_notional = inputs.position_size_pct * inputs.equity;
        if small_mode {
            target_notional = target_notional.min(self.small.target_notional_per_trade);
        }

        let fractional_ok =
            self.allow_fractional && self.small.allow_fractional && inputs.fractionable;

        let mut qty = round_qty(target_notional / inputs.entry_price);
        if !fractional_ok {
            qty = qty.floor();
        }
        if qty <= 0.0 {
            return Err(TradingError::PreconditionFailed(format!(
                "target notional ${target_notional:.2} buys no shares at ${:.2}",
                inputs.entry_price
            )));
        }

        let notional = qty * inputs.entry_price;
        let spendable = (1.0 - self.min_buying_power_pct) * inputs.buying_power;
        if notional > spendable {
            return Err(TradingError::PreconditionFailed(format!(
                "notional ${notional:.2} exceeds spendable buying power ${spendable:.2}"
            )));
        }

        debug!(
            qty,
            notional,
            small_mode,
            "position sized"
        );

        Ok(SizedPosition {
            qty,
            notional,
            small_account_mode: small_mode,
        })
    }

    /// Protective stop/target for an entry. ATR-based when an ATR value is
    /// available, otherwise fixed-percent tiers keyed by notional size.
    pub fn exit_levels(
        &self,
        entry: f64,
        is_long: bool,
        atr: Option<f64>,
        notional: f64,
    ) -> (f64, f64) {
        let (stop_distance, profit_distance) = match atr {
            Some(atr) if atr > 0.0 => (
                atr * ATR_STOP_MULTIPLIER,
                atr * ATR_TAKE_PROFIT_MULTIPLIER,
            ),
            _ => {
                let (stop_pct, profit_pct) = if notional < 1_000.0 {
                    (0.02, 0.04)
                } else if notional < 10_000.0 {
                    (0.03, 0.06)
                } else {
                    (0.05, 0.10)
                };
                (entry * stop_pct, entry * profit_pct)
            }
        };

        if is_long {
            (entry - stop_distance, entry + profit_distance)
        } else {
            (entry + stop_distance, entry - profit_distance)
        }
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("small_account_threshold", &self.small.threshold)
            .field("allow_fractional", &self.allow_fractional)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn engine() -> RiskEngine {
        RiskEngine::new(&Settings::for_tests())
    }

    fn inputs(entry: f64, equity: f64) -> SizingInputs {
        SizingInputs {
            entry_price: entry,
            position_size_pct: 0.05,
            equity,
            buying_power: equity * 2.0,
            fractionable: true,
            open_position_count: 0,
        }
    }

    #[test]
    fn small_account_mode_threshold() {
        let engine = engine();
        assert!(engine.small_account_active(1_500.0));
        assert!(engine.small_account_active(2_000.0));
        assert!(!engine.small_account_active(2_000.01));
    }

    #[test]
    fn small_account_caps_notional_per_trade() {
        let engine = engine();
        // 5% of $1,500 = $75 < $200 target, so the percentage wins.
        let sized = engine.size_position(&inputs(10.0, 1_500.0)).unwrap();
        assert!((sized.notional - 75.0).abs() < 0.05);
        assert!(sized.small_account_mode);

        // 50% of $1,500 = $750 > $200 target, so the target caps it.
        let mut large = inputs(10.0, 1_500.0);
        large.position_size_pct = 0.5;
        let sized = engine.size_position(&large).unwrap();
        assert!((sized.notional - 200.0).abs() < 0.05);
    }

    #[test]
    fn normal_account_uses_percentage_of_equity() {
        let engine = engine();
        let sized = engine.size_position(&inputs(100.0, 50_000.0)).unwrap();
        assert!(!sized.small_account_mode);
        assert!((sized.notional - 2_500.0).abs() < 0.05);
        assert_eq!(sized.qty, 25.0);
    }

    #[test]
    fn non_fractionable_floors_to_whole_shares() {
        let engine = engine();
        let mut i = inputs(30.0, 50_000.0);
        i.fractionable = false;
        // 5% of 50k = $2500 / 30 = 83.33 -> 83.
        let sized = engine.size_position(&i).unwrap();
        assert_eq!(sized.qty, 83.0);
    }

    #[test]
    fn zero_quantity_rejected() {
        let engine = engine();
        let mut i = inputs(400.0, 1_500.0);
        i.fractionable = false;
        // Small mode target $75 cannot buy a whole $400 share.
        let err = engine.size_position(&i).unwrap_err();
        assert!(matches!(err, TradingError::PreconditionFailed(_)));
    }

    #[test]
    fn buying_power_reserve_enforced() {
        let engine = engine();
        let mut i = inputs(100.0, 50_000.0);
        i.position_size_pct = 0.5; // $25k notional
        i.buying_power = 26_000.0; // spendable = 90% = $23.4k
        let err = engine.size_position(&i).unwrap_err();
        assert!(matches!(err, TradingError::PreconditionFailed(_)));
    }

    #[test]
    fn small_account_position_cap() {
        let engine = engine();
        let mut i = inputs(10.0, 1_500.0);
        i.open_position_count = 5;
        let err = engine.size_position(&i).unwrap_err();
        assert!(err.to_string().contains("position cap"));
    }

    #[test]
    fn small_account_price_cap() {
        let engine = engine();
        let i = inputs(600.0, 1_500.0);
        let err = engine.size_position(&i).unwrap_err();
        assert!(err.to_string().contains("cap"));
    }

    #[test]
    fn cooldown_window() {
        let engine = engine();
        let now = Utc::now();
        assert!(!engine.cooldown_active(None, now));
        assert!(engine.cooldown_active(Some(now - Duration::minutes(5)), now));
        assert!(!engine.cooldown_active(Some(now - Duration::minutes(16)), now));
    }

    #[test]
    fn atr_exit_levels() {
        let engine = engine();
        let (stop, target) = engine.exit_levels(100.0, true, Some(2.0), 5_000.0);
        assert_eq!(stop, 96.0);
        assert_eq!(target, 106.0);

        let (stop, target) = engine.exit_levels(100.0, false, Some(2.0), 5_000.0);
        assert_eq!(stop, 104.0);
        assert_eq!(target, 94.0);
    }

    #[test]
    fn percent_tier_exit_levels() {
        let engine = engine();
        // Small notional: 2%/4%.
        let (stop, target) = engine.exit_levels(100.0, true, None, 500.0);
        assert_eq!(stop, 98.0);
        assert_eq!(target, 104.0);
        // Large notional: 5%/10%.
        let (stop, target) = engine.exit_levels(100.0, true, None, 20_000.0);
        assert_eq!(stop, 95.0);
        assert_eq!(target, 110.0);
    }
}
