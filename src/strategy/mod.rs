// =============================================================================
// Strategy Engine — registry of pure signal producers over daily bars
// =============================================================================
//
// Strategies implement the `Strategy` trait: a synchronous, pure
// `evaluate(ticker, bars) -> Option<TradingSignal>`. The engine owns the
// price provider, fetches one buffered daily window per ticker, and runs the
// active strategies sequentially over it. New strategies are added by
// registration, not inheritance.
//
// Universe scans run tickers concurrently with bounded parallelism; each
// ticker's strategies run sequentially within its worker.
// =============================================================================

pub mod breakout_micro;
pub mod mean_reversion;
pub mod momentum;
pub mod trend_following;
pub mod vwap_scalper;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures_util::{stream, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::data::PriceProvider;
use crate::error::Result;
use crate::types::{Direction, PriceBar, TradingSignal};

pub use breakout_micro::BreakoutMicroStrategy;
pub use mean_reversion::MeanReversionStrategy;
pub use momentum::MomentumStrategy;
pub use trend_following::TrendFollowingStrategy;
pub use vwap_scalper::VwapScalperStrategy;

/// Strategies active by default (standard mode).
pub const DEFAULT_STRATEGIES: [&str; 3] = ["momentum", "mean_reversion", "trend_following"];

/// Additional strategies enabled for small accounts.
pub const SMALL_ACCOUNT_STRATEGIES: [&str; 2] = ["vwap_scalper", "breakout_micro"];

/// Concurrent tickers during a universe scan.
const SCAN_CONCURRENCY: usize = 8;

/// A pure, stateless signal producer.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Bars required before the strategy can produce a signal.
    fn min_bars(&self) -> usize;

    /// Evaluate one ticker over ascending daily bars. Returns `None` when
    /// there is insufficient data or no directional edge.
    fn evaluate(&self, ticker: &str, bars: &[PriceBar]) -> Option<TradingSignal>;
}

/// Build a registry entry by name.
pub fn build_strategy(name: &str) -> Option<Box<dyn Strategy>> {
    match name {
        "momentum" => Some(Box::new(MomentumStrategy::default())),
        "mean_reversion" => Some(Box::new(MeanReversionStrategy::default())),
        "trend_following" => Some(Box::new(TrendFollowingStrategy::default())),
        "vwap_scalper" => Some(Box::new(VwapScalperStrategy::default())),
        "breakout_micro" => Some(Box::new(BreakoutMicroStrategy::default())),
        _ => None,
    }
}

/// Derive stop/take-profit around an entry at the given risk:reward ratio.
pub(crate) fn protective_levels(
    direction: Direction,
    entry: f64,
    stop_distance: f64,
    reward_ratio: f64,
) -> (f64, f64) {
    match direction {
        Direction::Short => (
            entry + stop_distance,
            entry - stop_distance * reward_ratio,
        ),
        _ => (
            entry - stop_distance,
            entry + stop_distance * reward_ratio,
        ),
    }
}

/// Manages and runs the active strategies.
pub struct StrategyEngine {
    provider: Arc<dyn PriceProvider>,
    strategies: RwLock<Vec<Box<dyn Strategy>>>,
}

impl StrategyEngine {
    /// Build the engine with the given strategy names (defaults when
    /// `None`). Unknown names are logged and skipped.
    pub fn new(provider: Arc<dyn PriceProvider>, enabled: Option<&[String]>) -> Self {
        let names: Vec<String> = match enabled {
            Some(list) => list.to_vec(),
            None => DEFAULT_STRATEGIES.iter().map(|s| s.to_string()).collect(),
        };

        let mut strategies = Vec::new();
        for name in &names {
            match build_strategy(name) {
                Some(strategy) => strategies.push(strategy),
                None => warn!(strategy = %name, "unknown strategy — skipped"),
            }
        }

        info!(
            count = strategies.len(),
            strategies = ?strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "strategy engine initialised"
        );

        Self {
            provider,
            strategies: RwLock::new(strategies),
        }
    }

    /// Enable the scalping strategies used in small-account mode.
    pub fn enable_small_account_strategies(&self) {
        let mut strategies = self.strategies.write();
        for name in SMALL_ACCOUNT_STRATEGIES {
            if strategies.iter().any(|s| s.name() == name) {
                continue;
            }
            if let Some(strategy) = build_strategy(name) {
                info!(strategy = name, "enabled small-account strategy");
                strategies.push(strategy);
            }
        }
    }

    /// Replace the active registry with exactly the named strategies.
    pub fn set_strategies(&self, names: &[String]) {
        let mut replacement = Vec::new();
        for name in names {
            match build_strategy(name) {
                Some(strategy) => replacement.push(strategy),
                None => warn!(strategy = %name, "unknown strategy — skipped"),
            }
        }
        info!(strategies = ?replacement.iter().map(|s| s.name()).collect::<Vec<_>>(), "strategy set updated");
        *self.strategies.write() = replacement;
    }

    /// Names of the currently active strategies.
    pub fn active_strategies(&self) -> Vec<String> {
        self.strategies
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Bars needed to satisfy every active strategy.
    fn window_days(&self) -> usize {
        self.strategies
            .read()
            .iter()
            .map(|s| s.min_bars())
            .max()
            .unwrap_or(20)
    }

    /// Analyze one ticker with the active strategies (optionally filtered by
    /// name). One price fetch per ticker; strategies run sequentially.
    pub async fn analyze_ticker(
        &self,
        ticker: &str,
        strategies: Option<&[String]>,
    ) -> Result<Vec<TradingSignal>> {
        let window = self.window_days();
        let end = Utc::now().date_naive();
        // Calendar buffer for weekends and holidays.
        let start = end - Duration::days(window as i64 + 30);

        let bars = self.provider.get_prices(ticker, start, end).await?;

        let active = self.strategies.read();
        let mut signals = Vec::new();
        for strategy in active.iter() {
            if let Some(filter) = strategies {
                if !filter.iter().any(|n| n == strategy.name()) {
                    continue;
                }
            }
            if let Some(signal) = strategy.evaluate(ticker, &bars) {
                if signal.direction != Direction::Neutral {
                    signals.push(signal);
                }
            }
        }
        debug!(ticker, signals = signals.len(), "ticker analysed");
        Ok(signals)
    }

    /// Scan a universe of tickers with bounded concurrency, keeping signals
    /// at or above `min_confidence`. Per-ticker failures are logged and
    /// skipped; the scan itself never fails.
    pub async fn scan_universe(
        &self,
        tickers: &[String],
        strategies: Option<&[String]>,
        min_confidence: f64,
    ) -> HashMap<String, Vec<TradingSignal>> {
        let results: Vec<(String, Vec<TradingSignal>)> = stream::iter(tickers.iter().cloned())
            .map(|ticker| async move {
                match self.analyze_ticker(&ticker, strategies).await {
                    Ok(signals) => {
                        let kept: Vec<TradingSignal> = signals
                            .into_iter()
                            .filter(|s| s.confidence >= min_confidence)
                            .collect();
                        (ticker, kept)
                    }
                    Err(e) => {
                        warn!(ticker = %ticker, error = %e, "scan failed for ticker");
                        (ticker, Vec::new())
                    }
                }
            })
            .buffer_unordered(SCAN_CONCURRENCY)
            .collect()
            .await;

        results
            .into_iter()
            .filter(|(_, signals)| !signals.is_empty())
            .collect()
    }

    /// Top-N signals across tickers and strategies, sorted by descending
    /// confidence.
    pub async fn get_best_signals(&self, tickers: &[String], top_n: usize) -> Vec<TradingSignal> {
        let mut all: Vec<TradingSignal> = self
            .scan_universe(tickers, None, 0.0)
            .await
            .into_values()
            .flatten()
            .collect();

        all.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(top_n);
        all
    }
}

impl std::fmt::Debug for StrategyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyEngine")
            .field("strategies", &self.active_strategies())
            .finish()
    }
}
