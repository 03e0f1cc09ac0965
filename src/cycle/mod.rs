// =============================================================================
// Trading Cycle Pipeline — Screen → Research → Analyze → Decide → Execute
// =============================================================================
//
// Strictly staged: a stage completes before the next begins, so late research
// can never influence an already-decided signal. Screening fans out over
// tickers with bounded concurrency; later stages walk the surviving top
// signals in order.
//
// At-most-one: the `running` flag is toggled by compare-exchange and cleared
// by a drop guard on every exit path. A second invocation while one is in
// flight fails fast with Conflict and emits no workflow events of its own.
//
// Cancellation: the shared token is observed at stage boundaries and before
// each external call. In-flight broker submissions complete; remaining
// signals are skipped and the cycle ends Cancelled.
// =============================================================================

pub mod collaborators;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{evaluate_pdt, Broker, PortfolioSnapshot};
use crate::config::Settings;
use crate::error::{Result, TradingError};
use crate::history::{DecisionContextRecord, NewTrade, TradeHistoryService};
use crate::monitor::{ExitRule, PositionMonitor};
use crate::risk::{RiskEngine, SizingInputs};
use crate::strategy::StrategyEngine;
use crate::telemetry::events::EventLogger;
use crate::types::{TradeAction, TradingSignal};
use crate::watchlist::{SortBy, WatchlistService, WatchlistStatus};

use collaborators::{
    DecisionCollaborator, PmDecision, ResearchCollaborator, ResearchDepth, ResearchSummary,
};

/// Strategies that imply intraday round trips and therefore hit the PDT gate.
const INTRADAY_STRATEGIES: [&str; 2] = ["vwap_scalper", "breakout_micro"];

/// Retained cycle results.
const MAX_RECENT_RESULTS: usize = 20;

// -----------------------------------------------------------------------------
// Cancellation token
// -----------------------------------------------------------------------------

/// Cooperative cancellation flag shared between the cycle and its owner.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// -----------------------------------------------------------------------------
// Options and result
// -----------------------------------------------------------------------------

/// Parameters for one cycle run.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub tickers: Option<Vec<String>>,
    pub min_confidence: f64,
    pub max_signals: usize,
    pub execute_trades: bool,
    pub dry_run: bool,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            tickers: None,
            min_confidence: 65.0,
            max_signals: 3,
            execute_trades: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Completed,
    Errored,
    Cancelled,
}

/// An error recorded against one stage (and optionally one ticker) without
/// aborting the cycle.
#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub stage: String,
    pub ticker: Option<String>,
    pub message: String,
}

/// Outcome of one cycle, returned to the caller and emitted as the
/// `trading_cycle_complete` workflow event.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub workflow_id: Uuid,
    pub status: CycleStatus,
    pub dry_run: bool,
    pub tickers_screened: usize,
    pub signals_found: usize,
    pub research_validated: usize,
    pub trades_analyzed: usize,
    pub trades_executed: usize,
    pub duration_ms: u64,
    pub errors: Vec<StageError>,
}

// -----------------------------------------------------------------------------
// Running guard
// -----------------------------------------------------------------------------

/// Clears the running flag on every exit path, including panic unwind.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// -----------------------------------------------------------------------------
// Cycle
// -----------------------------------------------------------------------------

/// Collaborators injected into the cycle.
pub struct CycleDeps {
    pub broker: Arc<dyn Broker>,
    pub engine: Arc<StrategyEngine>,
    pub research: Arc<dyn ResearchCollaborator>,
    pub decision: Arc<dyn DecisionCollaborator>,
    pub history: Arc<TradeHistoryService>,
    pub watchlist: Arc<WatchlistService>,
    pub monitor: Arc<PositionMonitor>,
    pub risk: Arc<RiskEngine>,
    pub events: Arc<EventLogger>,
    pub settings: Settings,
}

pub struct TradingCycle {
    deps: CycleDeps,
    running: AtomicBool,
    cancel: CancelToken,
    last_result: RwLock<Option<CycleResult>>,
    recent: RwLock<VecDeque<CycleResult>>,
}

/// Per-run mutable bookkeeping.
struct RunState {
    errors: Vec<StageError>,
    signals_found: usize,
    research_validated: usize,
    trades_analyzed: usize,
    trades_executed: usize,
    cancelled: bool,
}

impl RunState {
    fn record(&mut self, stage: &str, ticker: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        warn!(stage, ticker = ticker.unwrap_or("-"), message = %message, "cycle stage error");
        self.errors.push(StageError {
            stage: stage.to_string(),
            ticker: ticker.map(str::to_string),
            message,
        });
    }
}

impl TradingCycle {
    pub fn new(deps: CycleDeps) -> Self {
        Self {
            deps,
            running: AtomicBool::new(false),
            cancel: CancelToken::new(),
            last_result: RwLock::new(None),
            recent: RwLock::new(VecDeque::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn last_result(&self) -> Option<CycleResult> {
        self.last_result.read().clone()
    }

    pub fn recent_results(&self) -> Vec<CycleResult> {
        self.recent.read().iter().cloned().collect()
    }

    /// Run one trading cycle.
    ///
    /// # Errors
    /// `Conflict` when a cycle is already in flight (no queuing, no events
    /// emitted). Fatal configuration / invariant errors propagate; everything
    /// else is recorded per-stage in the result.
    pub async fn run_trading_cycle(&self, options: CycleOptions) -> Result<CycleResult> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TradingError::Conflict)?;
        let _guard = RunningGuard(&self.running);

        let universe = match &options.tickers {
            Some(tickers) if !tickers.is_empty() => {
                tickers.iter().map(|t| t.to_uppercase()).collect()
            }
            _ => self.build_universe().await,
        };

        let wf = self.deps.events.start_workflow("trading_cycle", &universe);
        info!(
            workflow_id = %wf.workflow_id,
            tickers = universe.len(),
            dry_run = options.dry_run,
            "trading cycle started"
        );

        let mut state = RunState {
            errors: Vec::new(),
            signals_found: 0,
            research_validated: 0,
            trades_analyzed: 0,
            trades_executed: 0,
            cancelled: false,
        };

        self.run_stages(&wf, &options, &universe, &mut state).await;

        let status = if state.cancelled {
            CycleStatus::Cancelled
        } else if state.errors.iter().any(|e| e.stage == "setup") {
            CycleStatus::Errored
        } else {
            CycleStatus::Completed
        };

        let result = CycleResult {
            workflow_id: wf.workflow_id,
            status,
            dry_run: options.dry_run,
            tickers_screened: universe.len(),
            signals_found: state.signals_found,
            research_validated: state.research_validated,
            trades_analyzed: state.trades_analyzed,
            trades_executed: state.trades_executed,
            duration_ms: wf.elapsed_ms(),
            errors: state.errors,
        };

        self.deps.events.complete_workflow(
            &wf,
            json!({
                "event": "trading_cycle_complete",
                "status": result.status,
                "tickers_screened": result.tickers_screened,
                "signals_found": result.signals_found,
                "research_validated": result.research_validated,
                "trades_analyzed": result.trades_analyzed,
                "trades_executed": result.trades_executed,
                "errors": result.errors.len(),
            }),
        );

        *self.last_result.write() = Some(result.clone());
        {
            let mut recent = self.recent.write();
            recent.push_back(result.clone());
            while recent.len() > MAX_RECENT_RESULTS {
                recent.pop_front();
            }
        }

        info!(
            workflow_id = %wf.workflow_id,
            status = ?result.status,
            executed = result.trades_executed,
            duration_ms = result.duration_ms,
            "trading cycle finished"
        );
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Stages
    // -------------------------------------------------------------------------

    async fn run_stages(
        &self,
        wf: &crate::telemetry::events::WorkflowContext,
        options: &CycleOptions,
        universe: &[String],
        state: &mut RunState,
    ) {
        let events = Arc::clone(&self.deps.events);

        if self.cancel.is_cancelled() {
            state.cancelled = true;
            return;
        }

        // ── Setup: account snapshot and effective limits ────────────────
        let account = match self.deps.broker.get_account().await {
            Ok(account) => account,
            Err(e) => {
                state.record("setup", None, format!("account unavailable: {e}"));
                return;
            }
        };
        if account.trading_blocked {
            state.record("setup", None, "account is blocked from trading");
            return;
        }

        let positions = self.deps.broker.get_positions().await.unwrap_or_default();
        let pdt = evaluate_pdt(&account);

        let mut min_confidence = options.min_confidence;
        let mut max_signals = options.max_signals;
        if let Some((small_max, small_min)) = self.deps.risk.cycle_overrides(account.equity) {
            self.deps.engine.enable_small_account_strategies();
            min_confidence = min_confidence.max(small_min);
            max_signals = max_signals.min(small_max);
        }

        // ── Stage 1: screening ──────────────────────────────────────────
        let step = events.step(wf, "strategy_screening", None);
        let scan = self
            .deps
            .engine
            .scan_universe(universe, None, min_confidence)
            .await;

        let mut signals: Vec<TradingSignal> = scan.into_values().flatten().collect();
        state.signals_found = signals.len();

        // Resolve fractionable status once per surviving ticker.
        for signal in signals.iter_mut() {
            signal.fractionable = self.deps.broker.is_fractionable(&signal.ticker).await;
        }

        // PDT gate: without day-trade headroom, intraday scalps are skipped.
        if !pdt.can_day_trade {
            let before = signals.len();
            signals.retain(|s| !INTRADAY_STRATEGIES.contains(&s.strategy.as_str()));
            if signals.len() < before {
                state.record(
                    "strategy_screening",
                    None,
                    pdt.warning
                        .clone()
                        .unwrap_or_else(|| "PDT gate blocked intraday signals".to_string()),
                );
            }
        }

        signals.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        signals.truncate(max_signals);
        step.complete(json!({
            "signals_found": state.signals_found,
            "candidates": signals.len(),
        }));

        if signals.is_empty() {
            return;
        }
        if self.cancel.is_cancelled() {
            state.cancelled = true;
            return;
        }

        // ── Stage 2: research ───────────────────────────────────────────
        let step = events.step(wf, "research", None);
        let research_timeout = Duration::from_secs(self.deps.settings.timeouts.research_secs);
        let mut researched: Vec<(TradingSignal, ResearchSummary)> = Vec::new();

        for signal in signals {
            if self.cancel.is_cancelled() {
                state.cancelled = true;
                step.complete(json!({ "researched": researched.len(), "cancelled": true }));
                return;
            }

            let query = format!(
                "Latest outlook, news and sentiment for {} stock. The {} strategy flagged a {} setup.",
                signal.ticker, signal.strategy, signal.direction
            );
            let summary = match timeout(
                research_timeout,
                self.deps.research.research(&query, ResearchDepth::Standard),
            )
            .await
            {
                Ok(Ok(outcome)) => ResearchSummary::from_outcome(&outcome),
                Ok(Err(e)) => {
                    state.record("research", Some(&signal.ticker), e.to_string());
                    ResearchSummary::unknown()
                }
                Err(_) => {
                    state.record("research", Some(&signal.ticker), "research timed out");
                    ResearchSummary::unknown()
                }
            };

            if summary.sentiment != "unknown" {
                state.research_validated += 1;
            }
            researched.push((signal, summary));
        }
        step.complete(json!({
            "researched": researched.len(),
            "validated": state.research_validated,
        }));

        if self.cancel.is_cancelled() {
            state.cancelled = true;
            return;
        }

        // ── Stage 3: decisions ──────────────────────────────────────────
        let step = events.step(wf, "decision", None);
        let portfolio = match self.deps.broker.sync_portfolio().await {
            Ok(p) => p,
            Err(e) => {
                state.record("decision", None, format!("portfolio sync failed: {e}"));
                step.fail("portfolio sync failed");
                return;
            }
        };

        let decision_timeout = Duration::from_secs(self.deps.settings.timeouts.decision_secs);
        let mut decided: Vec<(TradingSignal, ResearchSummary, PmDecision)> = Vec::new();

        for (signal, summary) in researched {
            if self.cancel.is_cancelled() {
                state.cancelled = true;
                step.complete(json!({ "decided": decided.len(), "cancelled": true }));
                return;
            }

            match timeout(
                decision_timeout,
                self.deps.decision.decide(&signal, &summary, &portfolio),
            )
            .await
            {
                Ok(Ok(decision)) => {
                    state.trades_analyzed += 1;
                    self.deps.events.log_pm_decision(
                        wf.workflow_id,
                        &signal.ticker,
                        decision.action.as_str(),
                        decision.quantity,
                        Some(decision.confidence),
                        decision.stop_loss_pct,
                        decision.take_profit_pct,
                        Some(&decision.reasoning),
                        Some(portfolio.equity),
                    );
                    if decision.action != TradeAction::Hold {
                        decided.push((signal, summary, decision));
                    }
                }
                Ok(Err(e)) => {
                    state.record("decision", Some(&signal.ticker), e.to_string())
                }
                Err(_) => {
                    state.record("decision", Some(&signal.ticker), "decision timed out")
                }
            }
        }
        step.complete(json!({ "decided": decided.len() }));

        // ── Stage 4: execution ──────────────────────────────────────────
        if !options.execute_trades {
            return;
        }

        let step = events.step(wf, "execution", None);
        let mut executed = 0usize;
        for (signal, summary, decision) in decided {
            if self.cancel.is_cancelled() {
                state.cancelled = true;
                break;
            }
            self.execute_one(
                wf,
                options,
                &account,
                &portfolio,
                positions.len(),
                signal,
                summary,
                decision,
                state,
            )
            .await;
            executed = state.trades_executed;
        }
        step.complete(json!({ "executed": executed, "dry_run": options.dry_run }));
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_one(
        &self,
        wf: &crate::telemetry::events::WorkflowContext,
        options: &CycleOptions,
        account: &crate::broker::Account,
        portfolio: &PortfolioSnapshot,
        open_positions: usize,
        signal: TradingSignal,
        summary: ResearchSummary,
        decision: PmDecision,
        state: &mut RunState,
    ) {
        let ticker = signal.ticker.clone();

        // Per-ticker cooldown.
        let last_trade = self.deps.history.last_trade_time(&ticker).unwrap_or(None);
        if self.deps.risk.cooldown_active(last_trade, chrono::Utc::now()) {
            state.record(
                "execution",
                Some(&ticker),
                format!(
                    "cooldown active ({}m between trades)",
                    self.deps.risk.cooldown_minutes()
                ),
            );
            return;
        }

        // Risk sizing; the PM's quantity only ever tightens it.
        let sized = match self.deps.risk.size_position(&SizingInputs {
            entry_price: signal.entry_price,
            position_size_pct: signal.position_size_pct,
            equity: account.equity,
            buying_power: account.buying_power,
            fractionable: signal.fractionable,
            open_position_count: open_positions,
        }) {
            Ok(sized) => sized,
            Err(e) => {
                state.record("execution", Some(&ticker), e.to_string());
                return;
            }
        };
        let qty = if decision.quantity > 0.0 {
            decision.quantity.min(sized.qty)
        } else {
            sized.qty
        };

        // Protective levels: PM percentages win, then the signal's own.
        let entry = signal.entry_price;
        let is_long = matches!(decision.action, TradeAction::Buy | TradeAction::Cover);
        let stop_price = decision
            .stop_loss_pct
            .map(|pct| {
                if is_long {
                    entry * (1.0 - pct / 100.0)
                } else {
                    entry * (1.0 + pct / 100.0)
                }
            })
            .unwrap_or(signal.stop_loss);
        let target_price = decision
            .take_profit_pct
            .map(|pct| {
                if is_long {
                    entry * (1.0 + pct / 100.0)
                } else {
                    entry * (1.0 - pct / 100.0)
                }
            })
            .unwrap_or(signal.take_profit);

        let context = DecisionContextRecord {
            trigger_source: "trading_cycle".to_string(),
            strategy_name: Some(signal.strategy.clone()),
            strategy_signal: Some(signal.direction.to_string()),
            strategy_confidence: Some(signal.confidence),
            strategy_reasoning: Some(signal.reasoning.clone()),
            research_sentiment: Some(summary.sentiment.clone()),
            research_confidence: Some(summary.confidence),
            research_summary: summary.summary.clone(),
            agent_signals: None,
            bullish_count: (summary.sentiment == "bullish") as i64,
            bearish_count: (summary.sentiment == "bearish") as i64,
            neutral_count: (summary.sentiment == "neutral") as i64,
            consensus_direction: Some(summary.sentiment.clone()),
            consensus_confidence: Some(summary.confidence),
            portfolio_equity: Some(portfolio.equity),
            portfolio_cash: Some(portfolio.cash),
            pm_action: Some(decision.action.as_str().to_string()),
            pm_quantity: Some(decision.quantity),
            pm_confidence: Some(decision.confidence),
            pm_reasoning: Some(decision.reasoning.clone()),
            pm_stop_loss_pct: decision.stop_loss_pct,
            pm_take_profit_pct: decision.take_profit_pct,
        };

        if options.dry_run {
            let record = NewTrade {
                ticker: ticker.clone(),
                action: Some(decision.action),
                quantity: qty,
                entry_price: Some(entry),
                strategy: Some(signal.strategy.clone()),
                stop_loss_price: Some(stop_price),
                take_profit_price: Some(target_price),
                fractionable: signal.fractionable,
                notes: Some("dry_run".to_string()),
                ..Default::default()
            };
            if let Err(e) = self.deps.history.record_trade(&record, Some(&context)) {
                state.record("execution", Some(&ticker), e.to_string());
            }
            info!(ticker = %ticker, action = %decision.action, qty, "dry run — order not submitted");
            return;
        }

        let result = self
            .deps
            .broker
            .execute_decision(&ticker, decision.action, qty)
            .await;

        if result.success {
            let order = result.order.as_ref();
            let record = NewTrade {
                ticker: ticker.clone(),
                action: Some(decision.action),
                quantity: qty,
                entry_price: Some(entry),
                order_id: order.map(|o| o.id.clone()),
                client_order_id: order.map(|o| o.client_order_id.clone()),
                strategy: Some(signal.strategy.clone()),
                stop_loss_price: Some(stop_price),
                take_profit_price: Some(target_price),
                fractionable: signal.fractionable,
                notes: None,
            };
            if let Err(e) = self.deps.history.record_trade(&record, Some(&context)) {
                state.record("execution", Some(&ticker), e.to_string());
            }

            self.deps.monitor.register_exit_rule(
                &ticker,
                ExitRule {
                    stop_price: Some(stop_price),
                    target_price: Some(target_price),
                },
            );

            self.deps.events.log_trade_execution(
                Some(wf.workflow_id),
                order.map(|o| o.id.as_str()).unwrap_or_default(),
                &ticker,
                decision.action.as_str(),
                qty,
                "market",
                "submitted",
                None,
            );

            state.trades_executed += 1;
        } else {
            state.record(
                "execution",
                Some(&ticker),
                result
                    .error
                    .unwrap_or_else(|| "order submission failed".to_string()),
            );
        }
    }

    /// Universe when no tickers are given: watching watchlist entries, then
    /// held positions, then the default pool, deduplicated and capped.
    async fn build_universe(&self) -> Vec<String> {
        let mut universe: Vec<String> = Vec::new();

        if let Ok(items) = self
            .deps
            .watchlist
            .get_watchlist(Some(WatchlistStatus::Watching), SortBy::Priority)
        {
            universe.extend(items.into_iter().map(|i| i.ticker));
        }

        if let Ok(positions) = self.deps.broker.get_positions().await {
            universe.extend(positions.into_iter().map(|p| p.symbol));
        }

        universe.extend(self.deps.settings.cycle.default_pool.iter().cloned());

        let mut seen = std::collections::HashSet::new();
        universe.retain(|t| seen.insert(t.to_uppercase()));
        universe.truncate(self.deps.settings.cycle.max_universe);
        universe
    }
}

impl std::fmt::Debug for TradingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingCycle")
            .field("running", &self.is_running())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::telemetry::alerts::AlertManager;
    use crate::testutil::{
        bars_with_volumes, momentum_bars, FakeBroker, FakePriceProvider, FakeResearch,
    };
    use super::collaborators::SignalFollowDecision;

    fn build_cycle(
        broker: Arc<FakeBroker>,
        provider: Arc<FakePriceProvider>,
    ) -> Arc<TradingCycle> {
        let settings = Settings::for_tests();
        let store = Arc::new(Store::open(":memory:").unwrap());
        let events = Arc::new(EventLogger::new(None));
        let alerts = Arc::new(AlertManager::new(Arc::clone(&events)));
        let history = Arc::new(TradeHistoryService::new(Arc::clone(&store)));
        let engine = Arc::new(StrategyEngine::new(provider.clone(), None));
        let watchlist = Arc::new(WatchlistService::new(
            Arc::clone(&store),
            provider,
            Arc::clone(&engine),
        ));
        let monitor = Arc::new(PositionMonitor::new(
            broker.clone(),
            Arc::clone(&history),
            Arc::clone(&events),
            alerts,
            settings.default_stop_loss_pct,
            settings.default_take_profit_pct,
        ));
        let risk = Arc::new(RiskEngine::new(&settings));

        Arc::new(TradingCycle::new(CycleDeps {
            broker,
            engine,
            research: Arc::new(FakeResearch::success_bullish()),
            decision: Arc::new(SignalFollowDecision),
            history,
            watchlist,
            monitor,
            risk,
            events,
            settings,
        }))
    }

    fn momentum_options() -> CycleOptions {
        CycleOptions {
            tickers: Some(vec!["AAPL".to_string()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn concurrent_invocation_conflicts() {
        let broker = Arc::new(FakeBroker::with_equity(50_000.0));
        let provider = Arc::new(FakePriceProvider::default());
        provider.set_bars("AAPL", momentum_bars());
        provider.set_delay_ms(150);

        let cycle = build_cycle(broker, provider);

        let first = {
            let cycle = Arc::clone(&cycle);
            tokio::spawn(async move { cycle.run_trading_cycle(momentum_options()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cycle.is_running());

        let started = std::time::Instant::now();
        let second = cycle.run_trading_cycle(momentum_options()).await;
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(matches!(second, Err(TradingError::Conflict)));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status, CycleStatus::Completed);
        assert!(!cycle.is_running());

        // The rejected invocation emitted no workflow of its own.
        let starts = cycle
            .deps
            .events
            .fallback_events(Some("workflow_events"))
            .into_iter()
            .filter(|e| e.payload["step_name"] == "workflow_start")
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn full_cycle_executes_a_momentum_trade() {
        let broker = Arc::new(FakeBroker::with_equity(50_000.0));
        let provider = Arc::new(FakePriceProvider::default());
        provider.set_bars("AAPL", momentum_bars());

        let cycle = build_cycle(Arc::clone(&broker), provider);
        let result = cycle.run_trading_cycle(momentum_options()).await.unwrap();

        assert_eq!(result.status, CycleStatus::Completed);
        assert_eq!(result.tickers_screened, 1);
        assert!(result.signals_found >= 1);
        assert_eq!(result.research_validated, result.trades_analyzed);
        assert_eq!(result.trades_executed, 1);

        // One real submission reached the broker.
        assert_eq!(broker.submissions().len(), 1);
        let submitted = &broker.submissions()[0];
        assert_eq!(submitted.symbol, "AAPL");

        // The trade was recorded with its decision context.
        let trades = cycle
            .deps
            .history
            .get_trade_history(Some("AAPL"), None, 10)
            .unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].strategy.as_deref(), Some("momentum"));

        // The flag is released after completion.
        assert!(!cycle.is_running());
        assert!(cycle.last_result().is_some());
    }

    #[tokio::test]
    async fn dry_run_records_but_does_not_submit() {
        let broker = Arc::new(FakeBroker::with_equity(50_000.0));
        let provider = Arc::new(FakePriceProvider::default());
        provider.set_bars("AAPL", momentum_bars());

        let cycle = build_cycle(Arc::clone(&broker), provider);
        let result = cycle
            .run_trading_cycle(CycleOptions {
                tickers: Some(vec!["AAPL".to_string()]),
                dry_run: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.status, CycleStatus::Completed);
        assert!(result.trades_analyzed >= 1);
        assert_eq!(result.trades_executed, 0);
        assert!(broker.submissions().is_empty());

        let trades = cycle
            .deps
            .history
            .get_trade_history(Some("AAPL"), None, 10)
            .unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].notes.as_deref(), Some("dry_run"));
    }

    #[tokio::test]
    async fn cancelled_before_start_ends_cancelled() {
        let broker = Arc::new(FakeBroker::with_equity(50_000.0));
        let provider = Arc::new(FakePriceProvider::default());
        provider.set_bars("AAPL", momentum_bars());

        let cycle = build_cycle(broker, provider);
        cycle.cancel_token().cancel();

        let result = cycle.run_trading_cycle(momentum_options()).await.unwrap();
        assert_eq!(result.status, CycleStatus::Cancelled);
        assert_eq!(result.trades_executed, 0);
        assert!(!cycle.is_running());
    }

    #[tokio::test]
    async fn flat_market_finds_nothing() {
        let broker = Arc::new(FakeBroker::with_equity(50_000.0));
        let provider = Arc::new(FakePriceProvider::default());
        provider.set_bars(
            "FLAT",
            bars_with_volumes(&[100.0; 60], &[1e6; 60]),
        );

        let cycle = build_cycle(Arc::clone(&broker), provider);
        let result = cycle
            .run_trading_cycle(CycleOptions {
                tickers: Some(vec!["FLAT".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.status, CycleStatus::Completed);
        assert_eq!(result.signals_found, 0);
        assert_eq!(result.trades_executed, 0);
        assert!(broker.submissions().is_empty());
    }

    #[tokio::test]
    async fn universe_built_from_watchlist_positions_and_pool() {
        let broker = Arc::new(FakeBroker::with_equity(50_000.0));
        broker.add_position(crate::testutil::make_position(
            "NVDA", 2.0, "long", 400.0, 410.0,
        ));
        let provider = Arc::new(FakePriceProvider::default());
        provider.set_bars("GME", bars_with_volumes(&[20.0; 10], &[1e6; 10]));

        let cycle = build_cycle(broker, provider);
        cycle
            .deps
            .watchlist
            .add_item(crate::watchlist::NewWatchlistItem {
                ticker: "GME".to_string(),
                entry_target: Some(18.0),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = cycle
            .run_trading_cycle(CycleOptions {
                tickers: None,
                ..Default::default()
            })
            .await
            .unwrap();

        // 1 watchlist + 1 position + 8 pool tickers, deduplicated.
        assert_eq!(result.tickers_screened, 10);
    }
}
