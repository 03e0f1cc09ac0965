// =============================================================================
// Helios — Main Entry Point & CLI
// =============================================================================
//
// Composition root: builds the object graph (store, telemetry, broker,
// strategy engine, risk, cycle, scheduler) from the environment and drives
// it from the command line.
//
// Exit codes: 0 success, 2 misconfiguration, 3 cycle conflict,
// 4 broker/transport failure, 1 anything else.
// =============================================================================

use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use helios_trader::broker::{AlpacaClient, Broker};
use helios_trader::config::Settings;
use helios_trader::cycle::collaborators::{
    HttpDecisionClient, HttpResearchClient, SignalFollowDecision, UnavailableResearch,
};
use helios_trader::cycle::{CycleDeps, CycleOptions, TradingCycle};
use helios_trader::data::{FinancialDatasetsProvider, PriceProvider};
use helios_trader::error::{Result, TradingError};
use helios_trader::history::TradeHistoryService;
use helios_trader::monitor::PositionMonitor;
use helios_trader::performance::PerformanceTracker;
use helios_trader::risk::RiskEngine;
use helios_trader::scheduler::{JobContext, TradingScheduler};
use helios_trader::store::Store;
use helios_trader::strategy::StrategyEngine;
use helios_trader::telemetry::alerts::AlertManager;
use helios_trader::telemetry::events::EventLogger;
use helios_trader::telemetry::health::HealthChecker;
use helios_trader::telemetry::rate_limit::RateLimitMonitor;
use helios_trader::watchlist::{SortBy, WatchlistService};

#[derive(Parser)]
#[command(name = "helios", about = "Autonomous equities trading orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and all periodic jobs until stopped.
    Start,
    /// Request a running service to shut down (via the shared store).
    Stop,
    /// Run one trading cycle now.
    RunCycle {
        #[arg(long)]
        dry_run: bool,
        /// Comma-separated tickers; defaults to watchlist + positions + pool.
        #[arg(long, value_delimiter = ',')]
        tickers: Vec<String>,
        #[arg(long)]
        min_confidence: Option<f64>,
        #[arg(long)]
        max_signals: Option<usize>,
    },
    /// Show service status from the shared store.
    Status,
    /// Import filled broker orders into local history.
    SyncOrders {
        #[arg(long, default_value_t = 30)]
        days: i64,
        /// Reset and recompute all realized P&L from scratch.
        #[arg(long)]
        recompute_pnl: bool,
    },
    /// Run a health check.
    Health {
        #[arg(long)]
        pre_market: bool,
    },
}

/// The assembled object graph.
struct App {
    settings: Settings,
    store: Arc<Store>,
    events: Arc<EventLogger>,
    alerts: Arc<AlertManager>,
    broker: Arc<dyn Broker>,
    history: Arc<TradeHistoryService>,
    watchlist: Arc<WatchlistService>,
    monitor: Arc<PositionMonitor>,
    health: Arc<HealthChecker>,
    performance: Arc<PerformanceTracker>,
    cycle: Arc<TradingCycle>,
}

fn build_app(settings: Settings) -> Result<App> {
    let store = Arc::new(Store::open(&settings.database_path)?);
    let events = Arc::new(EventLogger::new(Some(Arc::clone(&store))));
    let alerts = Arc::new(AlertManager::new(Arc::clone(&events)));
    let rate_monitor = Arc::new(RateLimitMonitor::new());

    let broker: Arc<dyn Broker> =
        Arc::new(AlpacaClient::new(&settings, Arc::clone(&rate_monitor))?);

    if settings.financial_datasets_api_key.is_none() {
        warn!("FINANCIAL_DATASETS_API_KEY not set — price lookups will fail");
    }
    let provider: Arc<dyn PriceProvider> = Arc::new(FinancialDatasetsProvider::new(
        settings.financial_datasets_api_key.as_deref().unwrap_or(""),
        Arc::clone(&rate_monitor),
    )?);

    let engine = Arc::new(StrategyEngine::new(Arc::clone(&provider), None));
    let history = Arc::new(TradeHistoryService::new(Arc::clone(&store)));
    let watchlist = Arc::new(WatchlistService::new(
        Arc::clone(&store),
        Arc::clone(&provider),
        Arc::clone(&engine),
    ));
    let monitor = Arc::new(PositionMonitor::new(
        Arc::clone(&broker),
        Arc::clone(&history),
        Arc::clone(&events),
        Arc::clone(&alerts),
        settings.default_stop_loss_pct,
        settings.default_take_profit_pct,
    ));
    let risk = Arc::new(RiskEngine::new(&settings));
    let health = Arc::new(HealthChecker::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        Arc::clone(&alerts),
        settings.clone(),
    ));
    let performance = Arc::new(PerformanceTracker::new(
        Arc::clone(&broker),
        Arc::clone(&history),
        Arc::clone(&store),
        settings.exchange_tz(),
    ));

    // Collaborators: HTTP agents when configured, degraded fallbacks when
    // not.
    let research: Arc<dyn helios_trader::cycle::collaborators::ResearchCollaborator> =
        match &settings.research_agent_url {
            Some(url) => Arc::new(HttpResearchClient::new(url, settings.timeouts.research_secs)?),
            None => {
                warn!("RESEARCH_AGENT_URL not set — research degrades to sentiment=unknown");
                Arc::new(UnavailableResearch)
            }
        };
    let decision: Arc<dyn helios_trader::cycle::collaborators::DecisionCollaborator> =
        match &settings.decision_agent_url {
            Some(url) => Arc::new(HttpDecisionClient::new(url, settings.timeouts.decision_secs)?),
            None => {
                warn!("DECISION_AGENT_URL not set — decisions follow the strategy signal");
                Arc::new(SignalFollowDecision)
            }
        };

    let cycle = Arc::new(TradingCycle::new(CycleDeps {
        broker: Arc::clone(&broker),
        engine,
        research,
        decision,
        history: Arc::clone(&history),
        watchlist: Arc::clone(&watchlist),
        monitor: Arc::clone(&monitor),
        risk,
        events: Arc::clone(&events),
        settings: settings.clone(),
    }));

    Ok(App {
        settings,
        store,
        events,
        alerts,
        broker,
        history,
        watchlist,
        monitor,
        health,
        performance,
        cycle,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(err: &TradingError) -> ExitCode {
    match err {
        TradingError::Config(_) => ExitCode::from(2),
        TradingError::Conflict => ExitCode::from(3),
        TradingError::Transport(_)
        | TradingError::RateLimited { .. }
        | TradingError::Broker { .. } => ExitCode::from(4),
        _ => ExitCode::from(1),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_env()?;
    info!(%settings, "configuration loaded");

    match cli.command {
        Command::Start => start_service(settings).await,
        Command::Stop => {
            let store = Store::open(&settings.database_path)?;
            store.request_shutdown()?;
            println!("shutdown requested");
            Ok(())
        }
        Command::RunCycle {
            dry_run,
            tickers,
            min_confidence,
            max_signals,
        } => {
            let app = build_app(settings)?;
            let options = CycleOptions {
                tickers: (!tickers.is_empty()).then_some(tickers),
                min_confidence: min_confidence.unwrap_or(app.settings.cycle.min_confidence),
                max_signals: max_signals.unwrap_or(app.settings.cycle.max_signals),
                execute_trades: true,
                dry_run,
            };
            let result = app.cycle.run_trading_cycle(options).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&result)
                    .unwrap_or_else(|_| "<unprintable result>".to_string())
            );
            Ok(())
        }
        Command::Status => {
            let app = build_app(settings)?;
            print_status(&app)
        }
        Command::SyncOrders { days, recompute_pnl } => {
            let app = build_app(settings)?;
            let cutoff = Utc::now() - ChronoDuration::days(days);
            let orders = app.broker.get_orders("closed", 500, None).await?;
            let recent: Vec<_> = orders
                .into_iter()
                .filter(|o| o.submitted_at.map(|t| t >= cutoff).unwrap_or(true))
                .collect();

            let (imported, skipped) = app.history.import_orders(&recent)?;
            let reconciled = if recompute_pnl {
                app.history.recompute_pnl()?
            } else {
                app.history.reconcile_fifo()?
            };
            println!(
                "orders imported: {imported}, skipped: {skipped}, legs reconciled: {reconciled}"
            );
            Ok(())
        }
        Command::Health { pre_market } => {
            let app = build_app(settings)?;
            let report = if pre_market {
                app.health.run_pre_market_check().await
            } else {
                app.health.run_continuous_check().await
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&report)
                    .unwrap_or_else(|_| "<unprintable report>".to_string())
            );
            Ok(())
        }
    }
}

async fn start_service(settings: Settings) -> Result<()> {
    let app = build_app(settings)?;
    app.store.clear_shutdown_request()?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Helios Trader — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // Startup health check: a BLOCKED report is logged loudly but the
    // scheduler still starts, so intermittent broker issues self-heal.
    let report = app.health.run_pre_market_check().await;
    info!(status = %report.overall_status, "startup health check");

    let jobs = Arc::new(JobContext {
        cycle: Arc::clone(&app.cycle),
        monitor: Arc::clone(&app.monitor),
        watchlist: Arc::clone(&app.watchlist),
        health: Arc::clone(&app.health),
        performance: Arc::clone(&app.performance),
        ranker: None,
    });
    let scheduler = Arc::new(TradingScheduler::new(
        Arc::clone(&app.store),
        Arc::clone(&app.events),
        jobs,
        app.settings.exchange_tz(),
        app.settings.scheduler_max_retries,
    ));

    let loaded = scheduler.load_tasks()?;
    info!(loaded, "persisted tasks loaded");
    scheduler.add_default_schedule(
        app.settings.position_monitor_interval_minutes,
        app.settings.trading_cycle_interval_minutes,
    )?;
    Arc::clone(&scheduler).start();

    info!("All subsystems running. Press Ctrl+C to stop.");

    // Run until Ctrl+C or a `stop` command lands in the store.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received — stopping gracefully");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {
                if !scheduler.is_running() {
                    info!("scheduler stopped via control store");
                    break;
                }
            }
        }
    }

    scheduler.stop();
    app.cycle.cancel_token().cancel();
    info!("Helios Trader shut down complete.");
    Ok(())
}

fn print_status(app: &App) -> Result<()> {
    let heartbeat = app.store.last_heartbeat()?;
    let heartbeat_age = heartbeat.map(|t| (Utc::now() - t).num_minutes());
    let summary = app.watchlist.get_summary()?;
    let metrics = app.history.metrics()?;
    let watching = app
        .watchlist
        .get_watchlist(None, SortBy::Priority)?
        .len();
    let recent_alerts = app.alerts.recent(None).len();

    println!("helios status");
    println!("  paper trading     : {}", app.settings.is_paper());
    match heartbeat_age {
        Some(age) => println!("  last heartbeat    : {age}m ago"),
        None => println!("  last heartbeat    : never"),
    }
    println!("  cycle running     : {}", app.cycle.is_running());
    println!(
        "  watchlist         : {watching} items ({} watching, {} triggered)",
        summary.watching, summary.triggered
    );
    println!(
        "  closed trades     : {} (win rate {})",
        metrics.total_trades,
        metrics
            .win_rate
            .map(|w| format!("{w:.1}%"))
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("  total realized pnl: ${:.2}", metrics.total_pnl);
    println!("  recent alerts     : {recent_alerts}");
    Ok(())
}
