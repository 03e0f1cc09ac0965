// =============================================================================
// Settings — environment-driven engine configuration
// =============================================================================
//
// Every tunable lives here so the composition root can build the whole
// object graph from one value. Environment variable names are fixed; values
// are free. Missing broker credentials are a fatal Config error at startup
// (CLI exit code 2).
//
// All fields carry serde defaults so a partially-specified JSON dump of the
// settings still deserialises.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Result, TradingError};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_paper_base_url() -> String {
    "https://paper-api.alpaca.markets/v2".to_string()
}

fn default_data_url() -> String {
    "https://data.alpaca.markets/v2".to_string()
}

fn default_database_path() -> String {
    "helios.db".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_stale_threshold_minutes() -> i64 {
    10
}

fn default_small_account_threshold() -> f64 {
    2_000.0
}

fn default_target_notional() -> f64 {
    200.0
}

fn default_small_max_signals() -> usize {
    2
}

fn default_small_min_confidence() -> f64 {
    70.0
}

fn default_max_ticker_price() -> f64 {
    500.0
}

fn default_max_positions() -> usize {
    5
}

fn default_cooldown_minutes() -> i64 {
    15
}

fn default_min_confidence() -> f64 {
    65.0
}

fn default_max_signals() -> usize {
    3
}

fn default_max_universe() -> usize {
    20
}

fn default_screen_concurrency() -> usize {
    8
}

fn default_pool() -> Vec<String> {
    // Liquid, mostly fractionable names suited to small accounts.
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "AMD".to_string(),
        "F".to_string(),
        "SOFI".to_string(),
        "PLTR".to_string(),
        "NIO".to_string(),
        "T".to_string(),
    ]
}

fn default_broker_timeout_secs() -> u64 {
    10
}

fn default_research_timeout_secs() -> u64 {
    120
}

fn default_decision_timeout_secs() -> u64 {
    45
}

fn default_min_buying_power_pct() -> f64 {
    0.10
}

fn default_stop_loss_pct() -> f64 {
    0.05
}

fn default_take_profit_pct() -> f64 {
    0.10
}

fn default_max_retries() -> u32 {
    3
}

fn default_monitor_interval_minutes() -> i64 {
    5
}

fn default_cycle_interval_minutes() -> i64 {
    30
}

// =============================================================================
// Sections
// =============================================================================

/// Small-account trading profile, active when equity is at or below the
/// threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmallAccountSettings {
    /// Equity at or below this activates small-account mode.
    #[serde(default = "default_small_account_threshold")]
    pub threshold: f64,

    /// Dollar notional targeted per trade instead of a % of equity.
    #[serde(default = "default_target_notional")]
    pub target_notional_per_trade: f64,

    #[serde(default = "default_small_max_signals")]
    pub max_signals: usize,

    #[serde(default = "default_small_min_confidence")]
    pub min_confidence: f64,

    /// Tickers priced above this are skipped while the mode is active.
    #[serde(default = "default_max_ticker_price")]
    pub max_ticker_price: f64,

    #[serde(default = "default_true")]
    pub allow_fractional: bool,

    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// Minimum minutes between trades on the same ticker.
    #[serde(default = "default_cooldown_minutes")]
    pub trade_cooldown_minutes: i64,
}

impl Default for SmallAccountSettings {
    fn default() -> Self {
        Self {
            threshold: default_small_account_threshold(),
            target_notional_per_trade: default_target_notional(),
            max_signals: default_small_max_signals(),
            min_confidence: default_small_min_confidence(),
            max_ticker_price: default_max_ticker_price(),
            allow_fractional: true,
            max_positions: default_max_positions(),
            trade_cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

/// Trading-cycle defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSettings {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_max_signals")]
    pub max_signals: usize,

    /// Cap on the screening universe when no tickers are passed.
    #[serde(default = "default_max_universe")]
    pub max_universe: usize,

    /// Tickers screened concurrently within the screening stage.
    #[serde(default = "default_screen_concurrency")]
    pub screen_concurrency: usize,

    /// Fallback pool merged into the universe for small accounts.
    #[serde(default = "default_pool")]
    pub default_pool: Vec<String>,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_signals: default_max_signals(),
            max_universe: default_max_universe(),
            screen_concurrency: default_screen_concurrency(),
            default_pool: default_pool(),
        }
    }
}

/// Deadlines for outbound calls, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_broker_timeout_secs")]
    pub broker_secs: u64,

    #[serde(default = "default_research_timeout_secs")]
    pub research_secs: u64,

    #[serde(default = "default_decision_timeout_secs")]
    pub decision_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            broker_secs: default_broker_timeout_secs(),
            research_secs: default_research_timeout_secs(),
            decision_secs: default_decision_timeout_secs(),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level engine settings, normally built from the environment via
/// [`Settings::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // --- Broker credentials --------------------------------------------------
    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,

    #[serde(default = "default_paper_base_url")]
    pub alpaca_base_url: String,

    #[serde(default = "default_data_url")]
    pub alpaca_data_url: String,

    // --- External data / collaborators ---------------------------------------
    #[serde(default)]
    pub financial_datasets_api_key: Option<String>,

    #[serde(default)]
    pub openai_api_key: Option<String>,

    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    #[serde(default)]
    pub research_agent_url: Option<String>,

    #[serde(default)]
    pub decision_agent_url: Option<String>,

    // --- Persistence ---------------------------------------------------------
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub cache_url: Option<String>,

    // --- Scheduling ----------------------------------------------------------
    /// Exchange timezone for wall-clock jobs.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_stale_threshold_minutes")]
    pub scheduler_stale_threshold_minutes: i64,

    #[serde(default = "default_max_retries")]
    pub scheduler_max_retries: u32,

    #[serde(default = "default_monitor_interval_minutes")]
    pub position_monitor_interval_minutes: i64,

    #[serde(default = "default_cycle_interval_minutes")]
    pub trading_cycle_interval_minutes: i64,

    // --- Trading behaviour ---------------------------------------------------
    #[serde(default = "default_true")]
    pub use_intraday_data: bool,

    /// Global fractional-share switch. Off forces whole shares everywhere.
    #[serde(default = "default_true")]
    pub allow_fractional: bool,

    /// Fraction of buying power always left unspent.
    #[serde(default = "default_min_buying_power_pct")]
    pub min_buying_power_pct: f64,

    /// Default position-monitor stop loss (fraction of entry).
    #[serde(default = "default_stop_loss_pct")]
    pub default_stop_loss_pct: f64,

    /// Default position-monitor take profit (fraction of entry).
    #[serde(default = "default_take_profit_pct")]
    pub default_take_profit_pct: f64,

    #[serde(default)]
    pub small_account: SmallAccountSettings,

    #[serde(default)]
    pub cycle: CycleSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    env_opt(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn env_bool(name: &str, fallback: bool) -> bool {
    match env_opt(name).map(|v| v.to_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => fallback,
    }
}

impl Settings {
    /// Build settings from the process environment.
    ///
    /// # Errors
    /// `Config` when the broker credentials are missing — the engine cannot
    /// do anything useful without them.
    pub fn from_env() -> Result<Self> {
        let alpaca_api_key = env_opt("ALPACA_API_KEY").ok_or_else(|| {
            TradingError::Config(
                "ALPACA_API_KEY not set — set ALPACA_API_KEY and ALPACA_SECRET_KEY".to_string(),
            )
        })?;
        let alpaca_secret_key = env_opt("ALPACA_SECRET_KEY").ok_or_else(|| {
            TradingError::Config("ALPACA_SECRET_KEY not set".to_string())
        })?;

        let defaults = SmallAccountSettings::default();
        let small_account = SmallAccountSettings {
            threshold: env_or("SMALL_ACCOUNT_THRESHOLD", defaults.threshold),
            target_notional_per_trade: env_or(
                "TARGET_NOTIONAL_PER_TRADE",
                defaults.target_notional_per_trade,
            ),
            trade_cooldown_minutes: env_or(
                "TRADE_COOLDOWN_MINUTES",
                defaults.trade_cooldown_minutes,
            ),
            ..defaults
        };

        Ok(Self {
            alpaca_api_key,
            alpaca_secret_key,
            alpaca_base_url: env_opt("ALPACA_BASE_URL").unwrap_or_else(default_paper_base_url),
            alpaca_data_url: env_opt("ALPACA_DATA_URL").unwrap_or_else(default_data_url),
            financial_datasets_api_key: env_opt("FINANCIAL_DATASETS_API_KEY"),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            research_agent_url: env_opt("RESEARCH_AGENT_URL"),
            decision_agent_url: env_opt("DECISION_AGENT_URL"),
            database_path: env_opt("DATABASE_PATH").unwrap_or_else(default_database_path),
            cache_url: env_opt("CACHE_URL"),
            timezone: env_opt("TRADING_TIMEZONE").unwrap_or_else(default_timezone),
            scheduler_stale_threshold_minutes: env_or(
                "SCHEDULER_STALE_THRESHOLD_MINUTES",
                default_stale_threshold_minutes(),
            ),
            scheduler_max_retries: default_max_retries(),
            position_monitor_interval_minutes: default_monitor_interval_minutes(),
            trading_cycle_interval_minutes: default_cycle_interval_minutes(),
            use_intraday_data: env_bool("USE_INTRADAY_DATA", true),
            allow_fractional: env_bool("ALLOW_FRACTIONAL", true),
            min_buying_power_pct: default_min_buying_power_pct(),
            default_stop_loss_pct: default_stop_loss_pct(),
            default_take_profit_pct: default_take_profit_pct(),
            small_account,
            cycle: CycleSettings::default(),
            timeouts: TimeoutSettings {
                broker_secs: default_broker_timeout_secs(),
                research_secs: env_or("RESEARCH_TIMEOUT_SECS", default_research_timeout_secs()),
                decision_secs: env_or("DECISION_TIMEOUT_SECS", default_decision_timeout_secs()),
            },
        })
    }

    /// Whether the account is running against the paper-trading endpoint.
    pub fn is_paper(&self) -> bool {
        self.alpaca_base_url.contains("paper")
    }

    /// Parse the configured exchange timezone, falling back to US Eastern if
    /// the name is invalid.
    pub fn exchange_tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::America::New_York)
    }

    /// A settings value suitable for unit tests: paper credentials, in-memory
    /// database, defaults everywhere else.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            alpaca_api_key: "test-key".to_string(),
            alpaca_secret_key: "test-secret".to_string(),
            alpaca_base_url: default_paper_base_url(),
            alpaca_data_url: default_data_url(),
            financial_datasets_api_key: None,
            openai_api_key: None,
            anthropic_api_key: None,
            research_agent_url: None,
            decision_agent_url: None,
            database_path: ":memory:".to_string(),
            cache_url: None,
            timezone: default_timezone(),
            scheduler_stale_threshold_minutes: default_stale_threshold_minutes(),
            scheduler_max_retries: default_max_retries(),
            position_monitor_interval_minutes: default_monitor_interval_minutes(),
            trading_cycle_interval_minutes: default_cycle_interval_minutes(),
            use_intraday_data: true,
            allow_fractional: true,
            min_buying_power_pct: default_min_buying_power_pct(),
            default_stop_loss_pct: default_stop_loss_pct(),
            default_take_profit_pct: default_take_profit_pct(),
            small_account: SmallAccountSettings::default(),
            cycle: CycleSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl std::fmt::Display for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Credentials are never printed.
        write!(
            f,
            "Settings {{ base_url: {}, paper: {}, tz: {}, db: {} }}",
            self.alpaca_base_url,
            self.is_paper(),
            self.timezone,
            self.database_path
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_expected_values() {
        let cfg = Settings::for_tests();
        assert_eq!(cfg.cycle.min_confidence, 65.0);
        assert_eq!(cfg.cycle.max_signals, 3);
        assert_eq!(cfg.cycle.screen_concurrency, 8);
        assert_eq!(cfg.scheduler_stale_threshold_minutes, 10);
        assert_eq!(cfg.small_account.threshold, 2_000.0);
        assert_eq!(cfg.small_account.trade_cooldown_minutes, 15);
        assert!(cfg.allow_fractional);
        assert!(cfg.is_paper());
    }

    #[test]
    fn exchange_tz_parses_and_falls_back() {
        let mut cfg = Settings::for_tests();
        assert_eq!(cfg.exchange_tz(), chrono_tz::America::New_York);
        cfg.timezone = "not/a_zone".to_string();
        assert_eq!(cfg.exchange_tz(), chrono_tz::America::New_York);
        cfg.timezone = "America/Chicago".to_string();
        assert_eq!(cfg.exchange_tz(), chrono_tz::America::Chicago);
    }

    #[test]
    fn display_redacts_credentials() {
        let cfg = Settings::for_tests();
        let text = format!("{cfg}");
        assert!(!text.contains("test-key"));
        assert!(!text.contains("test-secret"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "alpaca_api_key": "k", "alpaca_secret_key": "s" }"#;
        let cfg: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.alpaca_base_url, default_paper_base_url());
        assert_eq!(cfg.cycle.max_universe, 20);
        assert_eq!(cfg.small_account.max_positions, 5);
        assert_eq!(cfg.timeouts.broker_secs, 10);
    }
}
