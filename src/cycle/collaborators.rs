// =============================================================================
// Research & Decision Collaborators — external agent contracts
// =============================================================================
//
// The cycle consumes two narrow contracts: a research agent that answers a
// question with sourced analysis, and a portfolio-manager agent that turns a
// (signal, research, portfolio) bundle into a trade decision. HTTP clients
// are provided for configured agent endpoints; the composition root wires
// degraded fallbacks when no endpoint is configured.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::PortfolioSnapshot;
use crate::error::{Result, TradingError};
use crate::types::{Direction, TradeAction, TradingSignal};

// -----------------------------------------------------------------------------
// Research contract
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchDepth {
    Quick,
    Standard,
    Deep,
}

impl ResearchDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }
}

/// Raw outcome of one research query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub success: bool,
    pub answer: Option<String>,
    /// Confidence in [0, 100].
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
    pub error: Option<String>,
}

impl ResearchOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            answer: None,
            confidence: 0.0,
            sources: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Streaming research events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResearchEvent {
    Start { query: String },
    Progress { message: String },
    Complete { outcome: ResearchOutcome },
    Error { message: String },
}

/// Sentiment summary derived from a research outcome; the shape the cycle
/// actually consumes.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchSummary {
    /// "bullish" | "bearish" | "neutral" | "unknown"
    pub sentiment: String,
    pub confidence: f64,
    pub summary: Option<String>,
}

impl ResearchSummary {
    pub fn unknown() -> Self {
        Self {
            sentiment: "unknown".to_string(),
            confidence: 0.0,
            summary: None,
        }
    }

    /// Derive a sentiment from the answer text by counting directional
    /// tokens. Crude on purpose: the research agent's prose is advisory.
    pub fn from_outcome(outcome: &ResearchOutcome) -> Self {
        let Some(answer) = outcome.answer.as_ref().filter(|_| outcome.success) else {
            return Self::unknown();
        };
        let lower = answer.to_lowercase();

        let bullish = ["bullish", "buy", "upside", "undervalued", "strong growth"]
            .iter()
            .map(|t| lower.matches(t).count())
            .sum::<usize>();
        let bearish = ["bearish", "sell", "downside", "overvalued", "headwind"]
            .iter()
            .map(|t| lower.matches(t).count())
            .sum::<usize>();

        let sentiment = if bullish > bearish {
            "bullish"
        } else if bearish > bullish {
            "bearish"
        } else {
            "neutral"
        };

        Self {
            sentiment: sentiment.to_string(),
            confidence: outcome.confidence,
            summary: Some(answer.chars().take(2_000).collect()),
        }
    }
}

/// External research agent.
#[async_trait]
pub trait ResearchCollaborator: Send + Sync {
    async fn research(&self, query: &str, depth: ResearchDepth) -> Result<ResearchOutcome>;
}

// -----------------------------------------------------------------------------
// Decision contract
// -----------------------------------------------------------------------------

/// The portfolio manager's answer for one signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmDecision {
    pub action: TradeAction,
    pub quantity: f64,
    pub confidence: f64,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub reasoning: String,
}

/// External portfolio-manager agent.
#[async_trait]
pub trait DecisionCollaborator: Send + Sync {
    async fn decide(
        &self,
        signal: &TradingSignal,
        research: &ResearchSummary,
        portfolio: &PortfolioSnapshot,
    ) -> Result<PmDecision>;
}

// -----------------------------------------------------------------------------
// HTTP implementations
// -----------------------------------------------------------------------------

/// Research agent over HTTP: POST {base}/research {query, depth}.
pub struct HttpResearchClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpResearchClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TradingError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn parse_outcome(body: &Value) -> ResearchOutcome {
        ResearchOutcome {
            success: body.get("success").and_then(Value::as_bool).unwrap_or(false),
            answer: body
                .get("answer")
                .and_then(Value::as_str)
                .map(str::to_string),
            confidence: body
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            sources: body
                .get("sources")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            error: body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Streaming variant: emits start / progress / complete|error events on
    /// the returned channel while the query runs.
    pub fn research_stream(
        self: std::sync::Arc<Self>,
        query: String,
        depth: ResearchDepth,
    ) -> mpsc::Receiver<ResearchEvent> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let _ = tx
                .send(ResearchEvent::Start {
                    query: query.clone(),
                })
                .await;
            let _ = tx
                .send(ResearchEvent::Progress {
                    message: "research in progress".to_string(),
                })
                .await;

            match self.research(&query, depth).await {
                Ok(outcome) => {
                    let _ = tx.send(ResearchEvent::Complete { outcome }).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(ResearchEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        });
        rx
    }
}

#[async_trait]
impl ResearchCollaborator for HttpResearchClient {
    async fn research(&self, query: &str, depth: ResearchDepth) -> Result<ResearchOutcome> {
        let url = format!("{}/research", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "query": query, "depth": depth.as_str() }))
            .send()
            .await
            .map_err(TradingError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TradingError::Transport(format!(
                "research agent returned {status}"
            )));
        }

        let body: Value = response.json().await.map_err(TradingError::from_transport)?;
        debug!(success = body.get("success").and_then(serde_json::Value::as_bool), "research response");
        Ok(Self::parse_outcome(&body))
    }
}

/// Portfolio-manager agent over HTTP: POST {base}/decide.
pub struct HttpDecisionClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDecisionClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TradingError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl DecisionCollaborator for HttpDecisionClient {
    async fn decide(
        &self,
        signal: &TradingSignal,
        research: &ResearchSummary,
        portfolio: &PortfolioSnapshot,
    ) -> Result<PmDecision> {
        let url = format!("{}/decide", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "signal": signal,
                "research": research,
                "portfolio": portfolio,
            }))
            .send()
            .await
            .map_err(TradingError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TradingError::Transport(format!(
                "decision agent returned {status}"
            )));
        }

        let body: Value = response.json().await.map_err(TradingError::from_transport)?;
        let action = body
            .get("action")
            .and_then(Value::as_str)
            .and_then(TradeAction::parse)
            .ok_or_else(|| {
                TradingError::Transport("decision agent returned no usable action".to_string())
            })?;

        Ok(PmDecision {
            action,
            quantity: body.get("quantity").and_then(Value::as_f64).unwrap_or(0.0),
            confidence: body.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
            stop_loss_pct: body.get("stop_loss_pct").and_then(Value::as_f64),
            take_profit_pct: body.get("take_profit_pct").and_then(Value::as_f64),
            reasoning: body
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

// -----------------------------------------------------------------------------
// Degraded fallbacks (used when no agent endpoint is configured)
// -----------------------------------------------------------------------------

/// Research fallback: always reports failure, which the cycle degrades to
/// `sentiment=unknown` without aborting.
pub struct UnavailableResearch;

#[async_trait]
impl ResearchCollaborator for UnavailableResearch {
    async fn research(&self, _query: &str, _depth: ResearchDepth) -> Result<ResearchOutcome> {
        Ok(ResearchOutcome::failed("research agent not configured"))
    }
}

/// Decision fallback: follow the strategy signal's direction with quantity 0
/// (sizing is decided by the risk engine) and echo its protective levels as
/// percentages.
pub struct SignalFollowDecision;

#[async_trait]
impl DecisionCollaborator for SignalFollowDecision {
    async fn decide(
        &self,
        signal: &TradingSignal,
        _research: &ResearchSummary,
        _portfolio: &PortfolioSnapshot,
    ) -> Result<PmDecision> {
        let action = match signal.direction {
            Direction::Long => TradeAction::Buy,
            Direction::Short => TradeAction::Short,
            Direction::Neutral => TradeAction::Hold,
        };

        let entry = signal.entry_price;
        let pct = |level: f64| {
            (entry > 0.0).then(|| ((level - entry) / entry * 100.0).abs())
        };

        if action != TradeAction::Hold {
            warn!(
                ticker = %signal.ticker,
                action = %action,
                "no decision agent configured — following the strategy signal"
            );
        }

        Ok(PmDecision {
            action,
            quantity: 0.0,
            confidence: signal.confidence,
            stop_loss_pct: pct(signal.stop_loss),
            take_profit_pct: pct(signal.take_profit),
            reasoning: format!("following {} signal: {}", signal.strategy, signal.reasoning),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_signal;

    #[test]
    fn sentiment_from_answer_tokens() {
        let outcome = ResearchOutcome {
            success: true,
            answer: Some("Strong growth and clear upside; analysts are bullish.".to_string()),
            confidence: 80.0,
            sources: vec![],
            error: None,
        };
        let summary = ResearchSummary::from_outcome(&outcome);
        assert_eq!(summary.sentiment, "bullish");
        assert_eq!(summary.confidence, 80.0);

        let outcome = ResearchOutcome {
            success: true,
            answer: Some("Overvalued with major headwinds; we would sell.".to_string()),
            confidence: 70.0,
            sources: vec![],
            error: None,
        };
        assert_eq!(ResearchSummary::from_outcome(&outcome).sentiment, "bearish");
    }

    #[test]
    fn failed_research_is_unknown() {
        let summary = ResearchSummary::from_outcome(&ResearchOutcome::failed("timeout"));
        assert_eq!(summary.sentiment, "unknown");
        assert_eq!(summary.confidence, 0.0);
        assert!(summary.summary.is_none());
    }

    #[tokio::test]
    async fn fallback_decision_follows_signal() {
        let signal = make_signal("AAPL", Direction::Long, 70.0, 100.0);
        let portfolio = PortfolioSnapshot {
            cash: 1_000.0,
            buying_power: 2_000.0,
            equity: 1_000.0,
            portfolio_value: 1_000.0,
            positions: Default::default(),
        };

        let decision = SignalFollowDecision
            .decide(&signal, &ResearchSummary::unknown(), &portfolio)
            .await
            .unwrap();
        assert_eq!(decision.action, TradeAction::Buy);
        assert_eq!(decision.quantity, 0.0);
        // Signal stop 5% below entry becomes a 5% stop percentage.
        assert!((decision.stop_loss_pct.unwrap() - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unavailable_research_reports_failure() {
        let outcome = UnavailableResearch
            .research("What is AAPL outlook?", ResearchDepth::Quick)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }
}
