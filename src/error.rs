// =============================================================================
// Error taxonomy for the Helios trading orchestrator
// =============================================================================
//
// Adapters (broker, price provider, collaborators) recover Transport and
// RateLimited with bounded retries. The trading cycle recovers per-ticker
// errors locally and continues. Conflict, Config, and InvariantViolation
// always propagate to the caller.
// =============================================================================

use thiserror::Error;

/// Unified error type for every fallible operation in the engine.
#[derive(Debug, Error)]
pub enum TradingError {
    /// Missing or invalid credentials / required environment. Fatal at
    /// startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or timeout failure against an external service.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP 429 from an external API. Feeds the rate-limit monitor and
    /// defers the next call.
    #[error("rate limited (retry_after={retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    /// Non-retriable business error from the broker (insufficient buying
    /// power, non-fractionable asset, ...).
    #[error("broker error ({status}): {message}")]
    Broker { status: u16, message: String },

    /// A pre-flight check rejected the operation (PDT gate, buying power,
    /// cooldown, position cap). Recorded and skipped, never retried within
    /// the same cycle.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A trading cycle is already in flight.
    #[error("trading cycle already running")]
    Conflict,

    /// Cooperative cancellation observed at a stage boundary.
    #[error("operation cancelled")]
    Cancelled,

    /// Internal bug (e.g. FIFO queue corruption). The offending operation is
    /// aborted but the process continues.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Durable store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl TradingError {
    /// Whether the adapter layer may retry this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }

    /// Map a reqwest failure onto the taxonomy. Timeouts and connection
    /// errors are Transport; everything else that reached this point is too.
    pub fn from_transport(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<rusqlite::Error> for TradingError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(TradingError::Transport("timeout".into()).is_retriable());
        assert!(TradingError::RateLimited { retry_after: Some(3) }.is_retriable());
        assert!(!TradingError::Conflict.is_retriable());
        assert!(!TradingError::Broker { status: 403, message: "no".into() }.is_retriable());
        assert!(!TradingError::PreconditionFailed("pdt".into()).is_retriable());
    }

    #[test]
    fn display_includes_status_and_message() {
        let err = TradingError::Broker {
            status: 422,
            message: "insufficient buying power".into(),
        };
        let text = err.to_string();
        assert!(text.contains("422"));
        assert!(text.contains("insufficient buying power"));
    }
}
