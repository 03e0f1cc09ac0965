// =============================================================================
// Price Provider — daily OHLCV bars for the strategy engine
// =============================================================================
//
// The engine only depends on the `PriceProvider` contract: ascending daily
// bars for an inclusive date range, possibly fewer than requested
// (weekends/holidays). `FinancialDatasetsProvider` is the production
// implementation over the financial data HTTP API.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{Result, TradingError};
use crate::telemetry::rate_limit::RateLimitMonitor;
use crate::types::PriceBar;

/// Provider key used for call telemetry.
const API_NAME: &str = "financial_datasets";

/// Source of historical daily bars.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Daily bars for `[start, end]`, ordered ascending by date. May return
    /// fewer bars than calendar days in the range.
    async fn get_prices(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>>;
}

/// HTTP client for the financial datasets price API.
pub struct FinancialDatasetsProvider {
    base_url: String,
    client: reqwest::Client,
    monitor: Arc<RateLimitMonitor>,
}

impl FinancialDatasetsProvider {
    pub fn new(api_key: &str, monitor: Arc<RateLimitMonitor>) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let key = reqwest::header::HeaderValue::from_str(api_key).map_err(|_| {
            TradingError::Config("FINANCIAL_DATASETS_API_KEY contains invalid characters".into())
        })?;
        headers.insert("X-API-KEY", key);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| TradingError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: "https://api.financialdatasets.ai".to_string(),
            client,
            monitor,
        })
    }

    fn parse_bar(entry: &Value) -> Option<PriceBar> {
        let time = entry.get("time").and_then(Value::as_str)?;
        // "2025-03-03" or "2025-03-03T00:00:00Z" — the date prefix is enough.
        let date = NaiveDate::parse_from_str(time.get(..10)?, "%Y-%m-%d").ok()?;

        let field = |key: &str| -> Option<f64> {
            match entry.get(key) {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => s.parse().ok(),
                _ => None,
            }
        };

        Some(PriceBar {
            date,
            open: field("open")?,
            high: field("high")?,
            low: field("low")?,
            close: field("close")?,
            volume: field("volume").unwrap_or(0.0),
        })
    }
}

#[async_trait]
impl PriceProvider for FinancialDatasetsProvider {
    #[instrument(skip(self), name = "prices::get_prices")]
    async fn get_prices(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let url = format!("{}/prices/", self.base_url);
        let started = Instant::now();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("ticker", ticker.to_uppercase()),
                ("interval", "day".to_string()),
                ("interval_multiplier", "1".to_string()),
                ("start_date", start.format("%Y-%m-%d").to_string()),
                ("end_date", end.format("%Y-%m-%d").to_string()),
            ])
            .send()
            .await;

        let latency = started.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.monitor
                    .record_call(API_NAME, "prices", false, latency, None);
                return Err(TradingError::from_transport(e));
            }
        };

        let status = response.status();
        if status.as_u16() == 429 {
            self.monitor.record_rate_limit_hit(API_NAME, None);
            self.monitor
                .record_call(API_NAME, "prices", false, latency, None);
            return Err(TradingError::RateLimited { retry_after: None });
        }
        if !status.is_success() {
            self.monitor
                .record_call(API_NAME, "prices", false, latency, None);
            return Err(TradingError::Transport(format!(
                "price API returned {status} for {ticker}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(TradingError::from_transport)?;
        self.monitor
            .record_call(API_NAME, "prices", true, latency, None);

        let mut bars: Vec<PriceBar> = body
            .get("prices")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Self::parse_bar).collect())
            .unwrap_or_default();

        // The contract is ascending by date regardless of API ordering.
        bars.sort_by_key(|b| b.date);
        if bars.is_empty() {
            warn!(ticker, %start, %end, "price API returned no bars");
        } else {
            debug!(ticker, count = bars.len(), "bars fetched");
        }
        Ok(bars)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_bar_accepts_date_and_datetime() {
        let bar = FinancialDatasetsProvider::parse_bar(&json!({
            "time": "2025-03-03", "open": 10.0, "high": 11.0,
            "low": 9.5, "close": 10.5, "volume": 1000
        }))
        .unwrap();
        assert_eq!(bar.date, NaiveDate::from_ymd_opt(2025, 3, 3).unwrap());
        assert_eq!(bar.close, 10.5);

        let bar = FinancialDatasetsProvider::parse_bar(&json!({
            "time": "2025-03-04T00:00:00Z", "open": "10", "high": "11",
            "low": "9", "close": "10.25", "volume": "500"
        }))
        .unwrap();
        assert_eq!(bar.date, NaiveDate::from_ymd_opt(2025, 3, 4).unwrap());
        assert_eq!(bar.volume, 500.0);
    }

    #[test]
    fn parse_bar_rejects_incomplete_entries() {
        assert!(FinancialDatasetsProvider::parse_bar(&json!({"time": "2025-03-03"})).is_none());
        assert!(FinancialDatasetsProvider::parse_bar(&json!({"open": 1.0})).is_none());
        assert!(FinancialDatasetsProvider::parse_bar(&json!({
            "time": "bad-date", "open": 1.0, "high": 1.0, "low": 1.0, "close": 1.0
        }))
        .is_none());
    }
}
