use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;

use crate::error::EngineError;
use crate::model::symbol::Symbol;
use crate::model::tick::Tick;
use crate::model::timeframe::Timeframe;

use super::types::{self, QuoteCandle};

/// Keep error logs bounded while preserving a payload sample.
pub fn body_sample(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 200 {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(200).collect();
        format!("{head}...")
    }
}

/// Polling client for the bridge REST surface: history, current candle,
/// tick, and position snapshots. Every request carries the bearer token;
/// a configured fallback base URL is tried when the primary fails with
/// anything but an auth rejection.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    fallback_url: Option<String>,
    token: String,
}

impl RestClient {
    pub fn new(
        base_url: &str,
        fallback_url: Option<&str>,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            fallback_url: fallback_url.map(|u| u.trim_end_matches('/').to_string()),
            token: token.to_string(),
        })
    }

    async fn get_value(
        &self,
        base: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, EngineError> {
        let url = format!("{base}{path}");
        let resp = self
            .http
            .get(&url)
            .query(query)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EngineError::Auth(format!("GET {path} -> {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Transport(format!(
                "GET {path} -> {status}: {}",
                body_sample(&body)
            )));
        }
        Ok(resp.json().await?)
    }

    async fn get_with_fallback(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, EngineError> {
        match self.get_value(&self.base_url, path, query).await {
            Ok(v) => Ok(v),
            // A rejected token fails on every base URL the same way.
            Err(e @ EngineError::Auth(_)) => Err(e),
            Err(primary) => {
                let Some(fallback) = &self.fallback_url else {
                    return Err(primary);
                };
                tracing::warn!(path, error = %primary, "primary endpoint failed, trying fallback");
                self.get_value(fallback, path, query).await
            }
        }
    }

    /// Most recent `count` bars for the series, oldest first as the
    /// server returns them. Malformed rows are skipped.
    pub async fn history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<QuoteCandle>, EngineError> {
        let value = self
            .get_with_fallback(
                "/api/history",
                &[
                    ("symbol", symbol.as_str().to_string()),
                    ("timeframe", timeframe.minutes().to_string()),
                    ("count", count.to_string()),
                ],
            )
            .await?;
        Ok(types::parse_history_rows(&value))
    }

    /// Bars covering `[from_ms, to_ms]`. `count` caps how many the server
    /// may return for the span.
    pub async fn history_range(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        from_ms: u64,
        to_ms: u64,
        count: usize,
    ) -> Result<Vec<QuoteCandle>, EngineError> {
        let value = self
            .get_with_fallback(
                "/api/history",
                &[
                    ("symbol", symbol.as_str().to_string()),
                    ("timeframe", timeframe.minutes().to_string()),
                    ("from", (from_ms / 1_000).to_string()),
                    ("to", (to_ms / 1_000).to_string()),
                    ("count", count.to_string()),
                ],
            )
            .await?;
        Ok(types::parse_history_rows(&value))
    }

    /// The still-forming candle of the current bucket, when the server
    /// has one.
    pub async fn current_candle(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Option<QuoteCandle>, EngineError> {
        let value = self
            .get_with_fallback(
                "/api/candle",
                &[
                    ("symbol", symbol.as_str().to_string()),
                    ("timeframe", timeframe.minutes().to_string()),
                ],
            )
            .await?;
        Ok(types::parse_quote_candle(&value))
    }

    pub async fn tick(&self, symbol: &Symbol) -> Result<Option<Tick>, EngineError> {
        let value = self
            .get_with_fallback("/api/tick", &[("symbol", symbol.as_str().to_string())])
            .await?;
        Ok(types::parse_tick(&value))
    }

    /// Raw snapshot rows for the account. The caller owns normalization
    /// because the lots scale is feed-specific.
    pub async fn positions_snapshot(&self, account: &str) -> Result<Vec<Value>, EngineError> {
        let value = self
            .get_with_fallback("/api/positions", &[("account", account.to_string())])
            .await?;
        match types::unwrap_rows(&value) {
            Some(rows) => Ok(rows.clone()),
            None => Err(EngineError::DataQuality(format!(
                "positions response has no rows: {}",
                body_sample(&value.to_string())
            ))),
        }
    }
}
