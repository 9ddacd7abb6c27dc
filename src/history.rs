//! Historical bars loading.
//!
//! A load is best-effort across the endpoint chain and both symbol
//! spellings; total failure is an explicitly flagged empty result, never
//! an error the chart has to handle.

use std::collections::BTreeMap;

use crate::bridge::rest::RestClient;
use crate::bridge::types::QuoteCandle;
use crate::model::bar::{bucket_start, Bar};
use crate::model::symbol::Symbol;
use crate::model::timeframe::Timeframe;

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryRequest {
    /// First load of a series: the most recent default window.
    Initial,
    /// A visible-range request from the chart.
    Range { from_ms: u64, to_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct HistoryResult {
    /// Ascending, deduplicated, bucket-aligned.
    pub bars: Vec<Bar>,
    /// Set when every source came back empty or failing. The series
    /// simply has nothing to show.
    pub no_data: bool,
    /// The spelling that answered; polling continues with it.
    pub symbol: Symbol,
}

/// Dedupe by bucket (later rows win), sort ascending, repair ordering
/// violations, and optionally trim to the most recent `keep_most_recent`.
pub fn normalize_rows(
    rows: &[QuoteCandle],
    timeframe: Timeframe,
    keep_most_recent: Option<usize>,
) -> Vec<Bar> {
    let duration = timeframe.duration_ms();
    let mut by_bucket: BTreeMap<u64, Bar> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.is_usable()) {
        let bucket = bucket_start(row.time_ms, duration);
        let bar = Bar {
            bucket_time_ms: bucket,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        }
        .repaired();
        by_bucket.insert(bucket, bar);
    }
    let mut bars: Vec<Bar> = by_bucket.into_values().collect();
    if let Some(limit) = keep_most_recent {
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
    }
    bars
}

pub struct HistoryLoader {
    initial_bars: usize,
    max_bars: usize,
    range_margin: usize,
}

impl HistoryLoader {
    pub fn new(initial_bars: usize, max_bars: usize, range_margin: usize) -> Self {
        Self {
            initial_bars,
            max_bars,
            range_margin,
        }
    }

    /// Bars a range request may ask for: the span in buckets plus a
    /// margin, capped.
    pub fn bar_count_for_range(&self, range_secs: u64, timeframe: Timeframe) -> usize {
        let estimate = range_secs.div_ceil(timeframe.duration_secs()) as usize + self.range_margin;
        estimate.min(self.max_bars)
    }

    pub async fn load(
        &self,
        rest: &RestClient,
        symbol: &Symbol,
        timeframe: Timeframe,
        request: &HistoryRequest,
    ) -> HistoryResult {
        for sym in [symbol.clone(), symbol.variant()] {
            let fetched = match request {
                HistoryRequest::Initial => rest.history(&sym, timeframe, self.initial_bars).await,
                HistoryRequest::Range { from_ms, to_ms } => {
                    let range_secs = to_ms.saturating_sub(*from_ms) / 1_000;
                    let count = self.bar_count_for_range(range_secs, timeframe);
                    rest.history_range(&sym, timeframe, *from_ms, *to_ms, count).await
                }
            };
            match fetched {
                Ok(rows) if !rows.is_empty() => {
                    let keep = matches!(request, HistoryRequest::Initial)
                        .then_some(self.initial_bars);
                    let bars = normalize_rows(&rows, timeframe, keep);
                    if !bars.is_empty() {
                        tracing::info!(
                            symbol = %sym,
                            timeframe = %timeframe,
                            bars = bars.len(),
                            "history loaded"
                        );
                        return HistoryResult {
                            bars,
                            no_data: false,
                            symbol: sym,
                        };
                    }
                    tracing::debug!(symbol = %sym, "history rows all unusable");
                }
                Ok(_) => {
                    tracing::debug!(symbol = %sym, "history came back empty");
                }
                Err(e) => {
                    tracing::warn!(symbol = %sym, error = %e, "history fetch failed");
                }
            }
        }
        tracing::warn!(
            symbol = %symbol,
            timeframe = %timeframe,
            "history exhausted all sources, reporting no data"
        );
        HistoryResult {
            bars: Vec::new(),
            no_data: true,
            symbol: symbol.clone(),
        }
    }
}
