//! Per-subscription candle aggregation.
//!
//! One `Aggregation` owns the forming bar of one (symbol, timeframe)
//! series. Ticks, polled candle reads, and base-interval backfills all
//! funnel through it; wall-clock time is passed in so the state machine
//! stays deterministic under test.

use std::collections::BTreeMap;

use crate::bridge::types::QuoteCandle;
use crate::model::bar::{bucket_start, Bar};
use crate::model::symbol::Symbol;
use crate::model::tick::Tick;
use crate::model::timeframe::Timeframe;

/// What an applied event did to the series.
#[derive(Debug, Clone, PartialEq)]
pub enum BarEvent {
    /// A new bucket started. Consumers drop incremental caches and
    /// treat the previous bar as closed.
    Opened(Bar),
    /// The forming bar changed in place.
    Updated(Bar),
}

impl BarEvent {
    pub fn bar(&self) -> &Bar {
        match self {
            BarEvent::Opened(bar) | BarEvent::Updated(bar) => bar,
        }
    }
}

pub struct Aggregation {
    symbol: Symbol,
    timeframe: Timeframe,
    current: Option<Bar>,
    /// Close of the most recently touched bar. The next bar opens here;
    /// only the first bar of a series uses its own price.
    last_close: Option<f64>,
    newest_bucket_ms: Option<u64>,
}

impl Aggregation {
    pub fn new(symbol: Symbol, timeframe: Timeframe) -> Self {
        Self {
            symbol,
            timeframe,
            current: None,
            last_close: None,
            newest_bucket_ms: None,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn current_bar(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    pub fn newest_bucket_ms(&self) -> Option<u64> {
        self.newest_bucket_ms
    }

    /// Prime continuity from loaded history (ascending bars). The newest
    /// loaded bar becomes the forming bar when it falls in the live
    /// bucket.
    pub fn seed_history(&mut self, bars: &[Bar], now_ms: u64) {
        let Some(last) = bars.last() else {
            return;
        };
        self.last_close = Some(last.close);
        self.newest_bucket_ms = Some(last.bucket_time_ms);
        if last.bucket_time_ms == bucket_start(now_ms, self.timeframe.duration_ms()) {
            self.current = Some(last.clone());
        }
    }

    /// The live feed has gone quiet for more than two bucket spans.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        match self.newest_bucket_ms {
            Some(newest) => now_ms.saturating_sub(newest) > 2 * self.timeframe.duration_ms(),
            None => false,
        }
    }

    pub fn apply_tick(&mut self, tick: &Tick, now_ms: u64) -> Option<BarEvent> {
        let Some(price) = tick.trade_price() else {
            tracing::debug!(symbol = %self.symbol, "tick without usable price dropped");
            return None;
        };
        let event_time = if tick.time_ms == 0 { now_ms } else { tick.time_ms };
        let duration = self.timeframe.duration_ms();
        let bucket = bucket_start(event_time, duration);
        if bucket < bucket_start(now_ms, duration) {
            tracing::debug!(symbol = %self.symbol, bucket, "late tick for a closed bucket dropped");
            return None;
        }

        match &mut self.current {
            Some(bar) if bucket < bar.bucket_time_ms => None,
            Some(bar) if bucket == bar.bucket_time_ms => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                // Ticks carry no size; the bar counts them until a
                // server-reported volume overwrites the count.
                bar.volume += 1.0;
                self.last_close = Some(price);
                Some(BarEvent::Updated(bar.clone()))
            }
            _ => Some(BarEvent::Opened(self.open_bar(bucket, price, price, price, price, 1.0))),
        }
    }

    /// Apply a polled or pushed whole-candle read. An unusable payload
    /// skips the cycle without touching the series.
    pub fn apply_candle(&mut self, candle: &QuoteCandle, now_ms: u64) -> Option<BarEvent> {
        if !candle.is_usable() {
            tracing::debug!(symbol = %self.symbol, ?candle, "unusable candle payload, cycle skipped");
            return None;
        }
        let duration = self.timeframe.duration_ms();
        let bucket = bucket_start(candle.time_ms, duration);
        if bucket < bucket_start(now_ms, duration) {
            tracing::debug!(symbol = %self.symbol, bucket, "candle for a closed bucket dropped");
            return None;
        }

        match &mut self.current {
            Some(bar) if bucket < bar.bucket_time_ms => None,
            Some(bar) if bucket == bar.bucket_time_ms => {
                bar.close = candle.close;
                bar.high = bar.high.max(candle.high).max(candle.close);
                bar.low = bar.low.min(candle.low).min(candle.close);
                if candle.volume > 0.0 {
                    bar.volume = candle.volume;
                }
                self.last_close = Some(candle.close);
                Some(BarEvent::Updated(bar.clone()))
            }
            _ => Some(BarEvent::Opened(self.open_bar(
                bucket,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
            ))),
        }
    }

    /// Re-bucket base-interval bars into this timeframe after the live
    /// feed went stale. Derived buckets obey the same open-continuity
    /// rule; volumes sum and extremes widen per bucket. Buckets older
    /// than the forming bar stay untouched.
    pub fn apply_base_bars(&mut self, base: &[Bar]) -> Vec<BarEvent> {
        let duration = self.timeframe.duration_ms();
        let mut grouped: BTreeMap<u64, Vec<&Bar>> = BTreeMap::new();
        for b in base.iter().filter(|b| b.is_well_formed()) {
            grouped.entry(bucket_start(b.bucket_time_ms, duration)).or_default().push(b);
        }

        let mut events = Vec::new();
        for (bucket, group) in grouped {
            let high = group.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let low = group.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            let close = group.last().map(|b| b.close).unwrap_or_default();
            let volume: f64 = group.iter().map(|b| b.volume).sum();
            let first_open = group.first().map(|b| b.open).unwrap_or(close);

            match &mut self.current {
                Some(bar) if bucket < bar.bucket_time_ms => continue,
                Some(bar) if bucket == bar.bucket_time_ms => {
                    bar.close = close;
                    bar.high = bar.high.max(high).max(close);
                    bar.low = bar.low.min(low).min(close);
                    // The base series is authoritative for the span it covers.
                    bar.volume = volume;
                    self.last_close = Some(close);
                    events.push(BarEvent::Updated(bar.clone()));
                }
                _ => {
                    events.push(BarEvent::Opened(
                        self.open_bar(bucket, first_open, high, low, close, volume),
                    ));
                }
            }
        }
        events
    }

    fn open_bar(
        &mut self,
        bucket: u64,
        fallback_open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Bar {
        let open = self.last_close.unwrap_or(fallback_open);
        let bar = Bar {
            bucket_time_ms: bucket,
            open,
            high,
            low,
            close,
            volume,
        }
        .repaired();
        self.current = Some(bar.clone());
        self.last_close = Some(close);
        self.newest_bucket_ms = Some(self.newest_bucket_ms.map_or(bucket, |n| n.max(bucket)));
        bar
    }
}
