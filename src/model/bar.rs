/// Align a timestamp to the start of its bucket.
pub fn bucket_start(time_ms: u64, duration_ms: u64) -> u64 {
    assert!(duration_ms > 0, "duration_ms must be > 0");
    time_ms - (time_ms % duration_ms)
}

/// One OHLC bucket of a (symbol, timeframe) series.
///
/// A bar whose bucket lies strictly before the current wall-clock bucket is
/// closed and never mutated again.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub bucket_time_ms: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn is_aligned(&self, duration_ms: u64) -> bool {
        duration_ms > 0 && self.bucket_time_ms % duration_ms == 0
    }

    /// All prices finite, the close positive, and high/low bracketing
    /// open/close.
    pub fn is_well_formed(&self) -> bool {
        let finite = self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite();
        finite
            && self.close > 0.0
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.high >= self.low
    }

    /// Widen high/low until they bracket open and close. Upstream sources
    /// occasionally ship a high below the open or a low above the close;
    /// the series invariant wins over the reported extremes.
    pub fn repaired(mut self) -> Bar {
        self.high = self.high.max(self.open).max(self.close);
        self.low = self.low.min(self.open).min(self.close);
        self
    }
}
