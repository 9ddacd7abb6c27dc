/// Top-of-book quote from the push channel or the tick endpoint.
///
/// Fields the upstream omits arrive as 0.0; `trade_price` skips them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub time_ms: u64,
}

impl Tick {
    /// Price used for candle aggregation: last trade when present,
    /// otherwise ask, otherwise bid.
    pub fn trade_price(&self) -> Option<f64> {
        [self.last, self.ask, self.bid]
            .into_iter()
            .find(|p| p.is_finite() && *p > 0.0)
    }
}
