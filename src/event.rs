use crate::model::bar::Bar;
use crate::model::position::Position;
use crate::model::symbol::Symbol;
use crate::model::tick::Tick;
use crate::model::timeframe::Timeframe;

/// Push-channel lifecycle as consumers observe it.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Closed,
    Reconnecting { delay_ms: u64 },
    /// Terminal until the owner reopens with a fresh token.
    AuthFailed { reason: String },
}

/// Everything the engine emits to its consumers (chart, position table,
/// command surface). Bar events carry the series key so one receiver can
/// multiplex subscriptions.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new bucket opened. Consumers drop incremental caches for this
    /// series and re-render from the emitted bar.
    BarOpened {
        symbol: Symbol,
        timeframe: Timeframe,
        bar: Bar,
    },
    /// The current bucket moved.
    BarUpdated {
        symbol: Symbol,
        timeframe: Timeframe,
        bar: Bar,
    },
    /// Outcome of a history load. `no_data` marks an exhausted endpoint
    /// chain; bars are then empty and the consumer shows a blank series,
    /// not an error.
    BarHistory {
        symbol: Symbol,
        timeframe: Timeframe,
        bars: Vec<Bar>,
        no_data: bool,
    },
    /// Full open-position set after any snapshot, upsert, or close.
    Positions(Vec<Position>),
    /// Latest quote, forwarded for price displays.
    TickQuote { symbol: Symbol, tick: Tick },
    ChannelStatus {
        target: String,
        seq: u64,
        status: ChannelStatus,
    },
    Error(String),
}
