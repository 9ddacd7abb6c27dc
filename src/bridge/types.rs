//! Normalization of broker payloads into model types.
//!
//! The bridge fronts several server generations that disagree on field
//! casing and numeric encoding. Every field is read through an ordered
//! fallback table; the rest of the crate only ever sees the model types.

use serde_json::Value;

use crate::model::position::{Position, PositionKey, Side};
use crate::model::symbol::Symbol;
use crate::model::tick::Tick;

pub const TICKET_FIELDS: &[&str] = &["Ticket", "ticket", "Position", "PositionId", "Order", "Id"];
pub const VOLUME_FIELDS: &[&str] = &["Volume", "volume"];
const SYMBOL_FIELDS: &[&str] = &["Symbol", "symbol"];
const SIDE_FIELDS: &[&str] = &["Side", "side", "Type", "type", "Cmd", "cmd"];
const OPEN_PRICE_FIELDS: &[&str] = &["OpenPrice", "openPrice", "PriceOpen"];
const CURRENT_PRICE_FIELDS: &[&str] = &["CurrentPrice", "currentPrice", "PriceCurrent", "ClosePrice"];
const STOP_LOSS_FIELDS: &[&str] = &["StopLoss", "stopLoss", "SL", "sl"];
const TAKE_PROFIT_FIELDS: &[&str] = &["TakeProfit", "takeProfit", "TP", "tp"];
const OPEN_TIME_FIELDS: &[&str] = &["OpenTime", "openTime", "Time", "time"];
const SWAP_FIELDS: &[&str] = &["Swap", "swap"];
const PROFIT_FIELDS: &[&str] = &["Profit", "profit"];
const COMMISSION_FIELDS: &[&str] = &["Commission", "commission"];
const COMMENT_FIELDS: &[&str] = &["Comment", "comment"];
const ROW_WRAPPER_FIELDS: &[&str] = &["data", "Items", "Positions", "Records"];
const EVENT_KIND_FIELDS: &[&str] = &["event", "Event", "type", "Type"];
const TIME_FIELDS: &[&str] = &["time", "Time"];

/// First present field wins; exact spellings are tried in table order
/// before one case-insensitive pass.
pub fn pick<'a>(v: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let map = v.as_object()?;
    for name in names {
        if let Some(found) = map.get(*name) {
            return Some(found);
        }
    }
    for name in names {
        if let Some((_, found)) = map.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            return Some(found);
        }
    }
    None
}

/// Every present field from the table, one value per case-insensitive
/// spelling, exact spellings first. Rows often carry the same ticket
/// under two names plus a display id under a third.
fn pick_all<'a>(v: &'a Value, names: &[&str]) -> Vec<&'a Value> {
    let Some(map) = v.as_object() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut taken: Vec<&str> = Vec::new();
    for name in names {
        if let Some(found) = map.get(*name) {
            out.push(found);
            taken.push(name);
        }
    }
    for (key, found) in map {
        if names.iter().any(|n| n.eq_ignore_ascii_case(key))
            && !taken.iter().any(|t| t.eq_ignore_ascii_case(key))
        {
            out.push(found);
        }
    }
    out
}

/// Numbers arrive both as JSON numbers and as strings.
pub fn num_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn num_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Epoch stamp in milliseconds. The bridge reports seconds; some push
/// frames already carry milliseconds, so second-resolution values are
/// scaled up.
pub fn time_ms(v: &Value) -> Option<u64> {
    let raw = num_f64(v)?;
    if raw < 0.0 {
        return None;
    }
    let n = raw.round() as u64;
    Some(if n < 100_000_000_000 { n * 1_000 } else { n })
}

/// Rows of a snapshot response: either a bare array or one nested under
/// a wrapper key.
pub fn unwrap_rows(v: &Value) -> Option<&Vec<Value>> {
    if let Some(rows) = v.as_array() {
        return Some(rows);
    }
    pick(v, ROW_WRAPPER_FIELDS)?.as_array()
}

/// Candle payload as the wire carries it, before bucket alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteCandle {
    pub time_ms: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl QuoteCandle {
    /// Garbage filter for polled reads: non-finite prices or a
    /// non-positive close mark the whole payload unusable.
    pub fn is_usable(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.close > 0.0
    }
}

pub fn parse_quote_candle(v: &Value) -> Option<QuoteCandle> {
    Some(QuoteCandle {
        time_ms: pick(v, TIME_FIELDS).and_then(time_ms)?,
        open: pick(v, &["open", "Open"]).and_then(num_f64)?,
        high: pick(v, &["high", "High"]).and_then(num_f64)?,
        low: pick(v, &["low", "Low"]).and_then(num_f64)?,
        close: pick(v, &["close", "Close"]).and_then(num_f64)?,
        volume: pick(v, &["volume", "Volume"]).and_then(num_f64).unwrap_or(0.0),
    })
}

/// History responses are arrays of candle rows, possibly wrapped.
/// Malformed rows are skipped, not fatal.
pub fn parse_history_rows(v: &Value) -> Vec<QuoteCandle> {
    match unwrap_rows(v) {
        Some(rows) => rows.iter().filter_map(parse_quote_candle).collect(),
        None => Vec::new(),
    }
}

/// Absent fields default to 0.0, which `Tick::trade_price` skips. A row
/// with no usable price at all parses to `None`.
pub fn parse_tick(v: &Value) -> Option<Tick> {
    let tick = Tick {
        bid: pick(v, &["bid", "Bid"]).and_then(num_f64).unwrap_or(0.0),
        ask: pick(v, &["ask", "Ask"]).and_then(num_f64).unwrap_or(0.0),
        last: pick(v, &["last", "Last"]).and_then(num_f64).unwrap_or(0.0),
        time_ms: pick(v, TIME_FIELDS).and_then(time_ms).unwrap_or(0),
    };
    tick.trade_price().map(|_| tick)
}

fn parse_side(v: &Value) -> Option<Side> {
    if let Some(s) = v.as_str() {
        let s = s.trim();
        if s.eq_ignore_ascii_case("buy") || s == "0" {
            return Some(Side::Buy);
        }
        if s.eq_ignore_ascii_case("sell") || s == "1" {
            return Some(Side::Sell);
        }
        return None;
    }
    // MetaTrader order commands: 0 = buy, 1 = sell, >1 = pending orders.
    match v.as_u64() {
        Some(0) => Some(Side::Buy),
        Some(1) => Some(Side::Sell),
        _ => None,
    }
}

/// A position row plus every identifier text it arrived under. The
/// reconciler's id map is keyed by these strings.
#[derive(Debug, Clone)]
pub struct ParsedPosition {
    pub position: Position,
    pub ids: Vec<String>,
}

impl ParsedPosition {
    pub fn carries_id(&self, id: &str) -> bool {
        self.ids.iter().any(|s| s == id)
    }
}

/// Normalize one position row. `volume_scale` is the declared lots
/// multiplier of the feed variant the row came from.
///
/// Symbol, side, volume, and open price are mandatory; a row missing one
/// of them is unusable and dropped by the caller. A missing or
/// non-numeric ticket produces a synthetic key that stays displayable
/// but non-actionable.
pub fn parse_position(v: &Value, volume_scale: f64) -> Option<ParsedPosition> {
    let symbol = pick(v, SYMBOL_FIELDS)
        .and_then(text_of)
        .map(|s| Symbol::new(&s))?;
    let side = pick(v, SIDE_FIELDS).and_then(parse_side)?;
    let volume_lots = pick(v, VOLUME_FIELDS).and_then(num_f64)? * volume_scale;
    let open_price = pick(v, OPEN_PRICE_FIELDS).and_then(num_f64)?;
    let current_price = pick(v, CURRENT_PRICE_FIELDS)
        .and_then(num_f64)
        .unwrap_or(open_price);

    let ids: Vec<String> = pick_all(v, TICKET_FIELDS)
        .into_iter()
        .filter_map(text_of)
        .collect();
    let ticket = ids
        .iter()
        .find_map(|s| s.parse::<u64>().ok().filter(|t| *t > 0));
    let key = match ticket {
        Some(t) => PositionKey::Ticket(t),
        None => PositionKey::Synthetic {
            // A zero or non-numeric id stays on display duty; rows with
            // no id at all get a local one.
            id: ids.first().cloned().unwrap_or_else(|| {
                format!("pos-{}", &uuid::Uuid::new_v4().to_string()[..8])
            }),
            symbol: symbol.clone(),
            volume_lots,
            open_price,
        },
    };

    let position = Position {
        key,
        symbol,
        side,
        volume_lots,
        open_price,
        current_price,
        stop_loss: pick(v, STOP_LOSS_FIELDS).and_then(num_f64).filter(|p| *p > 0.0),
        take_profit: pick(v, TAKE_PROFIT_FIELDS).and_then(num_f64).filter(|p| *p > 0.0),
        open_time_ms: pick(v, OPEN_TIME_FIELDS).and_then(time_ms).unwrap_or(0),
        swap: pick(v, SWAP_FIELDS).and_then(num_f64).unwrap_or(0.0),
        profit: pick(v, PROFIT_FIELDS).and_then(num_f64).unwrap_or(0.0),
        commission: pick(v, COMMISSION_FIELDS).and_then(num_f64).unwrap_or(0.0),
        comment: pick(v, COMMENT_FIELDS).and_then(|c| c.as_str()).and_then(|c| {
            let trimmed = c.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }),
    };
    Some(ParsedPosition { position, ids })
}

/// Data frame from the push channel, after the event-kind dispatch.
/// Position payloads stay raw because the lots scale belongs to the
/// position book, not the wire.
#[derive(Debug, Clone)]
pub enum PushEvent {
    Tick {
        symbol: Option<Symbol>,
        tick: Tick,
    },
    Candle {
        symbol: Option<Symbol>,
        candle: QuoteCandle,
    },
    PositionUpdate(Value),
    PositionClosed {
        ticket: u64,
    },
    Positions(Vec<Value>),
}

fn frame_symbol(v: &Value) -> Option<Symbol> {
    pick(v, SYMBOL_FIELDS).and_then(text_of).map(|s| Symbol::new(&s))
}

/// Dispatch one text frame. `Ok(None)` covers heartbeats, acks, and
/// kinds this client does not consume.
pub fn parse_push_event(text: &str) -> Result<Option<PushEvent>, serde_json::Error> {
    let v: Value = serde_json::from_str(text)?;
    let Some(kind) = pick(&v, EVENT_KIND_FIELDS).and_then(Value::as_str) else {
        return Ok(None);
    };

    let event = match kind {
        "tick" => parse_tick(&v).map(|tick| PushEvent::Tick {
            symbol: frame_symbol(&v),
            tick,
        }),
        "candle" => parse_quote_candle(&v).map(|candle| PushEvent::Candle {
            symbol: frame_symbol(&v),
            candle,
        }),
        "positionUpdate" => {
            let row = pick(&v, &["data"]).cloned().unwrap_or(v);
            Some(PushEvent::PositionUpdate(row))
        }
        // Older servers say "closed", newer ones "positionClosed".
        "positionClosed" | "closed" => pick(&v, TICKET_FIELDS)
            .and_then(num_u64)
            .filter(|t| *t > 0)
            .map(|ticket| PushEvent::PositionClosed { ticket }),
        "positions" => unwrap_rows(&v).map(|rows| PushEvent::Positions(rows.clone())),
        _ => None,
    };
    Ok(event)
}

/// Reply to the auth op. `None` means the frame was something else.
pub fn parse_auth_reply(text: &str) -> Option<Result<(), String>> {
    let v: Value = serde_json::from_str(text).ok()?;
    let kind = pick(&v, EVENT_KIND_FIELDS)?.as_str()?;
    if kind != "auth" {
        return None;
    }
    let status = pick(&v, &["status", "Status"])
        .and_then(Value::as_str)
        .unwrap_or("denied");
    if status.eq_ignore_ascii_case("ok") {
        Some(Ok(()))
    } else {
        let message = pick(&v, &["message", "Message", "reason"])
            .and_then(Value::as_str)
            .unwrap_or("authentication denied")
            .to_string();
        Some(Err(message))
    }
}
