//! Ticket resolution for display identifiers.
//!
//! Close and modify requests need a numeric ticket, but grid rows may
//! carry any identifier spelling the feed invented. Resolution walks a
//! fixed ladder: the learned id map, a direct numeric parse, a trailing
//! number, and finally a field match against a fresh snapshot. When
//! every step fails the error names what was tried. No step guesses.

use serde_json::Value;

use crate::bridge::rest::RestClient;
use crate::bridge::types;
use crate::error::{EngineError, ResolutionError};
use crate::model::position::PositionKey;
use crate::model::symbol::Symbol;
use crate::positions::PositionBook;

/// Relative tolerance of the snapshot field match. Prices and lots
/// survive one decimal round-trip through the wire well inside this.
pub const MATCH_TOLERANCE: f64 = 1e-4;

pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= MATCH_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

/// Display fields of an unresolved row, the inputs of the snapshot
/// match step.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchFields {
    pub symbol: Symbol,
    pub volume_lots: f64,
    pub open_price: f64,
}

#[derive(Debug)]
pub enum LocalResolution {
    Resolved(u64),
    /// All offline steps failed. `attempted` feeds the final error;
    /// `fields` is present when the id names a row currently displayed.
    Unresolved {
        attempted: Vec<String>,
        fields: Option<MatchFields>,
    },
}

fn trailing_number(raw: &str) -> Option<u64> {
    let bytes = raw.as_bytes();
    let start = bytes
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    if start == bytes.len() {
        return None;
    }
    // Zero is the feed's marker for "no ticket", never a real one.
    raw[start..].parse::<u64>().ok().filter(|t| *t > 0)
}

/// Steps that need no network: id map, numeric parse, trailing number.
pub fn resolve_local(book: &PositionBook, raw_id: &str) -> LocalResolution {
    let raw = raw_id.trim();
    let mut attempted = Vec::new();

    if let Some(ticket) = book.lookup_ticket(raw) {
        return LocalResolution::Resolved(ticket);
    }
    attempted.push(format!("id map ({} known ids)", book.known_id_count()));

    if let Ok(ticket) = raw.parse::<u64>() {
        if ticket > 0 {
            return LocalResolution::Resolved(ticket);
        }
    }
    attempted.push("numeric parse".to_string());

    if let Some(ticket) = trailing_number(raw) {
        return LocalResolution::Resolved(ticket);
    }
    attempted.push("trailing number".to_string());

    let fields = book.positions().iter().find_map(|p| match &p.key {
        PositionKey::Synthetic {
            id,
            symbol,
            volume_lots,
            open_price,
        } if id == raw => Some(MatchFields {
            symbol: symbol.clone(),
            volume_lots: *volume_lots,
            open_price: *open_price,
        }),
        _ => None,
    });

    LocalResolution::Unresolved { attempted, fields }
}

/// Final step: match the display fields against fresh snapshot rows.
/// Exactly one ticketed row may match; zero or several is a refusal,
/// never a guess.
pub fn match_snapshot(
    rows: &[Value],
    raw_id: &str,
    mut attempted: Vec<String>,
    fields: Option<&MatchFields>,
    volume_scale: f64,
) -> Result<u64, ResolutionError> {
    let Some(fields) = fields else {
        attempted.push("field match".to_string());
        return Err(ResolutionError {
            raw_id: raw_id.to_string(),
            attempted,
            context: "id does not name any displayed position, so there are no fields to match"
                .to_string(),
        });
    };
    attempted.push(format!("field match over {} snapshot rows", rows.len()));

    let mut candidates: Vec<u64> = rows
        .iter()
        .filter_map(|row| types::parse_position(row, volume_scale))
        .filter(|p| {
            p.position.symbol == fields.symbol
                && approx_eq(p.position.volume_lots, fields.volume_lots)
                && approx_eq(p.position.open_price, fields.open_price)
        })
        .filter_map(|p| p.position.key.ticket())
        .collect();
    candidates.sort_unstable();
    candidates.dedup();

    match candidates.as_slice() {
        [ticket] => Ok(*ticket),
        [] => Err(ResolutionError {
            raw_id: raw_id.to_string(),
            attempted,
            context: format!(
                "no snapshot row matches {} {} lots at {}",
                fields.symbol, fields.volume_lots, fields.open_price
            ),
        }),
        many => Err(ResolutionError {
            raw_id: raw_id.to_string(),
            attempted,
            context: format!(
                "{} snapshot rows match the display fields, refusing to guess",
                many.len()
            ),
        }),
    }
}

/// Full ladder. A successful snapshot match is remembered in the book's
/// id map and the fresh rows replace the working set while they are at
/// hand.
pub async fn resolve_ticket(
    book: &mut PositionBook,
    rest: &RestClient,
    account: &str,
    raw_id: &str,
) -> Result<u64, EngineError> {
    let raw = raw_id.trim();
    match resolve_local(book, raw) {
        LocalResolution::Resolved(ticket) => Ok(ticket),
        LocalResolution::Unresolved {
            mut attempted,
            fields,
        } => {
            let rows = match rest.positions_snapshot(account).await {
                Ok(rows) => rows,
                Err(e) => {
                    attempted.push("fresh snapshot".to_string());
                    return Err(ResolutionError {
                        raw_id: raw.to_string(),
                        attempted,
                        context: format!("snapshot fetch failed: {e}"),
                    }
                    .into());
                }
            };
            let ticket =
                match_snapshot(&rows, raw, attempted, fields.as_ref(), book.rest_volume_scale())?;
            book.learn_ticket(raw, ticket);
            book.apply_snapshot(&rows);
            tracing::info!(raw_id = raw, ticket, "ticket resolved by snapshot field match");
            Ok(ticket)
        }
    }
}
