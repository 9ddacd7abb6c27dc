//! Open-position reconciliation.
//!
//! The book mirrors whatever the feed last asserted: full arrays replace
//! the set verbatim, single pushes upsert, closed events remove. Lots
//! scales differ per feed variant and are pinned at construction; the
//! REST snapshot feed reports centi-lots, the push feed reports
//! ten-thousandths of a lot.

use std::collections::HashMap;

use serde_json::Value;

use crate::bridge::rest::body_sample;
use crate::bridge::types::{self, ParsedPosition};
use crate::model::position::{Position, PositionKey};
use crate::model::symbol::Symbol;

pub struct PositionBook {
    positions: Vec<Position>,
    /// Raw feed identifiers seen together with a numeric ticket. First
    /// stop of ticket resolution.
    ticket_index: HashMap<String, u64>,
    rest_volume_scale: f64,
    push_volume_scale: f64,
    contract_size: f64,
}

fn same_identity(existing: &Position, incoming: &ParsedPosition) -> bool {
    match (&existing.key, &incoming.position.key) {
        (PositionKey::Ticket(a), PositionKey::Ticket(b)) => a == b,
        (PositionKey::Synthetic { id, .. }, PositionKey::Synthetic { id: other, .. }) => {
            id == other
        }
        // A ticketless record upgrades in place when its raw id shows up
        // again carrying a ticket.
        (PositionKey::Synthetic { id, .. }, PositionKey::Ticket(_)) => incoming.carries_id(id),
        (PositionKey::Ticket(_), PositionKey::Synthetic { .. }) => false,
    }
}

impl PositionBook {
    pub fn new(rest_volume_scale: f64, push_volume_scale: f64, contract_size: f64) -> Self {
        Self {
            positions: Vec::new(),
            ticket_index: HashMap::new(),
            rest_volume_scale,
            push_volume_scale,
            contract_size,
        }
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.clone()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn lookup_ticket(&self, raw_id: &str) -> Option<u64> {
        self.ticket_index.get(raw_id.trim()).copied()
    }

    pub fn known_id_count(&self) -> usize {
        self.ticket_index.len()
    }

    /// Lots multiplier of the snapshot feed, needed when snapshot rows
    /// are parsed outside the book.
    pub fn rest_volume_scale(&self) -> f64 {
        self.rest_volume_scale
    }

    /// Record an id-to-ticket pairing learned outside the feed, e.g. by
    /// a successful snapshot field match.
    pub fn learn_ticket(&mut self, raw_id: &str, ticket: u64) {
        self.ticket_index.insert(raw_id.trim().to_string(), ticket);
    }

    /// REST snapshot rows replace the set verbatim, an empty array
    /// included. Returns how many rows were kept.
    pub fn apply_snapshot(&mut self, rows: &[Value]) -> usize {
        self.replace_all(rows, self.rest_volume_scale)
    }

    /// Full-array push replaces too, at the push feed's scale.
    pub fn apply_push_snapshot(&mut self, rows: &[Value]) -> usize {
        self.replace_all(rows, self.push_volume_scale)
    }

    fn replace_all(&mut self, rows: &[Value], scale: f64) -> usize {
        let mut next = Vec::with_capacity(rows.len());
        for row in rows {
            match types::parse_position(row, scale) {
                Some(parsed) => {
                    self.index(&parsed);
                    next.push(parsed.position);
                }
                None => {
                    tracing::warn!(
                        row = %body_sample(&row.to_string()),
                        "unusable position row dropped"
                    );
                }
            }
        }
        self.positions = next;
        self.positions.len()
    }

    /// Single-object push: upsert by identity.
    pub fn apply_update(&mut self, row: &Value) -> bool {
        let Some(mut parsed) = types::parse_position(row, self.push_volume_scale) else {
            tracing::warn!(row = %body_sample(&row.to_string()), "unusable position update dropped");
            return false;
        };
        // A raw id we have already seen with a ticket resolves the key
        // before matching.
        let learned = match &parsed.position.key {
            PositionKey::Synthetic { id, .. } => self.ticket_index.get(id).copied(),
            PositionKey::Ticket(_) => None,
        };
        if let Some(ticket) = learned {
            parsed.position.key = PositionKey::Ticket(ticket);
        }
        self.index(&parsed);
        match self.positions.iter().position(|p| same_identity(p, &parsed)) {
            Some(i) => self.positions[i] = parsed.position,
            None => self.positions.push(parsed.position),
        }
        true
    }

    /// A closed event removes the ticket. Unknown tickets are a no-op.
    pub fn apply_closed(&mut self, ticket: u64) -> bool {
        let before = self.positions.len();
        self.positions.retain(|p| p.key.ticket() != Some(ticket));
        before != self.positions.len()
    }

    /// Refresh current price and float for one symbol between feed
    /// updates. Returns whether anything changed.
    pub fn mark_price(&mut self, symbol: &Symbol, price: f64) -> bool {
        let mut touched = false;
        for pos in self.positions.iter_mut().filter(|p| &p.symbol == symbol) {
            pos.mark_price(price, self.contract_size);
            touched = true;
        }
        touched
    }

    fn index(&mut self, parsed: &ParsedPosition) {
        if let Some(ticket) = parsed.position.key.ticket() {
            for id in &parsed.ids {
                self.ticket_index.insert(id.clone(), ticket);
            }
        }
    }
}
