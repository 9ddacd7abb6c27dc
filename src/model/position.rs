use std::fmt;

use super::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Identity of a broker position.
///
/// A numeric ticket is the only identity order commands accept. Records
/// that arrive without one get a synthetic key carrying the fields a later
/// snapshot match needs; such records stay visible but non-actionable
/// until a snapshot supplies the real ticket.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionKey {
    Ticket(u64),
    Synthetic {
        id: String,
        symbol: Symbol,
        volume_lots: f64,
        open_price: f64,
    },
}

impl PositionKey {
    pub fn ticket(&self) -> Option<u64> {
        match self {
            PositionKey::Ticket(t) => Some(*t),
            PositionKey::Synthetic { .. } => None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        matches!(self, PositionKey::Ticket(_))
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionKey::Ticket(t) => write!(f, "#{t}"),
            PositionKey::Synthetic { id, .. } => write!(f, "synthetic:{id}"),
        }
    }
}

/// One open trade as the broker reports it. Volumes are normalized to
/// lots at ingestion; prices and money fields stay in broker units.
#[derive(Debug, Clone)]
pub struct Position {
    pub key: PositionKey,
    pub symbol: Symbol,
    pub side: Side,
    pub volume_lots: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub open_time_ms: u64,
    pub swap: f64,
    pub profit: f64,
    pub commission: f64,
    pub comment: Option<String>,
}

impl Position {
    /// Refresh the float between broker updates. The next broker-sent
    /// profit overwrites the estimate.
    pub fn mark_price(&mut self, price: f64, contract_size: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.current_price = price;
        self.profit =
            (price - self.open_price) * self.side.sign() * self.volume_lots * contract_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_eurusd() -> Position {
        Position {
            key: PositionKey::Ticket(42),
            symbol: Symbol::new("EURUSD"),
            side: Side::Buy,
            volume_lots: 0.10,
            open_price: 1.1000,
            current_price: 1.1000,
            stop_loss: None,
            take_profit: None,
            open_time_ms: 0,
            swap: 0.0,
            profit: 0.0,
            commission: 0.0,
            comment: None,
        }
    }

    #[test]
    fn mark_price_moves_long_profit_with_price() {
        let mut pos = long_eurusd();
        pos.mark_price(1.1050, 100_000.0);
        assert!((pos.current_price - 1.1050).abs() < f64::EPSILON);
        assert!((pos.profit - 50.0).abs() < 1e-6);
    }

    #[test]
    fn mark_price_inverts_for_short() {
        let mut pos = long_eurusd();
        pos.side = Side::Sell;
        pos.mark_price(1.1050, 100_000.0);
        assert!((pos.profit - (-50.0)).abs() < 1e-6);
    }

    #[test]
    fn mark_price_ignores_unusable_prices() {
        let mut pos = long_eurusd();
        pos.mark_price(f64::NAN, 100_000.0);
        pos.mark_price(0.0, 100_000.0);
        assert!((pos.current_price - 1.1000).abs() < f64::EPSILON);
    }

    #[test]
    fn synthetic_keys_are_not_actionable() {
        let key = PositionKey::Synthetic {
            id: "sym-EURUSD-idx-0".to_string(),
            symbol: Symbol::new("EURUSD"),
            volume_lots: 0.10,
            open_price: 1.1,
        };
        assert!(!key.is_actionable());
        assert_eq!(key.ticket(), None);
        assert!(PositionKey::Ticket(7).is_actionable());
    }
}
