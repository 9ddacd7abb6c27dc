use std::fmt;

use serde::{Deserialize, Serialize};

/// Instrument name as the broker catalog spells it.
///
/// Brokers list micro-contract variants of an instrument under the same
/// uppercase ticker with a lowercase `m` marker appended ("EURUSD" vs
/// "EURUSDm"). The two names answer on different endpoints but describe one
/// instrument, so a feed that returns nothing for one is retried with the
/// other before giving up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Canonicalize a raw name: trim, uppercase the ticker body, keep a
    /// trailing lowercase `m` as the micro marker.
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.strip_suffix('m') {
            Some(body) if !body.is_empty() => Symbol(format!("{}m", body.to_ascii_uppercase())),
            _ => Symbol(trimmed.to_ascii_uppercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_micro(&self) -> bool {
        self.0.ends_with('m')
    }

    /// The other spelling of this instrument: micro gains the marker,
    /// non-micro loses it.
    pub fn variant(&self) -> Symbol {
        match self.0.strip_suffix('m') {
            Some(body) => Symbol(body.to_string()),
            None => Symbol(format!("{}m", self.0)),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
