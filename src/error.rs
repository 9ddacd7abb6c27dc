use thiserror::Error;

/// Diagnostic record of a failed ticket resolution. Every step the
/// resolver tried is listed so the failure can be acted on without
/// reproducing it.
#[derive(Error, Debug, Clone)]
#[error("cannot resolve '{raw_id}' to a ticket: tried {}; {context}", attempted.join(", "))]
pub struct ResolutionError {
    pub raw_id: String,
    pub attempted: Vec<String>,
    /// What the resolver had to work with (map size, snapshot size, ...).
    pub context: String,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    /// Connectivity-class failure. Always retried, never fatal.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single payload failed validation and was dropped.
    #[error("data quality: {0}")]
    DataQuality(String),

    /// Watchdog fired before the channel delivered its first payload.
    #[error("no data on {target} channel within {waited_ms}ms")]
    Staleness { target: String, waited_ms: u64 },

    /// Token rejected. Not retried until the caller reopens.
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Transport-class errors are retried on the fixed reconnect delay;
    /// everything else either drops one event or parks the channel.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_) | EngineError::Http(_) | EngineError::Staleness { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_error_lists_attempts() {
        let err = ResolutionError {
            raw_id: "sym-BTCUSD-idx-0".to_string(),
            attempted: vec!["map lookup".to_string(), "numeric parse".to_string()],
            context: "map had 0 entries".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sym-BTCUSD-idx-0"));
        assert!(msg.contains("map lookup"));
        assert!(msg.contains("numeric parse"));
        assert!(msg.contains("map had 0 entries"));
    }

    #[test]
    fn retry_classification() {
        assert!(EngineError::Transport("reset".to_string()).is_retryable());
        assert!(EngineError::Staleness {
            target: "positions".to_string(),
            waited_ms: 7_000
        }
        .is_retryable());
        assert!(!EngineError::Auth("401".to_string()).is_retryable());
        assert!(!EngineError::DataQuality("nan close".to_string()).is_retryable());
    }
}
