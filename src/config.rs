use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::model::timeframe::Timeframe;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub engine: EngineTuning,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub rest_base_url: String,
    /// Secondary history host, tried when the primary rejects or times out.
    #[serde(default)]
    pub rest_fallback_url: Option<String>,
    pub ws_url: String,
    pub account: String,
    pub symbol: String,
    pub timeframe: String,
    pub http_timeout_ms: u64,
    #[serde(skip)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineTuning {
    pub poll_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub history_initial_bars: usize,
    pub history_max_bars: usize,
    pub history_range_margin: usize,
    pub candle_watchdog_ms: u64,
    pub position_watchdog_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Lots per volume unit of the REST snapshot feed.
    pub rest_volume_scale: f64,
    /// Lots per volume unit of the push feed.
    pub push_volume_scale: f64,
    /// Contract units per lot, used to mark open positions to market.
    pub contract_size: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl BridgeConfig {
    pub fn timeframe(&self) -> Result<Timeframe> {
        Timeframe::from_label(&self.timeframe).with_context(|| {
            format!("bridge.timeframe '{}' is not a chart period", self.timeframe)
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

impl EngineTuning {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn candle_watchdog(&self) -> Duration {
        Duration::from_millis(self.candle_watchdog_ms)
    }

    pub fn position_watchdog(&self) -> Duration {
        Duration::from_millis(self.position_watchdog_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = Path::new("config/default.toml");
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;

        let mut config: Config =
            toml::from_str(&config_str).context("failed to parse config/default.toml")?;

        config.bridge.token = std::env::var("BRIDGE_TOKEN")
            .context("BRIDGE_TOKEN not set in .env or environment")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.bridge.timeframe()?;
        if self.bridge.rest_base_url.trim().is_empty() {
            bail!("bridge.rest_base_url is empty");
        }
        if self.bridge.ws_url.trim().is_empty() {
            bail!("bridge.ws_url is empty");
        }
        if self.bridge.symbol.trim().is_empty() {
            bail!("bridge.symbol is empty");
        }
        if self.engine.poll_interval_ms == 0 || self.engine.snapshot_interval_ms == 0 {
            bail!("engine poll intervals must be > 0");
        }
        if self.engine.history_initial_bars == 0 {
            bail!("engine.history_initial_bars must be > 0");
        }
        if self.engine.history_max_bars < self.engine.history_initial_bars {
            bail!("engine.history_max_bars must be at least engine.history_initial_bars");
        }
        if !(self.engine.rest_volume_scale > 0.0) || !(self.engine.push_volume_scale > 0.0) {
            bail!("volume scales must be positive");
        }
        if !(self.engine.contract_size > 0.0) {
            bail!("engine.contract_size must be positive");
        }
        Ok(())
    }
}
