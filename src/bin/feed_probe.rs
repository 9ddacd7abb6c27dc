use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::StreamExt;

use market_sync::bridge::rest::RestClient;
use market_sync::bridge::ws::{PushChannel, SubscribeTarget};
use market_sync::config::Config;
use market_sync::engine::Engine;
use market_sync::event::EngineEvent;
use market_sync::model::symbol::Symbol;
use market_sync::model::timeframe::Timeframe;

const PUSH_WAIT: Duration = Duration::from_secs(8);
const ENGINE_WAIT: Duration = Duration::from_secs(12);

#[derive(Debug)]
struct ProbeResult {
    surface: &'static str,
    status: ProbeStatus,
    detail: String,
}

#[derive(Debug, PartialEq, Eq)]
enum ProbeStatus {
    Ok,
    Skipped,
    Failed,
}

fn ok(surface: &'static str, detail: String) -> ProbeResult {
    ProbeResult {
        surface,
        status: ProbeStatus::Ok,
        detail,
    }
}

fn skipped(surface: &'static str, detail: &str) -> ProbeResult {
    ProbeResult {
        surface,
        status: ProbeStatus::Skipped,
        detail: detail.to_string(),
    }
}

fn failed(surface: &'static str, detail: String) -> ProbeResult {
    ProbeResult {
        surface,
        status: ProbeStatus::Failed,
        detail,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Install rustls crypto provider (required by rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    println!("bridge feed probe");
    println!("=================");
    if let Some(token) = env_nonempty("BRIDGE_TOKEN") {
        println!("token {}", mask_token(&token));
    }

    let results = vec![
        probe_history().await,
        probe_quote().await,
        probe_positions().await,
        probe_push().await,
        probe_engine().await,
    ];

    let mut has_failure = false;
    for result in &results {
        let status = match result.status {
            ProbeStatus::Ok => "OK",
            ProbeStatus::Skipped => "SKIPPED",
            ProbeStatus::Failed => {
                has_failure = true;
                "FAILED"
            }
        };
        println!("- {:<10} {:<7} {}", result.surface, status, result.detail);
    }

    if has_failure {
        bail!("one or more feed probes failed");
    }

    Ok(())
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn probe_symbol() -> Symbol {
    Symbol::new(&env_nonempty("BRIDGE_SYMBOL").unwrap_or_else(|| "EURUSD".to_string()))
}

fn rest_from_env(surface: &'static str) -> Result<RestClient, ProbeResult> {
    let (Some(base), Some(token)) = (env_nonempty("BRIDGE_REST_URL"), env_nonempty("BRIDGE_TOKEN"))
    else {
        return Err(skipped(surface, "set BRIDGE_REST_URL and BRIDGE_TOKEN"));
    };
    RestClient::new(&base, None, &token, Duration::from_secs(5))
        .map_err(|e| failed(surface, format!("client build error: {e}")))
}

async fn probe_history() -> ProbeResult {
    let surface = "history";
    let rest = match rest_from_env(surface) {
        Ok(rest) => rest,
        Err(result) => return result,
    };
    match rest.history(&probe_symbol(), Timeframe::M5, 10).await {
        Ok(rows) => ok(surface, format!("rows={}", rows.len())),
        Err(e) => failed(surface, e.to_string()),
    }
}

async fn probe_quote() -> ProbeResult {
    let surface = "quote";
    let rest = match rest_from_env(surface) {
        Ok(rest) => rest,
        Err(result) => return result,
    };
    let sym = probe_symbol();
    match tokio::join!(rest.current_candle(&sym, Timeframe::M1), rest.tick(&sym)) {
        (Ok(candle), Ok(tick)) => ok(
            surface,
            format!("candle={} tick={}", candle.is_some(), tick.is_some()),
        ),
        (Err(e), _) | (_, Err(e)) => failed(surface, e.to_string()),
    }
}

async fn probe_positions() -> ProbeResult {
    let surface = "positions";
    let Some(account) = env_nonempty("BRIDGE_ACCOUNT") else {
        return skipped(surface, "set BRIDGE_ACCOUNT");
    };
    let rest = match rest_from_env(surface) {
        Ok(rest) => rest,
        Err(result) => return result,
    };
    match rest.positions_snapshot(&account).await {
        Ok(rows) => ok(surface, format!("rows={}", rows.len())),
        Err(e) => failed(surface, e.to_string()),
    }
}

async fn probe_push() -> ProbeResult {
    let surface = "push";
    let (Some(url), Some(token)) = (env_nonempty("BRIDGE_WS_URL"), env_nonempty("BRIDGE_TOKEN"))
    else {
        return skipped(surface, "set BRIDGE_WS_URL and BRIDGE_TOKEN");
    };
    let channel = PushChannel::new(&url, &token);
    let target = SubscribeTarget::Symbol(probe_symbol());
    let mut ws = match channel.open(&target).await {
        Ok(ws) => ws,
        Err(e) => return failed(surface, e.to_string()),
    };

    let deadline = tokio::time::sleep(PUSH_WAIT);
    tokio::pin!(deadline);
    let mut frames = 0u32;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            msg = ws.next() => match msg {
                Some(Ok(m)) if m.is_text() => frames += 1,
                Some(Ok(_)) => {}
                Some(Err(e)) => return failed(surface, format!("socket error: {e}")),
                None => return failed(surface, "socket closed before the wait ended".to_string()),
            },
        }
    }

    if frames == 0 {
        failed(surface, format!("no data frame within {PUSH_WAIT:?}"))
    } else {
        ok(surface, format!("frames={frames} within {PUSH_WAIT:?}"))
    }
}

/// End-to-end: run both feeds off the real config for a short window and
/// count what comes out.
async fn probe_engine() -> ProbeResult {
    let surface = "engine";
    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(_) => return skipped(surface, "needs config/default.toml and BRIDGE_TOKEN"),
    };
    let timeframe = match cfg.bridge.timeframe() {
        Ok(tf) => tf,
        Err(e) => return failed(surface, e.to_string()),
    };
    let symbol = Symbol::new(&cfg.bridge.symbol);
    let account = cfg.bridge.account.clone();
    let engine = match Engine::new(cfg) {
        Ok(engine) => engine,
        Err(e) => return failed(surface, format!("engine build error: {e}")),
    };

    let (mut candles, mut candle_events) = engine.open_candles(&symbol, timeframe).await;
    let (mut positions, mut position_events) = engine.open_positions(&account);

    let mut history_bars = 0usize;
    let mut history_no_data = false;
    let mut live_bars = 0u32;
    let mut ticks = 0u32;
    let mut position_sets = 0u32;

    let deadline = tokio::time::sleep(ENGINE_WAIT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            maybe = candle_events.recv() => match maybe {
                Some(EngineEvent::BarHistory { bars, no_data, .. }) => {
                    history_bars = bars.len();
                    history_no_data = no_data;
                }
                Some(EngineEvent::BarOpened { .. } | EngineEvent::BarUpdated { .. }) => live_bars += 1,
                Some(EngineEvent::TickQuote { .. }) => ticks += 1,
                Some(_) => {}
                None => break,
            },
            maybe = position_events.recv() => match maybe {
                Some(EngineEvent::Positions(_)) => position_sets += 1,
                Some(_) => {}
                None => break,
            },
        }
    }
    candles.close();
    positions.close();

    if live_bars == 0 && ticks == 0 && position_sets == 0 {
        return failed(
            surface,
            format!("no live events within {ENGINE_WAIT:?} (history no-data: {history_no_data})"),
        );
    }
    ok(
        surface,
        format!(
            "history={history_bars} live_bars={live_bars} ticks={ticks} position_sets={position_sets}"
        ),
    )
}

fn mask_token(token: &str) -> String {
    if token.len() <= 4 {
        return "****".to_string();
    }
    format!("***{}", &token[token.len() - 4..])
}
