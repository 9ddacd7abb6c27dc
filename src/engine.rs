//! Feed orchestration.
//!
//! One `Engine` serves any number of candle and position feeds. Each
//! feed runs three pieces: a push-channel supervisor, REST pollers on
//! the scheduler, and a pipeline task that owns the mutable state and
//! merges both sources. Cross-task traffic is channels only; the
//! session counter stamps push events so frames from a torn-down
//! generation die at the door.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::aggregator::{Aggregation, BarEvent};
use crate::bridge::rest::RestClient;
use crate::bridge::types::{PushEvent, QuoteCandle};
use crate::bridge::ws::{PushChannel, SubscribeTarget};
use crate::config::Config;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::history::{HistoryLoader, HistoryRequest};
use crate::model::symbol::Symbol;
use crate::model::tick::Tick;
use crate::model::timeframe::Timeframe;
use crate::positions::PositionBook;
use crate::scheduler::{self, PollHandle};
use crate::session::{ChannelSupervisor, SessionCounter, SessionEvent, SessionPolicy, Stamped};
use crate::ticket;

const EVENT_BUFFER: usize = 256;
const POLL_BUFFER: usize = 8;
const COMMAND_BUFFER: usize = 16;
/// Minimum wait between staleness backfills so a closed market does not
/// turn every poll cycle into a history fetch.
const BACKFILL_COOLDOWN_MS: u64 = 60_000;

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Receive from an optional channel; a parked (`None`) channel never
/// yields, it just stops competing in the select.
async fn next_msg<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct Engine {
    cfg: Config,
    rest: Arc<RestClient>,
    push: PushChannel,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Self, EngineError> {
        let rest = RestClient::new(
            &cfg.bridge.rest_base_url,
            cfg.bridge.rest_fallback_url.as_deref(),
            &cfg.bridge.token,
            cfg.bridge.http_timeout(),
        )?;
        let push = PushChannel::new(&cfg.bridge.ws_url, &cfg.bridge.token);
        Ok(Self {
            cfg,
            rest: Arc::new(rest),
            push,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn rest(&self) -> Arc<RestClient> {
        self.rest.clone()
    }

    /// Start a candle feed. The initial history load completes before
    /// this returns so the push subscription and the pollers use the
    /// symbol spelling that actually answered; the loaded bars arrive as
    /// the first event on the receiver.
    pub async fn open_candles(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> (CandleFeed, mpsc::Receiver<EngineEvent>) {
        let loader = HistoryLoader::new(
            self.cfg.engine.history_initial_bars,
            self.cfg.engine.history_max_bars,
            self.cfg.engine.history_range_margin,
        );
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let loaded = loader
            .load(&self.rest, symbol, timeframe, &HistoryRequest::Initial)
            .await;
        let live_symbol = loaded.symbol.clone();
        let mut agg = Aggregation::new(live_symbol.clone(), timeframe);
        agg.seed_history(&loaded.bars, now_ms());
        let _ = events_tx
            .send(EngineEvent::BarHistory {
                symbol: live_symbol.clone(),
                timeframe,
                bars: loaded.bars,
                no_data: loaded.no_data,
            })
            .await;

        let mut supervisor = ChannelSupervisor::new(
            self.push.clone(),
            SubscribeTarget::Symbol(live_symbol.clone()),
            SessionPolicy {
                reconnect_delay: self.cfg.engine.reconnect_delay(),
                first_data_timeout: self.cfg.engine.candle_watchdog(),
            },
        );
        let session_rx = supervisor.open();

        let (poll_tx, poll_rx) = mpsc::channel(POLL_BUFFER);
        let poll = {
            let rest = self.rest.clone();
            let sym = live_symbol.clone();
            scheduler::schedule(self.cfg.engine.poll_interval(), move || {
                let rest = rest.clone();
                let sym = sym.clone();
                let tx = poll_tx.clone();
                async move {
                    let (candle, tick) =
                        tokio::join!(rest.current_candle(&sym, timeframe), rest.tick(&sym));
                    let update = PollUpdate {
                        candle: candle.unwrap_or_else(|e| {
                            tracing::debug!(symbol = %sym, error = %e, "candle poll failed");
                            None
                        }),
                        tick: tick.unwrap_or_else(|e| {
                            tracing::debug!(symbol = %sym, error = %e, "tick poll failed");
                            None
                        }),
                    };
                    let _ = tx.try_send(update);
                }
            })
        };

        let pipeline = CandlePipeline {
            agg,
            loader,
            rest: self.rest.clone(),
            counter: supervisor.counter(),
            target_label: supervisor.target_label(),
            session_rx: Some(session_rx),
            poll_rx,
            events_tx,
            last_backfill_ms: 0,
        };
        let task = tokio::spawn(pipeline.run());

        (
            CandleFeed {
                symbol: live_symbol,
                timeframe,
                supervisor,
                poll: Some(poll),
                pipeline: Some(task),
            },
            events_rx,
        )
    }

    /// Start a position feed for one account: push subscription plus a
    /// periodic snapshot poll, with the first snapshot fired immediately.
    pub fn open_positions(&self, account: &str) -> (PositionFeed, mpsc::Receiver<EngineEvent>) {
        let account = account.trim().to_string();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let mut supervisor = ChannelSupervisor::new(
            self.push.clone(),
            SubscribeTarget::Account(account.clone()),
            SessionPolicy {
                reconnect_delay: self.cfg.engine.reconnect_delay(),
                first_data_timeout: self.cfg.engine.position_watchdog(),
            },
        );
        let session_rx = supervisor.open();

        let (poll_tx, poll_rx) = mpsc::channel(POLL_BUFFER);
        let poll = {
            let rest = self.rest.clone();
            let acct = account.clone();
            scheduler::schedule(self.cfg.engine.snapshot_interval(), move || {
                let rest = rest.clone();
                let acct = acct.clone();
                let tx = poll_tx.clone();
                async move {
                    let result = rest.positions_snapshot(&acct).await;
                    if let Err(e) = &result {
                        tracing::debug!(account = %acct, error = %e, "position snapshot poll failed");
                    }
                    let _ = tx.try_send(result);
                }
            })
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let pipeline = PositionPipeline {
            book: PositionBook::new(
                self.cfg.engine.rest_volume_scale,
                self.cfg.engine.push_volume_scale,
                self.cfg.engine.contract_size,
            ),
            rest: self.rest.clone(),
            account,
            counter: supervisor.counter(),
            target_label: supervisor.target_label(),
            session_rx: Some(session_rx),
            poll_rx,
            commands: Some(command_rx),
            events_tx,
        };
        let task = tokio::spawn(pipeline.run());

        (
            PositionFeed {
                supervisor,
                poll: Some(poll),
                pipeline: Some(task),
                commands: command_tx,
            },
            events_rx,
        )
    }
}

struct PollUpdate {
    candle: Option<QuoteCandle>,
    tick: Option<Tick>,
}

pub struct CandleFeed {
    symbol: Symbol,
    timeframe: Timeframe,
    supervisor: ChannelSupervisor,
    poll: Option<PollHandle>,
    pipeline: Option<JoinHandle<()>>,
}

impl CandleFeed {
    /// The spelling the feed settled on, canonical or micro variant.
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Pollers stop first, then the push channel tears down and the
    /// generation advances, then the pipeline goes. Idempotent.
    pub fn close(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.cancel();
        }
        self.supervisor.close();
        if let Some(task) = self.pipeline.take() {
            task.abort();
        }
    }
}

impl Drop for CandleFeed {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct PositionFeed {
    supervisor: ChannelSupervisor,
    poll: Option<PollHandle>,
    pipeline: Option<JoinHandle<()>>,
    commands: mpsc::Sender<BookCommand>,
}

impl PositionFeed {
    /// Resolve a grid identifier to a numeric ticket. Runs on the
    /// pipeline task because resolution may refresh the book.
    pub async fn resolve_ticket(&self, raw_id: &str) -> Result<u64, EngineError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(BookCommand::Resolve {
                raw_id: raw_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| EngineError::Transport("position feed is closed".to_string()))?;
        answer
            .await
            .map_err(|_| EngineError::Transport("position feed dropped the request".to_string()))?
    }

    /// Feed a quote into the book so open float tracks the market
    /// between position events.
    pub async fn mark_price(&self, symbol: &Symbol, price: f64) {
        let _ = self
            .commands
            .send(BookCommand::MarkPrice {
                symbol: symbol.clone(),
                price,
            })
            .await;
    }

    pub fn close(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.cancel();
        }
        self.supervisor.close();
        if let Some(task) = self.pipeline.take() {
            task.abort();
        }
    }
}

impl Drop for PositionFeed {
    fn drop(&mut self) {
        self.close();
    }
}

enum BookCommand {
    Resolve {
        raw_id: String,
        reply: oneshot::Sender<Result<u64, EngineError>>,
    },
    MarkPrice {
        symbol: Symbol,
        price: f64,
    },
}

struct CandlePipeline {
    agg: Aggregation,
    loader: HistoryLoader,
    rest: Arc<RestClient>,
    counter: SessionCounter,
    target_label: String,
    session_rx: Option<mpsc::Receiver<Stamped<SessionEvent>>>,
    poll_rx: mpsc::Receiver<PollUpdate>,
    events_tx: mpsc::Sender<EngineEvent>,
    last_backfill_ms: u64,
}

impl CandlePipeline {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe = next_msg(&mut self.session_rx) => match maybe {
                    Some(ev) => self.on_session_event(ev).await,
                    // Supervisor ended (closed or auth-parked); polling
                    // keeps the chart alive.
                    None => self.session_rx = None,
                },
                maybe = self.poll_rx.recv() => match maybe {
                    Some(update) => self.on_poll(update).await,
                    None => break,
                },
            }
        }
    }

    async fn on_session_event(&mut self, ev: Stamped<SessionEvent>) {
        if !ev.is_current(&self.counter) {
            tracing::debug!(seq = ev.seq, "stale-generation event dropped");
            return;
        }
        match ev.value {
            SessionEvent::Status(status) => {
                let _ = self
                    .events_tx
                    .send(EngineEvent::ChannelStatus {
                        target: self.target_label.clone(),
                        seq: ev.seq,
                        status,
                    })
                    .await;
            }
            SessionEvent::Push(PushEvent::Tick { symbol, tick }) => {
                if self.is_ours(symbol.as_ref()) {
                    self.apply_tick_reading(tick, now_ms()).await;
                }
            }
            SessionEvent::Push(PushEvent::Candle { symbol, candle }) => {
                if self.is_ours(symbol.as_ref()) {
                    if let Some(event) = self.agg.apply_candle(&candle, now_ms()) {
                        self.emit_bar(event).await;
                    }
                }
            }
            SessionEvent::Push(_) => {
                tracing::debug!(target = %self.target_label, "non-candle push frame ignored");
            }
        }
    }

    /// Frames without a symbol belong to the single subscribed series.
    fn is_ours(&self, symbol: Option<&Symbol>) -> bool {
        symbol.map_or(true, |s| s == self.agg.symbol())
    }

    async fn on_poll(&mut self, update: PollUpdate) {
        let now = now_ms();
        if let Some(candle) = update.candle {
            if let Some(event) = self.agg.apply_candle(&candle, now) {
                self.emit_bar(event).await;
            }
            if let Some(tick) = update.tick {
                // A tick older than the candle reading is a stale quote.
                if tick.time_ms == 0 || tick.time_ms >= candle.time_ms {
                    self.apply_tick_reading(tick, now).await;
                }
            }
        } else if let Some(tick) = update.tick {
            self.apply_tick_reading(tick, now).await;
        }
        self.maybe_backfill(now).await;
    }

    async fn apply_tick_reading(&mut self, tick: Tick, now: u64) {
        let _ = self
            .events_tx
            .send(EngineEvent::TickQuote {
                symbol: self.agg.symbol().clone(),
                tick,
            })
            .await;
        if let Some(event) = self.agg.apply_tick(&tick, now) {
            self.emit_bar(event).await;
        }
    }

    async fn emit_bar(&mut self, event: BarEvent) {
        let symbol = self.agg.symbol().clone();
        let timeframe = self.agg.timeframe();
        let ev = match event {
            BarEvent::Opened(bar) => EngineEvent::BarOpened {
                symbol,
                timeframe,
                bar,
            },
            BarEvent::Updated(bar) => EngineEvent::BarUpdated {
                symbol,
                timeframe,
                bar,
            },
        };
        let _ = self.events_tx.send(ev).await;
    }

    /// When the series has fallen more than two buckets behind, rebuild
    /// the gap from minute bars.
    async fn maybe_backfill(&mut self, now: u64) {
        if !self.agg.is_stale(now) {
            return;
        }
        if now.saturating_sub(self.last_backfill_ms) < BACKFILL_COOLDOWN_MS {
            return;
        }
        self.last_backfill_ms = now;

        let Some(from_ms) = self.agg.newest_bucket_ms() else {
            return;
        };
        let symbol = self.agg.symbol().clone();
        tracing::warn!(
            symbol = %symbol,
            timeframe = %self.agg.timeframe(),
            behind_ms = now.saturating_sub(from_ms),
            "series stale, backfilling from minute bars"
        );
        let result = self
            .loader
            .load(
                &self.rest,
                &symbol,
                Timeframe::M1,
                &HistoryRequest::Range {
                    from_ms,
                    to_ms: now,
                },
            )
            .await;
        if result.no_data {
            tracing::warn!(symbol = %symbol, "backfill returned no data");
            return;
        }
        let events = self.agg.apply_base_bars(&result.bars);
        for event in events {
            self.emit_bar(event).await;
        }
    }
}

struct PositionPipeline {
    book: PositionBook,
    rest: Arc<RestClient>,
    account: String,
    counter: SessionCounter,
    target_label: String,
    session_rx: Option<mpsc::Receiver<Stamped<SessionEvent>>>,
    poll_rx: mpsc::Receiver<Result<Vec<Value>, EngineError>>,
    commands: Option<mpsc::Receiver<BookCommand>>,
    events_tx: mpsc::Sender<EngineEvent>,
}

impl PositionPipeline {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe = next_msg(&mut self.session_rx) => match maybe {
                    Some(ev) => self.on_session_event(ev).await,
                    None => self.session_rx = None,
                },
                maybe = self.poll_rx.recv() => match maybe {
                    Some(Ok(rows)) => {
                        self.book.apply_snapshot(&rows);
                        self.emit_set().await;
                    }
                    Some(Err(e)) => {
                        let _ = self
                            .events_tx
                            .send(EngineEvent::Error(format!("position snapshot failed: {e}")))
                            .await;
                    }
                    None => break,
                },
                maybe = next_msg(&mut self.commands) => match maybe {
                    Some(cmd) => self.on_command(cmd).await,
                    None => self.commands = None,
                },
            }
        }
    }

    async fn on_session_event(&mut self, ev: Stamped<SessionEvent>) {
        if !ev.is_current(&self.counter) {
            tracing::debug!(seq = ev.seq, "stale-generation event dropped");
            return;
        }
        match ev.value {
            SessionEvent::Status(status) => {
                let _ = self
                    .events_tx
                    .send(EngineEvent::ChannelStatus {
                        target: self.target_label.clone(),
                        seq: ev.seq,
                        status,
                    })
                    .await;
            }
            SessionEvent::Push(PushEvent::PositionUpdate(row)) => {
                if self.book.apply_update(&row) {
                    self.emit_set().await;
                }
            }
            SessionEvent::Push(PushEvent::PositionClosed { ticket }) => {
                if self.book.apply_closed(ticket) {
                    self.emit_set().await;
                } else {
                    tracing::debug!(ticket, "closed event for a ticket not in the book");
                }
            }
            SessionEvent::Push(PushEvent::Positions(rows)) => {
                self.book.apply_push_snapshot(&rows);
                self.emit_set().await;
            }
            SessionEvent::Push(PushEvent::Tick {
                symbol: Some(symbol),
                tick,
            }) => {
                // Account channels relay quotes on some servers; use
                // them to keep the float current.
                if let Some(price) = tick.trade_price() {
                    if self.book.mark_price(&symbol, price) {
                        self.emit_set().await;
                    }
                }
            }
            SessionEvent::Push(_) => {
                tracing::debug!(target = %self.target_label, "unconsumed push frame ignored");
            }
        }
    }

    async fn on_command(&mut self, cmd: BookCommand) {
        match cmd {
            BookCommand::Resolve { raw_id, reply } => {
                let result =
                    ticket::resolve_ticket(&mut self.book, &self.rest, &self.account, &raw_id)
                        .await;
                let resolved = result.is_ok();
                let _ = reply.send(result);
                // Resolution may have refreshed the book from a snapshot.
                if resolved {
                    self.emit_set().await;
                }
            }
            BookCommand::MarkPrice { symbol, price } => {
                if self.book.mark_price(&symbol, price) {
                    self.emit_set().await;
                }
            }
        }
    }

    async fn emit_set(&mut self) {
        let _ = self
            .events_tx
            .send(EngineEvent::Positions(self.book.snapshot()))
            .await;
    }
}
