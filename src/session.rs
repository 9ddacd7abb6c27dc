use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

use crate::bridge::types::{self, PushEvent};
use crate::bridge::ws::{unsubscribe_message, PushChannel, SubscribeTarget, WsStream};
use crate::error::EngineError;
use crate::event::ChannelStatus;

const EVENT_BUFFER: usize = 256;

/// Monotonic generation stamp shared by a supervisor and its consumers.
/// Every reopen advances it; callbacks carrying an older stamp are
/// discarded wherever they land.
#[derive(Debug, Clone, Default)]
pub struct SessionCounter(Arc<AtomicU64>);

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Event tagged with the generation it was produced under.
#[derive(Debug, Clone)]
pub struct Stamped<T> {
    pub seq: u64,
    pub value: T,
}

impl<T> Stamped<T> {
    pub fn is_current(&self, counter: &SessionCounter) -> bool {
        self.seq == counter.current()
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(ChannelStatus),
    Push(PushEvent),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    /// Fixed wait before retrying after a transport error.
    pub reconnect_delay: Duration,
    /// Watchdog window: a freshly connected channel must deliver its
    /// first data frame within this span or it is torn down and redialed.
    pub first_data_timeout: Duration,
}

/// Owns the lifecycle of one push channel: dialing, the read loop, the
/// first-data watchdog, reconnects, and teardown ordering. Exactly one
/// generation is live at a time; events of older generations fail the
/// stamp check.
pub struct ChannelSupervisor {
    channel: PushChannel,
    target: SubscribeTarget,
    policy: SessionPolicy,
    seq: SessionCounter,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ChannelSupervisor {
    pub fn new(channel: PushChannel, target: SubscribeTarget, policy: SessionPolicy) -> Self {
        Self {
            channel,
            target,
            policy,
            seq: SessionCounter::new(),
            shutdown: None,
            task: None,
        }
    }

    pub fn counter(&self) -> SessionCounter {
        self.seq.clone()
    }

    pub fn target_label(&self) -> String {
        self.target.label()
    }

    /// Close any live channel, advance the generation, and dial. Events
    /// for the new generation arrive on the returned receiver.
    pub fn open(&mut self) -> mpsc::Receiver<Stamped<SessionEvent>> {
        self.close();
        let seq = self.seq.bump();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        let runner = SessionRunner {
            channel: self.channel.clone(),
            target: self.target.clone(),
            policy: self.policy,
            counter: self.seq.clone(),
            seq,
            tx,
            shutdown: shutdown_rx,
        };
        self.task = Some(tokio::spawn(runner.run()));
        rx
    }

    /// Idempotent. Signals the run task (its timers stop and the socket
    /// closes), then advances the generation so anything still in flight
    /// fails the stamp check. Does not wait for the task to unwind.
    pub fn close(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(true);
        self.task.take();
        self.seq.bump();
    }
}

impl Drop for ChannelSupervisor {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionRunner {
    channel: PushChannel,
    target: SubscribeTarget,
    policy: SessionPolicy,
    counter: SessionCounter,
    seq: u64,
    tx: mpsc::Sender<Stamped<SessionEvent>>,
    shutdown: watch::Receiver<bool>,
}

impl SessionRunner {
    async fn send_status(&self, status: ChannelStatus) {
        let stamped = Stamped {
            seq: self.seq,
            value: SessionEvent::Status(status),
        };
        let _ = self.tx.send(stamped).await;
    }

    fn forward_push(&self, event: PushEvent) {
        let stamped = Stamped {
            seq: self.seq,
            value: SessionEvent::Push(event),
        };
        if self.tx.try_send(stamped).is_err() {
            tracing::warn!(target = %self.target.label(), "event channel full, dropping frame");
        }
    }

    async fn run(mut self) {
        loop {
            if self.counter.current() != self.seq {
                break;
            }
            self.send_status(ChannelStatus::Connecting).await;
            match self.run_once().await {
                Ok(()) => {
                    self.send_status(ChannelStatus::Closed).await;
                    break;
                }
                Err(EngineError::Auth(reason)) => {
                    tracing::error!(
                        target = %self.target.label(),
                        %reason,
                        "authentication rejected, channel parked"
                    );
                    self.send_status(ChannelStatus::AuthFailed { reason }).await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(target = %self.target.label(), error = %e, "channel error");
                    self.send_status(ChannelStatus::Closed).await;
                    if self.counter.current() != self.seq {
                        break;
                    }
                    let delay = self.policy.reconnect_delay;
                    self.send_status(ChannelStatus::Reconnecting {
                        delay_ms: delay.as_millis() as u64,
                    })
                    .await;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = self.shutdown.changed() => break,
                    }
                }
            }
        }
    }

    async fn run_once(&mut self) -> Result<(), EngineError> {
        let mut ws: WsStream = self.channel.open(&self.target).await?;
        self.send_status(ChannelStatus::Open).await;

        let first_data = tokio::time::sleep(self.policy.first_data_timeout);
        tokio::pin!(first_data);
        let mut got_data = false;

        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            match types::parse_push_event(&text) {
                                Ok(Some(event)) => {
                                    got_data = true;
                                    self.forward_push(event);
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    tracing::debug!(error = %e, "unparseable frame dropped");
                                }
                            }
                        }
                        Some(Ok(tungstenite::Message::Ping(_))) => {
                            // pong is queued by tokio-tungstenite and flushed on the next poll
                        }
                        Some(Ok(tungstenite::Message::Close(_))) => {
                            return Err(EngineError::Transport("server closed the channel".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(EngineError::Transport(format!("read error: {e}")));
                        }
                        None => {
                            return Err(EngineError::Transport("stream ended".to_string()));
                        }
                    }
                }
                _ = &mut first_data, if !got_data => {
                    return Err(EngineError::Staleness {
                        target: self.target.label(),
                        waited_ms: self.policy.first_data_timeout.as_millis() as u64,
                    });
                }
                _ = self.shutdown.changed() => {
                    let _ = ws
                        .send(tungstenite::Message::Text(unsubscribe_message(&self.target)))
                        .await;
                    return Ok(());
                }
            }
        }
    }
}
