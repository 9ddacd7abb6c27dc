use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use market_sync::bridge::ws::{PushChannel, SubscribeTarget};
use market_sync::event::ChannelStatus;
use market_sync::model::symbol::Symbol;
use market_sync::session::{ChannelSupervisor, SessionEvent, SessionPolicy};

fn policy() -> SessionPolicy {
    SessionPolicy {
        reconnect_delay: Duration::from_millis(100),
        first_data_timeout: Duration::from_millis(200),
    }
}

/// Acks every auth op and then stays silent, so the first-data watchdog
/// decides the channel's fate.
async fn spawn_silent_server() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws listener");
    let addr = listener.local_addr().expect("listener addr");
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                // first client frame is the auth op
                if ws.next().await.is_none() {
                    return;
                }
                let _ = ws
                    .send(Message::Text(r#"{"event":"auth","status":"ok"}"#.to_string()))
                    .await;
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    (format!("ws://{addr}"), task)
}

/// Rejects every auth op.
async fn spawn_denying_server() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws listener");
    let addr = listener.local_addr().expect("listener addr");
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                if ws.next().await.is_none() {
                    return;
                }
                let reply = r#"{"event":"auth","status":"denied","message":"token expired"}"#;
                let _ = ws.send(Message::Text(reply.to_string())).await;
                let _ = ws.close(None).await;
            });
        }
    });
    (format!("ws://{addr}"), task)
}

#[tokio::test]
async fn transport_errors_redial_on_the_fixed_delay() {
    // nothing listens here, every dial is refused
    let channel = PushChannel::new("ws://127.0.0.1:9", "token");
    let mut supervisor = ChannelSupervisor::new(
        channel,
        SubscribeTarget::Symbol(Symbol::new("EURUSD")),
        policy(),
    );
    let mut rx = supervisor.open();

    let mut connecting = 0;
    let mut reconnecting = 0;
    while connecting < 2 || reconnecting < 1 {
        let ev = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("status flow within 3s")
            .expect("channel alive");
        if let SessionEvent::Status(status) = ev.value {
            match status {
                ChannelStatus::Connecting => connecting += 1,
                ChannelStatus::Reconnecting { delay_ms } => {
                    assert_eq!(delay_ms, 100);
                    reconnecting += 1;
                }
                _ => {}
            }
        }
    }
    supervisor.close();
}

#[tokio::test]
async fn first_data_watchdog_redials_a_silent_channel() {
    let (url, server) = spawn_silent_server().await;
    let channel = PushChannel::new(&url, "token");
    let mut supervisor = ChannelSupervisor::new(
        channel,
        SubscribeTarget::Symbol(Symbol::new("EURUSD")),
        policy(),
    );
    let mut rx = supervisor.open();

    let mut opens = 0;
    let mut reconnects = 0;
    let mut seq_seen = None;
    while opens < 2 {
        let ev = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("status flow within 5s")
            .expect("channel alive");
        match seq_seen {
            None => seq_seen = Some(ev.seq),
            // in-loop redials stay in one generation
            Some(seq) => assert_eq!(ev.seq, seq),
        }
        if let SessionEvent::Status(status) = ev.value {
            match status {
                ChannelStatus::Open => opens += 1,
                ChannelStatus::Reconnecting { .. } => reconnects += 1,
                ChannelStatus::AuthFailed { reason } => panic!("unexpected auth failure: {reason}"),
                _ => {}
            }
        }
    }
    assert_eq!(opens, 2);
    assert!(reconnects >= 1);

    supervisor.close();
    server.abort();
}

#[tokio::test]
async fn auth_rejection_parks_without_retry() {
    let (url, server) = spawn_denying_server().await;
    let channel = PushChannel::new(&url, "bad-token");
    let mut supervisor = ChannelSupervisor::new(
        channel,
        SubscribeTarget::Account("9".to_string()),
        policy(),
    );
    let mut rx = supervisor.open();

    let mut statuses = Vec::new();
    loop {
        match timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("runner ends within 3s")
        {
            Some(ev) => {
                if let SessionEvent::Status(status) = ev.value {
                    statuses.push(status);
                }
            }
            // the runner finished and dropped its sender
            None => break,
        }
    }

    assert!(statuses
        .iter()
        .any(|s| matches!(s, ChannelStatus::AuthFailed { reason } if reason.contains("token expired"))));
    assert!(!statuses
        .iter()
        .any(|s| matches!(s, ChannelStatus::Reconnecting { .. })));
    assert!(matches!(
        statuses.last().expect("saw statuses"),
        ChannelStatus::AuthFailed { .. }
    ));

    supervisor.close();
    server.abort();
}

#[tokio::test]
async fn close_invalidates_the_generation() {
    let (url, server) = spawn_silent_server().await;
    let channel = PushChannel::new(&url, "token");
    let mut supervisor = ChannelSupervisor::new(
        channel,
        SubscribeTarget::Symbol(Symbol::new("EURUSD")),
        policy(),
    );
    let counter = supervisor.counter();
    let mut rx = supervisor.open();

    let first = timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("first status")
        .expect("channel alive");
    assert!(first.is_current(&counter));

    supervisor.close();
    assert!(!first.is_current(&counter));

    // anything still in flight carries the dead stamp
    while let Ok(Some(ev)) = timeout(Duration::from_millis(300), rx.recv()).await {
        assert!(!ev.is_current(&counter));
    }

    server.abort();
}

#[tokio::test]
async fn reopen_starts_a_fresh_generation() {
    let (url, server) = spawn_silent_server().await;
    let channel = PushChannel::new(&url, "token");
    let mut supervisor = ChannelSupervisor::new(
        channel,
        SubscribeTarget::Symbol(Symbol::new("EURUSD")),
        policy(),
    );
    let counter = supervisor.counter();

    let mut rx1 = supervisor.open();
    let first = timeout(Duration::from_secs(3), rx1.recv())
        .await
        .expect("first status")
        .expect("channel alive");

    let mut rx2 = supervisor.open();
    let fresh = timeout(Duration::from_secs(3), rx2.recv())
        .await
        .expect("fresh status")
        .expect("channel alive");
    assert!(fresh.seq > first.seq);
    assert!(fresh.is_current(&counter));

    // the old receiver only sees stale-stamped leftovers
    while let Ok(Some(ev)) = timeout(Duration::from_millis(300), rx1.recv()).await {
        assert!(!ev.is_current(&counter));
    }

    supervisor.close();
    server.abort();
}
