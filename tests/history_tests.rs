use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use market_sync::bridge::rest::RestClient;
use market_sync::error::EngineError;
use market_sync::history::{HistoryLoader, HistoryRequest};
use market_sync::model::symbol::Symbol;
use market_sync::model::timeframe::Timeframe;

/// Minimal HTTP responder, enough protocol for the client's GETs.
/// Routes on the request target, one request per connection.
async fn spawn_http(
    respond: impl Fn(&str) -> (u16, String) + Send + 'static,
) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind http listener");
    let addr = listener.local_addr().expect("listener addr");
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let target = loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break None,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break String::from_utf8_lossy(&buf)
                                .lines()
                                .next()
                                .and_then(|line| line.split_whitespace().nth(1))
                                .map(str::to_string);
                        }
                    }
                }
            };
            let Some(target) = target else { continue };
            let (status, body) = respond(&target);
            let reason = match status {
                200 => "OK",
                401 => "Unauthorized",
                _ => "Error",
            };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    (format!("http://{addr}"), task)
}

fn client(base: &str, fallback: Option<&str>) -> RestClient {
    RestClient::new(base, fallback, "test-token", Duration::from_millis(900)).expect("client builds")
}

/// Candle rows as the bridge wire carries them: seconds-resolution
/// timestamps, five minutes apart.
fn history_body(start_secs: u64, count: usize) -> String {
    let rows: Vec<String> = (0..count)
        .map(|i| {
            let time = start_secs + (i as u64) * 300;
            let price = 1.1000 + i as f64 * 0.001;
            format!(
                r#"{{"time":{time},"open":{price},"high":{high},"low":{low},"close":{close},"volume":5}}"#,
                high = price + 0.0005,
                low = price - 0.0005,
                close = price + 0.0002
            )
        })
        .collect();
    format!("[{}]", rows.join(","))
}

#[tokio::test]
async fn offline_initial_load_is_flagged_empty() {
    let loader = HistoryLoader::new(480, 5_000, 20);
    let rest = client("http://127.0.0.1:9", None);
    let result = loader
        .load(&rest, &Symbol::new("EURUSD"), Timeframe::M5, &HistoryRequest::Initial)
        .await;
    assert!(result.bars.is_empty());
    assert!(result.no_data);
    assert_eq!(result.symbol.as_str(), "EURUSD");
}

#[tokio::test]
async fn fallback_host_serves_history_when_the_primary_errors() {
    let (primary_url, primary) =
        spawn_http(|_| (500, r#"{"error":"maintenance"}"#.to_string())).await;
    let (fallback_url, fallback) = spawn_http(|target| {
        if target.starts_with("/api/history") {
            (200, history_body(1_700_000_100, 6))
        } else {
            (500, String::new())
        }
    })
    .await;

    let rest = client(&primary_url, Some(&fallback_url));
    let rows = rest
        .history(&Symbol::new("EURUSD"), Timeframe::M5, 6)
        .await
        .expect("fallback answers");
    assert_eq!(rows.len(), 6);
    // second-resolution wire stamps scale up to milliseconds
    assert_eq!(rows[0].time_ms, 1_700_000_100_000);

    primary.abort();
    fallback.abort();
}

#[tokio::test]
async fn micro_variant_spelling_answers_when_the_canonical_is_empty() {
    let (url, server) = spawn_http(|target| {
        if target.contains("symbol=EURUSDm") {
            (200, history_body(1_700_000_100, 4))
        } else {
            (200, "[]".to_string())
        }
    })
    .await;

    let loader = HistoryLoader::new(480, 5_000, 20);
    let rest = client(&url, None);
    let result = loader
        .load(&rest, &Symbol::new("EURUSD"), Timeframe::M5, &HistoryRequest::Initial)
        .await;
    assert!(!result.no_data);
    assert_eq!(result.symbol.as_str(), "EURUSDm");
    assert_eq!(result.bars.len(), 4);
    assert!(result
        .bars
        .windows(2)
        .all(|w| w[0].bucket_time_ms < w[1].bucket_time_ms));

    server.abort();
}

#[tokio::test]
async fn rejected_token_is_not_retried_on_the_fallback() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counting = hits.clone();
    let (url, server) = spawn_http(move |_| {
        counting.fetch_add(1, Ordering::SeqCst);
        (401, r#"{"error":"bad token"}"#.to_string())
    })
    .await;

    let rest = client(&url, Some(&url));
    let err = rest
        .history(&Symbol::new("EURUSD"), Timeframe::M5, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Auth(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    server.abort();
}

#[tokio::test]
async fn range_requests_carry_seconds_and_cap_the_count() {
    let targets: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = targets.clone();
    let (url, server) = spawn_http(move |target| {
        sink.lock().unwrap().push(target.to_string());
        (200, history_body(1_700_000_100, 2))
    })
    .await;

    let loader = HistoryLoader::new(480, 5_000, 20);
    let rest = client(&url, None);
    let from_ms: u64 = 1_700_000_100_000;
    let to_ms = from_ms + 3_600_000;
    let result = loader
        .load(
            &rest,
            &Symbol::new("EURUSD"),
            Timeframe::M5,
            &HistoryRequest::Range { from_ms, to_ms },
        )
        .await;
    assert!(!result.no_data);

    let recorded = targets.lock().unwrap();
    let target = recorded.first().expect("server saw the request");
    assert!(target.contains("from=1700000100"), "target was {target}");
    assert!(target.contains("to=1700003700"), "target was {target}");
    // one hour of M5 is 12 buckets, plus the 20-bar margin
    assert!(target.contains("count=32"), "target was {target}");
    drop(recorded);

    server.abort();
}
