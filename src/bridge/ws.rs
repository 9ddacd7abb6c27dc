use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use crate::error::EngineError;
use crate::model::symbol::Symbol;

use super::types;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const AUTH_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// What a push channel is subscribed to: one symbol's quote stream or
/// one account's position stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeTarget {
    Symbol(Symbol),
    Account(String),
}

impl SubscribeTarget {
    pub fn label(&self) -> String {
        match self {
            SubscribeTarget::Symbol(s) => s.as_str().to_string(),
            SubscribeTarget::Account(a) => format!("account:{a}"),
        }
    }
}

fn auth_message(token: &str) -> String {
    json!({ "op": "auth", "token": token }).to_string()
}

pub fn subscribe_message(target: &SubscribeTarget) -> String {
    match target {
        SubscribeTarget::Symbol(s) => json!({ "op": "subscribe", "symbol": s.as_str() }).to_string(),
        SubscribeTarget::Account(a) => json!({ "op": "subscribe", "account": a }).to_string(),
    }
}

pub fn unsubscribe_message(target: &SubscribeTarget) -> String {
    match target {
        SubscribeTarget::Symbol(s) => {
            json!({ "op": "unsubscribe", "symbol": s.as_str() }).to_string()
        }
        SubscribeTarget::Account(a) => json!({ "op": "unsubscribe", "account": a }).to_string(),
    }
}

fn classify_connect_error(e: tungstenite::Error) -> EngineError {
    match e {
        tungstenite::Error::Http(resp)
            if resp.status() == tungstenite::http::StatusCode::UNAUTHORIZED
                || resp.status() == tungstenite::http::StatusCode::FORBIDDEN =>
        {
            EngineError::Auth(format!("handshake rejected: {}", resp.status()))
        }
        other => EngineError::Transport(format!("connect failed: {other}")),
    }
}

/// Push-channel dialer. The protocol is JSON text frames: an auth op
/// first, a subscribe op per target, then named data events inbound.
#[derive(Debug, Clone)]
pub struct PushChannel {
    url: String,
    token: String,
}

impl PushChannel {
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
        }
    }

    /// Connect, authenticate, and subscribe. The returned socket is
    /// ready to read data frames. Token rejection at any stage surfaces
    /// as [`EngineError::Auth`]; everything else is transport-class.
    pub async fn open(&self, target: &SubscribeTarget) -> Result<WsStream, EngineError> {
        let (mut ws, _resp) = connect_async(&self.url)
            .await
            .map_err(classify_connect_error)?;

        ws.send(tungstenite::Message::Text(auth_message(&self.token)))
            .await
            .map_err(|e| EngineError::Transport(format!("auth send failed: {e}")))?;
        self.await_auth_reply(&mut ws).await?;

        ws.send(tungstenite::Message::Text(subscribe_message(target)))
            .await
            .map_err(|e| EngineError::Transport(format!("subscribe send failed: {e}")))?;

        tracing::debug!(target = %target.label(), "push channel subscribed");
        Ok(ws)
    }

    /// Servers may emit hello frames before the auth reply; skip until
    /// the reply or the timeout.
    async fn await_auth_reply(&self, ws: &mut WsStream) -> Result<(), EngineError> {
        let wait = async {
            while let Some(frame) = ws.next().await {
                let frame =
                    frame.map_err(|e| EngineError::Transport(format!("read during auth: {e}")))?;
                match frame {
                    tungstenite::Message::Text(text) => {
                        if let Some(reply) = types::parse_auth_reply(&text) {
                            return reply.map_err(EngineError::Auth);
                        }
                    }
                    tungstenite::Message::Close(_) => {
                        return Err(EngineError::Transport(
                            "server closed during auth".to_string(),
                        ));
                    }
                    _ => {}
                }
            }
            Err(EngineError::Transport("stream ended during auth".to_string()))
        };

        match tokio::time::timeout(AUTH_REPLY_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Transport(format!(
                "no auth reply within {}ms",
                AUTH_REPLY_TIMEOUT.as_millis()
            ))),
        }
    }
}
