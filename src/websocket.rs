//! WebSocket support.
//!
//! A matched `WS` route hands the accepted socket to its handler as a
//! [`WebSocketSession`] — the originating [`Request`] (already carrying the
//! merged route params and query) plus send/receive/close operations over
//! the upgraded connection.

use crate::error::{Error, Result};
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::{Response, StatusCode};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use tokio_tungstenite::{
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message as WsMessage, Role},
    WebSocketStream,
};

use futures_util::{SinkExt, StreamExt};

#[derive(Debug, Clone)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl From<WsMessage> for Message {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(text) => Message::Text(text),
            WsMessage::Binary(data) => Message::Binary(data),
            WsMessage::Ping(data) => Message::Ping(data),
            WsMessage::Pong(data) => Message::Pong(data),
            WsMessage::Close(_) => Message::Close,
            WsMessage::Frame(_) => Message::Close,
        }
    }
}

impl From<Message> for WsMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => WsMessage::Text(text),
            Message::Binary(data) => WsMessage::Binary(data),
            Message::Ping(data) => WsMessage::Ping(data),
            Message::Pong(data) => WsMessage::Pong(data),
            Message::Close => WsMessage::Close(None),
        }
    }
}

/// An upgraded connection plus the request that produced it. Lives as long
/// as the socket is open; closed by handler completion or error.
///
/// The frame stream sits behind an `Arc<Mutex<_>>` rather than being owned
/// outright: a handler takes the session by value, but [`run_session`] keeps
/// a second handle to the same stream so it can still send a close frame
/// after the handler (and the session it consumed) has gone.
pub struct WebSocketSession {
    stream: Arc<AsyncMutex<WebSocketStream<TcpStream>>>,
    pub request: Request,
}

impl WebSocketSession {
    pub(crate) fn new(stream: WebSocketStream<TcpStream>, request: Request) -> Self {
        Self {
            stream: Arc::new(AsyncMutex::new(stream)),
            request,
        }
    }

    fn stream_handle(&self) -> Arc<AsyncMutex<WebSocketStream<TcpStream>>> {
        self.stream.clone()
    }

    pub fn params(&self) -> &std::collections::HashMap<String, String> {
        &self.request.params
    }

    pub fn query(&self) -> &std::collections::HashMap<String, String> {
        &self.request.query
    }

    pub async fn recv(&mut self) -> Option<Message> {
        match self.stream.lock().await.next().await {
            Some(Ok(msg)) => Some(msg.into()),
            _ => None,
        }
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.stream.lock().await.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    pub async fn send_json(&mut self, value: &impl serde::Serialize) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    pub async fn close_with_code(&mut self, code: u16, reason: &str) -> Result<()> {
        close_stream_with_code(&self.stream, code, reason).await
    }

    /// Close with RFC-6455 protocol error (1002) and the given reason text.
    /// Used when the handler future resolves to an error.
    pub async fn close_with_error(&mut self, reason: &str) -> Result<()> {
        self.close_with_code(1002, reason).await
    }
}

async fn close_stream_with_code(
    stream: &Arc<AsyncMutex<WebSocketStream<TcpStream>>>,
    code: u16,
    reason: &str,
) -> Result<()> {
    stream
        .lock()
        .await
        .send(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })))
        .await?;
    Ok(())
}

/// A WebSocket handler owns the session for the life of the connection and
/// reports success/failure via `Result<()>`. A returned `Err` is not surfaced
/// to a caller (there is none left to surface it to) — [`run_session`] is the
/// one place that observes it, and it closes the socket with a protocol-error
/// close frame carrying the failure text as reason, per §4.8.
pub trait WebSocketHandler: Send + Sync {
    fn call(&self, session: WebSocketSession) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> WebSocketHandler for F
where
    F: Fn(WebSocketSession) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, session: WebSocketSession) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(session))
    }
}

pub type WsHandlerFn = Arc<dyn WebSocketHandler>;

pub fn ws_handler<F, Fut>(f: F) -> WsHandlerFn
where
    F: Fn(WebSocketSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(f)
}

/// Drives `handler` to completion over `session`. If the handler's future
/// resolves to `Err`, closes the socket with RFC-6455 protocol error (1002)
/// and the failure text as reason — the session itself was moved into the
/// handler, so this reaches the same underlying stream through the handle
/// taken before the call.
pub(crate) async fn run_session(handler: WsHandlerFn, session: WebSocketSession) {
    let stream = session.stream_handle();
    if let Err(err) = handler.call(session).await {
        let _ = close_stream_with_code(&stream, 1002, &err.to_string()).await;
    }
}

/// True when the request carries `Upgrade: websocket` (any case) and an
/// RFC-6455 `Connection: ... upgrade ...` header.
pub fn is_websocket_upgrade(req: &Request) -> bool {
    let upgrade = req.header("upgrade").unwrap_or("");
    let connection = req.header("connection").unwrap_or("");
    upgrade.eq_ignore_ascii_case("websocket") && connection.to_lowercase().contains("upgrade")
}

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn generate_accept_key(key: &str) -> String {
    use base64::Engine;
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Build the `101 Switching Protocols` handshake response, or `None` if the
/// request does not carry the headers an upgrade requires.
pub fn websocket_upgrade(req: &Request) -> Option<Response> {
    if !is_websocket_upgrade(req) {
        return None;
    }
    let key = req.header("sec-websocket-key")?;
    let accept_key = generate_accept_key(key);

    Some(
        Response::new(StatusCode::custom(101), Vec::new())
            .with_header("upgrade", "websocket")
            .with_header("connection", "Upgrade")
            .with_header("sec-websocket-accept", &accept_key),
    )
}

pub(crate) fn upgrade_error_response() -> Response {
    Error::WebSocketUpgradeFailed("missing or invalid handshake headers".into()).into_response()
}

pub(crate) async fn accept(stream: TcpStream) -> WebSocketStream<TcpStream> {
    WebSocketStream::from_raw_socket(stream, Role::Server, None).await
}

/// Broadcast helper for fan-out to many open sessions (chat rooms, presence
/// channels). Each session is independently locked so a slow reader does
/// not block broadcasting to the others.
pub struct WebSocketRoom {
    connections: Arc<tokio::sync::RwLock<Vec<Arc<tokio::sync::Mutex<WebSocketSession>>>>>,
}

impl WebSocketRoom {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(tokio::sync::RwLock::new(Vec::new())),
        }
    }

    pub async fn add(&self, session: WebSocketSession) -> Arc<tokio::sync::Mutex<WebSocketSession>> {
        let session = Arc::new(tokio::sync::Mutex::new(session));
        self.connections.write().await.push(session.clone());
        session
    }

    pub async fn remove(&self, session: &Arc<tokio::sync::Mutex<WebSocketSession>>) {
        let mut conns = self.connections.write().await;
        if let Some(pos) = conns.iter().position(|c| Arc::ptr_eq(c, session)) {
            conns.remove(pos);
        }
    }

    pub async fn broadcast_text(&self, text: &str) {
        let conns = self.connections.read().await;
        for conn in conns.iter() {
            if let Ok(mut session) = conn.try_lock() {
                let _ = session.send_text(text.to_string()).await;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

impl Default for WebSocketRoom {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_conversion_roundtrips() {
        let text = Message::Text("hello".to_string());
        let wire: WsMessage = text.clone().into();
        let back: Message = wire.into();
        assert!(matches!(back, Message::Text(s) if s == "hello"));
    }

    #[tokio::test]
    async fn room_starts_empty() {
        let room = WebSocketRoom::new();
        assert_eq!(room.len().await, 0);
        assert!(room.is_empty().await);
    }

    /// §4.8: "a handler-thrown failure closes the socket with protocolError
    /// ... and the failure text as reason." The handler consumes the session
    /// by value, so this drives a real loopback pair to confirm
    /// `run_session` still reaches the stream afterward to send the close
    /// frame.
    #[tokio::test]
    async fn handler_failure_closes_with_protocol_error() {
        use futures_util::StreamExt;
        use tokio::net::{TcpListener, TcpStream};
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws_stream = tokio_tungstenite::accept_async(stream).await.unwrap();
            let request = Request::test(crate::request::Method::Get, "/ws", Vec::new());
            let session = WebSocketSession::new(ws_stream, request);
            let failing = ws_handler(|_session| async { Err(Error::HandlerFailed("kaboom".into())) });
            run_session(failing, session).await;
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let (mut client, _) = tokio_tungstenite::client_async(format!("ws://{}/ws", addr), client_stream)
            .await
            .unwrap();

        let frame = loop {
            match client.next().await {
                Some(Ok(WsMessage::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("expected a close frame, got {other:?}"),
            }
        };

        let frame = frame.expect("close frame should carry a code and reason");
        assert_eq!(frame.code, CloseCode::Protocol);
        assert!(frame.reason.contains("kaboom"));

        server.await.unwrap();
    }
}
