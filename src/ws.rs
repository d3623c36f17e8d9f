//! Shared WebSocket plumbing.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. Both the socket transport (client side) and the
//! notify server (accept side) go through this module rather than
//! `tokio-tungstenite` directly.
//!
//! [`connect`] handles URL→request building and TLS negotiation; [`accept`] performs the server handshake on an accepted
//! TCP stream. Both return a ([`WsWriter`], [`WsReader`]) pair ready for
//! use in `tokio::select!` loops.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, handshake::client::Request};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Stream type of an outbound (client) connection.
pub type ClientStream = MaybeTlsStream<TcpStream>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter<S = ClientStream> {
    sink: SplitSink<WebSocketStream<S>, tungstenite::Message>,
}

impl<S> WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a pong frame in response to a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Send a close frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a close frame was already sent or the write fails.
    pub async fn send_close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("WebSocket send_close failed")
    }

    /// Flush pending writes and close the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing the pending frames fails.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader<S = ClientStream> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally. Read failures are
    /// yielded as `Some(Err(_))`.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            return Some(Ok(match message {
                tungstenite::Message::Text(text) => WsMessage::Text(text),
                tungstenite::Message::Binary(data) => WsMessage::Binary(data),
                tungstenite::Message::Ping(data) => WsMessage::Ping(data),
                tungstenite::Message::Pong(data) => WsMessage::Pong(data),
                tungstenite::Message::Close(close_frame) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    WsMessage::Close { code, reason }
                }
                tungstenite::Message::Frame(_) => continue,
            }));
        }
    }
}

fn split<S>(ws: WebSocketStream<S>) -> (WsWriter<S>, WsReader<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (WsWriter { sink }, WsReader { stream })
}

/// Build a handshake request for `url`, rewriting `http(s)` to `ws(s)`.
///
/// # Errors
///
/// Returns an error for schemes other than `ws`, `wss`, `http` and `https`,
/// and for URLs the handshake request cannot be built from.
pub fn client_request(url: &str) -> Result<Request> {
    let ws_url = http_to_ws_scheme(url);
    if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
        anyhow::bail!("unsupported WebSocket URL scheme: {url}");
    }
    ws_url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))
}

/// Connect to a WebSocket URL.
///
/// Builds the handshake request from `url` (see [`client_request`]), then
/// performs the WebSocket handshake.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the WebSocket handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let request = client_request(url)?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    Ok(split(ws_stream))
}

/// Perform the server-side handshake on an accepted TCP stream.
///
/// # Errors
///
/// Returns an error if the peer does not complete a valid WebSocket
/// upgrade.
pub async fn accept(stream: TcpStream) -> Result<(WsWriter<TcpStream>, WsReader<TcpStream>)> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    Ok(split(ws_stream))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
