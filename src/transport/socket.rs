//! WebSocket transport.
//!
//! The only bidirectional kind: the session uses it for the auth handshake
//! and acknowledgments. Pings are answered inline; a close frame or the end
//! of the stream closes the link.

use async_trait::async_trait;

use super::{Link, Transport, TransportError, TransportKind};
use crate::notification::Payload;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Opens WebSocket links. `http(s)` URLs are rewritten to `ws(s)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketTransport;

impl SocketTransport {
    /// WebSocket transport.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn open(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        if let Err(e) = ws::client_request(url) {
            return Err(TransportError::unavailable(TransportKind::Socket, format!("{e:#}")));
        }

        let (writer, reader) = ws::connect(url)
            .await
            .map_err(|e| TransportError::failure(TransportKind::Socket, format!("{e:#}")))?;

        log::debug!("WebSocket link open to {}", url);
        Ok(Box::new(SocketLink { writer, reader }))
    }
}

/// Live WebSocket link.
#[derive(Debug)]
pub struct SocketLink {
    writer: WsWriter,
    reader: WsReader,
}

#[async_trait]
impl Link for SocketLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn recv(&mut self) -> Option<Result<Payload, TransportError>> {
        loop {
            match self.reader.recv().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(Payload::Text(text))),
                Ok(WsMessage::Binary(data)) => {
                    let text = match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!("Binary frame is not UTF-8, decoding lossily");
                            String::from_utf8_lossy(e.as_bytes()).into_owned()
                        }
                    };
                    return Some(Ok(Payload::Text(text)));
                }
                Ok(WsMessage::Ping(data)) => {
                    if let Err(e) = self.writer.send_pong(data).await {
                        return Some(Err(TransportError::failure(
                            TransportKind::Socket,
                            format!("{e:#}"),
                        )));
                    }
                }
                Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close { code, reason }) => {
                    log::info!("WebSocket closed by server: code={} reason={:?}", code, reason);
                    return None;
                }
                Err(e) => {
                    return Some(Err(TransportError::failure(
                        TransportKind::Socket,
                        format!("{e:#}"),
                    )))
                }
            }
        }
    }

    fn can_send(&self) -> bool {
        true
    }

    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.writer
            .send_text(text)
            .await
            .map_err(|e| TransportError::failure(TransportKind::Socket, format!("{e:#}")))
    }

    async fn close(&mut self) {
        if let Err(e) = self.writer.send_close().await {
            log::debug!("WebSocket close frame not sent: {:#}", e);
        }
        let _ = self.writer.close().await;
    }
}
