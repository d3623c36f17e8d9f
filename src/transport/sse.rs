//! Server-sent events transport.
//!
//! Opens a streaming GET with `Accept: text/event-stream` and surfaces the
//! `data` of every dispatched event as a text payload. Receive only.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use super::{http_url, Link, Transport, TransportError, TransportKind};
use crate::notification::Payload;

const EVENT_STREAM: &str = "text/event-stream";

/// Opens server-sent event streams.
#[derive(Debug, Clone, Default)]
pub struct EventsTransport {
    client: reqwest::Client,
}

impl EventsTransport {
    /// Transport with its own HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for EventsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Events
    }

    async fn open(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let kind = TransportKind::Events;
        let Some(url) = http_url(url) else {
            return Err(TransportError::unavailable(kind, format!("unsupported URL: {url}")));
        };

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, EVENT_STREAM)
            .send()
            .await
            .map_err(|e| TransportError::failure(kind, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::failure(kind, format!("HTTP {status}")));
        }

        // A plain document means the endpoint does not speak SSE at all.
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(EVENT_STREAM) {
            return Err(TransportError::unavailable(
                kind,
                format!("endpoint answered with content type '{content_type}'"),
            ));
        }

        log::debug!("Event stream open to {}", url);
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(Box::new(EventsLink {
            stream,
            decoder: SseDecoder::default(),
            ready: VecDeque::new(),
        }))
    }
}

/// Live event stream.
pub struct EventsLink {
    stream: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
}

impl std::fmt::Debug for EventsLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsLink")
            .field("ready", &self.ready.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Link for EventsLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Events
    }

    async fn recv(&mut self) -> Option<Result<Payload, TransportError>> {
        loop {
            if let Some(data) = self.ready.pop_front() {
                return Some(Ok(Payload::Text(data)));
            }
            match self.stream.next().await? {
                Ok(chunk) => self.ready.extend(self.decoder.feed(&chunk)),
                Err(e) => return Some(Err(TransportError::failure(TransportKind::Events, e))),
            }
        }
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Only the `data` field is kept; `event`, `id` and `retry` are ignored.
/// Chunks may split lines (and UTF-8 sequences) anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk, returning the data of every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }
        events
    }
}
