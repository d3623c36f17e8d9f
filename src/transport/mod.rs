//! Transport seam for the client session.
//!
//! A [`Transport`] knows how to open one kind of connection; the [`Link`]
//! it returns is the live connection the session reads payloads from.
//!
//! # Architecture
//!
//! ```text
//! TransportSession
//!     │  walks TransportPreference::candidates()
//!     ▼
//! TransportSet ── Socket  → SocketTransport  (WebSocket, bidirectional)
//!              ├─ Events  → EventsTransport  (server-sent events, receive only)
//!              └─ Polling → PollingTransport (periodic GET, receive only)
//! ```
//!
//! A kind that is missing from the set, or whose `open` reports
//! [`TransportError::Unavailable`], is skipped without delay. Any other
//! failure is retried on the same kind with backoff.

// Rust guideline compliant 2026-02

pub mod polling;
pub mod socket;
pub mod sse;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::notification::Payload;

pub use polling::PollingTransport;
pub use socket::SocketTransport;
pub use sse::EventsTransport;

/// Concrete transport kinds, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    /// Bidirectional WebSocket.
    Socket,
    /// Server-sent event stream.
    Events,
    /// Periodic HTTP polling.
    Polling,
}

impl TransportKind {
    /// Name used in logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socket => "websocket",
            Self::Events => "server-events",
            Self::Polling => "polling",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested transport kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Try every kind, socket first.
    #[default]
    Auto,
    /// Start with the socket.
    Socket,
    /// Start with server-sent events.
    Events,
    /// Polling only.
    Polling,
}

static FALLBACK_ORDER: [TransportKind; 3] = [
    TransportKind::Socket,
    TransportKind::Events,
    TransportKind::Polling,
];

impl TransportPreference {
    /// Kinds to try, in order. An explicit kind starts the order at itself.
    pub fn candidates(self) -> &'static [TransportKind] {
        match self {
            Self::Auto | Self::Socket => &FALLBACK_ORDER[..],
            Self::Events => &FALLBACK_ORDER[1..],
            Self::Polling => &FALLBACK_ORDER[2..],
        }
    }
}

impl std::str::FromStr for TransportPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "socket" | "websocket" | "ws" => Ok(Self::Socket),
            "events" | "server-events" | "sse" => Ok(Self::Events),
            "polling" | "poll" => Ok(Self::Polling),
            other => Err(format!(
                "unknown transport '{other}' (expected auto, socket, events or polling)"
            )),
        }
    }
}

/// Errors surfaced by transports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The capability is absent; the session falls back to the next kind.
    #[error("{kind} transport unavailable: {reason}")]
    Unavailable {
        /// Kind that is unavailable.
        kind: TransportKind,
        /// Why it cannot be used.
        reason: String,
    },
    /// The open attempt or the live link failed; retried with backoff.
    #[error("{kind} transport failed: {message}")]
    Failure {
        /// Kind that failed.
        kind: TransportKind,
        /// Failure description.
        message: String,
    },
    /// The link is receive-only.
    #[error("{0} transport cannot send")]
    SendUnsupported(TransportKind),
}

impl TransportError {
    /// Convenience constructor for [`TransportError::Failure`].
    pub fn failure(kind: TransportKind, message: impl std::fmt::Display) -> Self {
        Self::Failure {
            kind,
            message: message.to_string(),
        }
    }

    /// Convenience constructor for [`TransportError::Unavailable`].
    pub fn unavailable(kind: TransportKind, reason: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            kind,
            reason: reason.to_string(),
        }
    }
}

/// HTTP form of a notification URL, rewriting `ws(s)` to `http(s)`.
///
/// Returns `None` for schemes the HTTP transports cannot use.
pub(crate) fn http_url(url: &str) -> Option<String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Some(url.to_string())
    } else if let Some(rest) = url.strip_prefix("wss://") {
        Some(format!("https://{rest}"))
    } else {
        url.strip_prefix("ws://").map(|rest| format!("http://{rest}"))
    }
}

/// Opens connections of one kind.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Kind of link this transport opens.
    fn kind(&self) -> TransportKind;

    /// Open a link to `url`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Unavailable`] when this kind cannot be used for
    /// `url` at all, [`TransportError::Failure`] when the attempt failed.
    async fn open(&self, url: &str) -> Result<Box<dyn Link>, TransportError>;
}

/// A live connection.
#[async_trait]
pub trait Link: Send {
    /// Kind of this link.
    fn kind(&self) -> TransportKind;

    /// Next payload.
    ///
    /// `None` means the link closed. A streaming link that returns an
    /// error is considered lost; the polling link reports failed cycles as
    /// errors and keeps going.
    async fn recv(&mut self) -> Option<Result<Payload, TransportError>>;

    /// Whether [`Link::send_text`] is supported.
    fn can_send(&self) -> bool {
        false
    }

    /// Send a text frame.
    async fn send_text(&mut self, _text: &str) -> Result<(), TransportError> {
        Err(TransportError::SendUnsupported(self.kind()))
    }

    /// Release the link.
    async fn close(&mut self) {}
}

/// The transports available to a session, keyed by kind.
#[derive(Clone, Default)]
pub struct TransportSet {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl std::fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.transports.keys().collect();
        kinds.sort();
        f.debug_struct("TransportSet").field("kinds", &kinds).finish()
    }
}

impl TransportSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket, server-events and polling transports over the network.
    ///
    /// `poll_interval` is the polling cadence (see
    /// [`polling::poll_interval_for`]).
    pub fn native(poll_interval: Duration) -> Self {
        let http = reqwest::Client::new();
        Self::new()
            .with(SocketTransport::new())
            .with(EventsTransport::with_client(http.clone()))
            .with(PollingTransport::with_client(http, poll_interval))
    }

    /// Add or replace the transport for its kind.
    #[must_use]
    pub fn with(self, transport: impl Transport + 'static) -> Self {
        self.with_shared(Arc::new(transport))
    }

    /// Add or replace a shared transport.
    #[must_use]
    pub fn with_shared(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    /// Remove a kind, making it unavailable.
    #[must_use]
    pub fn without(mut self, kind: TransportKind) -> Self {
        self.transports.remove(&kind);
        self
    }

    /// Transport for a kind.
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.transports.get(&kind).cloned()
    }

    /// Whether a kind is present.
    pub fn contains(&self, kind: TransportKind) -> bool {
        self.transports.contains_key(&kind)
    }
}
