//! Notification server.
//!
//! [`NotifyServer`] accepts WebSocket clients, binds authenticated
//! connections to identities in the [`ClientRegistry`] and routes
//! acknowledgments into the [`PendingDeliveryTracker`]. Notifications are
//! dispatched through [`NotifyServer::send`], either broadcast to every live
//! connection or tracked for one identity until acknowledged.
//!
//! # Connection lifecycle
//!
//! ```text
//! accept ─► handshake ─► attach ─► reader loop ─┬─ auth → register identity
//!                                               ├─ ack  → tracker.acknowledge
//!                                               └─ close/error/cancel
//!                                                     │
//!                        detach ◄─ unregister(identity, conn) (compare-and-delete)
//! ```
//!
//! Each connection owns an unbounded outbound queue drained by a writer
//! task, so registry and tracker sends never wait on the socket.

// Rust guideline compliant 2026-02

pub mod messages;
pub mod registry;
pub mod tracker;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::constants::{DEFAULT_BIND_ADDR, RESEND_INTERVAL};
use crate::events::{Event, EventBus};
use crate::notification::ClientMessage;
use crate::ws::{self, WsMessage};

pub use messages::{ControlCommand, SendRequest, SendResponse};
pub use registry::{BroadcastReport, ClientRegistry, Connection, ConnectionHandle, ConnectionId, SendError};
pub use tracker::{DeliveryStatus, PendingDeliveryTracker, PendingRecord, Tracked};

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Listen address.
    pub bind: String,
    /// Interval between delivery attempts of a pending notification.
    pub resend_interval: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND_ADDR.to_string(),
            resend_interval: RESEND_INTERVAL,
        }
    }
}

/// Notification server. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct NotifyServer {
    options: ServerOptions,
    registry: Arc<ClientRegistry>,
    tracker: PendingDeliveryTracker,
    bus: EventBus,
}

impl NotifyServer {
    /// Server with its own event bus.
    pub fn new(options: ServerOptions) -> Self {
        Self::with_bus(options, EventBus::new())
    }

    /// Server announcing lifecycle events on `bus`.
    pub fn with_bus(options: ServerOptions, bus: EventBus) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let tracker =
            PendingDeliveryTracker::new(Arc::clone(&registry), bus.clone(), options.resend_interval);
        Self {
            options,
            registry,
            tracker,
            bus,
        }
    }

    /// Settings the server was built with.
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Connection registry.
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Pending-delivery tracker.
    pub fn tracker(&self) -> &PendingDeliveryTracker {
        &self.tracker
    }

    /// Server event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Dispatch a notification under a fresh UUID.
    ///
    /// Addressed requests are tracked and `sent` is 1 only when the
    /// immediate attempt reached a live connection. Unaddressed requests are
    /// broadcast and `sent` counts the connections that accepted them.
    /// Must be called from within a Tokio runtime.
    pub fn send(&self, request: SendRequest) -> SendResponse {
        let recipient = request.recipient().map(str::to_string);
        let notification = request.into_notification(uuid::Uuid::new_v4().to_string());

        match recipient {
            Some(identity) => {
                let tracked = self.tracker.track(&identity, notification);
                SendResponse {
                    ok: true,
                    sent: usize::from(tracked.delivered),
                    notification_id: Some(tracked.notification_id),
                }
            }
            None => {
                let text = serde_json::to_string(&notification).expect("serializable");
                let report = self.registry.broadcast(&text);
                log::info!(
                    "Broadcast {:?} to {}/{} connection(s)",
                    notification.id,
                    report.delivered,
                    report.attempted
                );
                SendResponse {
                    ok: true,
                    sent: report.delivered,
                    notification_id: None,
                }
            }
        }
    }

    /// Delivery status of `notification_id`.
    pub fn status(&self, notification_id: &str) -> DeliveryStatus {
        self.tracker.query(notification_id)
    }

    /// Pending records, oldest first.
    pub fn pending(&self) -> Vec<PendingRecord> {
        self.tracker.list_pending()
    }

    /// Run one control command and return its JSON reply.
    pub fn execute(&self, command: ControlCommand) -> Value {
        let reply = match command {
            ControlCommand::Send(request) => serde_json::to_value(self.send(request)),
            ControlCommand::Status { id } => serde_json::to_value(self.status(&id)),
            ControlCommand::Pending => serde_json::to_value(self.pending()),
        };
        reply.expect("serializable")
    }

    /// Parse and run one control line. Malformed input yields
    /// `{"ok":false,"error":...}`.
    pub fn execute_line(&self, line: &str) -> Value {
        match serde_json::from_str::<ControlCommand>(line) {
            Ok(command) => self.execute(command),
            Err(e) => {
                log::warn!("Rejected control line: {}", e);
                serde_json::json!({ "ok": false, "error": e.to_string() })
            }
        }
    }

    /// Bind the configured address, returning the listener and the
    /// actual local address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or already in use.
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(&self.options.bind).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Notify server bound on {}", local_addr);
        Ok((listener, local_addr))
    }

    /// Accept connections on `listener` until `cancel` fires.
    ///
    /// Open connections are closed when `cancel` fires as well.
    ///
    /// # Errors
    ///
    /// Failed accepts are logged and skipped, so this currently always
    /// returns `Ok(())`.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Notify server shutting down");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer, cancel).await;
                        });
                    }
                    Err(e) => log::error!("TCP accept failed: {}", e),
                },
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let (mut writer, mut reader) = match ws::accept(stream).await {
            Ok(halves) => halves,
            Err(e) => {
                log::debug!("Handshake with {} failed: {:#}", peer, e);
                return;
            }
        };

        let (handle, mut outbound) = ConnectionHandle::new();
        let id = handle.id();
        let connection: Arc<dyn Connection> = Arc::new(handle);
        self.registry.attach(Arc::clone(&connection));
        log::info!("{} connected from {}", id, peer);

        // Ends once every sender is gone, i.e. after detach below.
        tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                if let Err(e) = writer.send_text(&text).await {
                    log::debug!("{} write failed: {:#}", id, e);
                    return;
                }
            }
            if let Err(e) = writer.close().await {
                log::debug!("{} close failed: {:#}", id, e);
            }
        });

        let mut identity: Option<String> = None;
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = reader.recv() => message,
            };
            match message {
                Some(Ok(WsMessage::Text(text))) => {
                    self.handle_client_text(&text, &connection, &mut identity);
                }
                Some(Ok(WsMessage::Close { code, reason })) => {
                    log::debug!("{} closed by peer ({} {})", id, code, reason);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("{} read failed: {:#}", id, e);
                    break;
                }
                None => break,
            }
        }

        if let Some(identity) = &identity {
            self.registry.unregister(identity, id);
        }
        self.registry.detach(id);
        log::info!("{} disconnected", id);
    }

    fn handle_client_text(
        &self,
        text: &str,
        connection: &Arc<dyn Connection>,
        identity: &mut Option<String>,
    ) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("{} sent unrecognized message: {}", connection.id(), e);
                return;
            }
        };

        match &message {
            ClientMessage::Auth { .. } => {
                let Some(name) = message.identity() else {
                    log::debug!("{} sent auth without credential", connection.id());
                    return;
                };
                if let Some(previous) = identity.replace(name.to_string()) {
                    if previous != name {
                        self.registry.unregister(&previous, connection.id());
                    }
                }
                if let Some(superseded) = self.registry.register(name, Arc::clone(connection)) {
                    log::info!("'{}' moved from {} to {}", name, superseded, connection.id());
                } else {
                    log::info!("{} authenticated as '{}'", connection.id(), name);
                }
                self.bus.emit(Event::Authenticated {
                    identity: name.to_string(),
                    connection: connection.id(),
                });
            }
            ClientMessage::Ack {
                notification_id,
                status,
            } => {
                let known = self.tracker.acknowledge(notification_id);
                self.bus.emit(Event::Acknowledged {
                    notification_id: notification_id.clone(),
                    status: status.clone(),
                    known,
                });
            }
        }
    }
}
