//! Identity → connection registry.
//!
//! Tracks every live connection (for broadcast) and, for authenticated
//! connections, which one currently speaks for an identity.
//!
//! # Supersession
//!
//! ```text
//! conn-1 auth "alice"   identities: { alice → conn-1 }
//! conn-2 auth "alice"   identities: { alice → conn-2 }   (conn-1 stays open)
//! conn-1 closes         unregister(alice, conn-1) is a no-op
//! conn-2 closes         unregister(alice, conn-2) removes alice
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Failure to hand a message to a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection's writer is gone.
    #[error("connection closed")]
    Closed,
    /// The connection refused the message.
    #[error("connection rejected message: {0}")]
    Rejected(String),
}

/// A live connection the server can push text to.
pub trait Connection: Send + Sync {
    /// Connection id.
    fn id(&self) -> ConnectionId;

    /// Queue a text frame. Must not block.
    fn send_text(&self, text: &str) -> Result<(), SendError>;
}

/// Connection backed by an unbounded queue drained by a writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    /// New handle plus the receiving end for its writer task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::next(),
                tx,
            },
            rx,
        )
    }
}

impl Connection for ConnectionHandle {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_text(&self, text: &str) -> Result<(), SendError> {
        if self.tx.send(text.to_string()).is_err() {
            return Err(SendError::Closed);
        }
        Ok(())
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections a send was attempted on.
    pub attempted: usize,
    /// Connections that accepted the message.
    pub delivered: usize,
}

#[derive(Default)]
struct RegistryState {
    /// identity -> connection currently speaking for it.
    identities: HashMap<String, Arc<dyn Connection>>,
    /// Every live connection, authenticated or not.
    connections: BTreeMap<ConnectionId, Arc<dyn Connection>>,
}

/// Registry of live connections.
#[derive(Default)]
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("registry lock poisoned");
        f.debug_struct("ClientRegistry")
            .field("identity_count", &state.identities.len())
            .field("connection_count", &state.connections.len())
            .finish_non_exhaustive()
    }
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a live connection for broadcast.
    pub fn attach(&self, connection: Arc<dyn Connection>) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.connections.insert(connection.id(), connection);
    }

    /// Forget a closed connection and any identity still pointing at it.
    ///
    /// Returns the identities that were released.
    pub fn detach(&self, id: ConnectionId) -> Vec<String> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.connections.remove(&id);
        let released: Vec<String> = state
            .identities
            .iter()
            .filter(|(_, conn)| conn.id() == id)
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &released {
            state.identities.remove(identity);
        }
        released
    }

    /// Bind `identity` to `connection`, last writer wins. The connection is
    /// attached as well.
    ///
    /// Returns the id of the superseded connection, if any. The old
    /// connection is not closed.
    pub fn register(&self, identity: &str, connection: Arc<dyn Connection>) -> Option<ConnectionId> {
        let id = connection.id();
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.connections.insert(id, Arc::clone(&connection));
        let previous = state.identities.insert(identity.to_string(), connection);
        previous.map(|old| old.id()).filter(|old| *old != id)
    }

    /// Remove `identity` only if it still points at connection `id`.
    pub fn unregister(&self, identity: &str, id: ConnectionId) -> bool {
        let mut state = self.state.lock().expect("registry lock poisoned");
        match state.identities.get(identity) {
            Some(current) if current.id() == id => {
                state.identities.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Connection currently registered for `identity`.
    pub fn lookup(&self, identity: &str) -> Option<Arc<dyn Connection>> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .identities
            .get(identity)
            .cloned()
    }

    /// Send `text` to every live connection.
    ///
    /// A failing connection is logged and skipped.
    pub fn broadcast(&self, text: &str) -> BroadcastReport {
        let targets: Vec<Arc<dyn Connection>> = self
            .state
            .lock()
            .expect("registry lock poisoned")
            .connections
            .values()
            .cloned()
            .collect();

        let mut report = BroadcastReport {
            attempted: targets.len(),
            delivered: 0,
        };
        for connection in targets {
            match connection.send_text(text) {
                Ok(()) => report.delivered += 1,
                Err(e) => log::warn!("Broadcast to {} failed: {}", connection.id(), e),
            }
        }
        report
    }

    /// Number of bound identities.
    pub fn identity_count(&self) -> usize {
        self.state.lock().expect("registry lock poisoned").identities.len()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().expect("registry lock poisoned").connections.len()
    }
}
