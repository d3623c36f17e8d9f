//! In-process publish/subscribe for lifecycle events.
//!
//! Every component announces what happened through an [`EventBus`]
//! instead of calling its observers directly. Subscribers register a
//! callback per [`EventName`]; callbacks run synchronously on the emitting
//! task, in registration order.
//!
//! # Usage
//!
//! ```ignore
//! let bus = EventBus::new();
//! let sub = bus.on(EventName::Connect, |event| {
//!     if let Event::Connect { transport } = event {
//!         log::info!("connected over {}", transport);
//!     }
//! });
//! bus.off(sub);
//! ```
//!
//! Emission iterates a snapshot of the subscriber list, so callbacks may
//! subscribe, unsubscribe or emit again without disturbing the current
//! emission.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::notification::Notification;
use crate::server::registry::ConnectionId;
use crate::transport::TransportKind;

/// Event discriminant used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// A transport reached the open state.
    Connect,
    /// The live transport was lost or the session was closed.
    Disconnect,
    /// A transport or poll cycle failed.
    Error,
    /// A recoverable anomaly (rejected send, degraded payload).
    Warning,
    /// A notification was received from the server.
    Notification,
    /// A notification was handed to the presentation layer.
    Show,
    /// A server connection bound itself to an identity.
    Authenticated,
    /// The server attempted to deliver a tracked notification.
    DeliveryAttempted,
    /// The server received an acknowledgment.
    Acknowledged,
}

impl EventName {
    /// Wire-style name, used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Notification => "notification",
            Self::Show => "show",
            Self::Authenticated => "authenticated",
            Self::DeliveryAttempted => "delivery_attempted",
            Self::Acknowledged => "acknowledged",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A transport opened.
    Connect {
        /// Kind of the transport that opened.
        transport: TransportKind,
    },
    /// The session lost or closed its transport.
    Disconnect,
    /// A transport failure, reported for observability only.
    Error {
        /// Transport that failed, if one was selected.
        transport: Option<TransportKind>,
        /// Human-readable description.
        message: String,
    },
    /// A recoverable anomaly.
    Warning {
        /// Human-readable description.
        message: String,
    },
    /// A decoded notification arrived.
    Notification(Notification),
    /// A notification was presented.
    Show(Notification),
    /// A connection authenticated.
    Authenticated {
        /// Identity the connection claimed.
        identity: String,
        /// Connection that claimed it.
        connection: ConnectionId,
    },
    /// A tracked delivery was attempted.
    DeliveryAttempted {
        /// Tracked notification.
        notification_id: String,
        /// Addressed identity.
        identity: String,
        /// Whether a live connection accepted the message.
        delivered: bool,
    },
    /// An acknowledgment was received.
    Acknowledged {
        /// Acknowledged notification.
        notification_id: String,
        /// Status reported by the client.
        status: Option<String>,
        /// Whether the id was still pending.
        known: bool,
    },
}

impl Event {
    /// Subscription key for this event.
    pub fn name(&self) -> EventName {
        match self {
            Self::Connect { .. } => EventName::Connect,
            Self::Disconnect => EventName::Disconnect,
            Self::Error { .. } => EventName::Error,
            Self::Warning { .. } => EventName::Warning,
            Self::Notification(_) => EventName::Notification,
            Self::Show(_) => EventName::Show,
            Self::Authenticated { .. } => EventName::Authenticated,
            Self::DeliveryAttempted { .. } => EventName::DeliveryAttempted,
            Self::Acknowledged { .. } => EventName::Acknowledged,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    /// Event name -> ordered (id, callback) pairs.
    listeners: Mutex<HashMap<EventName, Vec<(SubscriptionId, Callback)>>>,
    next_id: AtomicU64,
}

/// Cloneable event bus. Clones share the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.inner.listeners.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("event_count", &listeners.len())
            .field(
                "total_callbacks",
                &listeners.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to an event.
    pub fn on<F>(&self, name: EventName, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .expect("event bus lock poisoned")
            .entry(name)
            .or_default()
            .push((id, Arc::new(callback)));
        log::trace!("Registered '{}' subscriber {:?}", name, id);
        id
    }

    /// Unsubscribe. Returns `false` if the subscription was not found.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.lock().expect("event bus lock poisoned");
        for callbacks in listeners.values_mut() {
            if let Some(idx) = callbacks.iter().position(|(sub, _)| *sub == id) {
                callbacks.remove(idx);
                return true;
            }
        }
        false
    }

    /// Emit an event to every subscriber of its name.
    ///
    /// A panicking callback is logged and does not prevent later
    /// callbacks from running.
    pub fn emit(&self, event: Event) {
        let name = event.name();
        let snapshot: Vec<Callback> = {
            let listeners = self.inner.listeners.lock().expect("event bus lock poisoned");
            match listeners.get(&name) {
                Some(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                log::error!("Event handler for '{}' panicked", name);
            }
        }
    }

    /// Forward the named events into a channel.
    ///
    /// Convenient for async consumers that prefer `recv().await` over
    /// callbacks. Sends after the receiver is dropped are discarded.
    pub fn forward(&self, names: &[EventName]) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        for &name in names {
            let tx = tx.clone();
            self.on(name, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        rx
    }

    /// Number of subscribers for an event.
    pub fn listener_count(&self, name: EventName) -> usize {
        self.inner
            .listeners
            .lock()
            .expect("event bus lock poisoned")
            .get(&name)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_subscribers_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.on(EventName::Disconnect, move |_| seen.lock().unwrap().push(tag));
        }
        bus.emit(Event::Disconnect);

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_emit_ignores_other_names() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        bus.on(EventName::Connect, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::Disconnect);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_during_emit_uses_snapshot() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let second_id = Arc::new(Mutex::new(None));

        {
            let bus2 = bus.clone();
            let second_id = Arc::clone(&second_id);
            let seen = Arc::clone(&seen);
            bus.on(EventName::Disconnect, move |_| {
                seen.lock().unwrap().push("first");
                if let Some(id) = second_id.lock().unwrap().take() {
                    assert!(bus2.off(id));
                }
            });
        }
        {
            let seen = Arc::clone(&seen);
            let id = bus.on(EventName::Disconnect, move |_| seen.lock().unwrap().push("second"));
            *second_id.lock().unwrap() = Some(id);
        }

        // Snapshot taken before the first callback removed the second one.
        bus.emit(Event::Disconnect);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);

        // Gone on the next emission.
        bus.emit(Event::Disconnect);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "first"]);
        assert_eq!(bus.listener_count(EventName::Disconnect), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        bus.on(EventName::Warning, |_| panic!("boom"));
        let h = Arc::clone(&hits);
        bus.on(EventName::Warning, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::Warning {
            message: "x".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_unknown_subscription() {
        let bus = EventBus::new();
        assert!(!bus.off(SubscriptionId(99)));
    }

    #[tokio::test]
    async fn test_forward_delivers_events() {
        let bus = EventBus::new();
        let mut rx = bus.forward(&[EventName::Connect, EventName::Disconnect]);

        bus.emit(Event::Connect {
            transport: TransportKind::Socket,
        });
        bus.emit(Event::Warning {
            message: "not forwarded".into(),
        });
        bus.emit(Event::Disconnect);

        assert_eq!(
            rx.recv().await,
            Some(Event::Connect {
                transport: TransportKind::Socket
            })
        );
        assert_eq!(rx.recv().await, Some(Event::Disconnect));
    }
}
