//! Retry-until-acknowledged delivery.
//!
//! Every notification addressed to an identity is recorded as pending and
//! pushed to whatever connection the [`ClientRegistry`] currently holds for
//! that identity: once immediately, then every `resend_interval` until the
//! client acknowledges it. Reconnecting clients therefore receive anything
//! they missed on the next tick.
//!
//! Each record owns one retry task. The task carries the record generation
//! it was armed for and exits as soon as the record is gone or replaced, so
//! an acknowledgment racing a tick can never resurrect the record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::registry::ClientRegistry;
use crate::events::{Event, EventBus};
use crate::notification::Notification;

/// A notification awaiting acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    /// Tracked notification id.
    pub notification_id: String,
    /// Recipient identity.
    pub identity: String,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
}

/// Delivery status of a notification id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Not yet acknowledged.
    Pending {
        /// Recipient identity.
        identity: String,
        /// Notification title.
        title: String,
        /// Notification body.
        body: String,
    },
    /// Acknowledged, or never tracked.
    Confirmed,
}

/// Result of [`PendingDeliveryTracker::track`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked {
    /// Id under which the notification is tracked.
    pub notification_id: String,
    /// Whether the immediate attempt reached a live connection.
    pub delivered: bool,
}

struct PendingEntry {
    record: PendingRecord,
    /// Serialized notification, sent as-is on every attempt.
    payload: String,
    generation: u64,
    timer: JoinHandle<()>,
}

struct TrackerInner {
    registry: Arc<ClientRegistry>,
    bus: EventBus,
    resend_interval: Duration,
    entries: Mutex<HashMap<String, PendingEntry>>,
    next_generation: AtomicU64,
}

/// Pending-delivery tracker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PendingDeliveryTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for PendingDeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDeliveryTracker")
            .field("pending", &self.len())
            .field("resend_interval", &self.inner.resend_interval)
            .finish_non_exhaustive()
    }
}

impl PendingDeliveryTracker {
    /// Tracker delivering through `registry`. Intervals below 1 ms are
    /// raised to 1 ms.
    pub fn new(registry: Arc<ClientRegistry>, bus: EventBus, resend_interval: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                registry,
                bus,
                resend_interval: resend_interval.max(Duration::from_millis(1)),
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Record `notification` for `identity` and attempt delivery now.
    ///
    /// A missing id is replaced with a fresh UUID. Tracking an id that is
    /// already pending replaces the record and restarts its retry timer.
    /// Must be called from within a Tokio runtime.
    pub fn track(&self, identity: &str, mut notification: Notification) -> Tracked {
        let id = match notification.id.take().filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        notification.id = Some(id.clone());
        let payload = serde_json::to_string(&notification).expect("serializable");
        let record = PendingRecord {
            notification_id: id.clone(),
            identity: identity.to_string(),
            title: notification.title,
            body: notification.body,
        };
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut entries = self.inner.entries.lock().expect("tracker lock poisoned");
            let timer = self.spawn_retry(id.clone(), generation);
            let replaced = entries.insert(
                id.clone(),
                PendingEntry {
                    record,
                    payload: payload.clone(),
                    generation,
                    timer,
                },
            );
            if let Some(old) = replaced {
                old.timer.abort();
                log::debug!("Re-tracking {}, previous record replaced", id);
            }
        }

        log::info!("Tracking notification {} for '{}'", id, identity);
        let delivered = self.deliver(&id, identity, &payload);
        Tracked {
            notification_id: id,
            delivered,
        }
    }

    /// Mark `notification_id` acknowledged and stop its retries.
    ///
    /// Returns `false` for unknown (or already acknowledged) ids.
    pub fn acknowledge(&self, notification_id: &str) -> bool {
        let removed = self
            .inner
            .entries
            .lock()
            .expect("tracker lock poisoned")
            .remove(notification_id);
        match removed {
            Some(entry) => {
                entry.timer.abort();
                log::info!(
                    "Notification {} acknowledged by '{}'",
                    notification_id,
                    entry.record.identity
                );
                true
            }
            None => {
                log::debug!("Ack for unknown notification {}", notification_id);
                false
            }
        }
    }

    /// Status of a notification id. Unknown ids report `Confirmed`.
    pub fn query(&self, notification_id: &str) -> DeliveryStatus {
        let entries = self.inner.entries.lock().expect("tracker lock poisoned");
        match entries.get(notification_id) {
            Some(entry) => DeliveryStatus::Pending {
                identity: entry.record.identity.clone(),
                title: entry.record.title.clone(),
                body: entry.record.body.clone(),
            },
            None => DeliveryStatus::Confirmed,
        }
    }

    /// All pending records, oldest first.
    pub fn list_pending(&self) -> Vec<PendingRecord> {
        let entries = self.inner.entries.lock().expect("tracker lock poisoned");
        let mut pending: Vec<(u64, PendingRecord)> = entries
            .values()
            .map(|entry| (entry.generation, entry.record.clone()))
            .collect();
        pending.sort_by_key(|(generation, _)| *generation);
        pending.into_iter().map(|(_, record)| record).collect()
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().expect("tracker lock poisoned").len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every retry timer and drop all records.
    pub fn clear(&self) {
        let drained: Vec<PendingEntry> = self
            .inner
            .entries
            .lock()
            .expect("tracker lock poisoned")
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &drained {
            entry.timer.abort();
        }
        if !drained.is_empty() {
            log::info!("Dropped {} pending notification(s)", drained.len());
        }
    }

    /// Spawned while the caller holds the entries lock, so the task cannot
    /// look its record up before it is inserted.
    fn spawn_retry(&self, id: String, generation: u64) -> JoinHandle<()> {
        let tracker = self.clone();
        let interval = self.inner.resend_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let target = {
                    let entries = tracker.inner.entries.lock().expect("tracker lock poisoned");
                    match entries.get(&id) {
                        Some(entry) if entry.generation == generation => {
                            (entry.record.identity.clone(), entry.payload.clone())
                        }
                        _ => return,
                    }
                };
                log::debug!("Resending notification {} to '{}'", id, target.0);
                tracker.deliver(&id, &target.0, &target.1);
            }
        })
    }

    fn deliver(&self, notification_id: &str, identity: &str, payload: &str) -> bool {
        let delivered = match self.inner.registry.lookup(identity) {
            Some(connection) => match connection.send_text(payload) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!(
                        "Delivery of {} to {} failed: {}",
                        notification_id,
                        connection.id(),
                        e
                    );
                    false
                }
            },
            None => {
                log::debug!(
                    "No live connection for '{}', {} stays pending",
                    identity,
                    notification_id
                );
                false
            }
        };

        self.inner.bus.emit(Event::DeliveryAttempted {
            notification_id: notification_id.to_string(),
            identity: identity.to_string(),
            delivered,
        });
        delivered
    }
}
