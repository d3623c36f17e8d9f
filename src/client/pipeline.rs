//! Incoming notification throttle.
//!
//! Sits between the session and the presentation layer. A notification is
//! presented right away when the rate limit allows it and its id was not
//! shown within the dedup window; otherwise it is queued. One delayed flush
//! task (never more than one) drains the queue after `rate_limit`,
//! presenting everything in arrival order and dropping ids that were shown
//! within the window in the meantime.
//!
//! While the queue is non-empty, new arrivals go behind it even if they
//! would be presentable on their own, so arrival order is preserved.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::{DEDUP_WINDOW, RATE_LIMIT};
use crate::events::{Event, EventBus};
use crate::notification::Notification;

/// Presentation layer seam. Implemented for any `Fn(&Notification)`.
pub trait Presenter: Send + Sync {
    /// Render a notification.
    fn present(&self, notification: &Notification);
}

impl<F> Presenter for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn present(&self, notification: &Notification) {
        self(notification)
    }
}

/// Throttle tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOptions {
    /// Minimum spacing between presentations.
    pub rate_limit: Duration,
    /// Span during which a repeated id is suppressed.
    pub dedup_window: Duration,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            rate_limit: RATE_LIMIT,
            dedup_window: DEDUP_WINDOW,
        }
    }
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_shown: Option<Instant>,
    /// id -> last presentation. Pruned lazily.
    recent: HashMap<String, Instant>,
    queue: VecDeque<Notification>,
    flush: Option<JoinHandle<()>>,
    /// Bumped per scheduled flush and on reset; a flush task whose number
    /// is stale returns without touching state.
    flush_generation: u64,
}

impl ThrottleState {
    fn rate_allows(&self, now: Instant, options: &ThrottleOptions) -> bool {
        self.last_shown
            .map_or(true, |last| now.duration_since(last) >= options.rate_limit)
    }

    fn seen_recently(&mut self, notification: &Notification, now: Instant, window: Duration) -> bool {
        let Some(id) = notification.id.as_deref() else {
            return false;
        };
        self.recent.retain(|_, shown| now.duration_since(*shown) < window);
        self.recent.contains_key(id)
    }

    fn record(&mut self, notification: &Notification, now: Instant) {
        self.last_shown = Some(now);
        if let Some(id) = &notification.id {
            self.recent.insert(id.clone(), now);
        }
    }
}

struct PipelineInner {
    options: ThrottleOptions,
    presenter: Arc<dyn Presenter>,
    bus: EventBus,
    state: Mutex<ThrottleState>,
}

/// Dedup + rate-limit + burst queue in front of a [`Presenter`].
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct IncomingPipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for IncomingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("pipeline lock poisoned");
        f.debug_struct("IncomingPipeline")
            .field("options", &self.inner.options)
            .field("queued", &state.queue.len())
            .field("recent", &state.recent.len())
            .field("flush_scheduled", &state.flush.is_some())
            .finish()
    }
}

impl IncomingPipeline {
    /// Create a pipeline presenting through `presenter` and announcing
    /// `show` events on `bus`.
    pub fn new(options: ThrottleOptions, presenter: Arc<dyn Presenter>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                options,
                presenter,
                bus,
                state: Mutex::new(ThrottleState::default()),
            }),
        }
    }

    /// Throttle settings.
    pub fn options(&self) -> ThrottleOptions {
        self.inner.options
    }

    /// Offer a notification. Never blocks.
    ///
    /// Returns `true` if it was presented immediately, `false` if it was
    /// queued for the next flush. Must be called from within a Tokio
    /// runtime, since queueing may spawn the flush task.
    pub fn accept(&self, notification: Notification) -> bool {
        let options = self.inner.options;
        let now = Instant::now();

        let present_now = {
            let mut state = self.inner.state.lock().expect("pipeline lock poisoned");
            if state.queue.is_empty()
                && state.rate_allows(now, &options)
                && !state.seen_recently(&notification, now, options.dedup_window)
            {
                state.record(&notification, now);
                true
            } else {
                state.queue.push_back(notification.clone());
                self.schedule_flush(&mut state);
                false
            }
        };

        if present_now {
            self.present(notification);
        } else {
            log::trace!("Queued notification {:?}", notification.id);
        }
        present_now
    }

    /// Number of queued notifications.
    pub fn queued_len(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("pipeline lock poisoned")
            .queue
            .len()
    }

    /// Whether a flush task is pending.
    pub fn flush_scheduled(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("pipeline lock poisoned")
            .flush
            .is_some()
    }

    /// Cancel the flush task and clear the queue and dedup window.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().expect("pipeline lock poisoned");
        if let Some(handle) = state.flush.take() {
            handle.abort();
        }
        state.flush_generation += 1;
        if !state.queue.is_empty() {
            log::debug!("Discarding {} queued notification(s)", state.queue.len());
        }
        state.queue.clear();
        state.recent.clear();
    }

    /// Spawns the flush task while the caller holds the lock, so the handle
    /// is stored before the task can observe state.
    fn schedule_flush(&self, state: &mut ThrottleState) {
        if state.flush.is_some() || state.queue.is_empty() {
            return;
        }
        state.flush_generation += 1;
        let generation = state.flush_generation;
        let pipeline = self.clone();
        let delay = self.inner.options.rate_limit;
        state.flush = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pipeline.flush(generation);
        }));
    }

    fn flush(&self, generation: u64) {
        let window = self.inner.options.dedup_window;
        let now = Instant::now();

        let ready: Vec<Notification> = {
            let mut state = self.inner.state.lock().expect("pipeline lock poisoned");
            if state.flush_generation != generation {
                log::trace!("Skipping superseded flush {}", generation);
                return;
            }
            state.flush = None;
            let queued = std::mem::take(&mut state.queue);
            let mut ready = Vec::with_capacity(queued.len());
            for notification in queued {
                if state.seen_recently(&notification, now, window) {
                    log::debug!("Dropping duplicate notification {:?}", notification.id);
                    continue;
                }
                state.record(&notification, now);
                ready.push(notification);
            }
            ready
        };

        for notification in ready {
            self.present(notification);
        }
    }

    fn present(&self, notification: Notification) {
        self.inner.presenter.present(&notification);
        self.inner.bus.emit(Event::Show(notification));
    }
}
