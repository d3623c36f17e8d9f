//! Client transport session.
//!
//! A [`TransportSession`] owns one logical connection at a time. `connect`
//! spawns a run task that walks the transport candidates, opens a link,
//! pumps payloads into the [`IncomingPipeline`], and reconnects with
//! backoff when the link fails.
//!
//! # State machine
//!
//! ```text
//!             connect()
//! Disconnected ────────► Connecting ──open ok──► Connected
//!      ▲                   ▲    │                   │
//!      │ reconnect off     │    │ unavailable:      │ link lost / open failed
//!      │                   │    │ next kind         ▼
//!      └───────────────────┴─── backoff sleep ◄── Reconnecting
//!
//! disconnect() from any state ──► Closed
//! ```
//!
//! Every state change made by the run task is guarded by a generation
//! number; `connect` and `disconnect` bump it, so a superseded task can
//! neither touch state nor emit events.
//!
//! Each run also holds a child of the session's cancellation token. The
//! token is cancelled when the last caller-held handle is dropped, so an
//! abandoned session stops reconnecting instead of running forever.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::backoff::Backoff;
use super::pipeline::{IncomingPipeline, Presenter, ThrottleOptions};
use crate::constants::{
    BACKOFF_FACTOR, OUTBOUND_QUEUE_CAPACITY, RECONNECT_MAX_INTERVAL, RECONNECT_MIN_INTERVAL,
};
use crate::events::{Event, EventBus};
use crate::notification::{decode_payload, ClientMessage, Credential, Notification, Payload};
use crate::transport::polling::poll_interval_for;
use crate::transport::{Link, TransportError, TransportKind, TransportPreference, TransportSet};

/// Grace period for closing a link on shutdown.
const LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// Not running.
    #[default]
    Disconnected,
    /// Opening a transport.
    Connecting,
    /// A link is open.
    Connected,
    /// Waiting to retry, or polling after a failed cycle.
    Reconnecting,
    /// Closed by `disconnect()`.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        })
    }
}

/// Connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Requested transport kind.
    pub transport: TransportPreference,
    /// Endpoint URL. Required by the time `connect` runs.
    pub url: Option<String>,
    /// Whether to reconnect after a failure.
    pub reconnect: bool,
    /// First reconnect delay.
    pub reconnect_min_interval: Duration,
    /// Reconnect delay cap.
    pub reconnect_max_interval: Duration,
    /// Growth factor of the reconnect delay.
    pub backoff_factor: f64,
    /// Sent in the auth handshake when the socket opens.
    pub credential: Option<Credential>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            transport: TransportPreference::Auto,
            url: None,
            reconnect: true,
            reconnect_min_interval: RECONNECT_MIN_INTERVAL,
            reconnect_max_interval: RECONNECT_MAX_INTERVAL,
            backoff_factor: BACKOFF_FACTOR,
            credential: None,
        }
    }
}

impl SessionOptions {
    fn backoff(&self) -> Backoff {
        Backoff::new(
            self.reconnect_min_interval,
            self.reconnect_max_interval,
            self.backoff_factor,
        )
    }
}

/// Errors returned to the caller. Transport trouble is reported on the
/// event bus instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Neither the call nor the configuration provided a URL.
    #[error("no notification URL configured")]
    MissingUrl,
}

#[derive(Debug)]
struct SessionShared {
    options: SessionOptions,
    state: SessionState,
    active: Option<TransportKind>,
    backoff: Backoff,
    last_connected: Option<DateTime<Utc>>,
    outbound: Option<mpsc::Sender<String>>,
    closing: bool,
    generation: u64,
    shutdown: Option<CancellationToken>,
}

struct SessionInner {
    bus: EventBus,
    pipeline: IncomingPipeline,
    /// Fixed transports; `None` builds the native set on each connect.
    transports: Option<TransportSet>,
    shared: Mutex<SessionShared>,
    /// Parent of every run's shutdown token.
    alive: CancellationToken,
}

/// Client side of the notification channel.
///
/// Cheap to clone; clones control the same session. Dropping the last
/// clone stops the run task.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<SessionInner>,
    /// `None` for the handle the run task holds.
    _owner: Option<Arc<DropGuard>>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.lock();
        f.debug_struct("TransportSession")
            .field("state", &shared.state)
            .field("active", &shared.active)
            .field("generation", &shared.generation)
            .finish_non_exhaustive()
    }
}

enum LinkEnd {
    Shutdown,
    Lost,
}

impl TransportSession {
    /// Builder with default options.
    pub fn builder() -> TransportSessionBuilder {
        TransportSessionBuilder::default()
    }

    /// Handle for the run task; it does not keep the session alive.
    fn worker(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _owner: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionShared> {
        self.inner.shared.lock().expect("session lock poisoned")
    }

    /// Run `f` only if `generation` is still the current run.
    fn with_current<R>(&self, generation: u64, f: impl FnOnce(&mut SessionShared) -> R) -> Option<R> {
        let mut shared = self.lock();
        if shared.generation == generation {
            Some(f(&mut shared))
        } else {
            None
        }
    }

    /// Connect using the configured URL, or `url` when given.
    ///
    /// Restarts the session if it is already running. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::MissingUrl`] when no non-blank URL is known.
    pub fn connect(&self, url: Option<&str>) -> Result<(), SessionError> {
        self.start(url, None)
    }

    /// Like [`connect`](Self::connect), replacing the session options first.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::MissingUrl`] when neither `url` nor `options`
    /// carries a non-blank URL; the current options are then left as they were.
    pub fn connect_with(&self, url: Option<&str>, options: SessionOptions) -> Result<(), SessionError> {
        self.start(url, Some(options))
    }

    fn start(&self, url: Option<&str>, options: Option<SessionOptions>) -> Result<(), SessionError> {
        let (run, was_live) = {
            let mut shared = self.lock();
            let mut next = options.unwrap_or_else(|| shared.options.clone());
            if let Some(url) = url {
                next.url = Some(url.to_string());
            }
            let url = next
                .url
                .clone()
                .filter(|u| !u.trim().is_empty())
                .ok_or(SessionError::MissingUrl)?;
            shared.options = next;

            if let Some(previous) = shared.shutdown.take() {
                previous.cancel();
            }
            let was_live = shared.active.take().is_some();
            let shutdown = self.inner.alive.child_token();
            shared.generation += 1;
            shared.closing = false;
            shared.state = SessionState::Connecting;
            shared.outbound = None;
            shared.backoff = shared.options.backoff();
            shared.shutdown = Some(shutdown.clone());

            let transports = self.inner.transports.clone().unwrap_or_else(|| {
                TransportSet::native(poll_interval_for(shared.options.reconnect_min_interval))
            });
            let run = RunContext {
                generation: shared.generation,
                url,
                candidates: shared.options.transport.candidates(),
                credential: shared.options.credential.clone(),
                transports,
                shutdown,
            };
            (run, was_live)
        };

        if was_live {
            self.inner.bus.emit(Event::Disconnect);
        }
        log::info!("Connecting to {} ({:?})", run.url, run.candidates);
        tokio::spawn(self.worker().run(run));
        Ok(())
    }

    /// Close the session and stop reconnecting. Idempotent.
    ///
    /// Also cancels the pipeline flush and clears its dedup window. A
    /// `disconnect` event is emitted only if a link was open.
    pub fn disconnect(&self) {
        let was_live = {
            let mut shared = self.lock();
            shared.generation += 1;
            shared.closing = true;
            shared.state = SessionState::Closed;
            shared.outbound = None;
            if let Some(shutdown) = shared.shutdown.take() {
                shutdown.cancel();
            }
            shared.active.take().is_some()
        };

        self.inner.pipeline.reset();
        if was_live {
            log::info!("Session closed");
            self.inner.bus.emit(Event::Disconnect);
        }
    }

    /// Serialize and send `payload` over the socket.
    ///
    /// Only possible while connected over the socket transport; otherwise
    /// nothing is sent, a `warning` event is emitted and `false` returned.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        let result = serde_json::to_string(payload)
            .map_err(|e| format!("payload not serializable: {e}"))
            .and_then(|text| {
                let shared = self.lock();
                if shared.state != SessionState::Connected {
                    return Err(format!("cannot send while {}", shared.state));
                }
                match (shared.active, shared.outbound.as_ref()) {
                    (Some(TransportKind::Socket), Some(outbound)) => outbound
                        .try_send(text)
                        .map_err(|e| format!("outbound queue rejected message: {e}")),
                    (Some(kind), _) => Err(format!("{kind} transport is receive-only")),
                    (None, _) => Err("no active transport".to_string()),
                }
            });

        match result {
            Ok(()) => true,
            Err(message) => {
                log::warn!("Send rejected: {}", message);
                self.inner.bus.emit(Event::Warning { message });
                false
            }
        }
    }

    /// Send an acknowledgment for a received notification.
    pub fn acknowledge(&self, notification_id: &str, status: Option<&str>) -> bool {
        self.send(&ClientMessage::Ack {
            notification_id: notification_id.to_string(),
            status: status.map(str::to_string),
        })
    }

    /// Present a local notification through the throttle.
    pub fn show(&self, notification: Notification) -> bool {
        self.inner.pipeline.accept(notification)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Kind of the open link, if any.
    pub fn active_transport(&self) -> Option<TransportKind> {
        self.lock().active
    }

    /// Delay the next reconnect would wait.
    pub fn current_backoff(&self) -> Duration {
        self.lock().backoff.current()
    }

    /// When a link last opened.
    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.lock().last_connected
    }

    /// Current options.
    pub fn options(&self) -> SessionOptions {
        self.lock().options.clone()
    }

    /// Event bus this session emits on.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Pipeline in front of the presenter.
    pub fn pipeline(&self) -> &IncomingPipeline {
        &self.inner.pipeline
    }

    // ------------------------------------------------------------------
    // Run task
    // ------------------------------------------------------------------

    async fn run(self, run: RunContext) {
        let generation = run.generation;
        let mut index = 0;

        while let Some(&kind) = run.candidates.get(index) {
            let Some(transport) = run.transports.get(kind) else {
                log::debug!("{} transport not present, falling back", kind);
                index += 1;
                continue;
            };

            if self
                .with_current(generation, |s| s.state = SessionState::Connecting)
                .is_none()
            {
                return;
            }

            let opened = tokio::select! {
                biased;
                () = run.shutdown.cancelled() => return,
                opened = transport.open(&run.url) => opened,
            };

            match opened {
                Err(TransportError::Unavailable { reason, .. }) => {
                    log::info!("{} transport unavailable ({}), falling back", kind, reason);
                    index += 1;
                    continue;
                }
                Err(e) => self.report_error(generation, Some(kind), &e),
                Ok(mut link) => {
                    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
                    if !self.mark_connected(generation, kind, outbound_tx) {
                        close_link(link.as_mut()).await;
                        return;
                    }
                    if let Some(credential) = run.credential.as_ref().filter(|_| link.can_send()) {
                        self.authenticate(link.as_mut(), credential).await;
                    }

                    match self
                        .drive(generation, link.as_mut(), &mut outbound_rx, &run.shutdown)
                        .await
                    {
                        LinkEnd::Shutdown => {
                            close_link(link.as_mut()).await;
                            return;
                        }
                        LinkEnd::Lost => self.mark_lost(generation, kind, &mut outbound_rx),
                    }
                }
            }

            let Some(delay) = self.next_retry_delay(generation, kind) else {
                return;
            };
            tokio::select! {
                biased;
                () = run.shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }

        let stopped = self.with_current(generation, |s| s.state = SessionState::Disconnected);
        if stopped.is_some() {
            log::error!("No usable transport for {}", run.url);
            self.inner.bus.emit(Event::Error {
                transport: None,
                message: "no usable transport".to_string(),
            });
        }
    }

    async fn drive(
        &self,
        generation: u64,
        link: &mut dyn Link,
        outbound: &mut mpsc::Receiver<String>,
        shutdown: &CancellationToken,
    ) -> LinkEnd {
        let kind = link.kind();
        let can_send = link.can_send();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return LinkEnd::Shutdown,
                Some(text) = outbound.recv(), if can_send => {
                    if let Err(e) = link.send_text(&text).await {
                        self.report_error(generation, Some(kind), &e);
                        return LinkEnd::Lost;
                    }
                }
                incoming = link.recv() => match incoming {
                    Some(Ok(payload)) => {
                        if kind == TransportKind::Polling {
                            self.restore_polling(generation);
                        }
                        self.handle_payload(generation, payload);
                    }
                    Some(Err(e)) if kind == TransportKind::Polling => {
                        self.with_current(generation, |s| s.state = SessionState::Reconnecting);
                        self.report_error(generation, Some(kind), &e);
                    }
                    Some(Err(e)) => {
                        self.report_error(generation, Some(kind), &e);
                        return LinkEnd::Lost;
                    }
                    None => {
                        log::info!("{} link closed", kind);
                        return LinkEnd::Lost;
                    }
                },
            }
        }
    }

    async fn authenticate(&self, link: &mut dyn Link, credential: &Credential) {
        let auth = serde_json::to_string(&credential.auth_message()).expect("serializable");
        match link.send_text(&auth).await {
            Ok(()) => log::debug!("Auth handshake sent"),
            Err(e) => log::warn!("Auth handshake not sent: {}", e),
        }
    }

    fn mark_connected(&self, generation: u64, kind: TransportKind, outbound: mpsc::Sender<String>) -> bool {
        let current = self.with_current(generation, |s| {
            s.state = SessionState::Connected;
            s.active = Some(kind);
            s.backoff.reset();
            s.last_connected = Some(Utc::now());
            s.outbound = Some(outbound);
        });
        if current.is_none() {
            return false;
        }
        log::info!("Connected over {}", kind);
        self.inner.bus.emit(Event::Connect { transport: kind });
        true
    }

    /// A successful poll after a failed cycle brings the session back.
    fn restore_polling(&self, generation: u64) {
        let restored = self.with_current(generation, |s| {
            let restored = s.state == SessionState::Reconnecting;
            if restored {
                s.state = SessionState::Connected;
                s.last_connected = Some(Utc::now());
            }
            restored
        });
        if restored == Some(true) {
            log::info!("Polling recovered");
            self.inner.bus.emit(Event::Connect {
                transport: TransportKind::Polling,
            });
        }
    }

    fn mark_lost(&self, generation: u64, kind: TransportKind, outbound: &mut mpsc::Receiver<String>) {
        let current = self.with_current(generation, |s| {
            s.active = None;
            s.outbound = None;
        });
        if current.is_none() {
            return;
        }

        let mut dropped = 0;
        while outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!("Dropped {} unsent message(s) with the {} link", dropped, kind);
        }
        log::warn!("Lost {} link", kind);
        self.inner.bus.emit(Event::Disconnect);
    }

    /// Next reconnect delay, or `None` when the run should end.
    fn next_retry_delay(&self, generation: u64, kind: TransportKind) -> Option<Duration> {
        self.with_current(generation, |s| {
            if s.closing || !s.options.reconnect {
                s.state = SessionState::Disconnected;
                log::info!("Not reconnecting (reconnect disabled)");
                return None;
            }
            s.state = SessionState::Reconnecting;
            let delay = s.backoff.next_delay();
            log::info!("Reconnecting over {} in {:.1}s", kind, delay.as_secs_f64());
            Some(delay)
        })
        .flatten()
    }

    fn handle_payload(&self, generation: u64, payload: Payload) {
        if self.with_current(generation, |_| ()).is_none() {
            return;
        }
        let decoded = decode_payload(payload);
        if decoded.degraded {
            self.inner.bus.emit(Event::Warning {
                message: "payload did not match the notification schema".to_string(),
            });
        }
        for notification in decoded.notifications {
            self.inner
                .bus
                .emit(Event::Notification(notification.clone()));
            self.inner.pipeline.accept(notification);
        }
    }

    fn report_error(&self, generation: u64, kind: Option<TransportKind>, error: &TransportError) {
        if self.with_current(generation, |_| ()).is_none() {
            return;
        }
        log::warn!("{}", error);
        self.inner.bus.emit(Event::Error {
            transport: kind,
            message: error.to_string(),
        });
    }
}

async fn close_link(link: &mut dyn Link) {
    if tokio::time::timeout(LINK_CLOSE_TIMEOUT, link.close())
        .await
        .is_err()
    {
        log::debug!("{} link close timed out", link.kind());
    }
}

fn log_presenter(notification: &Notification) {
    log::info!("[notification] {}: {}", notification.title, notification.body);
}

struct RunContext {
    generation: u64,
    url: String,
    candidates: &'static [TransportKind],
    credential: Option<Credential>,
    transports: TransportSet,
    shutdown: CancellationToken,
}

/// Builder for [`TransportSession`].
#[derive(Default)]
pub struct TransportSessionBuilder {
    options: SessionOptions,
    throttle: ThrottleOptions,
    transports: Option<TransportSet>,
    presenter: Option<Arc<dyn Presenter>>,
    bus: Option<EventBus>,
}

impl std::fmt::Debug for TransportSessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSessionBuilder")
            .field("options", &self.options)
            .field("throttle", &self.throttle)
            .field("transports", &self.transports)
            .field("has_presenter", &self.presenter.is_some())
            .finish()
    }
}

impl TransportSessionBuilder {
    /// Replace all session options.
    #[must_use]
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.options.url = Some(url.into());
        self
    }

    /// Requested transport kind.
    #[must_use]
    pub fn transport(mut self, preference: TransportPreference) -> Self {
        self.options.transport = preference;
        self
    }

    /// Credential for the auth handshake.
    #[must_use]
    pub fn credential(mut self, credential: Credential) -> Self {
        self.options.credential = Some(credential);
        self
    }

    /// Enable or disable reconnecting.
    #[must_use]
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.options.reconnect = reconnect;
        self
    }

    /// Throttle settings for the incoming pipeline.
    #[must_use]
    pub fn throttle(mut self, throttle: ThrottleOptions) -> Self {
        self.throttle = throttle;
        self
    }

    /// Use a fixed transport set instead of the native one.
    #[must_use]
    pub fn transports(mut self, transports: TransportSet) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Presentation layer. Defaults to logging each notification.
    #[must_use]
    pub fn presenter(mut self, presenter: impl Presenter + 'static) -> Self {
        self.presenter = Some(Arc::new(presenter));
        self
    }

    /// Share an existing event bus.
    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Build the session. Nothing connects until `connect` is called.
    pub fn build(self) -> TransportSession {
        let bus = self.bus.unwrap_or_default();
        let presenter: Arc<dyn Presenter> = match self.presenter {
            Some(presenter) => presenter,
            None => Arc::new(log_presenter),
        };
        let pipeline = IncomingPipeline::new(self.throttle, presenter, bus.clone());
        let shared = SessionShared {
            backoff: self.options.backoff(),
            options: self.options,
            state: SessionState::Disconnected,
            active: None,
            last_connected: None,
            outbound: None,
            closing: false,
            generation: 0,
            shutdown: None,
        };

        let alive = CancellationToken::new();
        TransportSession {
            _owner: Some(Arc::new(alive.clone().drop_guard())),
            inner: Arc::new(SessionInner {
                bus,
                pipeline,
                transports: self.transports,
                shared: Mutex::new(shared),
                alive,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::time::Instant;

    use super::*;
    use crate::events::EventName;
    use crate::transport::Transport;

    // ------------------------------------------------------------------
    // Scripted transports
    // ------------------------------------------------------------------

    enum Outcome {
        Unavailable,
        Fail,
        Open(FakeLink),
    }

    struct FakeTransport {
        kind: TransportKind,
        script: Mutex<VecDeque<Outcome>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl FakeTransport {
        fn new(kind: TransportKind, script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn open(&self, _url: &str) -> Result<Box<dyn Link>, TransportError> {
            self.attempts.lock().unwrap().push(Instant::now());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Outcome::Open(link)) => Ok(Box::new(link)),
                Some(Outcome::Unavailable) => Err(TransportError::unavailable(self.kind, "absent")),
                Some(Outcome::Fail) | None => Err(TransportError::failure(self.kind, "refused")),
            }
        }
    }

    struct FakeLink {
        kind: TransportKind,
        inbound: UnboundedReceiver<Result<Payload, TransportError>>,
        sent: UnboundedSender<String>,
    }

    struct LinkControl {
        inbound: UnboundedSender<Result<Payload, TransportError>>,
        sent: UnboundedReceiver<String>,
    }

    fn fake_link(kind: TransportKind) -> (FakeLink, LinkControl) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        (
            FakeLink {
                kind,
                inbound: in_rx,
                sent: sent_tx,
            },
            LinkControl {
                inbound: in_tx,
                sent: sent_rx,
            },
        )
    }

    #[async_trait]
    impl Link for FakeLink {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn recv(&mut self) -> Option<Result<Payload, TransportError>> {
            self.inbound.recv().await
        }

        fn can_send(&self) -> bool {
            self.kind == TransportKind::Socket
        }

        async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            let _ = self.sent.send(text.to_string());
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Harness {
        session: TransportSession,
        events: UnboundedReceiver<Event>,
        shown: Arc<Mutex<Vec<String>>>,
    }

    fn harness(options: SessionOptions, transports: TransportSet) -> Harness {
        let bus = EventBus::new();
        let events = bus.forward(&[
            EventName::Connect,
            EventName::Disconnect,
            EventName::Error,
            EventName::Warning,
            EventName::Notification,
        ]);
        let shown = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&shown);
        let session = TransportSession::builder()
            .options(options)
            .url("ws://notify.test/feed")
            .transports(transports)
            .presenter(move |n: &Notification| sink.lock().unwrap().push(n.body.clone()))
            .bus(bus)
            .build();
        Harness {
            session,
            events,
            shown,
        }
    }

    async fn next_event(events: &mut UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn set_of(transports: &[&Arc<FakeTransport>]) -> TransportSet {
        transports.iter().fold(TransportSet::new(), |set, t| {
            set.with_shared(Arc::clone(*t) as Arc<dyn Transport>)
        })
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_connect_without_url_is_configuration_error() {
        let session = TransportSession::builder()
            .transports(TransportSet::new())
            .build();
        assert_eq!(session.connect(None), Err(SessionError::MissingUrl));
        assert_eq!(session.connect(Some("  ")), Err(SessionError::MissingUrl));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_socket_falls_back_to_events_without_polling() {
        let (link, _control) = fake_link(TransportKind::Events);
        let events = FakeTransport::new(TransportKind::Events, vec![Outcome::Open(link)]);
        let polling = FakeTransport::new(TransportKind::Polling, vec![]);
        let mut h = harness(SessionOptions::default(), set_of(&[&events, &polling]));

        h.session.connect(None).unwrap();
        assert_eq!(
            next_event(&mut h.events).await,
            Event::Connect {
                transport: TransportKind::Events
            }
        );
        assert_eq!(h.session.state(), SessionState::Connected);
        assert_eq!(h.session.active_transport(), Some(TransportKind::Events));
        assert!(h.session.last_connected().is_some());
        assert!(polling.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_socket_falls_back_immediately() {
        let (link, _control) = fake_link(TransportKind::Events);
        let socket = FakeTransport::new(TransportKind::Socket, vec![Outcome::Unavailable]);
        let events = FakeTransport::new(TransportKind::Events, vec![Outcome::Open(link)]);
        let mut h = harness(SessionOptions::default(), set_of(&[&socket, &events]));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;

        assert_eq!(socket.attempts().len(), 1);
        assert_eq!(events.attempts(), socket.attempts(), "no delay between kinds");
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_polling_skips_other_kinds() {
        let (link, _control) = fake_link(TransportKind::Polling);
        let socket = FakeTransport::new(TransportKind::Socket, vec![]);
        let polling = FakeTransport::new(TransportKind::Polling, vec![Outcome::Open(link)]);
        let options = SessionOptions {
            transport: TransportPreference::Polling,
            ..SessionOptions::default()
        };
        let mut h = harness(options, set_of(&[&socket, &polling]));

        h.session.connect(None).unwrap();
        assert_eq!(
            next_event(&mut h.events).await,
            Event::Connect {
                transport: TransportKind::Polling
            }
        );
        assert!(socket.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_opens_back_off_then_reset() {
        let (link, _control) = fake_link(TransportKind::Socket);
        let socket = FakeTransport::new(
            TransportKind::Socket,
            vec![Outcome::Fail, Outcome::Fail, Outcome::Open(link)],
        );
        let events = FakeTransport::new(TransportKind::Events, vec![]);
        let mut h = harness(SessionOptions::default(), set_of(&[&socket, &events]));

        h.session.connect(None).unwrap();
        assert!(matches!(next_event(&mut h.events).await, Event::Error { .. }));
        assert!(matches!(next_event(&mut h.events).await, Event::Error { .. }));
        assert_eq!(
            next_event(&mut h.events).await,
            Event::Connect {
                transport: TransportKind::Socket
            }
        );

        let attempts = socket.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[1] - attempts[0], Duration::from_millis(1000));
        assert_eq!(attempts[2] - attempts[1], Duration::from_millis(1800));
        assert_eq!(h.session.current_backoff(), Duration::from_millis(1000));
        assert!(events.attempts().is_empty(), "failure never falls back");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_reconnects_on_same_kind() {
        let (first, first_control) = fake_link(TransportKind::Socket);
        let (second, _second_control) = fake_link(TransportKind::Socket);
        let socket = FakeTransport::new(
            TransportKind::Socket,
            vec![Outcome::Open(first), Outcome::Open(second)],
        );
        let mut h = harness(SessionOptions::default(), set_of(&[&socket]));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;

        drop(first_control);
        assert_eq!(next_event(&mut h.events).await, Event::Disconnect);
        settle().await;
        assert_eq!(h.session.state(), SessionState::Reconnecting);
        assert_eq!(h.session.active_transport(), None);

        assert_eq!(
            next_event(&mut h.events).await,
            Event::Connect {
                transport: TransportKind::Socket
            }
        );
        let attempts = socket.attempts();
        assert_eq!(attempts[1] - attempts[0], Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_sends_auth_first_then_acks() {
        let (link, mut control) = fake_link(TransportKind::Socket);
        let socket = FakeTransport::new(TransportKind::Socket, vec![Outcome::Open(link)]);
        let options = SessionOptions {
            credential: Some(Credential::Login("alice".into())),
            ..SessionOptions::default()
        };
        let mut h = harness(options, set_of(&[&socket]));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;

        assert_eq!(
            control.sent.recv().await.unwrap(),
            r#"{"type":"auth","login":"alice"}"#
        );
        assert!(h.session.acknowledge("n1", Some("shown")));
        assert_eq!(
            control.sent.recv().await.unwrap(),
            r#"{"type":"ack","notificationId":"n1","status":"shown"}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rejected_unless_connected_over_socket() {
        let (link, _control) = fake_link(TransportKind::Events);
        let events = FakeTransport::new(TransportKind::Events, vec![Outcome::Open(link)]);
        let mut h = harness(SessionOptions::default(), set_of(&[&events]));

        assert!(!h.session.send(&serde_json::json!({"hello": 1})));
        assert!(matches!(next_event(&mut h.events).await, Event::Warning { .. }));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;
        assert!(!h.session.acknowledge("n1", None));
        match next_event(&mut h.events).await {
            Event::Warning { message } => assert!(message.contains("receive-only")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_stops_reconnects() {
        let (link, _control) = fake_link(TransportKind::Socket);
        let socket = FakeTransport::new(TransportKind::Socket, vec![Outcome::Open(link)]);
        let mut h = harness(SessionOptions::default(), set_of(&[&socket]));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;

        h.session.disconnect();
        h.session.disconnect();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(next_event(&mut h.events).await, Event::Disconnect);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.events.try_recv().is_err(), "exactly one disconnect event");
        assert_eq!(socket.attempts().len(), 1);
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_disabled_stops_after_failure() {
        let socket = FakeTransport::new(TransportKind::Socket, vec![Outcome::Fail]);
        let options = SessionOptions {
            reconnect: false,
            ..SessionOptions::default()
        };
        let mut h = harness(options, set_of(&[&socket]));

        h.session.connect(None).unwrap();
        assert!(matches!(
            next_event(&mut h.events).await,
            Event::Error {
                transport: Some(TransportKind::Socket),
                ..
            }
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(socket.attempts().len(), 1);
        assert_eq!(h.session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_payload_expands_in_order() {
        let (link, control) = fake_link(TransportKind::Socket);
        let socket = FakeTransport::new(TransportKind::Socket, vec![Outcome::Open(link)]);
        let mut h = harness(SessionOptions::default(), set_of(&[&socket]));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;

        control
            .inbound
            .send(Ok(Payload::Text(
                r#"[{"id":"1","body":"one"},{"id":"2","body":"two"},"three"]"#.to_string(),
            )))
            .unwrap();

        let mut bodies = Vec::new();
        for _ in 0..3 {
            match next_event(&mut h.events).await {
                Event::Notification(n) => bodies.push(n.body),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(bodies, vec!["one", "two", "three"]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*h.shown.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_payload_warns_and_still_presents() {
        let (link, control) = fake_link(TransportKind::Socket);
        let socket = FakeTransport::new(TransportKind::Socket, vec![Outcome::Open(link)]);
        let mut h = harness(SessionOptions::default(), set_of(&[&socket]));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;

        control
            .inbound
            .send(Ok(Payload::Text(r#"{"body":["not","text"]}"#.to_string())))
            .unwrap();
        assert!(matches!(next_event(&mut h.events).await, Event::Warning { .. }));
        assert!(matches!(next_event(&mut h.events).await, Event::Notification(_)));
        assert_eq!(h.shown.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_reports_error_without_reopening() {
        let (link, control) = fake_link(TransportKind::Polling);
        let polling = FakeTransport::new(TransportKind::Polling, vec![Outcome::Open(link)]);
        let options = SessionOptions {
            transport: TransportPreference::Polling,
            ..SessionOptions::default()
        };
        let mut h = harness(options, set_of(&[&polling]));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;

        control
            .inbound
            .send(Err(TransportError::failure(TransportKind::Polling, "HTTP 500")))
            .unwrap();
        assert!(matches!(next_event(&mut h.events).await, Event::Error { .. }));
        assert_eq!(h.session.state(), SessionState::Reconnecting);

        control
            .inbound
            .send(Ok(Payload::Json(serde_json::json!([]))))
            .unwrap();
        assert_eq!(
            next_event(&mut h.events).await,
            Event::Connect {
                transport: TransportKind::Polling
            }
        );
        assert_eq!(h.session.state(), SessionState::Connected);
        assert_eq!(polling.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_disconnect_restarts_session() {
        let (first, _first_control) = fake_link(TransportKind::Socket);
        let (second, _second_control) = fake_link(TransportKind::Socket);
        let socket = FakeTransport::new(
            TransportKind::Socket,
            vec![Outcome::Open(first), Outcome::Open(second)],
        );
        let mut h = harness(SessionOptions::default(), set_of(&[&socket]));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;
        h.session.disconnect();
        assert_eq!(next_event(&mut h.events).await, Event::Disconnect);

        h.session.connect(None).unwrap();
        assert_eq!(
            next_event(&mut h.events).await,
            Event::Connect {
                transport: TransportKind::Socket
            }
        );
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_cancels_retry() {
        let socket = FakeTransport::new(TransportKind::Socket, vec![]);
        let mut h = harness(SessionOptions::default(), set_of(&[&socket]));

        h.session.connect(None).unwrap();
        assert!(matches!(next_event(&mut h.events).await, Event::Error { .. }));
        settle().await;
        assert_eq!(h.session.state(), SessionState::Reconnecting);

        h.session.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(socket.attempts().len(), 1);
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(h.events.try_recv().is_err(), "no disconnect without a live link");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_polling_link() {
        let (link, control) = fake_link(TransportKind::Polling);
        let polling = FakeTransport::new(TransportKind::Polling, vec![Outcome::Open(link)]);
        let options = SessionOptions {
            transport: TransportPreference::Polling,
            ..SessionOptions::default()
        };
        let mut h = harness(options, set_of(&[&polling]));

        h.session.connect(None).unwrap();
        next_event(&mut h.events).await;
        control
            .inbound
            .send(Ok(Payload::Text("before".to_string())))
            .unwrap();
        assert!(matches!(next_event(&mut h.events).await, Event::Notification(_)));

        h.session.disconnect();
        assert_eq!(next_event(&mut h.events).await, Event::Disconnect);
        settle().await;
        assert!(control.inbound.is_closed(), "polling link still held");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(polling.attempts().len(), 1);
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_stops_reconnecting() {
        let socket = FakeTransport::new(TransportKind::Socket, vec![]);
        let Harness {
            session,
            mut events,
            shown: _,
        } = harness(SessionOptions::default(), set_of(&[&socket]));

        session.connect(None).unwrap();
        assert!(matches!(next_event(&mut events).await, Event::Error { .. }));

        let clone = session.clone();
        drop(session);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(socket.attempts().len() > 1, "a live clone keeps the session running");

        drop(clone);
        settle().await;
        let attempts = socket.attempts().len();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(socket.attempts().len(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_url_leaves_options_untouched() {
        let (link, _control) = fake_link(TransportKind::Socket);
        let socket = FakeTransport::new(TransportKind::Socket, vec![Outcome::Open(link)]);
        let mut h = harness(SessionOptions::default(), set_of(&[&socket]));

        assert_eq!(h.session.connect(Some("  ")), Err(SessionError::MissingUrl));
        let replaced = SessionOptions {
            transport: TransportPreference::Polling,
            ..SessionOptions::default()
        };
        assert_eq!(
            h.session.connect_with(None, replaced),
            Err(SessionError::MissingUrl)
        );

        let options = h.session.options();
        assert_eq!(options.url.as_deref(), Some("ws://notify.test/feed"));
        assert_eq!(options.transport, TransportPreference::Auto);
        assert_eq!(h.session.state(), SessionState::Disconnected);

        h.session.connect(None).unwrap();
        assert_eq!(
            next_event(&mut h.events).await,
            Event::Connect {
                transport: TransportKind::Socket
            }
        );
    }
}
