//! Quack - real-time notification delivery.
//!
//! Delivers notifications from a server to identified clients over a
//! channel that may drop at any time.
//!
//! # Architecture
//!
//! - **Client** - [`TransportSession`] keeps one logical connection alive
//!   across WebSocket, server-sent events and polling, reconnecting with
//!   backoff. Incoming notifications pass through the
//!   [`IncomingPipeline`] (dedup, rate limit, burst queue) before reaching
//!   a [`Presenter`].
//! - **Server** - [`NotifyServer`] accepts WebSocket clients, binds them to
//!   identities in the [`ClientRegistry`] and redelivers tracked
//!   notifications through the [`PendingDeliveryTracker`] until acknowledged.
//! - **Events** - both sides announce lifecycle changes on an [`EventBus`].
//!
//! # Modules
//!
//! - [`client`] - session, backoff and throttle
//! - [`transport`] - transport seam and the three native transports
//! - [`server`] - registry, tracker and the WebSocket server
//! - [`config`] - configuration loading/saving

pub mod client;
pub mod config;
pub mod constants;
pub mod events;
pub mod notification;
pub mod server;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use client::{
    IncomingPipeline, Presenter, SessionError, SessionOptions, SessionState, ThrottleOptions,
    TransportSession,
};
pub use config::Config;
pub use events::{Event, EventBus, EventName};
pub use notification::{Action, ClientMessage, Credential, Notification};
pub use server::{
    ClientRegistry, DeliveryStatus, NotifyServer, PendingDeliveryTracker, SendRequest,
    ServerOptions,
};
pub use transport::{TransportKind, TransportPreference};
