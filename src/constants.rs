//! Application-wide defaults for quack.
//!
//! Every tunable the session, pipeline and tracker read has its default
//! here. [`crate::config::Config`] starts from these values and layers the
//! config file, environment and CLI flags on top.

use std::time::Duration;

// ============================================================================
// Reconnect & Transport
// ============================================================================

/// First reconnect delay after a transport failure.
pub const RECONNECT_MIN_INTERVAL: Duration = Duration::from_millis(1000);

/// Upper bound for the reconnect delay.
pub const RECONNECT_MAX_INTERVAL: Duration = Duration::from_millis(30_000);

/// Multiplier applied to the reconnect delay after each failure.
pub const BACKOFF_FACTOR: f64 = 1.8;

/// Floor for the polling transport interval.
///
/// The effective interval is `max(POLL_INTERVAL_FLOOR, reconnect_min)`.
pub const POLL_INTERVAL_FLOOR: Duration = Duration::from_millis(2000);

/// Timeout applied to a single HTTP request made by the polling transport.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Incoming throttle
// ============================================================================

/// Minimum spacing between two presented notifications.
pub const RATE_LIMIT: Duration = Duration::from_millis(400);

/// Span during which a repeated notification id is suppressed.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(5000);

// ============================================================================
// Server
// ============================================================================

/// Interval between redelivery attempts of an unacknowledged notification.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(5000);

/// Address the server binds when none is configured.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

/// Title used when a send request omits one.
pub const DEFAULT_TITLE: &str = "Notify";

/// Body used when a send request omits one.
pub const DEFAULT_BODY: &str = "Quack, quack!";

/// Display duration (ms) used when a notification does not specify one.
pub const DEFAULT_DURATION_MS: u64 = 7000;

/// Capacity of the session's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;
