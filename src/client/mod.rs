//! Client side: transport session, reconnect backoff and the incoming
//! notification throttle.

pub mod backoff;
pub mod pipeline;
pub mod session;

pub use backoff::Backoff;
pub use pipeline::{IncomingPipeline, Presenter, ThrottleOptions};
pub use session::{
    SessionError, SessionOptions, SessionState, TransportSession, TransportSessionBuilder,
};
