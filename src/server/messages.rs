//! Control-surface messages.
//!
//! `quack serve` reads one [`ControlCommand`] per stdin line:
//!
//! ```text
//! {"cmd":"send","title":"Build","body":"done","identity":"alice"}
//! {"cmd":"status","id":"5f0c..."}
//! {"cmd":"pending"}
//! ```

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BODY, DEFAULT_DURATION_MS, DEFAULT_TITLE};
use crate::notification::{Action, Notification};

/// Request to dispatch a notification.
///
/// Without an `identity` the notification is broadcast to every live
/// connection; with one it is tracked until acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Headline. Empty or missing falls back to `"Notify"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Body. Empty or missing falls back to `"Quack, quack!"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Display duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Action buttons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    /// Recipient identity (`login` and `token` are accepted as aliases).
    #[serde(
        default,
        alias = "login",
        alias = "token",
        skip_serializing_if = "Option::is_none"
    )]
    pub identity: Option<String>,
}

impl SendRequest {
    /// Broadcast request with the given title and body.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            body: Some(body.into()),
            ..Self::default()
        }
    }

    /// Address the request to `identity`.
    #[must_use]
    pub fn for_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Recipient identity, ignoring blank values.
    pub fn recipient(&self) -> Option<&str> {
        self.identity.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// Build the notification with id `id`, applying defaults.
    pub fn into_notification(self, id: String) -> Notification {
        Notification {
            id: Some(id),
            title: non_empty_or(self.title, DEFAULT_TITLE),
            body: non_empty_or(self.body, DEFAULT_BODY),
            duration_ms: Some(self.duration.unwrap_or(DEFAULT_DURATION_MS)),
            actions: self.actions,
        }
    }
}

fn non_empty_or(value: Option<String>, fallback: &str) -> String {
    value
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Reply to a [`SendRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    /// Always `true`; failures are reported per delivery, not per request.
    pub ok: bool,
    /// Connections that accepted the message.
    pub sent: usize,
    /// Tracking id, present for identity-addressed sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
}

/// One line of the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlCommand {
    /// Dispatch a notification.
    Send(SendRequest),
    /// Delivery status of a tracked id.
    Status {
        /// Notification id.
        id: String,
    },
    /// List pending records.
    Pending,
}
