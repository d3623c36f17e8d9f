//! Notification model and wire messages.
//!
//! Every message on the wire is JSON text:
//!
//! ```text
//! Server → Client   { "id", "title", "body", "duration", "actions": [{ "label", "action" }] }
//! Client → Server   { "type": "auth", "token" | "login": "..." }
//! Client → Server   { "type": "ack", "notificationId": "...", "status"?: "..." }
//! ```
//!
//! Incoming payloads are decoded leniently: a payload that does not parse
//! as a notification object still reaches the presentation layer as a
//! body-only notification.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A single notification.
///
/// `id` is the deduplication and acknowledgment key. Notifications that
/// arrive without one are never deduplicated and cannot be acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Sender-assigned identifier.
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    /// Headline text.
    #[serde(default, deserialize_with = "nullable_string")]
    pub title: String,
    /// Body text.
    #[serde(default, deserialize_with = "nullable_string")]
    pub body: String,
    /// Display duration in milliseconds (`0` keeps it until dismissed).
    #[serde(
        rename = "duration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_ms: Option<u64>,
    /// Buttons offered alongside the notification, in display order.
    #[serde(default, deserialize_with = "nullable_vec")]
    pub actions: Vec<Action>,
}

/// A button attached to a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Button label.
    #[serde(default, deserialize_with = "nullable_string")]
    pub label: String,
    /// Tag reported back to the host when the button is chosen.
    #[serde(rename = "action", default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Notification {
    /// Create a notification with an id, title and body.
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            title: title.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Body-only notification, used for plain-text payloads.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Set the display duration.
    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Append an action button.
    #[must_use]
    pub fn with_action(mut self, label: impl Into<String>, tag: impl Into<String>) -> Self {
        self.actions.push(Action {
            label: label.into(),
            tag: Some(tag.into()),
        });
        self
    }
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Binds the connection to an identity.
    Auth {
        /// Opaque token credential.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Login credential.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        login: Option<String>,
    },
    /// Confirms receipt of a tracked notification.
    Ack {
        /// Id of the acknowledged notification.
        #[serde(rename = "notificationId")]
        notification_id: String,
        /// Free-form status reported by the client (e.g. `"shown"`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
}

impl ClientMessage {
    /// Identity carried by an auth message. Token wins over login.
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Auth { token, login } => token
                .as_deref()
                .or(login.as_deref())
                .filter(|id| !id.is_empty()),
            Self::Ack { .. } => None,
        }
    }
}

/// Client credential sent in the auth handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Sent as `{"type":"auth","token":...}`.
    Token(String),
    /// Sent as `{"type":"auth","login":...}`.
    Login(String),
}

impl Credential {
    /// The auth message announcing this credential.
    pub fn auth_message(&self) -> ClientMessage {
        match self {
            Self::Token(token) => ClientMessage::Auth {
                token: Some(token.clone()),
                login: None,
            },
            Self::Login(login) => ClientMessage::Auth {
                token: None,
                login: Some(login.clone()),
            },
        }
    }
}

/// Raw payload surfaced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Text frame or event data, not yet parsed.
    Text(String),
    /// Already-parsed JSON (polling responses).
    Json(Value),
}

/// Result of decoding one payload.
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    /// Notifications in payload order.
    pub notifications: Vec<Notification>,
    /// Set when some part of the payload fell back to a body-only notification.
    pub degraded: bool,
}

/// Decode a payload into notifications.
///
/// Text is parsed as JSON when possible and otherwise becomes the body of a
/// single notification. Arrays expand into one notification per element,
/// in order. `null` elements are skipped.
pub fn decode_payload(payload: Payload) -> Decoded {
    let mut decoded = Decoded::default();

    let value = match payload {
        Payload::Text(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(_) => {
                decoded.notifications.push(Notification::text(text));
                return decoded;
            }
        },
        Payload::Json(value) => value,
    };

    match value {
        Value::Array(items) => {
            for item in items {
                decode_value(item, &mut decoded);
            }
        }
        other => decode_value(other, &mut decoded),
    }
    decoded
}

fn decode_value(value: Value, decoded: &mut Decoded) {
    match value {
        Value::Null => {}
        Value::String(body) => decoded.notifications.push(Notification::text(body)),
        Value::Object(_) => {
            let raw = value.to_string();
            match serde_json::from_value::<Notification>(value) {
                Ok(notification) => decoded.notifications.push(notification),
                Err(e) => {
                    log::debug!("Notification object did not match schema ({}), using raw body", e);
                    decoded.degraded = true;
                    decoded.notifications.push(Notification::text(raw));
                }
            }
        }
        other => decoded.notifications.push(Notification::text(other.to_string())),
    }
}

/// Accepts string or numeric ids; numeric ids are kept in their textual form.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn nullable_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn nullable_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_object() {
        let text = r#"{"id":"n1","title":"Hi","body":"there","duration":3000,
            "actions":[{"label":"Open","action":"open"}]}"#;
        let decoded = decode_payload(Payload::Text(text.to_string()));

        assert!(!decoded.degraded);
        assert_eq!(
            decoded.notifications,
            vec![Notification::new("n1", "Hi", "there")
                .with_duration(3000)
                .with_action("Open", "open")]
        );
    }

    #[test]
    fn test_decode_plain_text_becomes_body() {
        let decoded = decode_payload(Payload::Text("quack!".to_string()));
        assert_eq!(decoded.notifications, vec![Notification::text("quack!")]);
    }

    #[test]
    fn test_decode_array_preserves_order_and_skips_null() {
        let decoded = decode_payload(Payload::Json(serde_json::json!([
            {"id": "a", "body": "first"},
            null,
            "second",
            {"id": 7, "body": "third"}
        ])));

        let bodies: Vec<_> = decoded.notifications.iter().map(|n| n.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);
        assert_eq!(decoded.notifications[2].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_decode_mismatched_object_degrades() {
        let decoded = decode_payload(Payload::Text(r#"{"title": 42}"#.to_string()));
        assert!(decoded.degraded);
        assert_eq!(decoded.notifications.len(), 1);
        assert_eq!(decoded.notifications[0].body, r#"{"title":42}"#);
        assert!(decoded.notifications[0].id.is_none());
    }

    #[test]
    fn test_decode_null_fields_default() {
        let decoded = decode_payload(Payload::Text(
            r#"{"id":"x","title":null,"actions":null}"#.to_string(),
        ));
        let n = &decoded.notifications[0];
        assert_eq!(n.title, "");
        assert!(n.actions.is_empty());
        assert_eq!(n.duration_ms, None);
    }

    #[test]
    fn test_auth_message_wire_shape() {
        let json = serde_json::to_string(&Credential::Login("alice".into()).auth_message()).unwrap();
        assert_eq!(json, r#"{"type":"auth","login":"alice"}"#);

        let json = serde_json::to_string(&Credential::Token("t0k".into()).auth_message()).unwrap();
        assert_eq!(json, r#"{"type":"auth","token":"t0k"}"#);
    }

    #[test]
    fn test_ack_message_wire_shape() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"ack","notificationId":"n1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Ack {
                notification_id: "n1".into(),
                status: None
            }
        );
    }

    #[test]
    fn test_auth_identity_prefers_token() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"auth","token":"tok","login":"bob"}"#).unwrap();
        assert_eq!(msg.identity(), Some("tok"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"auth","login":""}"#).unwrap();
        assert_eq!(msg.identity(), None);
    }
}
