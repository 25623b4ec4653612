//! Inbound event normalization
//!
//! Decodes raw chat-platform webhook payloads into a canonical event type,
//! answers the URL-verification challenge, and absorbs the platform's
//! at-least-once delivery through a TTL'd dedup cache.
//!
//! The normalizer has no side effects beyond dedup-set insertion; it never
//! touches session or job state.

use insight_common::SessionId;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

mod dedup;

pub use dedup::DedupCache;

/// Event decoding errors
#[derive(Debug, Error)]
pub enum EventError {
    #[error("undecodable payload: {0}")]
    Undecodable(String),

    #[error("verification token mismatch")]
    TokenMismatch,

    #[error("event missing required field: {0}")]
    MissingField(&'static str),

    #[error("unsupported event type: {0}")]
    Unsupported(String),
}

/// Result of normalizing one inbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// URL-verification handshake; the token must be echoed verbatim
    /// within the same response cycle.
    Challenge { challenge: String },
    /// A decoded platform event
    Event(CanonicalEvent),
}

/// Canonical internal event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalEvent {
    /// Platform event id, used for dedup
    pub event_id: String,
    /// Conversation context the event belongs to
    pub session_id: SessionId,
    pub kind: EventKind,
}

/// What the user did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Plain text message
    Message { text: String },
    /// Card form submitted (field name -> value)
    CardSubmit { form: HashMap<String, String> },
    /// Single card input edited without submitting
    CardEdit { field: String, value: String },
}

// Wire shapes. The platform sends a v2 envelope with a `header` block for
// events, and a flat body for the url_verification handshake.

#[derive(Debug, Deserialize)]
struct ChallengeBody {
    challenge: String,
    token: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    header: Header,
    #[serde(default)]
    event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Header {
    event_id: String,
    event_type: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    sender: Sender,
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Sender {
    sender_id: SenderId,
}

#[derive(Debug, Deserialize)]
struct SenderId {
    open_id: String,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_type: String,
    /// JSON-encoded string, e.g. `{"text":"..."}` for text messages
    content: String,
}

#[derive(Debug, Deserialize)]
struct CardActionEvent {
    operator: Operator,
    action: CardAction,
}

#[derive(Debug, Deserialize)]
struct Operator {
    open_id: String,
}

#[derive(Debug, Deserialize)]
struct CardAction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    form_value: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    input_value: Option<String>,
}

const MESSAGE_RECEIVE: &str = "im.message.receive_v1";
const CARD_ACTION_TRIGGER: &str = "card.action.trigger";

/// Decode a raw webhook body.
///
/// `verification_token` is compared against the token the platform embeds
/// in both challenge bodies and event headers; a mismatch rejects the
/// payload before anything else is looked at. An empty configured token
/// disables the check (local development).
pub fn normalize(raw: &[u8], verification_token: &str) -> Result<Inbound, EventError> {
    let value: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| EventError::Undecodable(e.to_string()))?;

    // Handshake bodies are flat and carry a `challenge` field.
    if value.get("challenge").is_some() {
        let body: ChallengeBody = serde_json::from_value(value)
            .map_err(|e| EventError::Undecodable(e.to_string()))?;
        check_token(body.token.as_deref(), verification_token)?;
        debug!(kind = ?body.kind, "answering url verification challenge");
        return Ok(Inbound::Challenge {
            challenge: body.challenge,
        });
    }

    let envelope: Envelope =
        serde_json::from_value(value).map_err(|e| EventError::Undecodable(e.to_string()))?;
    check_token(envelope.header.token.as_deref(), verification_token)?;

    let event = match envelope.header.event_type.as_str() {
        MESSAGE_RECEIVE => decode_message(&envelope)?,
        CARD_ACTION_TRIGGER => decode_card_action(&envelope)?,
        other => return Err(EventError::Unsupported(other.to_string())),
    };

    Ok(Inbound::Event(event))
}

fn check_token(got: Option<&str>, expected: &str) -> Result<(), EventError> {
    if expected.is_empty() {
        return Ok(());
    }
    match got {
        Some(token) if token == expected => Ok(()),
        _ => Err(EventError::TokenMismatch),
    }
}

fn decode_message(envelope: &Envelope) -> Result<CanonicalEvent, EventError> {
    let event: MessageEvent = serde_json::from_value(envelope.event.clone())
        .map_err(|e| EventError::Undecodable(e.to_string()))?;

    if event.message.message_type != "text" {
        return Err(EventError::Unsupported(format!(
            "message type {}",
            event.message.message_type
        )));
    }

    // Text content is itself a JSON document: {"text": "..."}
    let content: serde_json::Value = serde_json::from_str(&event.message.content)
        .map_err(|e| EventError::Undecodable(e.to_string()))?;
    let text = content
        .get("text")
        .and_then(|t| t.as_str())
        .ok_or(EventError::MissingField("text"))?
        .trim()
        .to_string();

    Ok(CanonicalEvent {
        event_id: envelope.header.event_id.clone(),
        session_id: SessionId::from(event.sender.sender_id.open_id),
        kind: EventKind::Message { text },
    })
}

fn decode_card_action(envelope: &Envelope) -> Result<CanonicalEvent, EventError> {
    let event: CardActionEvent = serde_json::from_value(envelope.event.clone())
        .map_err(|e| EventError::Undecodable(e.to_string()))?;

    let session_id = SessionId::from(event.operator.open_id);

    // A form submit carries the whole form_value map; a lone input edit
    // carries its field name plus input_value.
    let kind = if let Some(form_value) = event.action.form_value {
        let mut form = HashMap::with_capacity(form_value.len());
        for (name, value) in form_value {
            form.insert(name, json_to_string(&value));
        }
        EventKind::CardSubmit { form }
    } else if let (Some(name), Some(value)) = (event.action.name, event.action.input_value) {
        EventKind::CardEdit {
            field: name,
            value,
        }
    } else {
        return Err(EventError::MissingField("form_value or input_value"));
    };

    Ok(CanonicalEvent {
        event_id: envelope.header.event_id.clone(),
        session_id,
        kind,
    })
}

/// Card inputs arrive as strings, but keep numbers/bools usable too.
fn json_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
