//! Message envelope and the broker wire document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::BusError;

/// String-keyed JSON object used for payloads and metadata.
pub type Fields = serde_json::Map<String, Value>;

/// Convert a JSON value into [`Fields`].
///
/// Convenience for `emit` call sites built around `serde_json::json!`.
/// Non-object values yield an empty mapping; the discard is logged at
/// debug level so a mis-shaped payload leaves a trace.
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => {
            tracing::debug!(value = %other, "discarding non-object value, using empty fields");
            Fields::new()
        }
    }
}

/// Immutable event envelope carried unchanged through every transport.
///
/// Constructed by producers (usually via [`MessageBroker::emit`]) and handed
/// to each matching subscription handler. The envelope never mutates after
/// construction; transports may serialize and reconstruct it, but topic,
/// payload, and metadata always survive the round trip.
///
/// [`MessageBroker::emit`]: crate::MessageBroker::emit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Process-unique identifier, generated at construction.
    pub id: Uuid,

    /// Non-empty dot-segmented subject, e.g. `"saga.started"`. Doubles as
    /// the AMQP routing key and as the value subscription patterns match.
    pub topic: String,

    /// Arbitrary structured content; opaque to the bus.
    pub payload: Fields,

    /// Auxiliary context (e.g. actor id); always present, never null.
    pub metadata: Fields,

    /// Creation time in UTC.
    pub timestamp: DateTime<Utc>,

    /// Identifier of the message that caused this one, if any.
    pub causation_id: Option<Uuid>,

    /// Identifier shared by every message in one causal chain, if any.
    pub correlation_id: Option<Uuid>,
}

impl Message {
    /// Create a message with an empty metadata mapping.
    pub fn new(topic: impl Into<String>, payload: Fields) -> Result<Self, BusError> {
        Self::with_metadata(topic, payload, Fields::new())
    }

    /// Create a message with explicit metadata.
    ///
    /// Rejects an empty topic; everything else is generated here: a fresh
    /// v4 id, the current UTC timestamp, and unset causation/correlation.
    pub fn with_metadata(
        topic: impl Into<String>,
        payload: Fields,
        metadata: Fields,
    ) -> Result<Self, BusError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(BusError::invalid_config("message topic cannot be empty"));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            topic,
            payload,
            metadata,
            timestamp: Utc::now(),
            causation_id: None,
            correlation_id: None,
        })
    }

    /// Set the causation id.
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// Document published to the AMQP exchange: exactly `{type, payload, meta}`.
///
/// Identifiers and timestamps are not carried on the wire; the consuming
/// side regenerates them in [`into_message`](WireMessage::into_message).
/// The in-process transport never serializes, so ids survive there. This
/// asymmetry is deliberate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// The message topic, used as the routing key.
    #[serde(rename = "type")]
    pub topic: String,

    /// Arbitrary nested structure.
    #[serde(default)]
    pub payload: Fields,

    /// String-keyed auxiliary mapping.
    #[serde(default)]
    pub meta: Fields,
}

impl WireMessage {
    /// Reconstruct an envelope from the wire document.
    ///
    /// Generates a fresh id and timestamp; causation/correlation stay unset.
    pub fn into_message(self) -> Message {
        Message {
            id: Uuid::new_v4(),
            topic: self.topic,
            payload: self.payload,
            metadata: self.meta,
            timestamp: Utc::now(),
            causation_id: None,
            correlation_id: None,
        }
    }
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        Self {
            topic: msg.topic.clone(),
            payload: msg.payload.clone(),
            meta: msg.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_defaults() {
        let before = Utc::now();
        let msg = Message::new("saga.started", fields(json!({ "saga_id": "s1" }))).unwrap();

        assert!(!msg.id.is_nil());
        assert_eq!(msg.topic, "saga.started");
        assert!(msg.metadata.is_empty());
        assert!(msg.causation_id.is_none());
        assert!(msg.correlation_id.is_none());

        let age = (msg.timestamp - before).num_seconds();
        assert!((0..5).contains(&age));
    }

    #[test]
    fn test_empty_topic_rejected() {
        let err = Message::new("", Fields::new()).unwrap_err();
        assert!(matches!(err, BusError::InvalidConfig(_)));
    }

    #[test]
    fn test_distinct_ids_per_construction() {
        let a = Message::new("story.created", Fields::new()).unwrap();
        let b = Message::new("story.created", Fields::new()).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_causation_and_correlation_builders() {
        let cause = Uuid::new_v4();
        let chain = Uuid::new_v4();
        let msg = Message::new("saga.advanced", Fields::new())
            .unwrap()
            .with_causation_id(cause)
            .with_correlation_id(chain);

        assert_eq!(msg.causation_id, Some(cause));
        assert_eq!(msg.correlation_id, Some(chain));
    }

    #[test]
    fn test_wire_document_field_names() {
        let msg = Message::with_metadata(
            "story.updated",
            fields(json!({ "story_id": "s7" })),
            fields(json!({ "actor_id": "a1" })),
        )
        .unwrap();

        let doc = serde_json::to_value(WireMessage::from(&msg)).unwrap();
        assert_eq!(doc["type"], "story.updated");
        assert_eq!(doc["payload"]["story_id"], "s7");
        assert_eq!(doc["meta"]["actor_id"], "a1");
        assert_eq!(doc.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_wire_round_trip_regenerates_identity() {
        let original = Message::with_metadata(
            "saga.started",
            fields(json!({ "saga_id": "s1" })),
            fields(json!({ "actor_id": "a1" })),
        )
        .unwrap();

        let body = serde_json::to_vec(&WireMessage::from(&original)).unwrap();
        let wire: WireMessage = serde_json::from_slice(&body).unwrap();
        let rebuilt = wire.into_message();

        assert_eq!(rebuilt.topic, original.topic);
        assert_eq!(rebuilt.payload, original.payload);
        assert_eq!(rebuilt.metadata, original.metadata);
        assert_ne!(rebuilt.id, original.id);
    }

    #[test]
    fn test_wire_defaults_for_missing_fields() {
        let wire: WireMessage = serde_json::from_str(r#"{"type":"story.created"}"#).unwrap();
        let msg = wire.into_message();
        assert!(msg.payload.is_empty());
        assert!(msg.metadata.is_empty());
    }

    #[test]
    fn test_fields_from_non_object_is_empty() {
        assert!(fields(json!([1, 2, 3])).is_empty());
        assert!(fields(json!("scalar")).is_empty());
    }
}
