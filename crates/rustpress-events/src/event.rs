//! Message and event data model.
//!
//! A [`Message`] is the raw unit of transport: whatever a consumer
//! received, carrying enough metadata to ack or nack it. An [`Event`] is
//! the routed, typed form the dispatcher hands to handlers once the
//! message body has been decoded and a `type` extracted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Event type identifier used to look up handlers in the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as received from a transport, before routing.
///
/// `id` doubles as the handler idempotency key: handlers should be safe
/// to re-run for the same `id` under at-least-once redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub body: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Opaque token required to ack/nack this message; semantics are
    /// defined by the transport that produced it.
    #[serde(default)]
    pub ack_handle: Option<String>,
    /// Transport tag: "sqs", "redis", "webhook", "websocket", ...
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(id: impl Into<String>, body: serde_json::Value, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body,
            timestamp: Some(Utc::now()),
            ack_handle: None,
            source: source.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_ack_handle(mut self, handle: impl Into<String>) -> Self {
        self.ack_handle = Some(handle.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Parse this message's body into a routed [`Event`]. Returns `None`
    /// when the body carries no `type` field — such messages are treated
    /// as handled (acked) by the dispatcher rather than routed.
    pub fn into_event(self) -> Option<Event> {
        let event_type = self
            .body
            .get("type")
            .and_then(|v| v.as_str())
            .map(EventType::new)?;

        let data = self
            .body
            .get("data")
            .cloned()
            .unwrap_or_else(|| self.body.clone());

        let mut metadata = self.metadata;
        if let Some(handle) = &self.ack_handle {
            metadata.insert("ack_handle".to_string(), serde_json::Value::String(handle.clone()));
        }

        Some(Event {
            id: Uuid::now_v7(),
            event_type,
            data,
            metadata,
            message_id: self.id,
        })
    }
}

/// The routed, decoded form of a [`Message`] handed to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// The originating message's id, carried through for idempotency and
    /// state-store keying.
    pub message_id: String,
}

impl Event {
    pub fn new(event_type: impl Into<EventType>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            data,
            metadata: HashMap::new(),
            message_id: Uuid::now_v7().to_string(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        let et = EventType::new("checkout.complete");
        assert_eq!(et.as_str(), "checkout.complete");
        assert_eq!(et.to_string(), "checkout.complete");
    }

    #[test]
    fn test_message_into_event() {
        let msg = Message::new(
            "m1",
            serde_json::json!({"type": "checkout.complete", "data": {"amount": 10}}),
            "sqs",
        );
        let event = msg.into_event().expect("event with a type");
        assert_eq!(event.event_type.as_str(), "checkout.complete");
        assert_eq!(event.data["amount"], 10);
        assert_eq!(event.message_id, "m1");
    }

    #[test]
    fn test_message_without_type_has_no_event() {
        let msg = Message::new("m2", serde_json::json!({"amount": 10}), "webhook");
        assert!(msg.into_event().is_none());
    }
}
