// ABOUTME: Normalized inbound message event handed to agent handlers.
// ABOUTME: Decouples handlers from the transport library's native event types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A text message received by an agent session.
///
/// Transports convert their native events into this shape before dispatch, so a
/// handler never sees a matrix-sdk (or any other library) type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport event identifier
    pub event_id: String,
    /// Resident id of the sender (e.g. `@alice:example.org`)
    pub sender: String,
    /// Room the message was sent in
    pub room_id: String,
    /// Plain-text body
    pub body: String,
    /// Origin server timestamp in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// The untouched event as the transport delivered it
    pub raw: Value,
}

impl InboundMessage {
    pub fn new(
        event_id: impl Into<String>,
        sender: impl Into<String>,
        room_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            sender: sender.into(),
            room_id: room_id.into(),
            body: body.into(),
            timestamp_ms: 0,
            raw: Value::Null,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }

    /// True when the message was sent by the given resident
    pub fn is_from(&self, resident_id: &str) -> bool {
        self.sender == resident_id
    }
}
