//! Event encoding, decoding, and shared types for the gRPC store backend.
//!
//! Pure data and conversion functions shared by the publish and
//! subscription paths. No network I/O occurs here.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::proto;

/// Current wall-clock time as Unix epoch milliseconds.
pub(crate) fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Cross-cutting metadata stamped on every event published through the bus.
///
/// Carried in the `metadata` bytes field of the wire `ProposedEvent` and
/// `RecordedEvent`. Both fields are optional; absent fields are omitted
/// from the serialized JSON entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Identity of the actor that caused the event (e.g. a user ID).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across streams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EventMetadata {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// An event proposed for appending, not yet assigned a position.
///
/// Immutable after creation. The event ID and producer timestamp are
/// assigned at construction; the store assigns the stream version and
/// global position when the append commits.
#[derive(Debug, Clone)]
pub struct ProposedEvent {
    /// Client-assigned UUID v4 event ID.
    pub event_id: Uuid,
    /// Event type tag (e.g. `"OrderPlaced"`).
    pub event_type: String,
    /// JSON payload.
    pub payload: Value,
    /// Cross-cutting metadata.
    pub metadata: EventMetadata,
    /// Producer-assigned timestamp, Unix epoch milliseconds.
    pub produced_at: u64,
}

impl ProposedEvent {
    /// Create a proposed event with a fresh event ID and the current
    /// producer timestamp.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use streambus::ProposedEvent;
    ///
    /// let event = ProposedEvent::new("OrderPlaced", json!({"total": 40}));
    /// assert_eq!(event.event_type, "OrderPlaced");
    /// ```
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            metadata: EventMetadata::default(),
            produced_at: unix_millis_now(),
        }
    }

    /// Attach metadata to the event.
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An event as recorded by the store and delivered to subscriptions.
///
/// All fields are pre-extracted from the wire `RecordedEvent`. Events
/// within one stream carry gapless, monotonic `stream_version` values in
/// append order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Owning stream key.
    pub stream_id: String,
    /// Zero-based, gapless version within the stream.
    pub stream_version: u64,
    /// Zero-based position in the global log.
    pub global_position: u64,
    /// Event type tag.
    pub event_type: String,
    /// Decoded JSON payload.
    pub payload: Value,
    /// Decoded metadata.
    pub metadata: EventMetadata,
    /// Producer-assigned timestamp, Unix epoch milliseconds.
    pub produced_at: u64,
    /// Store-assigned timestamp, Unix epoch milliseconds.
    pub recorded_at: u64,
}

/// Convert a [`ProposedEvent`] into the wire [`ProposedEvent`](proto::ProposedEvent).
///
/// Serializes the JSON payload and metadata as UTF-8 bytes. These
/// serializations are infallible for values that are already valid
/// `serde_json::Value` / [`EventMetadata`], so the empty-vec fallback
/// never triggers in practice.
pub(crate) fn to_proto_event(event: &ProposedEvent) -> proto::ProposedEvent {
    let payload = serde_json::to_vec(&event.payload).unwrap_or_default();
    let metadata = serde_json::to_vec(&event.metadata).unwrap_or_default();

    proto::ProposedEvent {
        event_id: event.event_id.to_string(),
        event_type: event.event_type.clone(),
        payload,
        metadata,
        produced_at: event.produced_at,
    }
}

/// Decode a wire [`RecordedEvent`](proto::RecordedEvent) into a [`StoredEvent`].
///
/// Returns `None` if the `event_id` is not a valid UUID or the payload
/// bytes are not valid JSON. Events written by foreign clients with
/// unparsable metadata keep their payload but get empty metadata rather
/// than being dropped, since per-stream gap-freedom matters more to
/// subscribers than metadata fidelity.
pub(crate) fn decode_stored_event(recorded: &proto::RecordedEvent) -> Option<StoredEvent> {
    let event_id = Uuid::parse_str(&recorded.event_id).ok()?;

    let payload = if recorded.payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&recorded.payload).ok()?
    };

    let metadata = if recorded.metadata.is_empty() {
        EventMetadata::default()
    } else {
        serde_json::from_slice(&recorded.metadata).unwrap_or_default()
    };

    Some(StoredEvent {
        event_id,
        stream_id: recorded.stream_id.clone(),
        stream_version: recorded.stream_version,
        global_position: recorded.global_position,
        event_type: recorded.event_type.clone(),
        payload,
        metadata,
        produced_at: recorded.produced_at,
        recorded_at: recorded.recorded_at,
    })
}
