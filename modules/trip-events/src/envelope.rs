//! # Trip Event Envelope
//!
//! The record carried on every trip channel. One JSON object per broker
//! message:
//!
//! ```json
//! {
//!   "id": "0b6f6d0e-...",
//!   "type": "trip.created",
//!   "trip_id": "t1",
//!   "user_id": "u1",
//!   "timestamp": "2024-05-01T12:00:00Z",
//!   "version": 1,
//!   "metadata": { "source": "trip-service" },
//!   "payload": { "name": "Lisbon" }
//! }
//! ```
//!
//! Producers may leave `id`, `timestamp` and `version` unset; the publisher
//! fills them in through [`Event::stamped`] before anything reaches the wire.
//! Readers ignore unknown top-level fields but reject unknown `type` values.

use crate::error::EventError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Actor id used by events that no human triggered (e.g. the weather loop)
pub const SYSTEM_USER_ID: &str = "system";

/// A `type` string outside the closed [`EventType`] enumeration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

macro_rules! event_types {
    ($($(#[$doc:meta])* $variant:ident => $wire:literal,)+) => {
        /// Closed set of trip event kinds
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum EventType {
            $($(#[$doc])* $variant,)+
        }

        impl EventType {
            /// Every kind, in declaration order
            pub const ALL: &'static [EventType] = &[$(EventType::$variant,)+];

            /// Wire name, e.g. `trip.created`
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventType::$variant => $wire,)+
                }
            }
        }

        impl FromStr for EventType {
            type Err = UnknownEventType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(EventType::$variant),)+
                    other => Err(UnknownEventType(other.to_string())),
                }
            }
        }
    };
}

event_types! {
    TripCreated => "trip.created",
    TripUpdated => "trip.updated",
    TripDeleted => "trip.deleted",
    TripStatusChanged => "trip.status.changed",
    MemberAdded => "member.added",
    MemberRemoved => "member.removed",
    MemberRoleChanged => "member.role.changed",
    InvitationCreated => "invitation.created",
    InvitationAccepted => "invitation.accepted",
    InvitationRejected => "invitation.rejected",
    ChatMessageSent => "chat.message.sent",
    ChatMessageEdited => "chat.message.edited",
    ChatMessageDeleted => "chat.message.deleted",
    ChatReactionAdded => "chat.reaction.added",
    ChatReactionRemoved => "chat.reaction.removed",
    ChatLastReadUpdated => "chat.last_read.updated",
    WeatherUpdated => "weather.updated",
    /// Severe weather warning for a trip destination
    WeatherAlert => "weather.alert",
    LocationUpdated => "location.updated",
    TodoCreated => "todo.created",
    TodoUpdated => "todo.updated",
    TodoDeleted => "todo.deleted",
    TodoCompleted => "todo.completed",
    DestinationChanged => "destination.changed",
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Producer and tracing metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Service that produced the event (required)
    #[serde(default)]
    pub source: String,

    /// Links related events in one business flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Id of the event or command that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// A trip-scoped domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id; empty until stamped
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Partition key; must equal the routing key given to publish
    #[serde(default)]
    pub trip_id: String,

    /// Acting user, or [`SYSTEM_USER_ID`]
    #[serde(default)]
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Schema version; 0 means unset
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub metadata: EventMetadata,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Create an unstamped event with an empty payload
    pub fn new(
        event_type: EventType,
        trip_id: impl Into<String>,
        user_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            event_type,
            trip_id: trip_id.into(),
            user_id: user_id.into(),
            timestamp: None,
            version: 0,
            metadata: EventMetadata {
                source: source.into(),
                ..EventMetadata::default()
            },
            payload: serde_json::Value::Null,
        }
    }

    /// Set an explicit id (useful for testing and idempotent producers)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.metadata.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.tags.insert(key.into(), value.into());
        self
    }

    /// Check the envelope against the routing key it is published under
    pub fn validate(&self, routing_trip_id: &str) -> Result<(), EventError> {
        if self.trip_id.is_empty() {
            return Err(EventError::Validation("trip_id is required".to_string()));
        }
        if self.user_id.is_empty() {
            return Err(EventError::Validation("user_id is required".to_string()));
        }
        if self.metadata.source.is_empty() {
            return Err(EventError::Validation(
                "metadata.source is required".to_string(),
            ));
        }
        if self.trip_id != routing_trip_id {
            return Err(EventError::Validation(format!(
                "event trip_id '{}' does not match routing key '{}'",
                self.trip_id, routing_trip_id
            )));
        }
        Ok(())
    }

    /// Fill in a missing id, timestamp and version
    ///
    /// Fields that are already set are kept, so stamping twice is a no-op.
    pub fn stamped(mut self) -> Self {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
        if self.version == 0 {
            self.version = 1;
        }
        self
    }

    pub fn is_stamped(&self) -> bool {
        !self.id.is_empty() && self.timestamp.is_some() && self.version > 0
    }

    /// Serialize to the wire representation
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(EventError::Serialization)
    }

    /// Parse a wire message
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
