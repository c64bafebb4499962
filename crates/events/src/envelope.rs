use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Event;

/// Envelope for an integration event.
///
/// Carries the metadata a consumer needs to deduplicate and route the payload:
/// a unique `event_id`, the stable `event_type` and its schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        event_type: impl Into<String>,
        event_version: u32,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            event_version,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap a typed event, assigning a fresh UUIDv7 event id.
    pub fn wrap(event: E) -> Self {
        Self::new(
            Uuid::now_v7(),
            event.event_type(),
            event.version(),
            event.occurred_at(),
            event,
        )
    }
}

impl<E: Serialize> EventEnvelope<E> {
    /// Erase the payload type (e.g. before handing it to an outbox or a log).
    pub fn to_json(&self) -> Result<EventEnvelope<serde_json::Value>, serde_json::Error> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            payload: serde_json::to_value(&self.payload)?,
        })
    }
}
