//! The unit of ingested telemetry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::buffer::BufferCategory;

/// One ingested unit of data, tagged with its source category and origin.
///
/// An envelope is produced by an ingestor on receipt of one inbound unit
/// (one MQTT publish or one raw frame), is immutable after creation, and is
/// consumed exactly once by the drain worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Which transport produced this envelope.
    pub category: BufferCategory,
    /// Opaque identifier of the producing client (MQTT client id or peer
    /// socket address).
    pub origin: String,
    /// The message payload, opaque to the hub.
    pub payload: Vec<u8>,
    /// When the ingestor received the unit.
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    /// Builds an envelope stamped with the current time.
    pub fn new(category: BufferCategory, origin: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            category,
            origin: origin.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}
