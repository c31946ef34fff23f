//! Application message type carried through the durable queue and onto the wire.

use bytes::Bytes;
use std::collections::HashMap;

/// An opaque application message.
///
/// The core never interprets `properties` or `event_time`; they ride along
/// for the broker's benefit only.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Optional partition/dedup key.
    pub key: Option<Bytes>,
    /// Message payload.
    pub value: Bytes,
    /// Arbitrary user properties, passed through unexamined.
    pub properties: HashMap<String, String>,
    /// Event-time in epoch millis, if the caller supplied one.
    pub event_time: Option<u64>,
}

impl Message {
    /// Build a message from a value with no key or properties.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
            properties: HashMap::new(),
            event_time: None,
        }
    }

    /// Attach a key.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attach an event-time.
    pub fn with_event_time(mut self, event_time: u64) -> Self {
        self.event_time = Some(event_time);
        self
    }
}
