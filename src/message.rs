//! The unit of work flowing through the pipeline.

use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::domain_types::{ClientId, TopicName};

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Qos {
    /// At most once delivery.
    AtMostOnce,
    /// At least once delivery.
    AtLeastOnce,
    /// Exactly once delivery.
    ExactlyOnce,
}

impl Qos {
    /// Converts to the wire-level numeric QoS value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    /// Parses a wire-level numeric QoS value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }
}

/// A message ingested from the subscriber broker connection.
///
/// Constructed by the subscriber callback and moved through the pipeline
/// unmodified; terminal decisions carry additional metadata alongside the
/// message, never inside it.
#[derive(Debug, Clone)]
pub struct Message {
    topic: TopicName,
    payload: bytes::Bytes,
    qos: Qos,
    retain: bool,
    client_id: ClientId,
    received_at: Instant,
    received_at_wall: DateTime<Utc>,
}

impl Message {
    /// Constructs a new message at ingress.
    #[must_use]
    pub fn new(
        topic: TopicName,
        payload: bytes::Bytes,
        qos: Qos,
        retain: bool,
        client_id: ClientId,
    ) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain,
            client_id,
            received_at: Instant::now(),
            received_at_wall: Utc::now(),
        }
    }

    /// The topic the message was published to.
    #[must_use]
    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    /// The raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &bytes::Bytes {
        &self.payload
    }

    /// The message's own QoS, forwarded unchanged on publish.
    #[must_use]
    pub fn qos(&self) -> Qos {
        self.qos
    }

    /// Whether the message was published with the retain flag set.
    #[must_use]
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// The originating publisher's client identifier, empty if unknown.
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Monotonic ingress timestamp, used for latency accounting.
    #[must_use]
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Wall-clock ingress timestamp, used for audit records and quarantine
    /// rows where a monotonic instant can't be persisted.
    #[must_use]
    pub fn received_at_wall(&self) -> DateTime<Utc> {
        self.received_at_wall
    }
}
