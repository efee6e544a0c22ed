//! Domain types for the MQTT governance proxy
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession and improve type safety throughout the codebase.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Non-empty, size-bounded MQTT topic name as carried by an inbound message.
///
/// Per MQTT topic rules: no wildcard characters, no NUL bytes, length
/// bounded to 65535 bytes, and no empty trailing level.
#[nutype(
    validate(predicate = |topic: &str| is_valid_concrete_topic(topic)),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct TopicName(String);

fn is_valid_concrete_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= 65535
        && !topic.contains('\0')
        && !topic.contains('+')
        && !topic.contains('#')
        && !topic.ends_with('/')
}

/// MQTT client identifier, matching `^[A-Za-z0-9_-]{1,23}$` when present.
#[nutype(
    validate(predicate = |id: &str| id.is_empty() || is_valid_client_id(id)),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default, TryFrom, Into)
)]
pub struct ClientId(String);

fn is_valid_client_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 23
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Opaque, non-empty identifier naming a compiled schema.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct SchemaId(String);

/// 128-bit monotonically allocated quarantine record identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct QuarantineId(Uuid);

impl QuarantineId {
    /// Creates a new random quarantine record ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Maximum accepted message payload size, 1 KiB .. 100 MiB, default 1 MiB.
#[nutype(
    validate(greater_or_equal = 1024, less_or_equal = 104_857_600),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 1_048_576
)]
pub struct MaxMessageSizeBytes(usize);

impl MaxMessageSizeBytes {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Bounded work queue capacity fed by the subscriber callback, default 10000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 10_000
)]
pub struct MessageBufferSize(usize);

impl MessageBufferSize {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Number of worker tasks in the pipeline pool, default 4.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 256),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 4
)]
pub struct WorkerThreadCount(usize);

impl WorkerThreadCount {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Bounded LRU validation cache size, default 1000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 1000
)]
pub struct ValidationCacheSize(usize);

impl ValidationCacheSize {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Quarantine retention window in days, default 30.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3650),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 30
)]
pub struct CleanupDays(u32);

impl CleanupDays {
    /// Converts the retention window to a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.into_inner()) * 86_400)
    }
}

/// Graceful shutdown drain budget in seconds, default 30.
#[nutype(
    validate(greater_or_equal = 0, less_or_equal = 3600),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 30
)]
pub struct ShutdownTimeoutSecs(u64);

impl ShutdownTimeoutSecs {
    /// Converts to `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Per-message soft processing deadline in seconds, default 5.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 600),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 5
)]
pub struct MessageTimeoutSecs(u64);

impl MessageTimeoutSecs {
    /// Converts to `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Per-client token bucket rate, in messages per second.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 100
)]
pub struct RateLimitPerSecond(u32);

impl RateLimitPerSecond {
    /// Gets the value as u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Connection pool size for the quarantine metadata index.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 10
)]
pub struct ConnectionPoolSize(usize);

impl ConnectionPoolSize {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Soft ceiling on total quarantine storage size, in bytes.
#[nutype(
    validate(greater_or_equal = 1_048_576),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct MaxQuarantineBytes(u64);

impl MaxQuarantineBytes {
    /// Gets the value as u64.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// How often the daemon runs a background quarantine retention sweep, in
/// seconds, default 3600 (one hour).
#[nutype(
    validate(greater_or_equal = 60, less_or_equal = 86_400),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
        Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 3600
)]
pub struct SweepIntervalSecs(u64);

impl SweepIntervalSecs {
    /// Converts to `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}
