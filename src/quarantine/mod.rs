//! Durable quarantine of rejected messages: a metadata index plus a
//! content-addressed payload blob store.

mod blob_store;
mod metadata_store;

pub use blob_store::{BlobStore, PayloadCompression};
pub use metadata_store::{MetadataStore, QuarantinePage, RecordFilter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain_types::{ClientId, MaxQuarantineBytes, QuarantineId, SchemaId, TopicName};
use crate::message::Qos;

/// Why a message was quarantined instead of forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    /// No configured topic pattern matched, or a client allow-list rejected it.
    TopicNotAllowed,
    /// The topic matched but no schema is bound to it.
    NoSchemaBound,
    /// The bound schema failed to compile (should only occur transiently
    /// during a partial reload).
    SchemaCompileError,
    /// The payload failed schema validation.
    SchemaValidationError,
    /// The payload exceeded `max_message_size`.
    PayloadTooLarge,
    /// The publishing client exceeded its rate limit.
    RateLimited,
    /// The upstream broker publish failed or timed out.
    UpstreamUnavailable,
    /// An unexpected internal error occurred while processing the message.
    InternalError,
}

impl std::fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QuarantineReason::TopicNotAllowed => "topic_not_allowed",
            QuarantineReason::NoSchemaBound => "no_schema_bound",
            QuarantineReason::SchemaCompileError => "schema_compile_error",
            QuarantineReason::SchemaValidationError => "schema_validation_error",
            QuarantineReason::PayloadTooLarge => "payload_too_large",
            QuarantineReason::RateLimited => "rate_limited",
            QuarantineReason::UpstreamUnavailable => "upstream_unavailable",
            QuarantineReason::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// An append-only quarantine row. Never updated after insertion; purged in
/// bulk by the retention sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineRecord {
    /// Monotonically allocated identifier.
    pub id: QuarantineId,
    /// When the message was received at ingress.
    pub received_at: DateTime<Utc>,
    /// When the message was quarantined.
    pub quarantined_at: DateTime<Utc>,
    /// The message's topic.
    pub topic: TopicName,
    /// The originating client id, if known.
    pub client_id: ClientId,
    /// The message's QoS level.
    pub qos: Qos,
    /// The message's retain flag.
    pub retain: bool,
    /// Why the message was quarantined.
    pub reason: QuarantineReason,
    /// Human-readable diagnostic, e.g. the first validation error path.
    pub detail: Option<String>,
    /// The schema consulted, if any.
    pub schema_id: Option<SchemaId>,
    /// Content-addressed reference into the payload blob store.
    pub payload_ref: String,
    /// Size of the original (uncompressed) payload, in bytes.
    pub payload_size: u64,
}

/// Errors raised by quarantine operations.
#[derive(Debug, Error)]
pub enum QuarantineError {
    /// The metadata index rejected the write or read.
    #[error("quarantine metadata store error: {0}")]
    Metadata(#[from] sqlx::Error),

    /// The blob store failed to write or read a payload.
    #[error("quarantine blob store error: {0}")]
    Blob(#[from] std::io::Error),
}

/// Combines the metadata index and the blob store into the single
/// `quarantine(record_meta, payload) → id`, `list`, `purge` contract.
pub struct QuarantineStore {
    metadata: MetadataStore,
    blobs: BlobStore,
}

impl QuarantineStore {
    /// Builds a store from an already-initialized metadata index and blob
    /// store.
    #[must_use]
    pub fn new(metadata: MetadataStore, blobs: BlobStore) -> Self {
        Self { metadata, blobs }
    }

    /// Writes the payload blob (deduplicating on content hash) and then the
    /// metadata row, fsyncing both before returning.
    ///
    /// # Errors
    ///
    /// Returns [`QuarantineError`] if the blob write or the metadata insert
    /// fails. A blob write that succeeds followed by a metadata failure
    /// leaves an orphaned blob, reclaimed later by [`BlobStore::reap_orphans`].
    pub async fn quarantine(
        &self,
        topic: TopicName,
        client_id: ClientId,
        qos: Qos,
        retain: bool,
        received_at: DateTime<Utc>,
        reason: QuarantineReason,
        detail: Option<String>,
        schema_id: Option<SchemaId>,
        payload: &[u8],
    ) -> Result<QuarantineId, QuarantineError> {
        let payload_ref = self.blobs.write(payload).await?;
        let record = QuarantineRecord {
            id: QuarantineId::generate(),
            received_at,
            quarantined_at: Utc::now(),
            topic,
            client_id,
            qos,
            retain,
            reason,
            detail,
            schema_id,
            payload_ref,
            payload_size: payload.len() as u64,
        };
        self.metadata.insert(&record).await?;
        Ok(record.id)
    }

    /// Lists quarantined records matching `filter`, paginated.
    ///
    /// # Errors
    ///
    /// Returns [`QuarantineError`] if the metadata index query fails.
    pub async fn list(
        &self,
        filter: &RecordFilter,
        page: QuarantinePage,
    ) -> Result<Vec<QuarantineRecord>, QuarantineError> {
        Ok(self.metadata.list(filter, page).await?)
    }

    /// Purges rows older than `older_than`, plus any that exceed
    /// `max_size` on an oldest-first basis, then unlinks blobs left with no
    /// referring row.
    ///
    /// # Errors
    ///
    /// Returns [`QuarantineError`] if the metadata sweep or blob reaping
    /// fails.
    pub async fn purge(
        &self,
        older_than: DateTime<Utc>,
        max_size: Option<MaxQuarantineBytes>,
    ) -> Result<u64, QuarantineError> {
        let mut purged = self.metadata.delete_older_than(older_than).await?;
        if let Some(max_size) = max_size {
            purged += self
                .metadata
                .evict_oldest_until_under(max_size.as_u64())
                .await?;
        }
        let live_refs = self.metadata.distinct_payload_refs().await?;
        self.blobs.reap_orphans(&live_refs).await?;
        Ok(purged)
    }

    /// Whether the metadata index currently accepts queries, for the
    /// `/health` endpoint's quarantine component.
    pub async fn is_writable(&self) -> bool {
        self.metadata.ping().await
    }
}
