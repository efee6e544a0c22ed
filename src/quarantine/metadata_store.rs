//! Relational metadata index for quarantined messages, backed by the
//! embedded `SQLite` pool managed in [`crate::database`].

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain_types::{ClientId, QuarantineId, SchemaId, TopicName};
use crate::message::Qos;

use super::{QuarantineReason, QuarantineRecord};

/// Filters applied to [`MetadataStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Restrict to a single reason, if set.
    pub reason: Option<QuarantineReason>,
    /// Restrict to rows quarantined at or after this time, if set.
    pub since: Option<DateTime<Utc>>,
}

/// A page request for [`MetadataStore::list`].
#[derive(Debug, Clone, Copy)]
pub struct QuarantinePage {
    /// Maximum rows to return.
    pub limit: u32,
    /// Rows to skip before the returned page.
    pub offset: u32,
}

/// Imperative-shell wrapper around the `quarantined_messages` table.
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Wraps an already-migrated connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts `record`. The caller is responsible for having already
    /// durably written the referenced blob.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the insert fails.
    pub async fn insert(&self, record: &QuarantineRecord) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO quarantined_messages \
             (id, received_at, quarantined_at, topic, client_id, qos, retain, reason, detail, schema_id, payload_ref, payload_size) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(record.id.to_string())
        .bind(record.received_at.timestamp())
        .bind(record.quarantined_at.timestamp())
        .bind(record.topic.to_string())
        .bind(record.client_id.to_string())
        .bind(i64::from(record.qos.as_u8()))
        .bind(record.retain)
        .bind(record.reason.to_string())
        .bind(record.detail.clone())
        .bind(record.schema_id.as_ref().map(ToString::to_string))
        .bind(record.payload_ref.clone())
        .bind(record.payload_size as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Lists rows matching `filter`, newest first, paginated.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the query fails.
    pub async fn list(
        &self,
        filter: &RecordFilter,
        page: QuarantinePage,
    ) -> sqlx::Result<Vec<QuarantineRecord>> {
        let reason_filter = filter.reason.map(|r| r.to_string());
        let since_filter = filter.since.map(|t| t.timestamp());

        let rows = sqlx::query(
            "SELECT id, received_at, quarantined_at, topic, client_id, qos, retain, reason, detail, schema_id, payload_ref, payload_size \
             FROM quarantined_messages \
             WHERE (?1 IS NULL OR reason = ?1) AND (?2 IS NULL OR quarantined_at >= ?2) \
             ORDER BY quarantined_at DESC \
             LIMIT ?3 OFFSET ?4",
        )
        .bind(reason_filter)
        .bind(since_filter)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Deletes rows with `quarantined_at < older_than`, returning the count
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the delete fails.
    pub async fn delete_older_than(&self, older_than: DateTime<Utc>) -> sqlx::Result<u64> {
        let result =
            sqlx::query("DELETE FROM quarantined_messages WHERE quarantined_at < ?1")
                .bind(older_than.timestamp())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Evicts the oldest rows until the sum of `payload_size` is at or below
    /// `max_bytes`, returning the count removed.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the query or delete fails.
    pub async fn evict_oldest_until_under(&self, max_bytes: u64) -> sqlx::Result<u64> {
        let total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(payload_size), 0) FROM quarantined_messages")
                .fetch_one(&self.pool)
                .await?;
        let mut over_by = (total as i128) - (max_bytes as i128);
        if over_by <= 0 {
            return Ok(0);
        }

        let ids: Vec<(String, i64)> = sqlx::query_as(
            "SELECT id, payload_size FROM quarantined_messages ORDER BY quarantined_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0u64;
        for (id, size) in ids {
            if over_by <= 0 {
                break;
            }
            sqlx::query("DELETE FROM quarantined_messages WHERE id = ?1")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            over_by -= i128::from(size);
            removed += 1;
        }
        Ok(removed)
    }

    /// All distinct `payload_ref` values still referenced by a row, used to
    /// identify orphaned blobs.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the query fails.
    pub async fn distinct_payload_refs(&self) -> sqlx::Result<HashSet<String>> {
        let refs: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT payload_ref FROM quarantined_messages")
                .fetch_all(&self.pool)
                .await?;
        Ok(refs.into_iter().collect())
    }

    /// Cheap liveness probe for the `/health` endpoint: whether the pool
    /// still accepts a trivial query.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<QuarantineRecord> {
    let id: String = row.try_get("id")?;
    let topic: String = row.try_get("topic")?;
    let client_id: String = row.try_get("client_id")?;
    let qos: i64 = row.try_get("qos")?;
    let reason: String = row.try_get("reason")?;
    let schema_id: Option<String> = row.try_get("schema_id")?;
    let received_at: i64 = row.try_get("received_at")?;
    let quarantined_at: i64 = row.try_get("quarantined_at")?;

    Ok(QuarantineRecord {
        id: id
            .parse::<uuid::Uuid>()
            .map(QuarantineId::from)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        received_at: Utc
            .timestamp_opt(received_at, 0)
            .single()
            .unwrap_or_else(Utc::now),
        quarantined_at: Utc
            .timestamp_opt(quarantined_at, 0)
            .single()
            .unwrap_or_else(Utc::now),
        topic: TopicName::try_new(topic).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        client_id: ClientId::try_new(client_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        qos: Qos::from_u8(qos as u8).unwrap_or(Qos::AtMostOnce),
        retain: row.try_get::<bool, _>("retain")?,
        reason: parse_reason(&reason),
        detail: row.try_get("detail")?,
        schema_id: schema_id
            .map(SchemaId::try_new)
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        payload_ref: row.try_get("payload_ref")?,
        payload_size: row.try_get::<i64, _>("payload_size")? as u64,
    })
}

fn parse_reason(s: &str) -> QuarantineReason {
    match s {
        "topic_not_allowed" => QuarantineReason::TopicNotAllowed,
        "no_schema_bound" => QuarantineReason::NoSchemaBound,
        "schema_compile_error" => QuarantineReason::SchemaCompileError,
        "schema_validation_error" => QuarantineReason::SchemaValidationError,
        "payload_too_large" => QuarantineReason::PayloadTooLarge,
        "rate_limited" => QuarantineReason::RateLimited,
        "upstream_unavailable" => QuarantineReason::UpstreamUnavailable,
        _ => QuarantineReason::InternalError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};

    async fn test_store() -> (MetadataStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = DatabasePath::new(dir.path().join("quarantine.db")).unwrap();
        let config = DatabaseConfig::for_testing(path);
        let connection = DatabaseConnection::initialize(config).await.unwrap();
        (MetadataStore::new(connection.pool().clone()), dir)
    }

    fn sample_record(payload_ref: &str, quarantined_at: DateTime<Utc>, size: u64) -> QuarantineRecord {
        QuarantineRecord {
            id: QuarantineId::generate(),
            received_at: quarantined_at,
            quarantined_at,
            topic: TopicName::try_new("devices/x/telemetry".to_string()).unwrap(),
            client_id: ClientId::try_new("sensor-1".to_string()).unwrap(),
            qos: Qos::AtLeastOnce,
            retain: false,
            reason: QuarantineReason::SchemaValidationError,
            detail: Some("/temperature: expected number".to_string()),
            schema_id: Some(SchemaId::try_new("telemetry-v1".to_string()).unwrap()),
            payload_ref: payload_ref.to_string(),
            payload_size: size,
        }
    }

    #[tokio::test]
    async fn inserts_and_lists_newest_first() {
        let (store, _dir) = test_store().await;
        let older = sample_record("ref-old", Utc.timestamp_opt(1_000, 0).unwrap(), 10);
        let newer = sample_record("ref-new", Utc.timestamp_opt(2_000, 0).unwrap(), 10);
        store.insert(&older).await.unwrap();
        store.insert(&newer).await.unwrap();

        let page = store
            .list(
                &RecordFilter::default(),
                QuarantinePage {
                    limit: 10,
                    offset: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].payload_ref, "ref-new");
    }

    #[tokio::test]
    async fn deletes_older_than_cutoff() {
        let (store, _dir) = test_store().await;
        let old = sample_record("ref-old", Utc.timestamp_opt(1_000, 0).unwrap(), 10);
        store.insert(&old).await.unwrap();

        let removed = store
            .delete_older_than(Utc.timestamp_opt(5_000, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn evicts_oldest_first_when_over_size() {
        let (store, _dir) = test_store().await;
        let a = sample_record("ref-a", Utc.timestamp_opt(1_000, 0).unwrap(), 100);
        let b = sample_record("ref-b", Utc.timestamp_opt(2_000, 0).unwrap(), 100);
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let removed = store.evict_oldest_until_under(100).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = store.distinct_payload_refs().await.unwrap();
        assert!(remaining.contains("ref-b"));
        assert!(!remaining.contains("ref-a"));
    }
}
