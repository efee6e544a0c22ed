//! End-to-end exercise of the quarantine store: write, list with filters,
//! and a retention sweep that purges rows past their retention window.

use chrono::Utc;

use mqtt_governance_proxy::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use mqtt_governance_proxy::domain_types::{ClientId, QuarantineId, SchemaId, TopicName};
use mqtt_governance_proxy::message::Qos;
use mqtt_governance_proxy::quarantine::{
    BlobStore, MetadataStore, PayloadCompression, QuarantinePage, QuarantineRecord,
    QuarantineReason, QuarantineStore, RecordFilter,
};

async fn stores(dir: &tempfile::TempDir) -> (MetadataStore, BlobStore) {
    let db_path = DatabasePath::new(dir.path().join("quarantine.db")).unwrap();
    let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(db_path))
        .await
        .unwrap();
    let metadata = MetadataStore::new(connection.pool().clone());
    let blobs = BlobStore::new(dir.path().join("blobs"), PayloadCompression::None)
        .await
        .unwrap();
    (metadata, blobs)
}

fn topic(name: &str) -> TopicName {
    TopicName::try_new(name.to_string()).unwrap()
}

fn client(name: &str) -> ClientId {
    ClientId::try_new(name.to_string()).unwrap()
}

fn schema(name: &str) -> SchemaId {
    SchemaId::try_new(name.to_string()).unwrap()
}

#[tokio::test]
async fn quarantines_and_lists_records_with_a_reason_filter() {
    let dir = tempfile::tempdir().unwrap();
    let (metadata, blobs) = stores(&dir).await;
    let store = QuarantineStore::new(metadata, blobs);

    store
        .quarantine(
            topic("devices/1/telemetry"),
            client("device-1"),
            Qos::AtLeastOnce,
            false,
            Utc::now(),
            QuarantineReason::SchemaValidationError,
            Some("missing required field 'temperature'".to_string()),
            Some(schema("telemetry-v1")),
            br#"{"deviceId":"device-1"}"#,
        )
        .await
        .unwrap();

    store
        .quarantine(
            topic("devices/2/telemetry"),
            client("device-2"),
            Qos::AtMostOnce,
            false,
            Utc::now(),
            QuarantineReason::TopicNotAllowed,
            None,
            None,
            b"irrelevant payload",
        )
        .await
        .unwrap();

    let all = store
        .list(
            &RecordFilter::default(),
            QuarantinePage {
                limit: 10,
                offset: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let filter = RecordFilter {
        reason: Some(QuarantineReason::SchemaValidationError),
        since: None,
    };
    let filtered = store
        .list(
            &filter,
            QuarantinePage {
                limit: 10,
                offset: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].topic, topic("devices/1/telemetry"));
    assert_eq!(
        filtered[0].detail.as_deref(),
        Some("missing required field 'temperature'")
    );
}

/// Inserts a row directly through the metadata index, bypassing
/// [`QuarantineStore::quarantine`], so its `quarantined_at` can be backdated
/// the way a real row ages over time rather than always being "now".
async fn insert_backdated(
    metadata: &MetadataStore,
    blobs: &BlobStore,
    topic_name: &str,
    quarantined_at: chrono::DateTime<Utc>,
    payload: &[u8],
) {
    let payload_ref = blobs.write(payload).await.unwrap();
    let record = QuarantineRecord {
        id: QuarantineId::generate(),
        received_at: quarantined_at,
        quarantined_at,
        topic: topic(topic_name),
        client_id: client("device-old"),
        qos: Qos::AtLeastOnce,
        retain: false,
        reason: QuarantineReason::PayloadTooLarge,
        detail: None,
        schema_id: None,
        payload_ref,
        payload_size: payload.len() as u64,
    };
    metadata.insert(&record).await.unwrap();
}

#[tokio::test]
async fn purge_removes_rows_past_the_retention_cutoff() {
    let dir = tempfile::tempdir().unwrap();
    let (metadata, blobs) = stores(&dir).await;

    let old_time = Utc::now() - chrono::Duration::days(90);
    insert_backdated(
        &metadata,
        &blobs,
        "devices/old/telemetry",
        old_time,
        b"stale payload",
    )
    .await;

    let store = QuarantineStore::new(metadata, blobs);
    store
        .quarantine(
            topic("devices/fresh/telemetry"),
            client("device-fresh"),
            Qos::AtLeastOnce,
            false,
            Utc::now(),
            QuarantineReason::PayloadTooLarge,
            None,
            None,
            b"fresh payload",
        )
        .await
        .unwrap();

    let cutoff = Utc::now() - chrono::Duration::days(30);
    let purged = store.purge(cutoff, None).await.unwrap();
    assert_eq!(purged, 1);

    let remaining = store
        .list(
            &RecordFilter::default(),
            QuarantinePage {
                limit: 10,
                offset: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].topic, topic("devices/fresh/telemetry"));
}
