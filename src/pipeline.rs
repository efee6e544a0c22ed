//! The proxy core: subscriber → validate → {forward, quarantine}, running
//! over a bounded queue and a pool of workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::audit::{AuditRecord, AuditSink, Decision};
use crate::broker::{BrokerClient, ConnectionState, MessageHandler};
use crate::domain_types::{ClientId, MaxMessageSizeBytes, MessageBufferSize, SchemaId, TopicName, WorkerThreadCount};
use crate::message::{Message, Qos};
use crate::metrics::{MessageStatus, MetricsRegistry, ValidationResult};
use crate::quarantine::{QuarantineReason, QuarantineStore};
use crate::rate_limit::RateLimiter;
use crate::schema::{SchemaRegistry, ValidationMode};
use crate::topic::{MatchOutcome, TopicMatcher};

/// The subset of a config snapshot the pipeline hot-swaps at message
/// boundaries. Everything else (broker connections, storage paths) is fixed
/// for the process lifetime and requires a restart to change.
pub struct PipelineSnapshot {
    /// Matches topics to bound schema ids, including per-client allow-lists.
    pub matcher: Arc<TopicMatcher>,
    /// Skips the forward step but still validates and audits.
    pub dry_run: bool,
    /// Rejects payloads larger than this as `PayloadTooLarge`.
    pub max_message_size: MaxMessageSizeBytes,
    /// Per-message soft processing deadline.
    pub message_timeout: Duration,
    /// Enforcement strictness applied to schema validation.
    pub validation_mode: ValidationMode,
}

/// The proxy core. Owns the ingress queue, worker pool, and references to
/// every component it orchestrates.
pub struct Pipeline {
    snapshot: ArcSwap<PipelineSnapshot>,
    schema_registry: Arc<SchemaRegistry>,
    quarantine: Arc<QuarantineStore>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditSink>,
    metrics: Arc<MetricsRegistry>,
    publisher: Arc<BrokerClient>,
    subscriber: Arc<BrokerClient>,
    sender: mpsc::Sender<Message>,
    receiver: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    cancel: CancellationToken,
    dropped_backpressure: AtomicU64,
}

struct IngressHandler {
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl MessageHandler for IngressHandler {
    async fn handle(&self, topic: &str, payload: Bytes, qos: Qos, retain: bool) {
        self.pipeline.ingest(topic, payload, qos, retain).await;
    }
}

impl Pipeline {
    /// Assembles a pipeline from its already-constructed components.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        initial: PipelineSnapshot,
        buffer_size: MessageBufferSize,
        schema_registry: Arc<SchemaRegistry>,
        quarantine: Arc<QuarantineStore>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditSink>,
        metrics: Arc<MetricsRegistry>,
        publisher: Arc<BrokerClient>,
        subscriber: Arc<BrokerClient>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size.as_usize());
        Self {
            snapshot: ArcSwap::from_pointee(initial),
            schema_registry,
            quarantine,
            rate_limiter,
            audit,
            metrics,
            publisher,
            subscriber,
            sender,
            receiver: tokio::sync::Mutex::new(Some(receiver)),
            cancel: CancellationToken::new(),
            dropped_backpressure: AtomicU64::new(0),
        }
    }

    /// Installs a new configuration snapshot, observed by workers at their
    /// next message boundary.
    pub fn reload(&self, snapshot: PipelineSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Number of messages dropped because the ingress queue stayed full
    /// past `message_timeout`.
    #[must_use]
    pub fn dropped_backpressure_count(&self) -> u64 {
        self.dropped_backpressure.load(Ordering::Relaxed)
    }

    /// Subscribes the subscriber connection to every configured topic
    /// filter and starts `worker_count` worker tasks consuming the ingress
    /// queue. Runs until [`Pipeline::stop`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber connection fails to subscribe to
    /// one of `topic_filters`.
    pub async fn run(
        self: &Arc<Self>,
        topic_filters: &[String],
        worker_count: WorkerThreadCount,
    ) -> Result<(), crate::broker::BrokerError> {
        let handler: Arc<dyn MessageHandler> = Arc::new(IngressHandler {
            pipeline: Arc::clone(self),
        });

        for filter in topic_filters {
            self.subscriber
                .subscribe(filter, Qos::AtLeastOnce, Arc::clone(&handler))
                .await?;
        }

        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .expect("Pipeline::run must only be called once");
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut workers = Vec::with_capacity(worker_count.as_usize());
        for _ in 0..worker_count.as_usize() {
            let pipeline = Arc::clone(self);
            let receiver = Arc::clone(&receiver);
            workers.push(tokio::spawn(async move {
                pipeline.worker_loop(receiver).await;
            }));
        }

        self.cancel.cancelled().await;
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }

    /// Signals workers to stop after their current item and the subscriber
    /// to stop accepting new messages.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Enqueues an inbound publish, blocking up to `message_timeout` if the
    /// work queue is full. Past the deadline the message is dropped and
    /// counted under `dropped_backpressure` rather than applying further
    /// backpressure to the broker connection.
    async fn ingest(&self, topic: &str, payload: Bytes, qos: Qos, retain: bool) {
        let Ok(topic_name) = TopicName::try_new(topic.to_string()) else {
            warn!(%topic, "dropping inbound publish with malformed topic");
            self.metrics.record_message(MessageStatus::Dropped);
            return;
        };
        let message = Message::new(topic_name, payload, qos, retain, ClientId::default());
        let timeout = self.snapshot.load().message_timeout;

        match tokio::time::timeout(timeout, self.sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                warn!("ingress queue closed while enqueuing message");
            }
            Err(_) => {
                self.dropped_backpressure.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_message(MessageStatus::Dropped);
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>) {
        loop {
            let message = {
                let mut guard = receiver.lock().await;
                tokio::select! {
                    msg = guard.recv() => msg,
                    () = self.cancel.cancelled() => None,
                }
            };
            let Some(message) = message else {
                return;
            };
            self.process_one(message).await;
        }
    }

    async fn process_one(&self, message: Message) {
        let started = Instant::now();
        let snapshot = self.snapshot.load_full();

        // Step 1: size check.
        if message.payload().len() > snapshot.max_message_size.as_usize() {
            self.quarantine_and_audit(
                &message,
                QuarantineReason::PayloadTooLarge,
                Some(format!(
                    "payload size {} exceeds max_message_size {}",
                    message.payload().len(),
                    snapshot.max_message_size.as_usize()
                )),
                None,
                started,
            )
            .await;
            return;
        }

        // Steps 2-3: topic match and client rule.
        let topic_string = message.topic().to_string();
        let schema_id = match snapshot.matcher.matches(&topic_string, message.client_id()) {
            MatchOutcome::NoMatch | MatchOutcome::ClientRuleRejected => {
                self.quarantine_and_audit(
                    &message,
                    QuarantineReason::TopicNotAllowed,
                    None,
                    None,
                    started,
                )
                .await;
                return;
            }
            // Step 5: the topic is allow-listed but carries no schema binding.
            MatchOutcome::Matched(None) => {
                self.quarantine_and_audit(
                    &message,
                    QuarantineReason::NoSchemaBound,
                    None,
                    None,
                    started,
                )
                .await;
                return;
            }
            MatchOutcome::Matched(Some(schema_id)) => schema_id,
        };

        // Step 4: rate limit.
        if !self.rate_limiter.try_acquire(message.client_id()) {
            self.quarantine_and_audit(
                &message,
                QuarantineReason::RateLimited,
                None,
                Some(schema_id.clone()),
                started,
            )
            .await;
            return;
        }

        // Step 6: validate.
        let validation_started = Instant::now();
        let outcome = self
            .schema_registry
            .validate(&schema_id, message.payload(), snapshot.validation_mode);
        self.metrics
            .record_validation_duration(validation_started.elapsed());

        let mut warn_detail = None;
        match outcome {
            Ok(Ok(())) => {
                self.metrics
                    .record_schema_validation(&schema_id, ValidationResult::Pass);
                self.metrics.record_message(MessageStatus::Valid);
            }
            Ok(Err(validation_error)) => {
                self.metrics
                    .record_schema_validation(&schema_id, ValidationResult::Fail);
                self.metrics.record_message(MessageStatus::Invalid);

                if snapshot.validation_mode != ValidationMode::WarnOnly {
                    self.quarantine_and_audit(
                        &message,
                        QuarantineReason::SchemaValidationError,
                        Some(validation_error.message),
                        Some(schema_id),
                        started,
                    )
                    .await;
                    return;
                }

                warn!(
                    topic = %topic_string,
                    schema_id = %schema_id,
                    error = %validation_error.message,
                    "schema validation failed in warn-only mode; forwarding anyway"
                );
                warn_detail = Some(validation_error.message);
            }
            Err(e) => {
                warn!(error = %e, "schema registry error during validation");
                self.quarantine_and_audit(
                    &message,
                    QuarantineReason::SchemaCompileError,
                    Some(e.to_string()),
                    Some(schema_id),
                    started,
                )
                .await;
                return;
            }
        }

        // Step 7: forward.
        if snapshot.dry_run {
            self.audit(
                &message,
                Decision::Forwarded,
                None,
                Some(schema_id),
                warn_detail,
                started,
            );
            return;
        }

        let forward_started = Instant::now();
        let publish_result = self.publisher.publish(
            &topic_string,
            message.payload().clone(),
            message.qos(),
            message.retain(),
        );
        self.metrics
            .record_forward_duration(forward_started.elapsed());

        match publish_result {
            Ok(()) => {
                self.metrics.record_message(MessageStatus::Forwarded);
                self.audit(
                    &message,
                    Decision::Forwarded,
                    None,
                    Some(schema_id),
                    warn_detail,
                    started,
                );
            }
            Err(e) => {
                warn!(error = %e, "publish to upstream broker failed");
                self.quarantine_and_audit(
                    &message,
                    QuarantineReason::UpstreamUnavailable,
                    Some(e.to_string()),
                    Some(schema_id),
                    started,
                )
                .await;
            }
        }
    }

    async fn quarantine_and_audit(
        &self,
        message: &Message,
        reason: QuarantineReason,
        detail: Option<String>,
        schema_id: Option<SchemaId>,
        started: Instant,
    ) {
        let result = self
            .quarantine
            .quarantine(
                message.topic().clone(),
                message.client_id().clone(),
                message.qos(),
                message.retain(),
                message.received_at_wall(),
                reason,
                detail.clone(),
                schema_id.clone(),
                message.payload(),
            )
            .await;

        if let Err(e) = result {
            warn!(error = %e, "failed to write quarantine record");
        }

        self.metrics.record_quarantine(reason);
        self.metrics.record_message(MessageStatus::Dropped);
        self.audit(message, Decision::Quarantined, Some(reason), schema_id, detail, started);
    }

    fn audit(
        &self,
        message: &Message,
        decision: Decision,
        reason: Option<QuarantineReason>,
        schema_id: Option<SchemaId>,
        detail: Option<String>,
        started: Instant,
    ) {
        self.audit.emit(AuditRecord {
            ts: Utc::now(),
            decision,
            topic: message.topic().clone(),
            client_id: message.client_id().clone(),
            schema_id,
            reason,
            detail,
            duration_us: started.elapsed().as_micros() as u64,
        });
    }

    /// Whether both broker connections are `Connected` and the quarantine
    /// store accepted a liveness probe, for the `/health` endpoint.
    pub async fn is_healthy(&self) -> bool {
        self.subscriber.state() == ConnectionState::Connected
            && self.publisher.state() == ConnectionState::Connected
            && self.quarantine.is_writable().await
    }

    /// Per-component status, for `/health/detailed`.
    pub async fn detailed_status(&self) -> Vec<(&'static str, String)> {
        let quarantine_writable = self.quarantine.is_writable().await;
        vec![
            ("subscriber", format!("{:?}", self.subscriber.state())),
            ("publisher", format!("{:?}", self.publisher.state())),
            (
                "quarantine",
                if quarantine_writable {
                    "writable".to_string()
                } else {
                    "unwritable".to_string()
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::OnceLock;

    use crate::audit::AuditDestination;
    use crate::broker::{BrokerConfig, BrokerRole, Transport};
    use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
    use crate::quarantine::{BlobStore, MetadataStore, PayloadCompression, QuarantinePage, RecordFilter};
    use crate::schema::{JsonSchemaDraft, SchemaSource};
    use crate::topic::{SchemaBinding, TopicPattern};

    use super::*;

    fn metrics() -> Arc<MetricsRegistry> {
        static REGISTRY: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();
        Arc::clone(REGISTRY.get_or_init(|| {
            Arc::new(MetricsRegistry::install().expect("install metrics recorder once"))
        }))
    }

    async fn test_quarantine_store() -> (Arc<QuarantineStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = DatabasePath::new(dir.path().join("quarantine.db")).unwrap();
        let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(db_path))
            .await
            .unwrap();
        let metadata = MetadataStore::new(connection.pool().clone());
        let blobs = BlobStore::new(dir.path().join("blobs"), PayloadCompression::None)
            .await
            .unwrap();
        (Arc::new(QuarantineStore::new(metadata, blobs)), dir)
    }

    fn unreachable_broker_client(role: BrokerRole) -> Arc<BrokerClient> {
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            client_id: ClientId::try_new(format!("test-{role:?}")).unwrap(),
            keep_alive: Duration::from_secs(30),
            transport: Transport::Tcp,
            clean_session: true,
            channel_capacity: 16,
        };
        Arc::new(BrokerClient::new(role, config).unwrap())
    }

    fn schema_registry_with_object_schema(dir: &tempfile::TempDir, schema_id: &SchemaId) -> Arc<SchemaRegistry> {
        let path = dir.path().join("schema.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "type": "object",
                "properties": {"deviceId": {"type": "string"}},
                "required": ["deviceId"]
            })
            .to_string(),
        )
        .unwrap();
        let registry = SchemaRegistry::new(crate::domain_types::ValidationCacheSize::try_new(10).unwrap());
        registry
            .load_all(&[SchemaSource::JsonSchema {
                id: schema_id.clone(),
                path,
                draft: JsonSchemaDraft::Draft07,
            }])
            .unwrap();
        Arc::new(registry)
    }

    async fn build_test_pipeline(
        dir: &tempfile::TempDir,
        dry_run: bool,
    ) -> (Arc<Pipeline>, Arc<QuarantineStore>, SchemaId) {
        build_test_pipeline_with_mode(dir, dry_run, ValidationMode::Strict).await
    }

    async fn build_test_pipeline_with_mode(
        dir: &tempfile::TempDir,
        dry_run: bool,
        validation_mode: ValidationMode,
    ) -> (Arc<Pipeline>, Arc<QuarantineStore>, SchemaId) {
        let schema_id = SchemaId::try_new("device-v1".to_string()).unwrap();
        let schema_registry = schema_registry_with_object_schema(dir, &schema_id);

        let binding = SchemaBinding::new(
            TopicPattern::compile("devices/+/telemetry").unwrap(),
            Some(schema_id.clone()),
        );
        let matcher = Arc::new(TopicMatcher::build(vec![binding], HashMap::new()));

        let (quarantine, _quarantine_dir) = test_quarantine_store().await;
        let rate_limiter = Arc::new(RateLimiter::new(
            crate::domain_types::RateLimitPerSecond::try_new(1000).unwrap(),
        ));
        let audit = Arc::new(AuditSink::spawn(AuditDestination::Stdout, 1024).unwrap());
        let metrics = metrics();

        let snapshot = PipelineSnapshot {
            matcher,
            dry_run,
            max_message_size: MaxMessageSizeBytes::try_new(1024).unwrap(),
            message_timeout: Duration::from_secs(1),
            validation_mode,
        };

        let pipeline = Arc::new(Pipeline::new(
            snapshot,
            MessageBufferSize::try_new(16).unwrap(),
            schema_registry,
            Arc::clone(&quarantine),
            rate_limiter,
            audit,
            metrics,
            unreachable_broker_client(BrokerRole::Publisher),
            unreachable_broker_client(BrokerRole::Subscriber),
        ));

        (pipeline, quarantine, schema_id)
    }

    fn client_id() -> ClientId {
        ClientId::try_new("sensor-1".to_string()).unwrap()
    }

    #[tokio::test]
    async fn oversized_payload_is_quarantined_as_payload_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, quarantine, _schema_id) = build_test_pipeline(&dir, true).await;

        let topic = TopicName::try_new("devices/a/telemetry".to_string()).unwrap();
        let message = Message::new(
            topic,
            Bytes::from(vec![0u8; 2048]),
            Qos::AtLeastOnce,
            false,
            client_id(),
        );
        pipeline.process_one(message).await;

        let records = quarantine
            .list(&RecordFilter::default(), QuarantinePage { limit: 10, offset: 0 })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, QuarantineReason::PayloadTooLarge);
    }

    #[tokio::test]
    async fn unmatched_topic_is_quarantined_as_topic_not_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, quarantine, _schema_id) = build_test_pipeline(&dir, true).await;

        let topic = TopicName::try_new("unrelated/topic".to_string()).unwrap();
        let message = Message::new(topic, Bytes::from_static(b"{}"), Qos::AtLeastOnce, false, client_id());
        pipeline.process_one(message).await;

        let records = quarantine
            .list(&RecordFilter::default(), QuarantinePage { limit: 10, offset: 0 })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, QuarantineReason::TopicNotAllowed);
    }

    #[tokio::test]
    async fn invalid_payload_is_quarantined_as_schema_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, quarantine, _schema_id) = build_test_pipeline(&dir, true).await;

        let topic = TopicName::try_new("devices/a/telemetry".to_string()).unwrap();
        let message = Message::new(topic, Bytes::from_static(b"{}"), Qos::AtLeastOnce, false, client_id());
        pipeline.process_one(message).await;

        let records = quarantine
            .list(&RecordFilter::default(), QuarantinePage { limit: 10, offset: 0 })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, QuarantineReason::SchemaValidationError);
    }

    #[tokio::test]
    async fn valid_payload_under_dry_run_is_forwarded_without_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, quarantine, _schema_id) = build_test_pipeline(&dir, true).await;

        let topic = TopicName::try_new("devices/a/telemetry".to_string()).unwrap();
        let message = Message::new(
            topic,
            Bytes::from_static(br#"{"deviceId":"d1"}"#),
            Qos::AtLeastOnce,
            false,
            client_id(),
        );
        pipeline.process_one(message).await;

        let records = quarantine
            .list(&RecordFilter::default(), QuarantinePage { limit: 10, offset: 0 })
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_client_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, quarantine, _schema_id) = build_test_pipeline(&dir, true).await;

        let topic = TopicName::try_new("devices/a/telemetry".to_string()).unwrap();
        for _ in 0..1000 {
            let message = Message::new(
                topic.clone(),
                Bytes::from_static(br#"{"deviceId":"d1"}"#),
                Qos::AtLeastOnce,
                false,
                client_id(),
            );
            pipeline.process_one(message).await;
        }
        let message = Message::new(
            topic,
            Bytes::from_static(br#"{"deviceId":"d1"}"#),
            Qos::AtLeastOnce,
            false,
            client_id(),
        );
        pipeline.process_one(message).await;

        let records = quarantine
            .list(&RecordFilter::default(), QuarantinePage { limit: 2000, offset: 0 })
            .await
            .unwrap();
        assert!(records.iter().any(|r| r.reason == QuarantineReason::RateLimited));
    }

    #[tokio::test]
    async fn topic_matched_with_no_schema_binding_is_quarantined_as_no_schema_bound() {
        let dir = tempfile::tempdir().unwrap();
        let schema_id = SchemaId::try_new("device-v1".to_string()).unwrap();
        let schema_registry = schema_registry_with_object_schema(&dir, &schema_id);

        let matcher = Arc::new(TopicMatcher::build(
            vec![SchemaBinding::new(
                TopicPattern::compile("devices/+/heartbeat").unwrap(),
                None,
            )],
            HashMap::new(),
        ));

        let (quarantine, _quarantine_dir) = test_quarantine_store().await;
        let rate_limiter = Arc::new(RateLimiter::new(
            crate::domain_types::RateLimitPerSecond::try_new(1000).unwrap(),
        ));
        let audit = Arc::new(AuditSink::spawn(AuditDestination::Stdout, 1024).unwrap());

        let snapshot = PipelineSnapshot {
            matcher,
            dry_run: true,
            max_message_size: MaxMessageSizeBytes::try_new(1024).unwrap(),
            message_timeout: Duration::from_secs(1),
            validation_mode: ValidationMode::Strict,
        };

        let pipeline = Arc::new(Pipeline::new(
            snapshot,
            MessageBufferSize::try_new(16).unwrap(),
            schema_registry,
            Arc::clone(&quarantine),
            rate_limiter,
            audit,
            metrics(),
            unreachable_broker_client(BrokerRole::Publisher),
            unreachable_broker_client(BrokerRole::Subscriber),
        ));

        let topic = TopicName::try_new("devices/a/heartbeat".to_string()).unwrap();
        let message = Message::new(topic, Bytes::from_static(b"{}"), Qos::AtLeastOnce, false, client_id());
        pipeline.process_one(message).await;

        let records = quarantine
            .list(&RecordFilter::default(), QuarantinePage { limit: 10, offset: 0 })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, QuarantineReason::NoSchemaBound);
    }

    #[tokio::test]
    async fn warn_only_mode_forwards_invalid_payload_without_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, quarantine, _schema_id) =
            build_test_pipeline_with_mode(&dir, true, ValidationMode::WarnOnly).await;

        let topic = TopicName::try_new("devices/a/telemetry".to_string()).unwrap();
        let message = Message::new(topic, Bytes::from_static(b"{}"), Qos::AtLeastOnce, false, client_id());
        pipeline.process_one(message).await;

        let records = quarantine
            .list(&RecordFilter::default(), QuarantinePage { limit: 10, offset: 0 })
            .await
            .unwrap();
        assert!(records.is_empty());
    }
}
