//! Configuration snapshot model and pure YAML parsing.
//!
//! Loading the YAML document, watching it for hot-reload, and resolving
//! relative paths against a working directory are external concerns; this
//! module only defines the validated in-memory shape the core consumes and
//! a pure `parse_yaml` entry point with no file I/O.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::{TlsSettings, TlsVersion, Transport};
use crate::domain_types::{
    CleanupDays, ClientId, ConnectionPoolSize, MaxMessageSizeBytes, MaxQuarantineBytes,
    MessageBufferSize, MessageTimeoutSecs, RateLimitPerSecond, SchemaId, ShutdownTimeoutSecs,
    SweepIntervalSecs, ValidationCacheSize, WorkerThreadCount,
};
use crate::quarantine::PayloadCompression;
use crate::schema::{JsonSchemaDraft, ValidationMode};

/// Errors raised parsing or validating a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document was not well-formed YAML, or didn't match the expected
    /// shape.
    #[error("malformed configuration: {0}")]
    Malformed(#[from] serde_yaml::Error),

    /// A topic pattern under `validation.schema_mappings` or
    /// `validation.topic_patterns` failed to compile.
    #[error("invalid topic pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The offending pattern string.
        pattern: String,
        /// Why it failed to compile.
        #[source]
        source: crate::topic::TopicMatchError,
    },

    /// `validation.schema_mappings` referenced a `schema_id` with no entry
    /// in `validation.schema_files`.
    #[error("schema mapping references unknown schema id {0:?}")]
    UnknownSchemaMapping(String),
}

/// Top-level group: process-wide settings not owned by a specific
/// component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Whether to run in dry-run mode (validate and audit, skip forwarding).
    #[serde(default)]
    pub dry_run: bool,
    /// Maximum accepted payload size.
    #[serde(default)]
    pub max_message_size: MaxMessageSizeBytes,
    /// Graceful shutdown drain budget.
    #[serde(default)]
    pub shutdown_timeout: ShutdownTimeoutSecs,
    /// Per-message soft processing deadline.
    #[serde(default)]
    pub message_timeout: MessageTimeoutSecs,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_message_size: MaxMessageSizeBytes::default(),
            shutdown_timeout: ShutdownTimeoutSecs::default(),
            message_timeout: MessageTimeoutSecs::default(),
        }
    }
}

/// One broker connection's YAML-facing configuration (subscriber or
/// publisher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerEndpointConfig {
    /// Broker hostname.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT client id presented at connect time.
    pub client_id: ClientId,
    /// Keep-alive interval, in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportSpec,
    /// Whether to request a clean (non-persistent) session.
    #[serde(default = "default_true")]
    pub clean_session: bool,
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// YAML shape of [`Transport`], resolved into the runtime type at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSpec {
    /// Plain TCP.
    #[default]
    Tcp,
    /// TLS over TCP.
    Tls {
        /// CA bundle path.
        ca_file: PathBuf,
        /// Client certificate path, for mutual TLS.
        client_cert: Option<PathBuf>,
        /// Client key path, for mutual TLS.
        client_key: Option<PathBuf>,
        /// Minimum TLS version, `"1.2"` or `"1.3"`.
        #[serde(default = "default_tls_version")]
        min_version: String,
        /// OpenSSL-style cipher suite string.
        cipher_string: Option<String>,
    },
    /// MQTT over WebSocket.
    WebSocket {
        /// URL path for the WebSocket handshake.
        path: String,
        /// Extra headers sent during the upgrade.
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
}

fn default_tls_version() -> String {
    "1.2".to_string()
}

impl TransportSpec {
    /// Resolves the YAML shape into the runtime [`Transport`] used by
    /// [`crate::broker::BrokerClient`].
    #[must_use]
    pub fn resolve(&self) -> Transport {
        match self {
            TransportSpec::Tcp => Transport::Tcp,
            TransportSpec::Tls {
                ca_file,
                client_cert,
                client_key,
                min_version,
                cipher_string,
            } => Transport::Tls(TlsSettings {
                ca_file: ca_file.clone(),
                client_cert: client_cert.clone(),
                client_key: client_key.clone(),
                min_version: if min_version == "1.3" {
                    TlsVersion::Tls13
                } else {
                    TlsVersion::Tls12
                },
                cipher_string: cipher_string.clone(),
            }),
            TransportSpec::WebSocket { path, headers } => Transport::WebSocket {
                path: path.clone(),
                headers: headers.clone(),
            },
        }
    }
}

/// `brokers{subscriber, publisher}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokersConfig {
    /// The ingress connection.
    pub subscriber: BrokerEndpointConfig,
    /// The egress connection.
    pub publisher: BrokerEndpointConfig,
}

/// One entry under `validation.schema_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaFileConfig {
    /// A JSON Schema document.
    JsonSchema {
        /// The schema's id.
        id: SchemaId,
        /// Path to the document on disk.
        path: PathBuf,
        /// Draft to compile against.
        #[serde(default)]
        draft: JsonSchemaDraft,
    },
    /// A protobuf message type within a descriptor set.
    Protobuf {
        /// The schema's id.
        id: SchemaId,
        /// Path to the compiled `FileDescriptorSet`.
        descriptor_set_path: PathBuf,
        /// Fully-qualified message type.
        message_type: String,
    },
}

/// One entry under `validation.client_rules`: a per-client allow-list
/// restricting which topics that client may publish to, on top of the
/// global pattern set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRuleConfig {
    /// The client this rule applies to.
    pub client_id: ClientId,
    /// Additional topic patterns the client is restricted to.
    pub allowed_topics: Vec<String>,
}

/// `validation{...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Ordered `(pattern, schema_id)` bindings; first match wins.
    pub schema_mappings: Vec<(String, SchemaId)>,
    /// Schema source declarations, keyed by the ids referenced above.
    pub schema_files: Vec<SchemaFileConfig>,
    /// Topic patterns allow-listed with no schema bound. Matching one of
    /// these quarantines nothing on topic grounds but also enforces no
    /// validation; checked after `schema_mappings` so a schema-bound pattern
    /// always takes precedence over an overlapping topic-only one.
    #[serde(default)]
    pub topic_patterns: Vec<String>,
    /// Per-client topic allow-lists.
    #[serde(default)]
    pub client_rules: Vec<ClientRuleConfig>,
    /// Enforcement strictness applied to JSON Schema validation.
    #[serde(default)]
    pub validation_mode: ValidationMode,
    /// Validation cache size. Accepts the `cache_size` alias for
    /// compatibility with the component-level defaults table.
    #[serde(default, alias = "cache_size")]
    pub validation_cache_size: ValidationCacheSize,
}

/// `storage.quarantine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineConfig {
    /// Path to the metadata index database file.
    pub database_path: PathBuf,
    /// Connection pool size for the metadata index.
    #[serde(default)]
    pub pool_size: ConnectionPoolSize,
    /// Retention window before a sweep purges a row.
    #[serde(default)]
    pub cleanup_days: CleanupDays,
    /// Soft ceiling on total quarantine storage size.
    pub max_size: Option<MaxQuarantineBytes>,
    /// How often the daemon runs a background retention sweep.
    #[serde(default)]
    pub sweep_interval: SweepIntervalSecs,
}

/// `storage.payloads`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadsConfig {
    /// Root directory for the content-addressed blob tree.
    pub root: PathBuf,
    /// Compression applied to newly written blobs.
    #[serde(default)]
    pub compression: PayloadCompression,
}

/// `storage{...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Quarantine metadata index settings.
    pub quarantine: QuarantineConfig,
    /// Payload blob store settings.
    pub payloads: PayloadsConfig,
}

/// `monitoring.metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsEndpointConfig {
    /// Port the Prometheus exposition endpoint listens on.
    pub port: u16,
    /// URL path serving the exposition text.
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// `monitoring.health_check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Port the health endpoints listen on.
    pub port: u16,
}

/// `monitoring.audit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "destination", rename_all = "snake_case")]
pub enum AuditConfig {
    /// Write line-oriented JSON to a rotated file.
    File {
        /// Directory holding the active and rotated files.
        directory: PathBuf,
        /// File name prefix, e.g. `audit.log`.
        file_name_prefix: String,
        /// Rotation policy: `"hourly"`, `"daily"`, `"never"`, or a byte size.
        rotation: AuditRotationSpec,
        /// Bounded in-memory buffer capacity before records are dropped.
        #[serde(default = "default_audit_buffer")]
        buffer_capacity: usize,
    },
    /// Write line-oriented JSON to stdout.
    Stdout {
        /// Bounded in-memory buffer capacity before records are dropped.
        #[serde(default = "default_audit_buffer")]
        buffer_capacity: usize,
    },
    /// Write line-oriented JSON (RFC 3164 framed) to a syslog listener.
    Syslog {
        /// `host:port` of the syslog listener.
        address: String,
        /// Bounded in-memory buffer capacity before records are dropped.
        #[serde(default = "default_audit_buffer")]
        buffer_capacity: usize,
    },
}

fn default_audit_buffer() -> usize {
    10_000
}

impl AuditConfig {
    /// Resolves this YAML shape into the runtime [`crate::audit::AuditDestination`]
    /// and its configured buffer capacity.
    #[must_use]
    pub fn resolve(&self) -> (crate::audit::AuditDestination, usize) {
        use crate::audit::AuditDestination;
        match self {
            AuditConfig::File {
                directory,
                file_name_prefix,
                rotation,
                buffer_capacity,
            } => (
                AuditDestination::File {
                    directory: directory.clone(),
                    file_name_prefix: file_name_prefix.clone(),
                    rotation: rotation.resolve(),
                },
                *buffer_capacity,
            ),
            AuditConfig::Stdout { buffer_capacity } => {
                (AuditDestination::Stdout, *buffer_capacity)
            }
            AuditConfig::Syslog {
                address,
                buffer_capacity,
            } => (
                AuditDestination::Syslog {
                    address: address.clone(),
                },
                *buffer_capacity,
            ),
        }
    }
}

/// YAML shape of [`crate::audit::Rotation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditRotationSpec {
    /// Hourly rotation.
    Hourly,
    /// Daily rotation.
    Daily,
    /// No automatic rotation.
    Never,
    /// Rotate once the active file exceeds this many bytes.
    SizeBytes(u64),
}

impl AuditRotationSpec {
    /// Resolves this YAML shape into the runtime [`crate::audit::Rotation`].
    #[must_use]
    pub fn resolve(&self) -> crate::audit::Rotation {
        match self {
            AuditRotationSpec::Hourly => crate::audit::Rotation::Hourly,
            AuditRotationSpec::Daily => crate::audit::Rotation::Daily,
            AuditRotationSpec::Never => crate::audit::Rotation::Never,
            AuditRotationSpec::SizeBytes(bytes) => crate::audit::Rotation::SizeBytes(*bytes),
        }
    }
}

/// `monitoring{...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus exposition endpoint.
    pub metrics: MetricsEndpointConfig,
    /// Liveness/readiness endpoints.
    pub health_check: HealthCheckConfig,
    /// Audit sink destination and buffering.
    pub audit: AuditConfig,
}

/// `security.rate_limiting`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Whether rate limiting is enforced.
    #[serde(default)]
    pub enabled: bool,
    /// Per-client token bucket rate.
    #[serde(default)]
    pub requests_per_second: RateLimitPerSecond,
}

/// `security{...}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Rate limiting settings.
    pub rate_limiting: Option<RateLimitingConfig>,
}

/// `performance{...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Bounded work queue capacity.
    #[serde(default)]
    pub message_buffer_size: MessageBufferSize,
    /// Number of worker tasks in the pipeline pool.
    #[serde(default)]
    pub worker_threads: WorkerThreadCount,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            message_buffer_size: MessageBufferSize::default(),
            worker_threads: WorkerThreadCount::default(),
        }
    }
}

/// The full validated configuration snapshot the core reads once at startup
/// and accepts atomic replacement of on hot reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// `global`.
    #[serde(default)]
    pub global: GlobalConfig,
    /// `brokers`.
    pub brokers: BrokersConfig,
    /// `validation`.
    pub validation: ValidationConfig,
    /// `storage`.
    pub storage: StorageConfig,
    /// `monitoring`.
    pub monitoring: MonitoringConfig,
    /// `security`.
    #[serde(default)]
    pub security: SecurityConfig,
    /// `performance`.
    #[serde(default)]
    pub performance: PerformanceConfig,
}

impl ConfigSnapshot {
    /// Cross-checks that every schema id referenced by `schema_mappings`
    /// resolves to an entry in `schema_files`, and that every topic pattern
    /// compiles.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on the first invalid pattern or dangling
    /// schema reference.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let known_ids: HashMap<String, ()> = self
            .validation
            .schema_files
            .iter()
            .map(|f| (schema_file_id(f), ()))
            .collect();

        for (pattern, schema_id) in &self.validation.schema_mappings {
            crate::topic::TopicPattern::compile(pattern).map_err(|source| {
                ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                }
            })?;
            if !known_ids.contains_key(&schema_id.to_string()) {
                return Err(ConfigError::UnknownSchemaMapping(schema_id.to_string()));
            }
        }

        for pattern in &self.validation.topic_patterns {
            crate::topic::TopicPattern::compile(pattern).map_err(|source| {
                ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                }
            })?;
        }

        Ok(())
    }

    /// The configured message processing timeout as a [`Duration`].
    #[must_use]
    pub fn message_timeout(&self) -> Duration {
        self.global.message_timeout.as_duration()
    }
}

fn schema_file_id(f: &SchemaFileConfig) -> String {
    match f {
        SchemaFileConfig::JsonSchema { id, .. } | SchemaFileConfig::Protobuf { id, .. } => {
            id.to_string()
        }
    }
}

/// Parses a YAML document into a [`ConfigSnapshot`], performing no file
/// I/O. Cross-field validation (pattern compilation, schema mapping
/// resolution) runs via [`ConfigSnapshot::validate`] after parsing.
///
/// # Errors
///
/// Returns [`ConfigError`] if the document is malformed or fails
/// cross-field validation.
pub fn parse_yaml(document: &str) -> Result<ConfigSnapshot, ConfigError> {
    let snapshot: ConfigSnapshot = serde_yaml::from_str(document)?;
    snapshot.validate()?;
    Ok(snapshot)
}
