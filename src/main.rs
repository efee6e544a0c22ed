//! Entry point for the `proxy` daemon: loads configuration, wires every
//! component together, and runs the pipeline alongside the health and
//! metrics HTTP servers until interrupted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mqtt_governance_proxy::audit::AuditSink;
use mqtt_governance_proxy::broker::{BrokerClient, BrokerConfig, BrokerRole, ConnectionState};
use mqtt_governance_proxy::config::{self, BrokerEndpointConfig, ConfigSnapshot, SchemaFileConfig};
use mqtt_governance_proxy::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use mqtt_governance_proxy::domain_types::{
    CleanupDays, ClientId, MaxQuarantineBytes, RateLimitPerSecond, SweepIntervalSecs,
};
use mqtt_governance_proxy::metrics::MetricsRegistry;
use mqtt_governance_proxy::pipeline::{Pipeline, PipelineSnapshot};
use mqtt_governance_proxy::quarantine::{BlobStore, MetadataStore, QuarantineStore};
use mqtt_governance_proxy::rate_limit::RateLimiter;
use mqtt_governance_proxy::schema::{SchemaRegistry, SchemaSource};
use mqtt_governance_proxy::server;
use mqtt_governance_proxy::topic::{ClientRule, SchemaBinding, TopicMatcher, TopicPattern};

/// One event loop channel's worth of in-flight un-acked publishes, per
/// broker connection. Not exposed in the configuration schema.
const BROKER_CHANNEL_CAPACITY: usize = 256;

/// MQTT schema governance proxy.
#[derive(Debug, Parser)]
#[command(name = "proxy", version, about)]
struct Cli {
    /// Path to the YAML configuration document.
    #[arg(long)]
    config: PathBuf,

    /// Validate and audit every message but skip forwarding upstream,
    /// overriding `global.dry_run`.
    #[arg(long)]
    dry_run: bool,

    /// Overrides the env-filter default, e.g. `debug` or `proxy=trace`.
    #[arg(long)]
    log_level: Option<String>,

    /// Parse and validate the configuration, then exit without starting.
    #[arg(long)]
    validate_config: bool,

    /// Overrides a configuration value, `dotted.path=value`. May be given
    /// multiple times; applied in order before validation.
    #[arg(long = "override", value_name = "key=value")]
    overrides: Vec<String>,
}

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_STARTUP_FAILURE: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "fatal startup failure");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    }
}

fn init_logging(log_level: Option<&str>) {
    let filter = log_level.map_or_else(
        tracing_subscriber::EnvFilter::from_default_env,
        |level| tracing_subscriber::EnvFilter::new(level.to_string()),
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<i32> {
    let document = tokio::fs::read_to_string(&cli.config)
        .await
        .with_context(|| format!("reading configuration from {}", cli.config.display()))?;

    let document = match apply_overrides(&document, &cli.overrides) {
        Ok(doc) => doc,
        Err(e) => {
            error!(error = %e, "invalid --override value");
            return Ok(EXIT_CONFIG_ERROR);
        }
    };

    let mut config = match config::parse_yaml(&document) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return Ok(EXIT_CONFIG_ERROR);
        }
    };

    if cli.dry_run {
        config.global.dry_run = true;
    }

    if cli.validate_config {
        info!("configuration is valid");
        return Ok(EXIT_OK);
    }

    match start(config).await {
        // The daemon only returns once a shutdown signal has drained it.
        Ok(()) => Ok(EXIT_INTERRUPTED),
        Err(e) => {
            error!(error = %e, "fatal startup failure");
            Ok(EXIT_STARTUP_FAILURE)
        }
    }
}

async fn start(config: ConfigSnapshot) -> Result<()> {
    let schema_registry = Arc::new(build_schema_registry(&config)?);
    let matcher = Arc::new(build_topic_matcher(&config)?);

    let db_path = DatabasePath::new(config.storage.quarantine.database_path.clone())
        .map_err(|e| anyhow::anyhow!("invalid quarantine database path: {e}"))?;
    let db_config = DatabaseConfig::new(db_path).with_pool_size(config.storage.quarantine.pool_size);
    let connection = DatabaseConnection::initialize(db_config)
        .await
        .context("initializing quarantine metadata store")?;
    let metadata = MetadataStore::new(connection.pool().clone());
    let blobs = BlobStore::new(
        config.storage.payloads.root.clone(),
        config.storage.payloads.compression,
    )
    .await
    .context("initializing quarantine payload store")?;
    let quarantine = Arc::new(QuarantineStore::new(metadata, blobs));

    let rate = config
        .security
        .rate_limiting
        .as_ref()
        .filter(|r| r.enabled)
        .map_or(RateLimitPerSecond::default(), |r| r.requests_per_second);
    let rate_limiter = Arc::new(RateLimiter::new(rate));

    let (audit_destination, audit_buffer) = config.monitoring.audit.resolve();
    let audit = Arc::new(
        AuditSink::spawn(audit_destination, audit_buffer).context("initializing audit sink")?,
    );

    let metrics = Arc::new(MetricsRegistry::install().context("installing metrics recorder")?);

    let publisher = Arc::new(
        build_broker_client(BrokerRole::Publisher, &config.brokers.publisher)
            .context("connecting publisher broker client")?,
    );
    let subscriber = Arc::new(
        build_broker_client(BrokerRole::Subscriber, &config.brokers.subscriber)
            .context("connecting subscriber broker client")?,
    );

    let snapshot = PipelineSnapshot {
        matcher,
        dry_run: config.global.dry_run,
        max_message_size: config.global.max_message_size,
        message_timeout: config.message_timeout(),
        validation_mode: config.validation.validation_mode,
    };

    let pipeline = Arc::new(Pipeline::new(
        snapshot,
        config.performance.message_buffer_size,
        Arc::clone(&schema_registry),
        Arc::clone(&quarantine),
        rate_limiter,
        audit,
        Arc::clone(&metrics),
        publisher,
        subscriber,
    ));

    let topic_filters: Vec<String> = config
        .validation
        .schema_mappings
        .iter()
        .map(|(pattern, _)| pattern.clone())
        .chain(config.validation.topic_patterns.iter().cloned())
        .collect();

    let shutdown = CancellationToken::new();

    let publisher_watch_task = tokio::spawn(watch_broker_connection(
        BrokerRole::Publisher,
        publisher.state_changes(),
        Arc::clone(&metrics),
        shutdown.clone(),
    ));
    let subscriber_watch_task = tokio::spawn(watch_broker_connection(
        BrokerRole::Subscriber,
        subscriber.state_changes(),
        Arc::clone(&metrics),
        shutdown.clone(),
    ));

    let sweep_task = {
        let quarantine = Arc::clone(&quarantine);
        let cleanup_days = config.storage.quarantine.cleanup_days;
        let max_size = config.storage.quarantine.max_size;
        let sweep_interval = config.storage.quarantine.sweep_interval;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            sweep_quarantine(quarantine, cleanup_days, max_size, sweep_interval, shutdown).await;
        })
    };

    let pipeline_task = {
        let pipeline = Arc::clone(&pipeline);
        let worker_threads = config.performance.worker_threads;
        tokio::spawn(async move { pipeline.run(&topic_filters, worker_threads).await })
    };

    let health_router = server::create_health_router(Arc::clone(&pipeline));
    let (health_listener, health_addr) =
        server::start_server(config.monitoring.health_check.port).await?;
    info!(%health_addr, "health endpoints listening");
    let health_shutdown = shutdown.clone();
    let health_task = tokio::spawn(async move {
        server::serve_with_graceful_shutdown(health_listener, health_router, health_shutdown).await
    });

    let metrics_router = server::create_metrics_router(
        Arc::clone(&metrics),
        &config.monitoring.metrics.path,
    );
    let (metrics_listener, metrics_addr) =
        server::start_server(config.monitoring.metrics.port).await?;
    info!(%metrics_addr, "metrics endpoint listening");
    let metrics_shutdown = shutdown.clone();
    let metrics_task = tokio::spawn(async move {
        server::serve_with_graceful_shutdown(metrics_listener, metrics_router, metrics_shutdown)
            .await
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    shutdown.cancel();
    pipeline.stop();

    let _ = health_task.await;
    let _ = metrics_task.await;
    let _ = publisher_watch_task.await;
    let _ = subscriber_watch_task.await;
    let _ = sweep_task.await;
    if let Err(e) = pipeline_task.await {
        warn!(error = %e, "pipeline task ended with an error");
    }

    Ok(())
}

/// Observes a broker connection's state transitions for the lifetime of the
/// daemon, keeping the `broker_connected` gauge current and counting a
/// reconnect each time the connection recovers from a drop.
async fn watch_broker_connection(
    role: BrokerRole,
    mut state_rx: watch::Receiver<ConnectionState>,
    metrics: Arc<MetricsRegistry>,
    shutdown: CancellationToken,
) {
    let mut previous = *state_rx.borrow();
    metrics.set_broker_connected(role, previous == ConnectionState::Connected);

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = *state_rx.borrow();
                metrics.set_broker_connected(role, current == ConnectionState::Connected);
                if current == ConnectionState::Connected && previous == ConnectionState::Reconnecting {
                    metrics.record_broker_reconnect(role);
                }
                previous = current;
            }
            () = shutdown.cancelled() => return,
        }
    }
}

/// Periodically purges quarantine rows older than `cleanup_days` (and, if
/// `max_size` is set, evicts the oldest rows until storage is back under the
/// ceiling), on the cadence configured by `sweep_interval`.
async fn sweep_quarantine(
    quarantine: Arc<QuarantineStore>,
    cleanup_days: CleanupDays,
    max_size: Option<MaxQuarantineBytes>,
    sweep_interval: SweepIntervalSecs,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_interval.as_duration());
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(cleanup_days.into_inner()));
                match quarantine.purge(cutoff, max_size).await {
                    Ok(purged) => info!(purged, "quarantine retention sweep completed"),
                    Err(e) => warn!(error = %e, "quarantine retention sweep failed"),
                }
            }
            () = shutdown.cancelled() => return,
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn build_schema_registry(config: &ConfigSnapshot) -> Result<SchemaRegistry> {
    let registry = SchemaRegistry::new(config.validation.validation_cache_size);
    let sources: Vec<SchemaSource> = config
        .validation
        .schema_files
        .iter()
        .map(|f| match f {
            SchemaFileConfig::JsonSchema { id, path, draft } => SchemaSource::JsonSchema {
                id: id.clone(),
                path: path.clone(),
                draft: *draft,
            },
            SchemaFileConfig::Protobuf {
                id,
                descriptor_set_path,
                message_type,
            } => SchemaSource::Protobuf {
                id: id.clone(),
                descriptor_set_path: descriptor_set_path.clone(),
                message_type: message_type.clone(),
            },
        })
        .collect();
    registry.load_all(&sources).context("loading schemas")?;
    Ok(registry)
}

fn build_topic_matcher(config: &ConfigSnapshot) -> Result<TopicMatcher> {
    let mut bindings = Vec::with_capacity(
        config.validation.schema_mappings.len() + config.validation.topic_patterns.len(),
    );
    for (pattern, schema_id) in &config.validation.schema_mappings {
        let compiled = TopicPattern::compile(pattern)
            .with_context(|| format!("compiling topic pattern {pattern:?}"))?;
        bindings.push(SchemaBinding::new(compiled, Some(schema_id.clone())));
    }
    for pattern in &config.validation.topic_patterns {
        let compiled = TopicPattern::compile(pattern)
            .with_context(|| format!("compiling topic pattern {pattern:?}"))?;
        bindings.push(SchemaBinding::new(compiled, None));
    }

    let mut client_rules: HashMap<ClientId, ClientRule> = HashMap::new();
    for rule in &config.validation.client_rules {
        let patterns: Result<Vec<TopicPattern>> = rule
            .allowed_topics
            .iter()
            .map(|p| {
                TopicPattern::compile(p)
                    .with_context(|| format!("compiling client rule pattern {p:?}"))
            })
            .collect();
        client_rules.insert(rule.client_id.clone(), ClientRule::new(patterns?));
    }

    Ok(TopicMatcher::build(bindings, client_rules))
}

fn build_broker_client(
    role: BrokerRole,
    endpoint: &BrokerEndpointConfig,
) -> Result<BrokerClient, mqtt_governance_proxy::broker::BrokerError> {
    let config = BrokerConfig {
        host: endpoint.host.clone(),
        port: endpoint.port,
        client_id: endpoint.client_id.clone(),
        keep_alive: std::time::Duration::from_secs(endpoint.keep_alive_secs),
        transport: endpoint.transport.resolve(),
        clean_session: endpoint.clean_session,
        channel_capacity: BROKER_CHANNEL_CAPACITY,
    };
    BrokerClient::new(role, config)
}

/// Applies `key.path=value` overrides to a YAML document by merging each
/// override into the parsed tree before the typed deserialization runs.
/// `value` is itself parsed as YAML, so `true`, `42`, and quoted strings all
/// take their natural scalar type.
fn apply_overrides(document: &str, overrides: &[String]) -> Result<String> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(document)?;

    for entry in overrides {
        let (path, raw_value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("override {entry:?} is not in key=value form"))?;
        let parsed_value: serde_yaml::Value = serde_yaml::from_str(raw_value)
            .unwrap_or_else(|_| serde_yaml::Value::String(raw_value.to_string()));
        set_path(&mut value, path.split('.'), parsed_value);
    }

    Ok(serde_yaml::to_string(&value)?)
}

fn set_path<'a>(
    value: &mut serde_yaml::Value,
    mut path: impl Iterator<Item = &'a str>,
    new_value: serde_yaml::Value,
) {
    let Some(key) = path.next() else {
        *value = new_value;
        return;
    };

    if !value.is_mapping() {
        *value = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    let mapping = value.as_mapping_mut().expect("just coerced to a mapping");
    let entry = mapping
        .entry(serde_yaml::Value::String(key.to_string()))
        .or_insert(serde_yaml::Value::Null);
    set_path(entry, path, new_value);
}
