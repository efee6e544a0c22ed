//! HTTP surface: liveness/readiness probes and the Prometheus scrape
//! endpoint, served alongside the MQTT pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::metrics::MetricsRegistry;
use crate::pipeline::Pipeline;

/// Builds the router serving `/health` and `/health/detailed`, bound to
/// `monitoring.health_check.port`.
#[must_use]
pub fn create_health_router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .with_state(pipeline)
}

/// Builds the router serving the Prometheus exposition endpoint at
/// `metrics_path`, bound to `monitoring.metrics.port`.
#[must_use]
pub fn create_metrics_router(metrics: Arc<MetricsRegistry>, metrics_path: &str) -> Router {
    Router::new()
        .route(metrics_path, get(metrics_text))
        .with_state(metrics)
}

async fn health(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    if pipeline.is_healthy().await {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ComponentStatus {
    component: String,
    status: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DetailedHealth {
    healthy: bool,
    components: Vec<ComponentStatus>,
}

async fn health_detailed(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    let components = pipeline
        .detailed_status()
        .await
        .into_iter()
        .map(|(component, status)| ComponentStatus {
            component: component.to_string(),
            status,
        })
        .collect();

    let body = DetailedHealth {
        healthy: pipeline.is_healthy().await,
        components,
    };
    let status = if body.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn metrics_text(State(metrics): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    metrics.render()
}

/// Binds a listener on `port` for the given router.
///
/// # Errors
///
/// Returns an error if the server cannot bind to the specified port.
pub async fn start_server(port: u16) -> Result<(TcpListener, SocketAddr), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    Ok((listener, actual_addr))
}

/// Binds a listener on an OS-assigned port, for tests.
///
/// # Errors
///
/// Returns an error if the server cannot bind to any available port.
#[allow(dead_code)]
pub async fn start_server_on_available_port() -> Result<(TcpListener, SocketAddr), std::io::Error> {
    start_server(0).await
}

/// Serves `router` on `listener` until the process exits.
///
/// # Errors
///
/// Returns an error if the server fails during operation.
pub async fn serve(listener: TcpListener, router: Router) -> Result<(), std::io::Error> {
    axum::serve(listener, router).await
}

/// Serves `router` on `listener` until `shutdown_token` is cancelled, then
/// drains in-flight requests.
///
/// # Errors
///
/// Returns an error if the server fails during operation.
pub async fn serve_with_graceful_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> Result<(), std::io::Error> {
    let shutdown_signal = async move {
        shutdown_token.cancelled().await;
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::OnceLock;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::audit::{AuditDestination, AuditSink};
    use crate::broker::{BrokerClient, BrokerConfig, BrokerRole, Transport};
    use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
    use crate::domain_types::{
        ClientId, MaxMessageSizeBytes, MessageBufferSize, RateLimitPerSecond, ValidationCacheSize,
    };
    use crate::pipeline::PipelineSnapshot;
    use crate::quarantine::{BlobStore, MetadataStore, PayloadCompression, QuarantineStore};
    use crate::rate_limit::RateLimiter;
    use crate::schema::{SchemaRegistry, ValidationMode};
    use crate::topic::TopicMatcher;

    fn metrics() -> Arc<MetricsRegistry> {
        static REGISTRY: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();
        Arc::clone(REGISTRY.get_or_init(|| {
            Arc::new(MetricsRegistry::install().expect("install metrics recorder once"))
        }))
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

    async fn test_pipeline() -> (Arc<Pipeline>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = DatabasePath::new(dir.path().join("quarantine.db")).unwrap();
        let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(db_path))
            .await
            .unwrap();
        let metadata = MetadataStore::new(connection.pool().clone());
        let blobs = BlobStore::new(dir.path().join("blobs"), PayloadCompression::None)
            .await
            .unwrap();
        let quarantine = Arc::new(QuarantineStore::new(metadata, blobs));

        let schema_registry = Arc::new(SchemaRegistry::new(ValidationCacheSize::try_new(10).unwrap()));
        let matcher = Arc::new(TopicMatcher::build(vec![], HashMap::new()));
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitPerSecond::try_new(100).unwrap()));
        let audit = Arc::new(AuditSink::spawn(AuditDestination::Stdout, 16).unwrap());

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
            quarantine,
            rate_limiter,
            audit,
            metrics(),
            unreachable_broker_client(BrokerRole::Publisher),
            unreachable_broker_client(BrokerRole::Subscriber),
        ));
        (pipeline, dir)
    }

    #[tokio::test]
    async fn health_reports_unavailable_when_brokers_are_disconnected() {
        let (pipeline, _dir) = test_pipeline().await;
        let router = create_health_router(pipeline);

        let (listener, addr) = start_server_on_available_port().await.unwrap();
        let server_handle = tokio::spawn(async move { serve(listener, router).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let client = reqwest::Client::new();
        let response = timeout(
            Duration::from_secs(1),
            client.get(format!("http://{addr}/health")).send(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        server_handle.abort();
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let (_pipeline, _dir) = test_pipeline().await;
        let router = create_metrics_router(metrics(), "/metrics");

        let (listener, addr) = start_server_on_available_port().await.unwrap();
        let server_handle = tokio::spawn(async move { serve(listener, router).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let client = reqwest::Client::new();
        let response = timeout(
            Duration::from_secs(1),
            client.get(format!("http://{addr}/metrics")).send(),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(response.status().is_success());
        server_handle.abort();
    }

    #[tokio::test]
    async fn health_detailed_reports_each_component() {
        let (pipeline, _dir) = test_pipeline().await;
        let router = create_health_router(pipeline);

        let (listener, addr) = start_server_on_available_port().await.unwrap();
        let server_handle = tokio::spawn(async move { serve(listener, router).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let client = reqwest::Client::new();
        let response = timeout(
            Duration::from_secs(1),
            client.get(format!("http://{addr}/health/detailed")).send(),
        )
        .await
        .unwrap()
        .unwrap();

        let body: DetailedHealth = response.json().await.unwrap();
        assert_eq!(body.components.len(), 3);
        server_handle.abort();
    }
}
