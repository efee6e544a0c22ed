//! Prometheus-exposed metrics for the pipeline and its sidecars.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

use crate::broker::BrokerRole;
use crate::domain_types::SchemaId;
use crate::quarantine::QuarantineReason;

/// Terminal status recorded against `messages_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// The payload passed schema validation.
    Valid,
    /// The payload failed schema validation.
    Invalid,
    /// The message was forwarded upstream.
    Forwarded,
    /// The message was dropped (quarantined or an internal error).
    Dropped,
}

impl MessageStatus {
    fn as_label(self) -> &'static str {
        match self {
            MessageStatus::Valid => "valid",
            MessageStatus::Invalid => "invalid",
            MessageStatus::Forwarded => "forwarded",
            MessageStatus::Dropped => "dropped",
        }
    }
}

/// Outcome recorded against `schema_validations_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// The payload conformed to the schema.
    Pass,
    /// The payload violated the schema.
    Fail,
}

impl ValidationResult {
    fn as_label(self) -> &'static str {
        match self {
            ValidationResult::Pass => "pass",
            ValidationResult::Fail => "fail",
        }
    }
}

fn role_label(role: BrokerRole) -> &'static str {
    match role {
        BrokerRole::Subscriber => "subscriber",
        BrokerRole::Publisher => "publisher",
    }
}

/// Errors raised installing the Prometheus recorder.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The exporter failed to bind or install.
    #[error("failed to install metrics exporter: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}

/// Owns the process-global Prometheus recorder handle and exposes typed
/// helpers for each metric named by the pipeline's observability contract.
pub struct MetricsRegistry {
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    /// Installs the global recorder and returns a registry for recording
    /// and rendering metrics.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if a recorder is already installed or the
    /// exporter fails to build.
    pub fn install() -> Result<Self, MetricsError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(Self { handle })
    }

    /// Renders the current metric state in Prometheus text exposition
    /// format, for the `/metrics` HTTP endpoint.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Increments `messages_total{status}`.
    pub fn record_message(&self, status: MessageStatus) {
        counter!("messages_total", "status" => status.as_label()).increment(1);
    }

    /// Increments `quarantine_records_total{reason}`.
    pub fn record_quarantine(&self, reason: QuarantineReason) {
        counter!("quarantine_records_total", "reason" => reason.to_string()).increment(1);
    }

    /// Increments `schema_validations_total{schema_id,result}`.
    pub fn record_schema_validation(&self, schema_id: &SchemaId, result: ValidationResult) {
        counter!(
            "schema_validations_total",
            "schema_id" => schema_id.to_string(),
            "result" => result.as_label()
        )
        .increment(1);
    }

    /// Increments `broker_reconnects_total{role}`.
    pub fn record_broker_reconnect(&self, role: BrokerRole) {
        counter!("broker_reconnects_total", "role" => role_label(role)).increment(1);
    }

    /// Records a sample into the `validation_duration_seconds` histogram.
    pub fn record_validation_duration(&self, duration: Duration) {
        histogram!("validation_duration_seconds").record(duration.as_secs_f64());
    }

    /// Records a sample into the `forward_duration_seconds` histogram.
    pub fn record_forward_duration(&self, duration: Duration) {
        histogram!("forward_duration_seconds").record(duration.as_secs_f64());
    }

    /// Sets the `queue_depth` gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!("queue_depth").set(depth as f64);
    }

    /// Sets the `quarantine_bytes` gauge.
    pub fn set_quarantine_bytes(&self, bytes: u64) {
        gauge!("quarantine_bytes").set(bytes as f64);
    }

    /// Sets the `broker_connected{role}` gauge to 1 (connected) or 0.
    pub fn set_broker_connected(&self, role: BrokerRole, connected: bool) {
        gauge!("broker_connected", "role" => role_label(role))
            .set(if connected { 1.0 } else { 0.0 });
    }

    /// Sets the `uptime_seconds` gauge.
    pub fn set_uptime(&self, uptime: Duration) {
        gauge!("uptime_seconds").set(uptime.as_secs_f64());
    }
}
