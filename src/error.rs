//! Crate-wide error type for the MQTT governance proxy.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::quarantine::QuarantineError;
use crate::schema::SchemaError;
use crate::topic::TopicMatchError;

/// Top-level error type returned from pipeline orchestration and startup.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration failed to parse or validate; fatal at startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A topic pattern failed validation at startup.
    #[error("topic pattern error: {0}")]
    TopicPattern(#[from] TopicMatchError),

    /// A schema failed to load or compile at startup.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The quarantine store could not be initialized or written to.
    #[error("quarantine store error: {0}")]
    Quarantine(#[from] QuarantineError),

    /// A broker connection could not be established or maintained.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// An internal invariant was violated; the message is dropped, the
    /// pipeline continues.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O failure at the process boundary (file, socket).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
