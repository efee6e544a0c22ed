//! Dual broker connections: a subscriber (ingress) and a publisher
//! (forwarding), each wrapping an independent MQTT client.

mod backoff;
mod client;

pub use backoff::ReconnectBackoff;
pub use client::{BrokerClient, BrokerConfig, BrokerRole, MessageHandler, Transport, TlsSettings, TlsVersion};

use thiserror::Error;

/// Connection lifecycle states. `Connected` may transition back to
/// `Reconnecting` on transport failure; all other transitions are linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport connection established.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The transport is up and the client is registered with the broker.
    Connected,
    /// A previously `Connected` client lost its transport and is retrying.
    Reconnecting,
    /// A graceful shutdown was requested; draining in-flight acks.
    Disconnecting,
}

/// Errors raised by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The underlying MQTT client rejected the operation.
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The connection event loop reported a fatal error.
    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    /// `publish` was called while the outgoing queue was saturated.
    #[error("outgoing queue saturated")]
    QueueSaturated,

    /// An operation restricted to one role was invoked on the other (e.g.
    /// `subscribe` on a publisher).
    #[error("operation not supported for broker role {0:?}")]
    WrongRole(BrokerRole),

    /// The client was not connected when the operation was attempted.
    #[error("broker client is not connected")]
    NotConnected,
}
