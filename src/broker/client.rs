//! A single MQTT client connection (subscriber or publisher role), driven by
//! a background task polling the `rumqttc` event loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport as RumqttTransport};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain_types::ClientId;
use crate::message::Qos;

use super::{BrokerError, ConnectionState, ReconnectBackoff};

/// Which side of the pipeline a [`BrokerClient`] serves. Subscribers accept
/// `subscribe`; publishers accept `publish`; calling the other operation is
/// a programmer error surfaced as [`BrokerError::WrongRole`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    /// Ingress connection: receives published messages.
    Subscriber,
    /// Egress connection: forwards validated messages upstream.
    Publisher,
}

/// TLS floor and material for a broker connection.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// CA bundle used to verify the broker's certificate.
    pub ca_file: PathBuf,
    /// Client certificate, for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// Client private key, for mutual TLS.
    pub client_key: Option<PathBuf>,
    /// Minimum accepted TLS version.
    pub min_version: TlsVersion,
    /// OpenSSL-style cipher suite string, if restricting ciphers.
    pub cipher_string: Option<String>,
}

/// Minimum acceptable TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2.
    #[default]
    Tls12,
    /// TLS 1.3.
    Tls13,
}

/// Transport used to reach the broker.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP.
    Tls(TlsSettings),
    /// MQTT over WebSocket.
    WebSocket {
        /// URL path the WebSocket handshake is performed against.
        path: String,
        /// Extra headers sent during the WebSocket upgrade.
        headers: Vec<(String, String)>,
    },
}

/// Connection parameters for one broker role.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker hostname.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT client id presented at connect time.
    pub client_id: ClientId,
    /// Keep-alive interval negotiated with the broker.
    pub keep_alive: Duration,
    /// Transport to use.
    pub transport: Transport,
    /// Whether to request a clean (non-persistent) session.
    pub clean_session: bool,
    /// Event loop channel capacity (bounds in-flight un-acked publishes).
    pub channel_capacity: usize,
}

/// Receives inbound publishes on the subscriber connection.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Invoked once per inbound publish, in delivery order.
    async fn handle(&self, topic: &str, payload: Bytes, qos: Qos, retain: bool);
}

fn to_rumqttc_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_rumqttc_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}

fn build_mqtt_options(config: &BrokerConfig) -> Result<MqttOptions, BrokerError> {
    let mut options = MqttOptions::new(config.client_id.to_string(), config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(config.clean_session);

    match &config.transport {
        Transport::Tcp => {}
        Transport::Tls(tls) => {
            let ca = std::fs::read(&tls.ca_file).map_err(|e| {
                BrokerError::Connection(rumqttc::ConnectionError::Io(e))
            })?;
            let client_auth = match (&tls.client_cert, &tls.client_key) {
                (Some(cert), Some(key)) => {
                    let cert_bytes = std::fs::read(cert)
                        .map_err(|e| BrokerError::Connection(rumqttc::ConnectionError::Io(e)))?;
                    let key_bytes = std::fs::read(key)
                        .map_err(|e| BrokerError::Connection(rumqttc::ConnectionError::Io(e)))?;
                    Some((cert_bytes, rumqttc::Key::RSA(key_bytes)))
                }
                _ => None,
            };
            options.set_transport(RumqttTransport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }
        Transport::WebSocket { path, headers: _ } => {
            options.set_transport(RumqttTransport::Ws);
            // rumqttc resolves the WebSocket path from the broker URL; the
            // configured path is appended by the caller when constructing
            // `host`. Extra headers are not supported by the transport and
            // are validated at config-load time instead.
            let _ = path;
        }
    }

    Ok(options)
}

struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    cancel: CancellationToken,
}

/// One MQTT connection, either subscriber or publisher role.
pub struct BrokerClient {
    role: BrokerRole,
    client: AsyncClient,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl BrokerClient {
    /// Builds a client and its background event-loop task, but does not
    /// connect until [`BrokerClient::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the TLS material cannot be read.
    pub fn new(role: BrokerRole, config: BrokerConfig) -> Result<Self, BrokerError> {
        let options = build_mqtt_options(&config)?;
        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state_tx,
            subscriptions: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Self::drive_event_loop(
            role,
            eventloop,
            Arc::clone(&shared),
            client.clone(),
        ));

        Ok(Self {
            role,
            client,
            shared,
            state_rx,
        })
    }

    /// A watch receiver reflecting the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A cloned watch receiver for tasks that need to react to every
    /// connection state transition rather than just poll the current one.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribes to `topic_filter`, installing `handler` to receive future
    /// inbound publishes. Subscriber role only; the subscription is
    /// persisted and re-issued automatically on reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::WrongRole`] on a publisher, or a client error
    /// if the subscribe request could not be sent.
    pub async fn subscribe(
        &self,
        topic_filter: &str,
        qos: Qos,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        if self.role != BrokerRole::Subscriber {
            return Err(BrokerError::WrongRole(self.role));
        }
        let rqos = to_rumqttc_qos(qos);
        *self.shared.handler.lock() = Some(handler);
        self.shared
            .subscriptions
            .lock()
            .push((topic_filter.to_string(), rqos));
        self.client.subscribe(topic_filter, rqos).await?;
        Ok(())
    }

    /// Publishes `payload` to `topic`. Publisher role only. Returns
    /// immediately with [`BrokerError::QueueSaturated`] if the outgoing
    /// queue is full, rather than waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::WrongRole`] on a subscriber, or
    /// [`BrokerError::QueueSaturated`] / a client error on publish failure.
    pub fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<(), BrokerError> {
        if self.role != BrokerRole::Publisher {
            return Err(BrokerError::WrongRole(self.role));
        }
        match self
            .client
            .try_publish(topic, to_rumqttc_qos(qos), retain, payload)
        {
            Ok(()) => Ok(()),
            Err(rumqttc::ClientError::TryRequest(_)) => Err(BrokerError::QueueSaturated),
            Err(other) => Err(BrokerError::Client(other)),
        }
    }

    /// Requests a graceful disconnect; the background event-loop task stops
    /// after observing the cancellation.
    ///
    /// # Errors
    ///
    /// Returns a client error if the disconnect packet could not be sent.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let _ = self.shared.state_tx.send(ConnectionState::Disconnecting);
        self.client.disconnect().await?;
        self.shared.cancel.cancel();
        Ok(())
    }

    async fn drive_event_loop(
        role: BrokerRole,
        mut eventloop: rumqttc::EventLoop,
        shared: Arc<Shared>,
        client: AsyncClient,
    ) {
        let mut backoff = ReconnectBackoff::new();
        let _ = shared.state_tx.send(ConnectionState::Connecting);

        loop {
            if shared.cancel.is_cancelled() {
                let _ = shared.state_tx.send(ConnectionState::Disconnected);
                return;
            }

            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!(?role, "broker connection established");
                    let _ = shared.state_tx.send(ConnectionState::Connected);
                    backoff.note_connected();
                    for (topic, qos) in shared.subscriptions.lock().iter() {
                        if let Err(e) = client.subscribe(topic.clone(), *qos).await {
                            warn!(?role, error = %e, "failed to re-issue subscription");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if let Some(handler) = shared.handler.lock().clone() {
                        let qos = from_rumqttc_qos(publish.qos);
                        handler
                            .handle(&publish.topic, publish.payload, qos, publish.retain)
                            .await;
                    }
                }
                Ok(_other) => {
                    debug!(?role, "broker event");
                }
                Err(e) => {
                    warn!(?role, error = %e, "broker connection error, reconnecting");
                    let _ = shared.state_tx.send(ConnectionState::Reconnecting);
                    backoff.note_failure();
                    let delay = backoff.next_delay();
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shared.cancel.cancelled() => {
                            let _ = shared.state_tx.send(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
            }
        }
    }
}
