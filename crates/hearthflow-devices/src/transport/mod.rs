/*!
 * Broker transports.
 *
 * A [`Transport`] carries raw publish/subscribe traffic between the manager and
 * the broker. Inbound traffic and connection lifecycle changes are reported as
 * [`TransportEvent`]s on the channel returned by [`Transport::connect`].
 */
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::error::{DeviceError, Result};
use crate::protocol::{encode_envelope, Envelope};

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

/// Capacity of the event channel handed out by transports
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle and traffic events reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the connection
    Connected,
    /// The broker acknowledged a subscription request
    Subscribed,
    /// A message arrived on a subscribed topic
    Message {
        /// Topic the message arrived on
        topic: String,
        /// Raw message body
        payload: Bytes,
    },
    /// The connection was lost or closed
    Disconnected {
        /// Human readable cause
        reason: String,
    },
}

/// Connection parameters for a transport
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client identifier
    pub client_id: String,
    /// Broker username
    pub username: String,
    /// Broker password
    pub password: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Whether to use TLS
    pub tls: bool,
    /// PEM encoded CA certificate, when not using the platform roots
    pub ca_cert: Option<Vec<u8>>,
    /// Whether the transport re-establishes a lost connection by itself
    pub auto_reconnect: bool,
}

impl ConnectOptions {
    /// Creates connection options with defaults for everything but the endpoint and identity
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: String::new(),
            password: String::new(),
            keep_alive: Duration::from_secs(30),
            tls: true,
            ca_cert: None,
            auto_reconnect: true,
        }
    }

    /// Sets the broker credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets the keep-alive interval
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Enables or disables TLS
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Sets a PEM encoded CA certificate
    pub fn with_ca_cert(mut self, ca_cert: Vec<u8>) -> Self {
        self.ca_cert = Some(ca_cert);
        self
    }

    /// Enables or disables automatic reconnection
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }
}

/// Publish/subscribe connection to the broker
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Start connecting and return the channel events will be delivered on
    ///
    /// Returning does not mean the broker has accepted the connection; that is
    /// signalled by [`TransportEvent::Connected`].
    async fn connect(&self, options: ConnectOptions) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Request subscriptions to `topics`, acknowledged by one [`TransportEvent::Subscribed`]
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Publish `payload` on `topic`
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;
}

/// A message handed to [`MockTransport::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Destination topic
    pub topic: String,
    /// Raw message body
    pub payload: Bytes,
}

impl PublishedMessage {
    /// Decode the body as an envelope
    pub fn envelope(&self) -> Result<Envelope> {
        crate::protocol::decode_envelope(&self.payload)
    }
}

#[derive(Debug, Default)]
struct MockState {
    events: Option<mpsc::Sender<TransportEvent>>,
    options: Option<ConnectOptions>,
    subscriptions: Vec<String>,
    published: Vec<PublishedMessage>,
    connects: usize,
}

/// In-memory transport for tests
///
/// `connect` immediately reports [`TransportEvent::Connected`] and every
/// `subscribe` is acknowledged. Published messages are recorded and broadcast
/// to [`MockTransport::watch_published`] receivers; inbound traffic is driven
/// with [`MockTransport::inject`].
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    outbound: broadcast::Sender<PublishedMessage>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a new, disconnected mock transport
    pub fn new() -> Self {
        let (outbound, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MockState::default()),
            outbound,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self) -> Result<mpsc::Sender<TransportEvent>> {
        self.state().events.clone().ok_or(DeviceError::NotConnected)
    }

    /// Deliver an event to the connected consumer
    pub async fn inject(&self, event: TransportEvent) -> Result<()> {
        self.sender()?
            .send(event)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))
    }

    /// Deliver an encoded envelope on `topic`
    pub async fn inject_envelope(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let payload = Bytes::from(encode_envelope(envelope)?);
        self.inject(TransportEvent::Message {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    /// Simulate the broker dropping the connection
    pub async fn drop_connection(&self, reason: &str) -> Result<()> {
        self.inject(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
        .await
    }

    /// Receive every message published from now on
    pub fn watch_published(&self) -> broadcast::Receiver<PublishedMessage> {
        self.outbound.subscribe()
    }

    /// Messages published so far
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Topics subscribed so far
    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    /// Options passed to the latest `connect`
    pub fn connect_options(&self) -> Option<ConnectOptions> {
        self.state().options.clone()
    }

    /// Number of `connect` calls
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    /// Whether a consumer is attached
    pub fn is_connected(&self) -> bool {
        self.state().events.is_some()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, options: ConnectOptions) -> Result<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        debug!("Mock transport connecting as {}", options.client_id);

        {
            let mut state = self.state();
            state.events = Some(tx.clone());
            state.options = Some(options);
            state.connects += 1;
        }

        tx.send(TransportEvent::Connected)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        Ok(rx)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let tx = {
            let mut state = self.state();
            let tx = state.events.clone().ok_or(DeviceError::NotConnected)?;
            state.subscriptions.extend(topics.iter().cloned());
            tx
        };

        tx.send(TransportEvent::Subscribed)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let message = PublishedMessage {
            topic: topic.to_string(),
            payload,
        };

        {
            let mut state = self.state();
            if state.events.is_none() {
                return Err(DeviceError::NotConnected);
            }
            state.published.push(message.clone());
        }

        trace!("Mock transport published on {}", topic);
        let _ = self.outbound.send(message);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let tx = self.state().events.take();
        if let Some(tx) = tx {
            let _ = tx
                .send(TransportEvent::Disconnected {
                    reason: "client disconnect".to_string(),
                })
                .await;
        }
        Ok(())
    }
}
