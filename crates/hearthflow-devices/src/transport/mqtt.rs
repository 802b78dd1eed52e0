/*!
 * MQTT transport backed by rumqttc.
 *
 * The rumqttc event loop is polled on a background task. Connection
 * acknowledgements, subscription acknowledgements and inbound publishes are
 * forwarded to the consumer as [`TransportEvent`]s. When automatic
 * reconnection is enabled the loop keeps polling after an error, which makes
 * rumqttc dial the broker again.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::{ConnectOptions, Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::error::{DeviceError, Result};

/// Capacity of rumqttc's request queue
const REQUEST_CAPACITY: usize = 10;

/// Delay before polling again after a connection error
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// MQTT transport
#[derive(Debug, Default)]
pub struct MqttTransport {
    client: Mutex<Option<AsyncClient>>,
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl MqttTransport {
    /// Create a new, disconnected transport
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Arc<AtomicBool>>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn client(&self) -> Result<AsyncClient> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(DeviceError::NotConnected)
    }

    fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
        let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);
        mqtt.set_credentials(&options.username, &options.password);

        if options.tls {
            let transport = match &options.ca_cert {
                Some(ca) => rumqttc::Transport::tls(ca.clone(), None, None),
                None => rumqttc::Transport::tls_with_default_config(),
            };
            mqtt.set_transport(transport);
        }

        mqtt
    }

    async fn run_event_loop(
        mut eventloop: EventLoop,
        events: mpsc::Sender<TransportEvent>,
        running: Arc<AtomicBool>,
        auto_reconnect: bool,
    ) {
        while running.load(Ordering::SeqCst) {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Broker accepted connection ({:?})", ack.code);
                    Some(TransportEvent::Connected)
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => Some(TransportEvent::Subscribed),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    trace!("Received {} bytes on {}", publish.payload.len(), publish.topic);
                    Some(TransportEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    })
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Client requested disconnect");
                    running.store(false, Ordering::SeqCst);
                    Some(TransportEvent::Disconnected {
                        reason: "client disconnect".to_string(),
                    })
                }
                Ok(_) => None,
                Err(e) => {
                    let reason = e.to_string();
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }

                    error!("MQTT connection error: {}", reason);
                    if events
                        .send(TransportEvent::Disconnected { reason })
                        .await
                        .is_err()
                    {
                        break;
                    }

                    if !auto_reconnect {
                        running.store(false, Ordering::SeqCst);
                        break;
                    }

                    warn!("Reconnecting in {:?}", RECONNECT_BACKOFF);
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    None
                }
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    debug!("Transport consumer went away, stopping event loop");
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        debug!("MQTT event loop stopped");
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: ConnectOptions) -> Result<mpsc::Receiver<TransportEvent>> {
        info!(
            "Connecting to MQTT broker at {}:{} as {} (tls: {})",
            options.host, options.port, options.client_id, options.tls
        );

        let (client, eventloop) = AsyncClient::new(Self::mqtt_options(&options), REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));

        if let Some(previous) = self.lock_running().replace(running.clone()) {
            warn!("Replacing an existing MQTT connection");
            previous.store(false, Ordering::SeqCst);
        }
        *self.client.lock().unwrap_or_else(|p| p.into_inner()) = Some(client);

        tokio::spawn(Self::run_event_loop(
            eventloop,
            tx,
            running,
            options.auto_reconnect,
        ));

        Ok(rx)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce))
            .collect();

        debug!("Subscribing to {:?}", topics);
        self.client()?
            .subscribe_many(filters)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        // The loop stops once rumqttc reports the outgoing disconnect.
        self.lock_running().take();

        match client {
            Some(client) => {
                info!("Disconnecting from MQTT broker");
                client
                    .disconnect()
                    .await
                    .map_err(|e| DeviceError::Transport(e.to_string()))
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mqtt_options_from_connect_options() {
        let options = ConnectOptions::new("mqtt.example.com", 443, "app:0123")
            .with_credentials("42", "5f4dcc3b5aa765d61d8327deb882cf99")
            .with_keep_alive(Duration::from_secs(45))
            .with_tls(false);

        let mqtt = MqttTransport::mqtt_options(&options);
        assert_eq!(mqtt.client_id(), "app:0123");
        assert_eq!(
            mqtt.broker_address(),
            ("mqtt.example.com".to_string(), 443)
        );
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(45));
        assert_eq!(
            mqtt.credentials(),
            Some((
                "42".to_string(),
                "5f4dcc3b5aa765d61d8327deb882cf99".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let transport = MqttTransport::new();
        assert!(matches!(
            transport.publish("/t", Bytes::new()).await,
            Err(DeviceError::NotConnected)
        ));
        assert!(matches!(
            transport.subscribe(&["/t".to_string()]).await,
            Err(DeviceError::NotConnected)
        ));
        assert!(transport.disconnect().await.is_ok());
    }
}
