/*!
 * Connection and dispatch engine.
 *
 * The [`Manager`] owns the broker connection. It signs and publishes commands,
 * correlates acknowledgements with pending requests, and routes push
 * notifications to devices and observers.
 *
 * Inbound traffic is read on one task. Acknowledgements are resolved inline;
 * notifications are queued to a second task so device handlers and observers
 * never stall the read loop, and are processed in arrival order.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

use hearthflow_core::config::Config;
use hearthflow_core::error::Error as CoreError;
use hearthflow_core::event::SharedEventBus;
use hearthflow_core::logging::{component_span, operation_span};
use hearthflow_core::utils::{spawn_and_log, with_timeout};

use crate::capability::{abilities, Capability, CapabilityFactory};
use crate::device::{CommandExecutor, ManagerHandle, OnlineStatus};
use crate::discovery::{DeviceDiscoverer, DiscoveryOptions, DiscoveryResult, InventorySource};
use crate::error::{DeviceError, Result};
use crate::notification::{Notification, NotificationObserver};
use crate::protocol::{
    decode_envelope, encode_envelope, generate_client_identity, mqtt_password, topics, verify,
    ClientIdentity, Envelope, Method,
};
use crate::registry::{DeviceFilter, DeviceRegistry};
use crate::transport::{ConnectOptions, Transport, TransportEvent};

/// Account credentials used to authenticate and sign messages
#[derive(Clone)]
pub struct Credentials {
    /// Account id
    pub account_id: String,
    /// Shared signing key
    pub key: String,
    /// Session token
    pub token: String,
}

impl Credentials {
    /// Create new credentials
    pub fn new(
        account_id: impl Into<String>,
        key: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            key: key.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("key", &"<redacted>")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Connection state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection
    Disconnected,
    /// Waiting for the broker to accept the connection
    Connecting,
    /// Connected, subscriptions pending
    Connected,
    /// Connected and subscribed
    Subscribed,
}

/// Connection lifecycle events published on the event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker accepted the connection
    Connected,
    /// The response and notification topics are subscribed
    Subscribed,
    /// The connection closed
    Disconnected {
        /// Whether the manager asked for it
        intentional: bool,
    },
}

type PendingReply = oneshot::Sender<Result<Value>>;

struct ManagerInner {
    config: Config,
    credentials: Credentials,
    identity: ClientIdentity,
    response_topic: String,
    notification_topic: String,
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    factory: Arc<CapabilityFactory>,
    discoverer: DeviceDiscoverer,
    pending: Mutex<HashMap<String, PendingReply>>,
    observers: RwLock<Vec<Arc<dyn NotificationObserver>>>,
    notifications: std::sync::Mutex<Option<mpsc::Sender<Notification>>>,
    state: watch::Sender<ConnectionState>,
    intentional_disconnect: AtomicBool,
    events: SharedEventBus,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Broker connection and dispatch engine
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("client_id", &self.inner.identity.client_id)
            .field("state", &*self.inner.state.borrow())
            .field("devices", &self.inner.registry.len())
            .finish()
    }
}

impl Manager {
    /// Create a manager; nothing is connected until [`Manager::connect`]
    pub fn new(
        config: Config,
        credentials: Credentials,
        transport: Arc<dyn Transport>,
        inventory: Arc<dyn InventorySource>,
    ) -> Result<Self> {
        config.validate()?;

        let identity = generate_client_identity();
        let response_topic = topics::response_topic(&credentials.account_id, &identity.app_id);
        let notification_topic = topics::account_notification_topic(&credentials.account_id);
        let registry = Arc::new(DeviceRegistry::new());
        let factory = Arc::new(CapabilityFactory::new());
        let discoverer = DeviceDiscoverer::new(inventory, factory.clone(), registry.clone());
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        debug!(
            "Created manager {} for account {}",
            identity.client_id, credentials.account_id
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                credentials,
                identity,
                response_topic,
                notification_topic,
                transport,
                registry,
                factory,
                discoverer,
                pending: Mutex::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
                notifications: std::sync::Mutex::new(None),
                state,
                intentional_disconnect: AtomicBool::new(false),
                events: SharedEventBus::new(),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Open the broker connection and wait until both topics are subscribed
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if *inner.state.borrow() != ConnectionState::Disconnected {
            debug!("Manager is already connected");
            return Ok(());
        }

        let broker = &inner.config.broker;
        let mut options = ConnectOptions::new(&broker.host, broker.port, &inner.identity.client_id)
            .with_credentials(
                &inner.credentials.account_id,
                mqtt_password(&inner.credentials.account_id, &inner.credentials.key),
            )
            .with_keep_alive(broker.keep_alive())
            .with_tls(broker.tls_enabled)
            .with_auto_reconnect(broker.auto_reconnect);
        if let Some(path) = &broker.ca_cert {
            options = options.with_ca_cert(tokio::fs::read(path).await.map_err(CoreError::from)?);
        }

        inner.intentional_disconnect.store(false, Ordering::SeqCst);
        inner.state.send_replace(ConnectionState::Connecting);
        let mut state = inner.state.subscribe();

        let events = match inner.transport.connect(options).await {
            Ok(events) => events,
            Err(e) => {
                inner.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        self.spawn_workers(events);

        info!(
            "Connecting to {}:{} as {}",
            broker.host, broker.port, inner.identity.client_id
        );
        let subscribed = with_timeout(broker.connect_timeout(), async move {
            state
                .wait_for(|state| *state == ConnectionState::Subscribed)
                .await
                .map(|_| ())
                .map_err(|_| CoreError::runtime("manager state channel closed"))
        })
        .await;

        if let Err(e) = subscribed {
            warn!("Broker connection did not complete: {}", e);
            inner.intentional_disconnect.store(true, Ordering::SeqCst);
            if let Err(e) = inner.transport.disconnect().await {
                debug!("Failed to stop transport: {}", e);
            }
            inner.state.send_replace(ConnectionState::Disconnected);
            return Err(e.into());
        }

        Ok(())
    }

    fn spawn_workers(&self, events: mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(self.inner.config.commands.notification_queue);
        *self
            .inner
            .notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);

        let client_id = self.inner.identity.client_id.as_str();
        let weak = Arc::downgrade(&self.inner);
        let event_loop = spawn_and_log(
            "broker-events",
            async move {
                ManagerInner::run_events(weak, events).await;
                Ok::<(), DeviceError>(())
            }
            .instrument(component_span("broker-events", Some(client_id))),
        );

        let weak = Arc::downgrade(&self.inner);
        let worker = spawn_and_log(
            "notification-dispatch",
            async move {
                ManagerInner::run_notifications(weak, rx).await;
                Ok::<(), DeviceError>(())
            }
            .instrument(component_span("notification-dispatch", Some(client_id))),
        );

        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(event_loop);
        tasks.push(worker);
    }

    /// Close the broker connection
    ///
    /// Device connectivity is left as it is.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting manager {}", self.inner.identity.client_id);
        self.inner.intentional_disconnect.store(true, Ordering::SeqCst);
        self.inner.transport.disconnect().await
    }

    /// Send a command to the device `uuid` and wait for its acknowledgement
    ///
    /// `None` uses the configured default timeout.
    pub async fn execute_command(
        &self,
        uuid: &str,
        method: Method,
        namespace: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.inner
            .execute_command(uuid, method, namespace, payload, timeout)
            .await
    }

    /// Sync the inventory into the registry
    pub async fn discover_devices(&self, options: &DiscoveryOptions) -> Result<DiscoveryResult> {
        self.inner
            .discoverer
            .discover(&self.handle(), options)
            .await
    }

    /// Register an observer for every push notification
    pub async fn add_observer(&self, observer: Arc<dyn NotificationObserver>) {
        self.inner.observers.write().await.push(observer);
    }

    /// Handle devices use to reach this manager
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle::new(&self.inner)
    }

    /// The device registry
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    /// The capability factory
    pub fn factory(&self) -> &Arc<CapabilityFactory> {
        &self.inner.factory
    }

    /// Bus carrying [`ConnectionEvent`]s
    pub fn events(&self) -> &SharedEventBus {
        &self.inner.events
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether commands can be sent
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Client identity used on the broker
    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    /// Topic acknowledgements arrive on
    pub fn response_topic(&self) -> &str {
        &self.inner.response_topic
    }

    /// Topic push notifications arrive on
    pub fn notification_topic(&self) -> &str {
        &self.inner.notification_topic
    }

    /// Number of commands awaiting acknowledgement
    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl ManagerInner {
    fn is_connected(&self) -> bool {
        matches!(
            *self.state.borrow(),
            ConnectionState::Connected | ConnectionState::Subscribed
        )
    }

    fn publish_event(&self, event: ConnectionEvent) {
        if let Err(e) = self.events.publish(event) {
            warn!("Failed to publish connection event: {}", e);
        }
    }

    async fn run_events(weak: Weak<ManagerInner>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };

            match event {
                TransportEvent::Connected => inner.on_connected().await,
                TransportEvent::Subscribed => inner.on_subscribed(),
                TransportEvent::Message { topic, payload } => inner.dispatch(&topic, &payload).await,
                TransportEvent::Disconnected { reason } => inner.on_disconnected(&reason).await,
            }
        }

        if let Some(inner) = weak.upgrade() {
            inner.state.send_replace(ConnectionState::Disconnected);
            inner.fail_pending().await;
        }
        debug!("Broker event stream closed");
    }

    async fn on_connected(&self) {
        info!("Connected to broker as {}", self.identity.client_id);
        self.state.send_replace(ConnectionState::Connected);
        self.publish_event(ConnectionEvent::Connected);

        let topics = [self.response_topic.clone(), self.notification_topic.clone()];
        if let Err(e) = self.transport.subscribe(&topics).await {
            error!("Failed to subscribe to {:?}: {}", topics, e);
        }
    }

    fn on_subscribed(self: &Arc<Self>) {
        if *self.state.borrow() == ConnectionState::Subscribed {
            return;
        }
        info!(
            "Subscribed to {} and {}",
            self.response_topic, self.notification_topic
        );
        self.state.send_replace(ConnectionState::Subscribed);
        self.publish_event(ConnectionEvent::Subscribed);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.refresh_devices().await;
            }
        });
    }

    async fn refresh_devices(&self) {
        let devices: Vec<_> = self
            .registry
            .devices()
            .into_iter()
            .filter(|device| device.is_subdevice() || device.has_capability(Capability::SystemAll))
            .collect();
        if devices.is_empty() {
            return;
        }

        debug!("Refreshing {} devices", devices.len());
        let results = join_all(devices.iter().map(|device| device.update(None))).await;
        for (device, result) in devices.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to refresh {}: {}", device.id(), e);
            }
        }
    }

    async fn on_disconnected(&self, reason: &str) {
        if *self.state.borrow() == ConnectionState::Disconnected {
            trace!("Ignoring repeated disconnect: {}", reason);
            return;
        }

        let intentional = self.intentional_disconnect.load(Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Disconnected);

        if intentional {
            info!("Disconnected from broker");
            self.fail_pending().await;
        } else {
            warn!("Lost broker connection: {}", reason);
            if self.config.broker.auto_reconnect {
                // Pending commands stay registered: an ack after the reconnect
                // still resolves them, otherwise they hit their own timeout.
                for device in self.registry.devices() {
                    device.set_online_status(OnlineStatus::Unknown);
                }
            } else {
                self.fail_pending().await;
                if let Err(e) = self.transport.disconnect().await {
                    warn!("Failed to stop transport: {}", e);
                }
            }
        }

        self.publish_event(ConnectionEvent::Disconnected { intentional });
    }

    async fn fail_pending(&self) {
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        for (message_id, reply) in pending {
            trace!("Failing pending request {}", message_id);
            let _ = reply.send(Err(DeviceError::NotConnected));
        }
    }

    async fn dispatch(&self, topic: &str, raw: &[u8]) {
        let envelope = match decode_envelope(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable message on {}: {}", topic, e);
                return;
            }
        };

        if !verify(&envelope.header, &self.credentials.key) {
            debug!(
                "Dropping message {} with an invalid signature",
                envelope.header.message_id
            );
            return;
        }

        let method = envelope.header.method;
        if topic == self.response_topic && method.is_ack() {
            self.resolve_pending(envelope).await;
        } else if topic == self.notification_topic && method == Method::Push {
            self.enqueue_notification(envelope).await;
        } else {
            debug!(
                "Unhandled {} {} on {}",
                method, envelope.header.namespace, topic
            );
        }
    }

    async fn resolve_pending(&self, envelope: Envelope) {
        let reply = self.pending.lock().await.remove(envelope.message_id());
        let Some(reply) = reply else {
            debug!(
                "Discarding acknowledgement for unknown message {}",
                envelope.message_id()
            );
            return;
        };

        let result = match envelope.header.method {
            Method::Error => Err(DeviceError::RemoteCommand {
                payload: envelope.payload,
            }),
            _ => Ok(envelope.payload),
        };
        if reply.send(result).is_err() {
            trace!("Requester of {} already gave up", envelope.header.message_id);
        }
    }

    async fn enqueue_notification(&self, envelope: Envelope) {
        let Some(uuid) = topics::originating_uuid(&envelope.header.from) else {
            warn!(
                "Dropping {} push without a device in from: {}",
                envelope.header.namespace, envelope.header.from
            );
            return;
        };
        let notification = Notification::new(envelope.header.namespace, uuid, envelope.payload);

        let sender = self
            .notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match sender {
            Some(sender) => {
                if sender.send(notification).await.is_err() {
                    warn!("Notification queue is closed");
                }
            }
            None => warn!("No notification worker running"),
        }
    }

    async fn run_notifications(weak: Weak<ManagerInner>, mut queue: mpsc::Receiver<Notification>) {
        while let Some(notification) = queue.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.process_notification(notification).await;
        }
    }

    async fn process_notification(self: &Arc<Self>, notification: Notification) -> bool {
        let targets = self
            .registry
            .find_all_by(&DeviceFilter::new().native_uuids([notification.originating_uuid.as_str()]));
        if targets.is_empty() {
            debug!(
                "No device registered for {} ({})",
                notification.originating_uuid, notification.namespace
            );
        }

        let mut handled = false;
        for device in &targets {
            match device.handle_notification(&notification.namespace, &notification.payload) {
                Ok(true) => {
                    handled = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "{} failed to handle {}: {}",
                    device.id(),
                    notification.namespace,
                    e
                ),
            }
        }

        let observers = self.observers.read().await.clone();
        for observer in observers {
            if let Err(e) = observer.on_notification(&notification, &targets).await {
                warn!("Observer failed on {}: {}", notification.namespace, e);
            }
        }

        if notification.is_unbind() {
            for device in &targets {
                match self.registry.relinquish(device.id()) {
                    Ok(_) => {
                        info!("{} was unbound from the account", device.id());
                        handled = true;
                    }
                    Err(e) => debug!("{} already gone: {}", device.id(), e),
                }
            }
        } else if notification.namespace == abilities::CONTROL_BIND && targets.is_empty() {
            handled |= self.discover_bound(&notification.originating_uuid).await;
        }

        if !handled {
            warn!(
                "Notification {} from {} was not handled",
                notification.namespace, notification.originating_uuid
            );
        }
        handled
    }

    async fn discover_bound(self: &Arc<Self>, uuid: &str) -> bool {
        let options = DiscoveryOptions::new().with_native_uuids([uuid]);
        match self
            .discoverer
            .discover(&ManagerHandle::new(self), &options)
            .await
        {
            Ok(result) => !result.enrolled.is_empty(),
            Err(e) => {
                warn!("Failed to discover newly bound device {}: {}", uuid, e);
                false
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for ManagerInner {
    async fn execute_command(
        &self,
        target_uuid: &str,
        method: Method,
        namespace: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.send_command(target_uuid, method, namespace, payload, timeout)
            .instrument(operation_span(namespace, target_uuid))
            .await
    }
}

impl ManagerInner {
    async fn send_command(
        &self,
        target_uuid: &str,
        method: Method,
        namespace: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }

        let timeout = timeout.unwrap_or_else(|| self.config.commands.default_timeout());
        let envelope = Envelope::request(
            method,
            namespace,
            payload,
            &self.response_topic,
            &self.credentials.key,
        );
        let message_id = envelope.message_id().to_string();
        let raw = Bytes::from(encode_envelope(&envelope)?);

        let (tx, rx) = oneshot::channel();
        if self.pending.lock().await.insert(message_id.clone(), tx).is_some() {
            warn!("Replacing pending request {}", message_id);
        }

        trace!("Sending {} {} to {} ({})", method, namespace, target_uuid, message_id);
        let topic = topics::device_command_topic(target_uuid);
        if let Err(e) = self.transport.publish(&topic, raw).await {
            self.pending.lock().await.remove(&message_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&message_id);
                Err(DeviceError::CommandTimeout {
                    namespace: namespace.to_string(),
                    target: target_uuid.to_string(),
                    timeout,
                })
            }
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AbilityMap;
    use crate::device::tests::{abilities_of, record};
    use crate::device::{DeviceRecord, SubDeviceRecord};
    use crate::discovery::StaticInventory;
    use crate::transport::MockTransport;
    use hearthflow_core::types::{unix_timestamp, Id};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    const KEY: &str = "shared-key";

    struct Harness {
        manager: Manager,
        transport: Arc<MockTransport>,
        inventory: Arc<StaticInventory>,
    }

    fn harness_with(config: Config) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let inventory = Arc::new(StaticInventory::new());
        let manager = Manager::new(
            config,
            Credentials::new("42", KEY, "token"),
            transport.clone(),
            inventory.clone(),
        )
        .unwrap();
        Harness {
            manager,
            transport,
            inventory,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default())
    }

    fn device_from(uuid: &str) -> String {
        format!("/appliance/{}/publish", uuid)
    }

    impl Harness {
        async fn connected() -> Self {
            let harness = harness();
            harness.manager.connect().await.unwrap();
            harness
        }

        async fn enroll(&self, record: DeviceRecord, names: &[&str]) {
            self.inventory.insert_device(record, Some(abilities_of(names)));
            self.manager
                .discover_devices(&DiscoveryOptions::new())
                .await
                .unwrap();
        }

        /// Answer the next published request with `method` and `payload`
        fn reply_next(&self, method: Method, payload: Value, key: &'static str) -> JoinHandle<Envelope> {
            let mut published = self.transport.watch_published();
            let transport = self.transport.clone();
            let response_topic = self.manager.response_topic().to_string();
            tokio::spawn(async move {
                let request = published.recv().await.unwrap().envelope().unwrap();
                let reply = Envelope::request_at(
                    method,
                    &request.header.namespace,
                    payload,
                    "/appliance/X1/publish",
                    key,
                    request.header.message_id.clone(),
                    unix_timestamp(),
                );
                transport.inject_envelope(&response_topic, &reply).await.unwrap();
                request
            })
        }

        async fn push(&self, uuid: &str, namespace: &str, payload: Value) {
            let push = Envelope::request(Method::Push, namespace, payload, &device_from(uuid), KEY);
            self.transport
                .inject_envelope(self.manager.notification_topic(), &push)
                .await
                .unwrap();
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Observer that records namespaces and the devices they targeted
    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<(String, Vec<Id>)>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationObserver for Recorder {
        async fn on_notification(
            &self,
            notification: &Notification,
            devices: &[Arc<crate::device::Device>],
        ) -> Result<()> {
            self.seen.lock().unwrap().push((
                notification.namespace.clone(),
                devices.iter().map(|d| d.id().clone()).collect(),
            ));
            if self.fail {
                return Err(DeviceError::Other("observer failure".to_string()));
            }
            Ok(())
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_subscribes_to_both_topics() {
        let harness = harness();
        let mut events = harness.manager.events().subscribe::<ConnectionEvent>().unwrap();

        harness.manager.connect().await.unwrap();

        assert_eq!(harness.manager.connection_state(), ConnectionState::Subscribed);
        let app_id = &harness.manager.identity().app_id;
        assert_eq!(
            harness.transport.subscriptions(),
            vec![format!("/app/42-{}/subscribe", app_id), "/app/42/subscribe".to_string()]
        );

        let options = harness.transport.connect_options().unwrap();
        assert_eq!(options.client_id, format!("app:{}", app_id));
        assert_eq!(options.username, "42");
        assert_eq!(options.password, mqtt_password("42", KEY));

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Subscribed);
    }

    #[tokio::test]
    async fn test_command_requires_connection() {
        let harness = harness();
        let result = harness
            .manager
            .execute_command("X1", Method::Get, abilities::SYSTEM_ALL, json!({}), None)
            .await;
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, DeviceError::NotConnected));
        assert!(harness.transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_command_resolves_with_ack_payload() {
        let harness = Harness::connected().await;
        let responder = harness.reply_next(Method::GetAck, json!({"all": {"ok": true}}), KEY);

        let payload = harness
            .manager
            .execute_command("X1", Method::Get, abilities::SYSTEM_ALL, json!({}), None)
            .await
            .unwrap();
        assert_eq!(payload, json!({"all": {"ok": true}}));

        let request = responder.await.unwrap();
        assert_eq!(request.header.method, Method::Get);
        assert_eq!(request.header.from, harness.manager.response_topic());
        assert!(verify(&request.header, KEY));
        assert_eq!(harness.transport.published()[0].topic, "/appliance/X1/subscribe");
        assert_eq!(harness.manager.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_error_ack_fails_command() {
        let harness = Harness::connected().await;
        let _responder = harness.reply_next(Method::Error, json!({"error": {"code": 5000}}), KEY);

        let result = harness
            .manager
            .execute_command("X1", Method::Set, abilities::TOGGLEX, json!({}), None)
            .await;
        match result {
            Err(DeviceError::RemoteCommand { payload }) => {
                assert_eq!(payload, json!({"error": {"code": 5000}}))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_times_out() {
        let harness = Harness::connected().await;
        let started = tokio::time::Instant::now();

        let result = harness
            .manager
            .execute_command(
                "X1",
                Method::Get,
                abilities::SYSTEM_ALL,
                json!({}),
                Some(Duration::from_secs(3)),
            )
            .await;

        match result {
            Err(DeviceError::CommandTimeout {
                namespace,
                target,
                timeout,
            }) => {
                assert_eq!(namespace, abilities::SYSTEM_ALL);
                assert_eq!(target, "X1");
                assert_eq!(timeout, Duration::from_secs(3));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(harness.manager.pending_requests().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forged_ack_is_dropped() {
        let harness = Harness::connected().await;
        let _responder = harness.reply_next(Method::GetAck, json!({}), "wrong-key");

        let result = harness
            .manager
            .execute_command(
                "X1",
                Method::Get,
                abilities::SYSTEM_ALL,
                json!({}),
                Some(Duration::from_secs(1)),
            )
            .await;
        assert!(matches!(result, Err(DeviceError::CommandTimeout { .. })));
    }

    #[tokio::test]
    async fn test_unknown_ack_is_ignored() {
        let harness = Harness::connected().await;
        harness
            .enroll(record("X1", "mss310"), &[abilities::TOGGLEX])
            .await;
        let devices = harness.manager.registry().len();
        let templates = harness.manager.factory().cached_templates();

        let stray = Envelope::request(
            Method::SetAck,
            abilities::TOGGLEX,
            json!({}),
            "/appliance/X1/publish",
            KEY,
        );
        harness
            .transport
            .inject_envelope(harness.manager.response_topic(), &stray)
            .await
            .unwrap();

        // The read loop keeps serving real acknowledgements afterwards.
        let _responder = harness.reply_next(Method::GetAck, json!({"fine": 1}), KEY);
        let payload = harness
            .manager
            .execute_command("X1", Method::Get, abilities::SYSTEM_ALL, json!({}), None)
            .await
            .unwrap();
        assert_eq!(payload, json!({"fine": 1}));
        assert_eq!(harness.manager.registry().len(), devices);
        assert_eq!(harness.manager.factory().cached_templates(), templates);
        assert_eq!(harness.manager.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_commands_resolve_independently() {
        let harness = Harness::connected().await;
        let mut published = harness.transport.watch_published();
        let transport = harness.transport.clone();
        let response_topic = harness.manager.response_topic().to_string();

        // Answer two requests in reverse order, echoing the namespace.
        let responder = tokio::spawn(async move {
            let first = published.recv().await.unwrap().envelope().unwrap();
            let second = published.recv().await.unwrap().envelope().unwrap();
            for request in [second, first] {
                let reply = Envelope::request_at(
                    Method::GetAck,
                    &request.header.namespace,
                    json!({ "ns": request.header.namespace.clone() }),
                    "/appliance/X1/publish",
                    KEY,
                    request.header.message_id.clone(),
                    unix_timestamp(),
                );
                transport.inject_envelope(&response_topic, &reply).await.unwrap();
            }
        });

        let (a, b) = tokio::join!(
            harness
                .manager
                .execute_command("X1", Method::Get, abilities::SYSTEM_ALL, json!({}), None),
            harness
                .manager
                .execute_command("X1", Method::Get, abilities::ELECTRICITY, json!({}), None),
        );
        responder.await.unwrap();

        assert_eq!(a.unwrap(), json!({"ns": abilities::SYSTEM_ALL}));
        assert_eq!(b.unwrap(), json!({"ns": abilities::ELECTRICITY}));
    }

    #[tokio::test]
    async fn test_discovery_enrolls_extended_toggle_device() {
        let harness = Harness::connected().await;
        harness
            .enroll(
                DeviceRecord {
                    uuid: "X1".to_string(),
                    device_type: "mss310".to_string(),
                    firmware_version: "1.0".to_string(),
                    hardware_version: "2.0".to_string(),
                    ..Default::default()
                },
                &[abilities::TOGGLE, abilities::TOGGLEX],
            )
            .await;

        let device = harness
            .manager
            .registry()
            .lookup_by_id(&Id::from("//BASE:X1"))
            .unwrap();
        assert_eq!(device.template().capabilities(), &[Capability::ToggleX]);
    }

    #[tokio::test]
    async fn test_push_updates_device_and_observers() {
        let harness = Harness::connected().await;
        harness
            .enroll(record("X1", "mss310"), &[abilities::TOGGLEX])
            .await;

        let failing = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let recorder = Arc::new(Recorder::default());
        harness.manager.add_observer(failing.clone()).await;
        harness.manager.add_observer(recorder.clone()).await;

        harness
            .push("X1", abilities::TOGGLEX, json!({"togglex": {"channel": 0, "onoff": 1}}))
            .await;

        eventually(|| !recorder.seen.lock().unwrap().is_empty()).await;
        let device = harness
            .manager
            .registry()
            .lookup_by_native_uuid("X1")
            .unwrap()
            .unwrap();
        assert_eq!(device.is_on(0), Some(true));
        assert_eq!(failing.seen.lock().unwrap().len(), 1);
        assert_eq!(
            recorder.seen.lock().unwrap()[0],
            (abilities::TOGGLEX.to_string(), vec![Id::from("//BASE:X1")])
        );
    }

    #[tokio::test]
    async fn test_push_for_unknown_device_still_reaches_observers() {
        let harness = Harness::connected().await;
        let recorder = Arc::new(Recorder::default());
        harness.manager.add_observer(recorder.clone()).await;

        harness.push("ghost", abilities::TOGGLEX, json!({})).await;

        eventually(|| !recorder.seen.lock().unwrap().is_empty()).await;
        assert!(recorder.seen.lock().unwrap()[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_notifications_are_processed_in_arrival_order() {
        let harness = Harness::connected().await;
        let recorder = Arc::new(Recorder::default());
        harness.manager.add_observer(recorder.clone()).await;

        let namespaces = [
            abilities::TOGGLEX,
            abilities::SYSTEM_ONLINE,
            abilities::ELECTRICITY,
            abilities::LIGHT,
        ];
        for namespace in namespaces {
            harness.push("X1", namespace, json!({})).await;
        }

        eventually(|| recorder.seen.lock().unwrap().len() == namespaces.len()).await;
        let seen: Vec<String> = recorder
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(namespace, _)| namespace.clone())
            .collect();
        assert_eq!(seen, namespaces);
    }

    #[tokio::test]
    async fn test_unbind_evicts_device() {
        let harness = Harness::connected().await;
        harness
            .enroll(record("X1", "mss310"), &[abilities::TOGGLEX])
            .await;
        let mut registry_events = harness.manager.registry().subscribe();

        harness.push("X1", abilities::CONTROL_UNBIND, json!({})).await;

        registry_events.recv().await.unwrap();
        assert!(harness
            .manager
            .registry()
            .lookup_by_id(&Id::from("//BASE:X1"))
            .is_none());
    }

    #[tokio::test]
    async fn test_bind_discovers_new_device() {
        let harness = Harness::connected().await;
        harness
            .inventory
            .insert_device(record("N1", "mss110"), Some(abilities_of(&[abilities::TOGGLE])));
        let mut registry_events = harness.manager.registry().subscribe();

        harness
            .push(
                "N1",
                abilities::CONTROL_BIND,
                json!({"bind": {"hardware": {"type": "mss110", "uuid": "N1"}, "firmware": {"version": "1.0"}}}),
            )
            .await;

        registry_events.recv().await.unwrap();
        assert!(harness
            .manager
            .registry()
            .lookup_by_native_uuid("N1")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_hub_push_reaches_subdevice() {
        let harness = Harness::connected().await;
        let hub_abilities = abilities_of(&[abilities::HUB_DIGEST, abilities::HUB_ONLINE]);
        let factory = harness.manager.factory();
        let hub = factory.build_device(&record("H1", "msh300"), &hub_abilities, harness.manager.handle());
        let sensor = factory
            .build_subdevice(
                &hub,
                &SubDeviceRecord {
                    id: "s1".to_string(),
                    kind: "ms100".to_string(),
                    name: "Sensor".to_string(),
                },
                &hub_abilities,
            )
            .unwrap();
        hub.register_subdevice(sensor.clone()).unwrap();
        harness.manager.registry().enroll(hub.clone());
        harness.manager.registry().enroll(sensor.clone());
        let recorder = Arc::new(Recorder::default());
        harness.manager.add_observer(recorder.clone()).await;

        harness
            .push("H1", abilities::HUB_ONLINE, json!({"online": [{"id": "s1", "status": 1}]}))
            .await;

        eventually(|| !recorder.seen.lock().unwrap().is_empty()).await;
        assert_eq!(sensor.online_status(), OnlineStatus::Online);
        assert_eq!(
            recorder.seen.lock().unwrap()[0].1,
            vec![Id::from("//BASE:H1"), Id::from("//SUB:H1:s1")]
        );
    }

    #[tokio::test]
    async fn test_device_failure_does_not_stop_dispatch() {
        let harness = Harness::connected().await;
        let hub_abilities = abilities_of(&[abilities::HUB_DIGEST, abilities::HUB_ONLINE]);
        let factory = harness.manager.factory();
        let hub = factory.build_device(&record("H1", "msh300"), &hub_abilities, harness.manager.handle());
        let sensor = factory
            .build_subdevice(
                &hub,
                &SubDeviceRecord {
                    id: "s1".to_string(),
                    kind: "ms100".to_string(),
                    name: "Sensor".to_string(),
                },
                &hub_abilities,
            )
            .unwrap();
        hub.register_subdevice(sensor.clone()).unwrap();
        harness.manager.registry().enroll(hub.clone());
        harness.manager.registry().enroll(sensor.clone());
        let recorder = Arc::new(Recorder::default());
        harness.manager.add_observer(recorder.clone()).await;

        // The entry carries no status, so the hub rejects the whole push.
        harness
            .push("H1", abilities::HUB_ONLINE, json!({"online": [{"id": "s1"}]}))
            .await;
        eventually(|| recorder.seen.lock().unwrap().len() == 1).await;
        assert_eq!(
            recorder.seen.lock().unwrap()[0].1,
            vec![Id::from("//BASE:H1"), Id::from("//SUB:H1:s1")]
        );
        assert_ne!(sensor.online_status(), OnlineStatus::Online);

        harness
            .push("H1", abilities::HUB_ONLINE, json!({"online": [{"id": "s1", "status": 1}]}))
            .await;
        eventually(|| recorder.seen.lock().unwrap().len() == 2).await;
        assert_eq!(sensor.online_status(), OnlineStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_command_survives_reconnect() {
        let harness = Harness::connected().await;
        let mut events = harness.manager.events().subscribe::<ConnectionEvent>().unwrap();
        let mut published = harness.transport.watch_published();

        let manager = harness.manager.clone();
        let command = tokio::spawn(async move {
            manager
                .execute_command(
                    "X1",
                    Method::Get,
                    abilities::SYSTEM_ALL,
                    json!({}),
                    Some(Duration::from_secs(30)),
                )
                .await
        });
        let request = published.recv().await.unwrap().envelope().unwrap();

        harness.transport.drop_connection("broker went away").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected { intentional: false }
        );
        assert_eq!(harness.manager.pending_requests().await, 1);

        harness.transport.inject(TransportEvent::Connected).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Subscribed);

        let reply = Envelope::request_at(
            Method::GetAck,
            abilities::SYSTEM_ALL,
            json!({"late": true}),
            "/appliance/X1/publish",
            KEY,
            request.header.message_id.clone(),
            unix_timestamp(),
        );
        harness
            .transport
            .inject_envelope(harness.manager.response_topic(), &reply)
            .await
            .unwrap();

        assert_eq!(command.await.unwrap().unwrap(), json!({"late": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_command_times_out_while_reconnecting() {
        let harness = Harness::connected().await;
        let mut published = harness.transport.watch_published();

        let manager = harness.manager.clone();
        let command = tokio::spawn(async move {
            manager
                .execute_command(
                    "X1",
                    Method::Get,
                    abilities::SYSTEM_ALL,
                    json!({}),
                    Some(Duration::from_secs(5)),
                )
                .await
        });
        published.recv().await.unwrap();
        harness.transport.drop_connection("broker went away").await.unwrap();

        let result = command.await.unwrap();
        assert!(matches!(result, Err(DeviceError::CommandTimeout { .. })));
        assert_eq!(harness.manager.pending_requests().await, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_unexpected_drop_marks_devices_unknown() {
        let harness = Harness::connected().await;
        harness
            .enroll(record("X1", "mss310"), &[abilities::TOGGLEX])
            .await;
        let mut events = harness.manager.events().subscribe::<ConnectionEvent>().unwrap();

        harness.transport.drop_connection("broker went away").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected { intentional: false }
        );
        let device = harness.manager.registry().lookup_by_native_uuid("X1").unwrap().unwrap();
        assert_eq!(device.online_status(), OnlineStatus::Unknown);
        assert!(!harness.manager.is_connected());

        // The transport reconnects by itself; the manager resubscribes.
        harness.transport.inject(TransportEvent::Connected).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Subscribed);
        assert_eq!(harness.transport.subscriptions().len(), 4);
    }

    #[tokio::test]
    async fn test_intentional_disconnect_keeps_device_status() {
        let harness = Harness::connected().await;
        harness
            .enroll(record("X1", "mss310"), &[abilities::TOGGLEX])
            .await;
        let mut events = harness.manager.events().subscribe::<ConnectionEvent>().unwrap();

        harness.manager.disconnect().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected { intentional: true }
        );
        let device = harness.manager.registry().lookup_by_native_uuid("X1").unwrap().unwrap();
        assert_eq!(device.online_status(), OnlineStatus::Online);
    }

    #[tokio::test]
    async fn test_drop_without_auto_reconnect_stops_transport() {
        let mut config = Config::default();
        config.broker.auto_reconnect = false;
        let harness = harness_with(config);
        harness.manager.connect().await.unwrap();
        let mut events = harness.manager.events().subscribe::<ConnectionEvent>().unwrap();
        let mut published = harness.transport.watch_published();

        let manager = harness.manager.clone();
        let pending = tokio::spawn(async move {
            manager
                .execute_command(
                    "X1",
                    Method::Get,
                    abilities::SYSTEM_ALL,
                    json!({}),
                    Some(Duration::from_secs(30)),
                )
                .await
        });
        published.recv().await.unwrap();

        harness.transport.drop_connection("reset").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected { intentional: false }
        );
        assert!(matches!(pending.await.unwrap(), Err(DeviceError::NotConnected)));
        eventually(|| !harness.transport.is_connected()).await;
        let result = harness
            .manager
            .execute_command("X1", Method::Get, abilities::SYSTEM_ALL, json!({}), None)
            .await;
        assert!(matches!(result, Err(DeviceError::NotConnected)));
    }

    #[tokio::test]
    async fn test_subscribe_refreshes_enrolled_devices() {
        let harness = harness();
        harness
            .inventory
            .insert_device(record("X1", "mss310"), Some(abilities_of(&[abilities::SYSTEM_ALL])));
        harness
            .inventory
            .insert_device(record("B1", "bare"), Some(AbilityMap::new()));
        harness
            .manager
            .discover_devices(&DiscoveryOptions::new())
            .await
            .unwrap();
        let mut published = harness.transport.watch_published();

        harness.manager.connect().await.unwrap();

        let refresh = published.recv().await.unwrap();
        assert_eq!(refresh.topic, "/appliance/X1/subscribe");
        assert_eq!(refresh.envelope().unwrap().header.namespace, abilities::SYSTEM_ALL);
    }

    /// Transport that accepts the connection but never confirms subscriptions
    #[derive(Debug, Default)]
    struct SilentTransport {
        disconnects: std::sync::atomic::AtomicUsize,
        events: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
    }

    #[async_trait]
    impl Transport for SilentTransport {
        async fn connect(&self, _options: ConnectOptions) -> Result<mpsc::Receiver<TransportEvent>> {
            let (tx, rx) = mpsc::channel(8);
            *self.events.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn subscribe(&self, _topics: &[String]) -> Result<()> {
            Ok(())
        }

        async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().take();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_resets_state() {
        let transport = Arc::new(SilentTransport::default());
        let manager = Manager::new(
            Config::default(),
            Credentials::new("42", KEY, "token"),
            transport.clone(),
            Arc::new(StaticInventory::new()),
        )
        .unwrap();

        let result = manager.connect().await;
        assert!(matches!(result, Err(DeviceError::Core(CoreError::Timeout(_)))));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);

        // A later attempt really connects again instead of returning early.
        let _ = manager.connect().await;
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.broker.host = String::new();
        let result = Manager::new(
            config,
            Credentials::new("42", KEY, "token"),
            Arc::new(MockTransport::new()),
            Arc::new(StaticInventory::new()),
        );
        assert!(matches!(result, Err(DeviceError::Core(_))));
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let rendered = format!("{:?}", Credentials::new("42", KEY, "session-7f3a"));
        assert!(rendered.contains("42"));
        assert!(!rendered.contains(KEY));
        assert!(!rendered.contains("session-7f3a"));
    }
}
