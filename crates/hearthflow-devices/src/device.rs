/*!
 * Device model.
 *
 * A [`Device`] is either a directly connected appliance, a hub that proxies a
 * set of sub-devices, or one of those sub-devices. What a device can do is
 * described by its shared [`CapabilityTemplate`]; per-device state (inventory
 * information, online status, channel state and the last payload seen for
 * each namespace) lives on the device itself.
 *
 * Devices never talk to the broker themselves. Direct devices issue commands
 * through a [`CommandExecutor`] (the manager), sub-devices through their hub.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use hearthflow_core::types::Id;

use crate::capability::{abilities, Capability, CapabilityTemplate};
use crate::error::{DeviceError, Result};
use crate::protocol::Method;

/// Library id prefix for directly connected devices
pub const BASE_ID_PREFIX: &str = "//BASE:";

/// Library id prefix for sub-devices
pub const SUBDEVICE_ID_PREFIX: &str = "//SUB:";

/// Library id of a directly connected device
pub fn base_library_id(uuid: &str) -> Id {
    Id::from_string(format!("{}{}", BASE_ID_PREFIX, uuid))
}

/// Library id of a sub-device
pub fn subdevice_library_id(hub_uuid: &str, subdevice_id: &str) -> Id {
    Id::from_string(format!("{}{}:{}", SUBDEVICE_ID_PREFIX, hub_uuid, subdevice_id))
}

/// Connectivity of a device as seen by the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum OnlineStatus {
    /// Connected to the cloud
    Online,
    /// Not connected to the cloud
    Offline,
    /// Never reported
    #[default]
    Unknown,
}

impl From<i64> for OnlineStatus {
    fn from(code: i64) -> Self {
        match code {
            1 => OnlineStatus::Online,
            0 | 2 => OnlineStatus::Offline,
            _ => OnlineStatus::Unknown,
        }
    }
}

impl From<OnlineStatus> for i64 {
    fn from(status: OnlineStatus) -> Self {
        match status {
            OnlineStatus::Online => 1,
            OnlineStatus::Offline => 0,
            OnlineStatus::Unknown => -1,
        }
    }
}

impl fmt::Display for OnlineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnlineStatus::Online => write!(f, "online"),
            OnlineStatus::Offline => write!(f, "offline"),
            OnlineStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A channel as listed in the inventory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Channel name
    #[serde(rename = "devName", default)]
    pub name: String,
    /// Channel type
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Inventory record of a directly connected device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Native device UUID
    pub uuid: String,
    /// Display name
    #[serde(rename = "devName", default)]
    pub name: String,
    /// Device type, e.g. `mss310`
    #[serde(default)]
    pub device_type: String,
    /// Device sub-type
    #[serde(default)]
    pub sub_type: String,
    /// Firmware version
    #[serde(rename = "fmwareVersion", default)]
    pub firmware_version: String,
    /// Hardware version
    #[serde(rename = "hdwareVersion", default)]
    pub hardware_version: String,
    /// Channels; index 0 is the master channel
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
    /// Online status code
    #[serde(default)]
    pub online_status: OnlineStatus,
    /// Broker the device is bound to
    #[serde(default)]
    pub domain: Option<String>,
    /// Fallback broker
    #[serde(default)]
    pub reserved_domain: Option<String>,
}

/// Inventory record of a sub-device attached to a hub
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDeviceRecord {
    /// Id of the sub-device, unique within its hub
    #[serde(rename = "subDeviceId")]
    pub id: String,
    /// Sub-device type, e.g. `ms100`
    #[serde(rename = "subDeviceType", default)]
    pub kind: String,
    /// Display name
    #[serde(rename = "subDeviceName", default)]
    pub name: String,
}

/// A device channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    /// Channel index
    pub index: usize,
    /// Channel name
    pub name: String,
    /// Channel type
    pub kind: String,
}

impl Channel {
    /// Whether this is the master channel
    pub fn is_master(&self) -> bool {
        self.index == 0
    }
}

/// Inventory-derived device information
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// Display name
    pub name: String,
    /// Device type
    pub device_type: String,
    /// Firmware version
    pub firmware_version: String,
    /// Hardware version
    pub hardware_version: String,
    /// Channels
    pub channels: Vec<Channel>,
    /// Online status
    pub online_status: OnlineStatus,
}

impl DeviceInfo {
    fn from_record(record: &DeviceRecord) -> Self {
        let mut channels: Vec<Channel> = record
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel)| Channel {
                index,
                name: channel.name.clone(),
                kind: channel.kind.clone(),
            })
            .collect();
        if channels.is_empty() {
            channels.push(Channel {
                index: 0,
                name: String::new(),
                kind: String::new(),
            });
        }

        Self {
            name: record.name.clone(),
            device_type: record.device_type.clone(),
            firmware_version: record.firmware_version.clone(),
            hardware_version: record.hardware_version.clone(),
            channels,
            online_status: record.online_status,
        }
    }
}

/// Issues commands to devices on the broker
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Send a signed request to the device `target_uuid` and wait for its acknowledgement
    ///
    /// `None` uses the executor's default timeout.
    async fn execute_command(
        &self,
        target_uuid: &str,
        method: Method,
        namespace: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value>;
}

/// Non-owning reference from a device to the executor that created it
#[derive(Clone)]
pub struct ManagerHandle(Weak<dyn CommandExecutor>);

impl ManagerHandle {
    /// Create a handle to `executor`
    pub fn new<E: CommandExecutor + 'static>(executor: &Arc<E>) -> Self {
        let weak: Weak<E> = Arc::downgrade(executor);
        Self(weak)
    }

    /// The executor, if it is still alive
    pub fn upgrade(&self) -> Result<Arc<dyn CommandExecutor>> {
        self.0.upgrade().ok_or(DeviceError::NotConnected)
    }
}

impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManagerHandle")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

#[derive(Debug)]
enum DeviceKind {
    Generic,
    Hub {
        subdevices: RwLock<BTreeMap<String, Arc<Device>>>,
    },
    Sub {
        // Resolved once at construction.
        hub: Weak<Device>,
        subdevice_id: String,
        refresh_namespace: &'static str,
    },
}

/// Namespace a sub-device type refreshes its full state with
pub fn subdevice_refresh_namespace(kind: &str) -> &'static str {
    match kind {
        "mts100" | "mts100v3" | "mts150" => abilities::HUB_MTS100_ALL,
        _ => abilities::HUB_SENSOR_ALL,
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    toggles: BTreeMap<usize, bool>,
    snapshots: HashMap<String, Value>,
}

/// A device known to the manager
#[derive(Debug)]
pub struct Device {
    id: Id,
    uuid: String,
    kind: DeviceKind,
    template: Arc<CapabilityTemplate>,
    manager: ManagerHandle,
    info: RwLock<DeviceInfo>,
    state: RwLock<DeviceState>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn status_code(value: &Value) -> Option<OnlineStatus> {
    value.as_i64().map(OnlineStatus::from)
}

fn onoff(value: &Value) -> Result<bool> {
    value
        .get("onoff")
        .and_then(Value::as_i64)
        .map(|v| v != 0)
        .ok_or_else(|| DeviceError::Protocol(format!("missing onoff in {}", value)))
}

impl Device {
    /// Create a directly connected device
    pub fn new(record: &DeviceRecord, template: Arc<CapabilityTemplate>, manager: ManagerHandle) -> Self {
        let kind = match template.base() {
            crate::capability::BaseKind::Hub => DeviceKind::Hub {
                subdevices: RwLock::new(BTreeMap::new()),
            },
            _ => DeviceKind::Generic,
        };

        Self {
            id: base_library_id(&record.uuid),
            uuid: record.uuid.clone(),
            kind,
            template,
            manager,
            info: RwLock::new(DeviceInfo::from_record(record)),
            state: RwLock::new(DeviceState::default()),
        }
    }

    /// Create a sub-device reachable through `hub`
    pub fn new_subdevice(
        hub: &Arc<Device>,
        record: &SubDeviceRecord,
        template: Arc<CapabilityTemplate>,
    ) -> Result<Self> {
        if !hub.is_hub() {
            return Err(DeviceError::UnsupportedOperation(format!(
                "{} is not a hub",
                hub.id
            )));
        }

        let info = DeviceInfo {
            name: record.name.clone(),
            device_type: record.kind.clone(),
            firmware_version: hub.firmware_version(),
            hardware_version: hub.hardware_version(),
            channels: vec![Channel {
                index: 0,
                name: String::new(),
                kind: String::new(),
            }],
            online_status: OnlineStatus::Unknown,
        };

        Ok(Self {
            id: subdevice_library_id(&hub.uuid, &record.id),
            uuid: hub.uuid.clone(),
            kind: DeviceKind::Sub {
                hub: Arc::downgrade(hub),
                subdevice_id: record.id.clone(),
                refresh_namespace: subdevice_refresh_namespace(&record.kind),
            },
            template,
            manager: hub.manager.clone(),
            info: RwLock::new(info),
            state: RwLock::new(DeviceState::default()),
        })
    }

    /// Library id, unique within a registry
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Native UUID; a sub-device reports its hub's
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Display name
    pub fn name(&self) -> String {
        read(&self.info).name.clone()
    }

    /// Device type
    pub fn device_type(&self) -> String {
        read(&self.info).device_type.clone()
    }

    /// Firmware version
    pub fn firmware_version(&self) -> String {
        read(&self.info).firmware_version.clone()
    }

    /// Hardware version
    pub fn hardware_version(&self) -> String {
        read(&self.info).hardware_version.clone()
    }

    /// Channels
    pub fn channels(&self) -> Vec<Channel> {
        read(&self.info).channels.clone()
    }

    /// Snapshot of the inventory-derived information
    pub fn info(&self) -> DeviceInfo {
        read(&self.info).clone()
    }

    /// The shared capability template
    pub fn template(&self) -> &Arc<CapabilityTemplate> {
        &self.template
    }

    /// Whether the device supports `capability`
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.template.has(capability)
    }

    /// Whether the device proxies sub-devices
    pub fn is_hub(&self) -> bool {
        matches!(self.kind, DeviceKind::Hub { .. })
    }

    /// Whether the device is reached through a hub
    pub fn is_subdevice(&self) -> bool {
        matches!(self.kind, DeviceKind::Sub { .. })
    }

    /// Id of the sub-device within its hub
    pub fn subdevice_id(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::Sub { subdevice_id, .. } => Some(subdevice_id),
            _ => None,
        }
    }

    /// Online status
    ///
    /// A sub-device is offline whenever its hub is not online.
    pub fn online_status(&self) -> OnlineStatus {
        let own = read(&self.info).online_status;
        match &self.kind {
            DeviceKind::Sub { hub, .. } => match hub.upgrade() {
                Some(hub) if hub.online_status() == OnlineStatus::Online => own,
                _ => OnlineStatus::Offline,
            },
            _ => own,
        }
    }

    pub(crate) fn set_online_status(&self, status: OnlineStatus) {
        let mut info = write(&self.info);
        if info.online_status != status {
            debug!("{} is now {}", self.id, status);
            info.online_status = status;
        }
    }

    /// Last known on/off state of `channel`
    pub fn is_on(&self, channel: usize) -> Option<bool> {
        read(&self.state).toggles.get(&channel).copied()
    }

    /// Last payload seen for `namespace`
    pub fn snapshot(&self, namespace: &str) -> Option<Value> {
        read(&self.state).snapshots.get(namespace).cloned()
    }

    fn store_snapshot(&self, namespace: &str, payload: &Value) {
        write(&self.state)
            .snapshots
            .insert(namespace.to_string(), payload.clone());
    }

    fn set_toggle(&self, channel: usize, on: bool) {
        write(&self.state).toggles.insert(channel, on);
    }

    /// Replace inventory-derived information with `record`
    ///
    /// The record must describe this device. The update is applied in one step.
    pub fn update_from_inventory(&self, record: &DeviceRecord) -> Result<()> {
        if self.is_subdevice() {
            return Err(DeviceError::UnsupportedOperation(format!(
                "{} is a sub-device",
                self.id
            )));
        }
        if record.uuid != self.uuid {
            return Err(DeviceError::IdentityMismatch {
                expected: self.uuid.clone(),
                actual: record.uuid.clone(),
            });
        }

        *write(&self.info) = DeviceInfo::from_record(record);
        trace!("Updated {} from inventory", self.id);
        Ok(())
    }

    /// Apply a sub-device inventory record to this sub-device
    pub fn update_subdevice_from_inventory(&self, record: &SubDeviceRecord) -> Result<()> {
        match self.subdevice_id() {
            Some(id) if id == record.id => {
                let mut info = write(&self.info);
                info.name = record.name.clone();
                info.device_type = record.kind.clone();
                Ok(())
            }
            Some(id) => Err(DeviceError::IdentityMismatch {
                expected: id.to_string(),
                actual: record.id.clone(),
            }),
            None => Err(DeviceError::UnsupportedOperation(format!(
                "{} is not a sub-device",
                self.id
            ))),
        }
    }

    /// Offer a push notification to the device
    ///
    /// Returns whether some capability consumed it. Hub namespaces are fanned
    /// out to the addressed sub-devices. Sub-devices only receive notifications
    /// through [`Device::handle_subdevice_notification`].
    pub fn handle_notification(&self, namespace: &str, payload: &Value) -> Result<bool> {
        if self.is_subdevice() {
            return Ok(false);
        }

        let capability = match self.template.capability_for_namespace(namespace) {
            Some(capability) => capability,
            None => return Ok(false),
        };

        match capability {
            c if c.is_hub_fanout() => self.fan_out(namespace, payload),
            Capability::ToggleX => self.apply_togglex(payload).map(|_| true),
            Capability::Toggle => self.apply_toggle(payload).map(|_| true),
            Capability::SystemOnline => self.apply_online(payload).map(|_| true),
            Capability::SystemAll => self.apply_system_all(payload).map(|_| true),
            _ => {
                self.store_snapshot(namespace, payload);
                Ok(true)
            }
        }
    }

    fn fan_out(&self, namespace: &str, payload: &Value) -> Result<bool> {
        let subdevices = match &self.kind {
            DeviceKind::Hub { subdevices } => read(subdevices).clone(),
            _ => return Ok(false),
        };

        let entries: Vec<&Value> = payload
            .as_object()
            .into_iter()
            .flat_map(|object| object.values())
            .filter_map(Value::as_array)
            .flatten()
            .collect();
        if entries.is_empty() {
            return Err(DeviceError::Protocol(format!(
                "{} notification carries no sub-device entries",
                namespace
            )));
        }

        let mut handled = false;
        for entry in entries {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                warn!("Skipping {} entry without id on hub {}", namespace, self.uuid);
                continue;
            };

            match subdevices.get(id) {
                Some(subdevice) => handled |= subdevice.handle_subdevice_notification(namespace, entry)?,
                None => debug!("Hub {} has no sub-device {}", self.uuid, id),
            }
        }

        Ok(handled)
    }

    /// Apply one sub-device entry of a hub notification
    pub fn handle_subdevice_notification(&self, namespace: &str, entry: &Value) -> Result<bool> {
        if !self.is_subdevice() {
            return Ok(false);
        }

        match namespace {
            abilities::HUB_ONLINE => {
                let status = entry
                    .get("status")
                    .and_then(status_code)
                    .ok_or_else(|| DeviceError::Protocol(format!("missing status in {}", entry)))?;
                self.set_online_status(status);
            }
            abilities::HUB_TOGGLEX => self.set_toggle(0, onoff(entry)?),
            _ => {}
        }

        self.store_snapshot(namespace, entry);
        Ok(true)
    }

    fn apply_togglex(&self, payload: &Value) -> Result<()> {
        let togglex = payload
            .get("togglex")
            .ok_or_else(|| DeviceError::Protocol("missing togglex".to_string()))?;
        let entries = match togglex {
            Value::Array(entries) => entries.iter().collect(),
            entry => vec![entry],
        };

        for entry in entries {
            let channel = entry.get("channel").and_then(Value::as_u64).unwrap_or(0) as usize;
            self.set_toggle(channel, onoff(entry)?);
        }
        Ok(())
    }

    fn apply_toggle(&self, payload: &Value) -> Result<()> {
        let toggle = payload
            .get("toggle")
            .ok_or_else(|| DeviceError::Protocol("missing toggle".to_string()))?;
        let channel = toggle.get("channel").and_then(Value::as_u64).unwrap_or(0) as usize;
        self.set_toggle(channel, onoff(toggle)?);
        Ok(())
    }

    fn apply_online(&self, payload: &Value) -> Result<()> {
        let status = payload
            .pointer("/online/status")
            .and_then(status_code)
            .ok_or_else(|| DeviceError::Protocol("missing online.status".to_string()))?;
        self.set_online_status(status);
        Ok(())
    }

    fn apply_system_all(&self, payload: &Value) -> Result<()> {
        let all = payload
            .get("all")
            .ok_or_else(|| DeviceError::Protocol("missing all".to_string()))?;

        if let Some(status) = all.pointer("/system/online/status").and_then(status_code) {
            self.set_online_status(status);
        }

        if let Some(togglex) = all.pointer("/digest/togglex") {
            self.apply_togglex(&json!({ "togglex": togglex }))?;
        }

        if let (DeviceKind::Hub { subdevices }, Some(entries)) = (
            &self.kind,
            all.pointer("/digest/hub/subdevice").and_then(Value::as_array),
        ) {
            let subdevices = read(subdevices).clone();
            for entry in entries {
                let subdevice = entry
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|id| subdevices.get(id));
                if let Some(subdevice) = subdevice {
                    if let Some(status) = entry.get("status").and_then(status_code) {
                        subdevice.set_online_status(status);
                    }
                    subdevice.store_snapshot(abilities::HUB_DIGEST, entry);
                }
            }
        }

        self.store_snapshot(abilities::SYSTEM_ALL, payload);
        Ok(())
    }

    fn apply_subdevice_all(&self, namespace: &str, payload: &Value) -> Result<()> {
        let id = self.subdevice_id().unwrap_or_default();
        let entry = payload
            .get("all")
            .and_then(Value::as_array)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|entry| entry.get("id").and_then(Value::as_str) == Some(id))
            })
            .ok_or_else(|| DeviceError::NotFound(format!("{} in {} response", self.id, namespace)))?;

        if let Some(status) = entry.pointer("/online/status").and_then(status_code) {
            self.set_online_status(status);
        }
        if let Some(on) = entry.pointer("/togglex/onoff").and_then(Value::as_i64) {
            self.set_toggle(0, on != 0);
        }
        self.store_snapshot(namespace, entry);
        Ok(())
    }

    fn hub(&self) -> Result<Arc<Device>> {
        match &self.kind {
            DeviceKind::Sub { hub, .. } => hub
                .upgrade()
                .ok_or_else(|| DeviceError::NotFound(format!("hub of {}", self.id))),
            _ => Err(DeviceError::UnsupportedOperation(format!(
                "{} is not a sub-device",
                self.id
            ))),
        }
    }

    /// Refresh the device's full state from the device itself
    ///
    /// Direct devices need [`Capability::SystemAll`]; sub-devices ask their hub.
    pub async fn update(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.kind {
            DeviceKind::Sub {
                subdevice_id,
                refresh_namespace,
                ..
            } => {
                let payload = json!({ "all": [{ "id": subdevice_id }] });
                let response = self
                    .hub()?
                    .execute_command(Method::Get, refresh_namespace, payload, timeout)
                    .await?;
                self.apply_subdevice_all(refresh_namespace, &response)
            }
            _ => {
                if !self.has_capability(Capability::SystemAll) {
                    return Err(DeviceError::UnsupportedOperation(format!(
                        "{} has no bulk refresh capability",
                        self.id
                    )));
                }
                let response = self
                    .execute_command(Method::Get, abilities::SYSTEM_ALL, json!({}), timeout)
                    .await?;
                self.apply_system_all(&response)
            }
        }
    }

    /// Send a command to this device and wait for its acknowledgement
    ///
    /// Sub-devices have no transport of their own and always fail with
    /// [`DeviceError::DelegationRequired`].
    pub async fn execute_command(
        &self,
        method: Method,
        namespace: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.is_subdevice() {
            return Err(DeviceError::DelegationRequired(self.id.to_string()));
        }

        self.manager
            .upgrade()?
            .execute_command(&self.uuid, method, namespace, payload, timeout)
            .await
    }

    /// Attach a sub-device to this hub
    ///
    /// Registering an id twice keeps the first sub-device.
    pub fn register_subdevice(&self, subdevice: Arc<Device>) -> Result<()> {
        let DeviceKind::Hub { subdevices } = &self.kind else {
            return Err(DeviceError::UnsupportedOperation(format!(
                "{} is not a hub",
                self.id
            )));
        };
        let Some(id) = subdevice.subdevice_id().map(str::to_string) else {
            return Err(DeviceError::UnsupportedOperation(format!(
                "{} is not a sub-device",
                subdevice.id
            )));
        };

        let mut subdevices = write(subdevices);
        if subdevices.contains_key(&id) {
            warn!("Sub-device {} is already registered on hub {}", id, self.uuid);
            return Ok(());
        }
        subdevices.insert(id, subdevice);
        Ok(())
    }

    /// Sub-device with `id`, if this hub has one
    pub fn subdevice(&self, id: &str) -> Option<Arc<Device>> {
        match &self.kind {
            DeviceKind::Hub { subdevices } => read(subdevices).get(id).cloned(),
            _ => None,
        }
    }

    /// All sub-devices of this hub
    pub fn subdevices(&self) -> Vec<Arc<Device>> {
        match &self.kind {
            DeviceKind::Hub { subdevices } => read(subdevices).values().cloned().collect(),
            _ => Vec::new(),
        }
    }
}
