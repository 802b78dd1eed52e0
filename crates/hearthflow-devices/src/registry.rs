/*!
 * Device registry.
 *
 * The registry indexes live devices by library id. Iteration follows library id
 * order, so hubs (`//BASE:`) are always visited before their sub-devices
 * (`//SUB:`).
 */
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use hearthflow_core::types::Id;

use crate::capability::Capability;
use crate::device::{Device, OnlineStatus};
use crate::error::{DeviceError, Result};

/// Event types for the device registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A device was enrolled
    DeviceEnrolled(Id),
    /// A device was relinquished
    DeviceRelinquished(Id),
}

/// Conjunction of optional device predicates
///
/// An empty filter matches every device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceFilter {
    /// Native UUIDs to match
    pub native_uuids: Option<HashSet<String>>,
    /// Library ids to match
    pub library_ids: Option<HashSet<Id>>,
    /// Device type to match
    pub device_type: Option<String>,
    /// Capability the device must have
    pub capability: Option<Capability>,
    /// Display name to match
    pub device_name: Option<String>,
    /// Online status to match
    pub online_status: Option<OnlineStatus>,
}

impl DeviceFilter {
    /// Create a filter matching every device
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to devices with one of `uuids`
    pub fn native_uuids<I, S>(mut self, uuids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.native_uuids = Some(uuids.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to devices with one of `ids`
    pub fn library_ids<I: IntoIterator<Item = Id>>(mut self, ids: I) -> Self {
        self.library_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restrict to devices of `device_type`
    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Restrict to devices with `capability`
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Restrict to devices named `name`
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Restrict to devices in `status`
    pub fn online_status(mut self, status: OnlineStatus) -> Self {
        self.online_status = Some(status);
        self
    }

    /// Whether `device` satisfies every predicate
    pub fn matches(&self, device: &Device) -> bool {
        self.native_uuids
            .as_ref()
            .map_or(true, |uuids| uuids.contains(device.uuid()))
            && self
                .library_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(device.id()))
            && self
                .device_type
                .as_ref()
                .map_or(true, |device_type| device.device_type() == *device_type)
            && self
                .capability
                .map_or(true, |capability| device.has_capability(capability))
            && self
                .device_name
                .as_ref()
                .map_or(true, |name| device.name() == *name)
            && self
                .online_status
                .map_or(true, |status| device.online_status() == status)
    }
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    /// The enrolled devices
    devices: RwLock<BTreeMap<Id, Arc<Device>>>,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(BTreeMap::new()),
            event_sender,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Id, Arc<Device>>> {
        self.devices.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Id, Arc<Device>>> {
        self.devices.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enroll a device under its library id
    ///
    /// Enrolling an id that is already present keeps the existing device.
    /// Returns whether the device was inserted.
    pub fn enroll(&self, device: Arc<Device>) -> bool {
        let id = device.id().clone();
        {
            let mut devices = self.write();
            if devices.contains_key(&id) {
                warn!("Device {} is already enrolled", id);
                return false;
            }
            devices.insert(id.clone(), device);
        }

        let _ = self.event_sender.send(RegistryEvent::DeviceEnrolled(id.clone()));
        debug!("Enrolled device {}", id);
        true
    }

    /// Remove the device enrolled under `id`
    pub fn relinquish(&self, id: &Id) -> Result<Arc<Device>> {
        let device = self
            .write()
            .remove(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;

        let _ = self.event_sender.send(RegistryEvent::DeviceRelinquished(id.clone()));
        debug!("Relinquished device {}", id);
        Ok(device)
    }

    /// Device enrolled under `id`
    pub fn lookup_by_id(&self, id: &Id) -> Option<Arc<Device>> {
        self.read().get(id).cloned()
    }

    /// The directly connected device with native UUID `uuid`
    ///
    /// Sub-devices share their hub's UUID and are not considered.
    pub fn lookup_by_native_uuid(&self, uuid: &str) -> Result<Option<Arc<Device>>> {
        let mut matches: Vec<Arc<Device>> = self
            .read()
            .values()
            .filter(|device| !device.is_subdevice() && device.uuid() == uuid)
            .cloned()
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            count => Err(DeviceError::Ambiguous {
                uuid: uuid.to_string(),
                count,
            }),
        }
    }

    /// Every device matching `filter`, in library id order
    pub fn find_all_by(&self, filter: &DeviceFilter) -> Vec<Arc<Device>> {
        self.read()
            .values()
            .filter(|device| filter.matches(device))
            .cloned()
            .collect()
    }

    /// All enrolled devices, in library id order
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.read().values().cloned().collect()
    }

    /// Number of enrolled devices
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no device is enrolled
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
