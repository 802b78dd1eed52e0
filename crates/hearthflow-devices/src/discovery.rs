/*!
 * Device discovery.
 *
 * Discovery reconciles the account inventory with the registry: devices that
 * are already enrolled are refreshed from their inventory record, new devices
 * are composed by the [`CapabilityFactory`] and enrolled, and hubs get their
 * sub-devices attached and enrolled alongside them.
 */
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hearthflow_core::types::Id;

use crate::capability::{abilities, AbilityMap, CapabilityFactory};
use crate::device::{Device, DeviceRecord, ManagerHandle, OnlineStatus, SubDeviceRecord};
use crate::error::{DeviceError, Result};
use crate::protocol::Method;
use crate::registry::DeviceRegistry;

/// Source of the account's device inventory
#[async_trait]
pub trait InventorySource: Send + Sync + Debug {
    /// Every device bound to the account
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Sub-devices attached to the hub `hub_uuid`
    async fn list_sub_devices(&self, hub_uuid: &str) -> Result<Vec<SubDeviceRecord>>;

    /// Abilities of `uuid`, when the inventory knows them
    ///
    /// `None` makes discovery ask the device itself.
    async fn device_abilities(&self, _uuid: &str) -> Result<Option<AbilityMap>> {
        Ok(None)
    }
}

/// Discovery options
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Only consider devices of this type
    pub device_type: Option<String>,
    /// Only consider these native UUIDs
    pub native_uuids: Option<HashSet<String>>,
    /// Timeout for ability queries; `None` uses the manager default
    pub ability_timeout: Option<Duration>,
}

impl DiscoveryOptions {
    /// Creates options that consider every device
    pub fn new() -> Self {
        Self::default()
    }

    /// Only consider devices of `device_type`
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Only consider `uuids`
    pub fn with_native_uuids<I, S>(mut self, uuids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.native_uuids = Some(uuids.into_iter().map(Into::into).collect());
        self
    }

    fn accepts(&self, record: &DeviceRecord) -> bool {
        self.device_type
            .as_ref()
            .map_or(true, |device_type| record.device_type == *device_type)
            && self
                .native_uuids
                .as_ref()
                .map_or(true, |uuids| uuids.contains(&record.uuid))
    }
}

/// Outcome of a discovery pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryResult {
    /// Newly enrolled devices
    pub enrolled: Vec<Id>,
    /// Already enrolled devices refreshed from inventory
    pub updated: Vec<Id>,
    /// Native UUIDs that could not be enrolled
    pub failed: Vec<String>,
}

impl DiscoveryResult {
    /// Number of devices the pass touched successfully
    pub fn synced(&self) -> usize {
        self.enrolled.len() + self.updated.len()
    }
}

/// Reconciles inventory with the registry
///
/// Passes are serialized so two passes never build competing hubs for the
/// same inventory record.
#[derive(Debug)]
pub struct DeviceDiscoverer {
    inventory: Arc<dyn InventorySource>,
    factory: Arc<CapabilityFactory>,
    registry: Arc<DeviceRegistry>,
    pass: Mutex<()>,
}

impl DeviceDiscoverer {
    /// Create a new device discoverer
    pub fn new(
        inventory: Arc<dyn InventorySource>,
        factory: Arc<CapabilityFactory>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            inventory,
            factory,
            registry,
            pass: Mutex::new(()),
        }
    }

    /// Run one discovery pass
    ///
    /// Failures on individual devices are recorded in the result; only a failing
    /// inventory listing aborts the pass.
    pub async fn discover(
        &self,
        manager: &ManagerHandle,
        options: &DiscoveryOptions,
    ) -> Result<DiscoveryResult> {
        let _pass = self.pass.lock().await;
        let records = self.inventory.list_devices().await?;
        let mut result = DiscoveryResult::default();

        for record in records.iter().filter(|record| options.accepts(record)) {
            match self.registry.lookup_by_native_uuid(&record.uuid) {
                Ok(Some(device)) => match device.update_from_inventory(record) {
                    Ok(()) => {
                        result.updated.push(device.id().clone());
                        if device.is_hub() {
                            self.sync_subdevices(&device, record, None, manager, options, &mut result)
                                .await;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to refresh {} from inventory: {}", record.uuid, e);
                        result.failed.push(record.uuid.clone());
                    }
                },
                Ok(None) => match self.enroll(record, manager, options).await {
                    Ok((device, reported, inserted)) => {
                        if inserted {
                            result.enrolled.push(device.id().clone());
                        } else {
                            result.updated.push(device.id().clone());
                        }
                        if device.is_hub() {
                            self.sync_subdevices(
                                &device,
                                record,
                                Some(reported),
                                manager,
                                options,
                                &mut result,
                            )
                            .await;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to enroll {}: {}", record.uuid, e);
                        result.failed.push(record.uuid.clone());
                    }
                },
                Err(e) => {
                    warn!("Skipping {}: {}", record.uuid, e);
                    result.failed.push(record.uuid.clone());
                }
            }
        }

        info!(
            "Discovery enrolled {}, updated {}, failed {}",
            result.enrolled.len(),
            result.updated.len(),
            result.failed.len()
        );
        Ok(result)
    }

    async fn abilities(
        &self,
        record: &DeviceRecord,
        manager: &ManagerHandle,
        options: &DiscoveryOptions,
    ) -> Result<AbilityMap> {
        if let Some(reported) = self.inventory.device_abilities(&record.uuid).await? {
            return Ok(reported);
        }

        if record.online_status != OnlineStatus::Online {
            return Err(DeviceError::UnsupportedOperation(format!(
                "cannot query abilities of {} while it is {}",
                record.uuid, record.online_status
            )));
        }

        let response = manager
            .upgrade()?
            .execute_command(
                &record.uuid,
                Method::Get,
                abilities::SYSTEM_ABILITY,
                json!({}),
                options.ability_timeout,
            )
            .await?;

        match response.get("ability") {
            Some(Value::Object(reported)) => Ok(reported.clone()),
            _ => Err(DeviceError::Protocol(format!(
                "{} response from {} carries no ability map",
                abilities::SYSTEM_ABILITY,
                record.uuid
            ))),
        }
    }

    async fn enroll(
        &self,
        record: &DeviceRecord,
        manager: &ManagerHandle,
        options: &DiscoveryOptions,
    ) -> Result<(Arc<Device>, AbilityMap, bool)> {
        let reported = self.abilities(record, manager, options).await?;
        let device = self.factory.build_device(record, &reported, manager.clone());
        if self.registry.enroll(device.clone()) {
            debug!("Discovered {} ({})", device.id(), record.device_type);
            return Ok((device, reported, true));
        }

        // Someone else enrolled this device meanwhile; keep theirs.
        let registered = self
            .registry
            .lookup_by_id(device.id())
            .ok_or_else(|| DeviceError::NotFound(device.id().to_string()))?;
        registered.update_from_inventory(record)?;
        Ok((registered, reported, false))
    }

    async fn sync_subdevices(
        &self,
        hub: &Arc<Device>,
        hub_record: &DeviceRecord,
        mut reported: Option<AbilityMap>,
        manager: &ManagerHandle,
        options: &DiscoveryOptions,
        result: &mut DiscoveryResult,
    ) {
        let records = match self.inventory.list_sub_devices(hub.uuid()).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to list sub-devices of {}: {}", hub.uuid(), e);
                return;
            }
        };

        for record in records {
            let label = format!("{}:{}", hub.uuid(), record.id);

            if let Some(existing) = hub.subdevice(&record.id) {
                match existing.update_subdevice_from_inventory(&record) {
                    Ok(()) => result.updated.push(existing.id().clone()),
                    Err(e) => {
                        warn!("Failed to refresh sub-device {}: {}", label, e);
                        result.failed.push(label);
                    }
                }
                continue;
            }

            // New sub-devices are composed from the hub's abilities, fetched at most once.
            if reported.is_none() {
                match self.abilities(hub_record, manager, options).await {
                    Ok(abilities) => reported = Some(abilities),
                    Err(e) => warn!("No abilities known for hub {}: {}", hub.uuid(), e),
                }
            }
            let Some(hub_abilities) = reported.as_ref() else {
                result.failed.push(label);
                continue;
            };

            let built = self
                .factory
                .build_subdevice(hub, &record, hub_abilities)
                .and_then(|subdevice| {
                    hub.register_subdevice(subdevice.clone())?;
                    Ok(hub.subdevice(&record.id).unwrap_or(subdevice))
                });
            match built {
                Ok(subdevice) => {
                    if self.registry.enroll(subdevice.clone()) {
                        result.enrolled.push(subdevice.id().clone());
                    } else {
                        result.updated.push(subdevice.id().clone());
                    }
                }
                Err(e) => {
                    warn!("Failed to build sub-device {}: {}", label, e);
                    result.failed.push(label);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct InventoryData {
    devices: Vec<DeviceRecord>,
    sub_devices: HashMap<String, Vec<SubDeviceRecord>>,
    abilities: HashMap<String, AbilityMap>,
}

/// In-memory inventory
#[derive(Debug, Default)]
pub struct StaticInventory {
    data: RwLock<InventoryData>,
}

impl StaticInventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, optionally with its abilities
    pub fn with_device(self, record: DeviceRecord, reported: Option<AbilityMap>) -> Self {
        self.insert_device(record, reported);
        self
    }

    /// Add a sub-device to the hub `hub_uuid`
    pub fn with_sub_device(self, hub_uuid: &str, record: SubDeviceRecord) -> Self {
        self.write()
            .sub_devices
            .entry(hub_uuid.to_string())
            .or_default()
            .push(record);
        self
    }

    /// Add or replace a device
    pub fn insert_device(&self, record: DeviceRecord, reported: Option<AbilityMap>) {
        let mut data = self.write();
        if let Some(reported) = reported {
            data.abilities.insert(record.uuid.clone(), reported);
        }
        data.devices.retain(|existing| existing.uuid != record.uuid);
        data.devices.push(record);
    }

    /// Remove a device
    pub fn remove_device(&self, uuid: &str) {
        let mut data = self.write();
        data.devices.retain(|existing| existing.uuid != uuid);
        data.abilities.remove(uuid);
        data.sub_devices.remove(uuid);
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InventoryData> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InventoryData> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl InventorySource for StaticInventory {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.read().devices.clone())
    }

    async fn list_sub_devices(&self, hub_uuid: &str) -> Result<Vec<SubDeviceRecord>> {
        Ok(self
            .read()
            .sub_devices
            .get(hub_uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn device_abilities(&self, uuid: &str) -> Result<Option<AbilityMap>> {
        Ok(self.read().abilities.get(uuid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::device::tests::{abilities_of, record, ScriptedExecutor};

    #[derive(Debug)]
    struct BrokenInventory;

    #[async_trait]
    impl InventorySource for BrokenInventory {
        async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
            Err(DeviceError::Inventory("unavailable".to_string()))
        }

        async fn list_sub_devices(&self, _hub_uuid: &str) -> Result<Vec<SubDeviceRecord>> {
            Ok(Vec::new())
        }
    }

    fn discoverer(inventory: StaticInventory) -> (DeviceDiscoverer, Arc<DeviceRegistry>) {
        let registry = Arc::new(DeviceRegistry::new());
        let discoverer = DeviceDiscoverer::new(
            Arc::new(inventory),
            Arc::new(CapabilityFactory::new()),
            registry.clone(),
        );
        (discoverer, registry)
    }

    #[tokio::test]
    async fn test_discover_enrolls_new_devices() {
        let executor = Arc::new(ScriptedExecutor::default());
        let inventory = StaticInventory::new().with_device(
            record("X1", "mss310"),
            Some(abilities_of(&[abilities::TOGGLE, abilities::TOGGLEX])),
        );
        let (discoverer, registry) = discoverer(inventory);

        let result = discoverer
            .discover(&ManagerHandle::new(&executor), &DiscoveryOptions::new())
            .await
            .unwrap();

        assert_eq!(result.enrolled, vec![Id::from("//BASE:X1")]);
        let device = registry.lookup_by_id(&Id::from("//BASE:X1")).unwrap();
        assert_eq!(device.template().capabilities(), &[Capability::ToggleX]);
        assert!(executor.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discover_queries_abilities_from_device() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.respond(
            abilities::SYSTEM_ABILITY,
            json!({ "ability": abilities_of(&[abilities::LIGHT, abilities::SYSTEM_ALL]) }),
        );
        let (discoverer, registry) =
            discoverer(StaticInventory::new().with_device(record("L1", "msl120"), None));

        let result = discoverer
            .discover(&ManagerHandle::new(&executor), &DiscoveryOptions::new())
            .await
            .unwrap();

        assert_eq!(result.enrolled.len(), 1);
        let light = registry.lookup_by_native_uuid("L1").unwrap().unwrap();
        assert!(light.has_capability(Capability::Light));

        let requests = executor.requests.lock().unwrap();
        assert_eq!(requests[0].0, "L1");
        assert_eq!(requests[0].2, abilities::SYSTEM_ABILITY);
    }

    #[tokio::test]
    async fn test_discover_skips_offline_devices_without_abilities() {
        let executor = Arc::new(ScriptedExecutor::default());
        let mut offline = record("X1", "mss310");
        offline.online_status = OnlineStatus::Offline;
        let (discoverer, registry) = discoverer(StaticInventory::new().with_device(offline, None));

        let result = discoverer
            .discover(&ManagerHandle::new(&executor), &DiscoveryOptions::new())
            .await
            .unwrap();

        assert_eq!(result.failed, vec!["X1".to_string()]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_discover_updates_enrolled_devices() {
        let executor = Arc::new(ScriptedExecutor::default());
        let inventory = Arc::new(
            StaticInventory::new().with_device(record("X1", "mss310"), Some(AbilityMap::new())),
        );
        let registry = Arc::new(DeviceRegistry::new());
        let discoverer = DeviceDiscoverer::new(
            inventory.clone(),
            Arc::new(CapabilityFactory::new()),
            registry.clone(),
        );
        let manager = ManagerHandle::new(&executor);

        discoverer
            .discover(&manager, &DiscoveryOptions::new())
            .await
            .unwrap();

        let mut renamed = record("X1", "mss310");
        renamed.name = "Renamed".to_string();
        inventory.insert_device(renamed, None);

        let result = discoverer
            .discover(&manager, &DiscoveryOptions::new())
            .await
            .unwrap();
        assert!(result.enrolled.is_empty());
        assert_eq!(result.updated, vec![Id::from("//BASE:X1")]);
        assert_eq!(
            registry.lookup_by_native_uuid("X1").unwrap().unwrap().name(),
            "Renamed"
        );
    }

    #[tokio::test]
    async fn test_discover_attaches_hub_subdevices() {
        let executor = Arc::new(ScriptedExecutor::default());
        let inventory = StaticInventory::new()
            .with_device(
                record("H1", "msh300"),
                Some(abilities_of(&[
                    abilities::HUB_DIGEST,
                    abilities::HUB_ONLINE,
                    abilities::HUB_MTS100_ALL,
                ])),
            )
            .with_sub_device(
                "H1",
                SubDeviceRecord {
                    id: "t1".to_string(),
                    kind: "mts100v3".to_string(),
                    name: "Radiator".to_string(),
                },
            );
        let (discoverer, registry) = discoverer(inventory);

        let result = discoverer
            .discover(&ManagerHandle::new(&executor), &DiscoveryOptions::new())
            .await
            .unwrap();

        assert_eq!(
            result.enrolled,
            vec![Id::from("//BASE:H1"), Id::from("//SUB:H1:t1")]
        );
        let hub = registry.lookup_by_id(&Id::from("//BASE:H1")).unwrap();
        let radiator = registry.lookup_by_id(&Id::from("//SUB:H1:t1")).unwrap();
        assert!(hub.is_hub());
        assert!(Arc::ptr_eq(&hub.subdevice("t1").unwrap(), &radiator));
        assert_eq!(radiator.name(), "Radiator");
    }

    /// Inventory whose first sub-device listing is slow, so passes overlap
    #[derive(Debug)]
    struct SlowInventory {
        inner: StaticInventory,
        slow_listing: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl InventorySource for SlowInventory {
        async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
            self.inner.list_devices().await
        }

        async fn list_sub_devices(&self, hub_uuid: &str) -> Result<Vec<SubDeviceRecord>> {
            if self
                .slow_listing
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.list_sub_devices(hub_uuid).await
        }

        async fn device_abilities(&self, uuid: &str) -> Result<Option<AbilityMap>> {
            tokio::task::yield_now().await;
            self.inner.device_abilities(uuid).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_passes_share_one_hub() {
        let executor = Arc::new(ScriptedExecutor::default());
        let inventory = SlowInventory {
            inner: StaticInventory::new()
                .with_device(
                    record("H1", "msh300"),
                    Some(abilities_of(&[abilities::HUB_DIGEST, abilities::HUB_ONLINE])),
                )
                .with_sub_device(
                    "H1",
                    SubDeviceRecord {
                        id: "s1".to_string(),
                        kind: "ms100".to_string(),
                        name: "Sensor".to_string(),
                    },
                ),
            slow_listing: std::sync::atomic::AtomicBool::new(true),
        };
        let registry = Arc::new(DeviceRegistry::new());
        let discoverer = DeviceDiscoverer::new(
            Arc::new(inventory),
            Arc::new(CapabilityFactory::new()),
            registry.clone(),
        );
        let manager = ManagerHandle::new(&executor);
        let options = DiscoveryOptions::new();

        let (first, second) = tokio::join!(
            discoverer.discover(&manager, &options),
            discoverer.discover(&manager, &options)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        let mut enrolled: Vec<Id> = first.enrolled.iter().chain(&second.enrolled).cloned().collect();
        enrolled.sort();
        assert_eq!(enrolled, vec![Id::from("//BASE:H1"), Id::from("//SUB:H1:s1")]);

        let hub = registry.lookup_by_id(&Id::from("//BASE:H1")).unwrap();
        let sensor = registry.lookup_by_id(&Id::from("//SUB:H1:s1")).unwrap();
        assert!(Arc::ptr_eq(&hub.subdevice("s1").unwrap(), &sensor));

        hub.handle_notification(
            abilities::HUB_ONLINE,
            &json!({"online": [{"id": "s1", "status": 1}]}),
        )
        .unwrap();
        assert_eq!(sensor.online_status(), OnlineStatus::Online);
    }

    #[tokio::test]
    async fn test_enrolling_an_already_registered_device_reuses_it() {
        let executor = Arc::new(ScriptedExecutor::default());
        let manager = ManagerHandle::new(&executor);
        let factory = Arc::new(CapabilityFactory::new());
        let registry = Arc::new(DeviceRegistry::new());
        let existing = factory.build_device(&record("X1", "mss310"), &AbilityMap::new(), manager.clone());
        registry.enroll(existing.clone());

        let discoverer = DeviceDiscoverer::new(
            Arc::new(StaticInventory::new().with_device(record("X1", "mss310"), Some(AbilityMap::new()))),
            factory,
            registry.clone(),
        );
        let mut renamed = record("X1", "mss310");
        renamed.name = "Renamed".to_string();

        let (device, _, inserted) = discoverer
            .enroll(&renamed, &manager, &DiscoveryOptions::new())
            .await
            .unwrap();

        assert!(!inserted);
        assert!(Arc::ptr_eq(&device, &existing));
        assert_eq!(existing.name(), "Renamed");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_discover_applies_options() {
        let executor = Arc::new(ScriptedExecutor::default());
        let inventory = StaticInventory::new()
            .with_device(record("X1", "mss310"), Some(AbilityMap::new()))
            .with_device(record("L1", "msl120"), Some(AbilityMap::new()));
        let (discoverer, registry) = discoverer(inventory);

        discoverer
            .discover(
                &ManagerHandle::new(&executor),
                &DiscoveryOptions::new().with_device_type("msl120"),
            )
            .await
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.lookup_by_native_uuid("L1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_inventory_failure_aborts_pass() {
        let executor = Arc::new(ScriptedExecutor::default());
        let discoverer = DeviceDiscoverer::new(
            Arc::new(BrokenInventory),
            Arc::new(CapabilityFactory::new()),
            Arc::new(DeviceRegistry::new()),
        );

        let result = discoverer
            .discover(&ManagerHandle::new(&executor), &DiscoveryOptions::new())
            .await;
        assert!(matches!(result, Err(DeviceError::Inventory(_))));
    }
}
