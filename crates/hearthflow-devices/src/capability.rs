/*!
 * Capability composition.
 *
 * Devices advertise a list of abilities. Each known ability maps to a
 * [`Capability`]; the set of capabilities a class of devices supports is
 * captured once in a [`CapabilityTemplate`] and shared by every device with the
 * same type, hardware version and firmware version.
 *
 * When a device advertises both `{ability}` and `{ability}X`, only the `X`
 * capability is kept. This follows the vendor's naming convention for
 * superseded abilities; abilities outside that convention are taken as-is.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::device::{Device, DeviceRecord, ManagerHandle, SubDeviceRecord};
use crate::error::Result;

/// Ability map as reported by a device: ability name to ability metadata
pub type AbilityMap = Map<String, Value>;

/// Ability and namespace names
pub mod abilities {
    /// Single-channel on/off
    pub const TOGGLE: &str = "Appliance.Control.Toggle";
    /// Multi-channel on/off
    pub const TOGGLEX: &str = "Appliance.Control.ToggleX";
    /// Dimmable/colour light
    pub const LIGHT: &str = "Appliance.Control.Light";
    /// Daily consumption history
    pub const CONSUMPTIONX: &str = "Appliance.Control.ConsumptionX";
    /// Instant power readings
    pub const ELECTRICITY: &str = "Appliance.Control.Electricity";
    /// Humidifier spray
    pub const SPRAY: &str = "Appliance.Control.Spray";
    /// Garage door opener
    pub const GARAGE_DOOR_STATE: &str = "Appliance.GarageDoor.State";
    /// Roller shutter
    pub const ROLLER_SHUTTER_STATE: &str = "Appliance.RollerShutter.State";
    /// Thermostat mode
    pub const THERMOSTAT_MODE: &str = "Appliance.Control.Thermostat.Mode";
    /// Audio playback
    pub const MP3: &str = "Appliance.Control.Mp3";
    /// Full device state
    pub const SYSTEM_ALL: &str = "Appliance.System.All";
    /// Connectivity status
    pub const SYSTEM_ONLINE: &str = "Appliance.System.Online";
    /// Do-not-disturb mode
    pub const SYSTEM_DND_MODE: &str = "Appliance.System.DNDMode";
    /// Runtime statistics
    pub const SYSTEM_RUNTIME: &str = "Appliance.System.Runtime";
    /// Sub-device battery levels
    pub const HUB_BATTERY: &str = "Appliance.Hub.Battery";
    /// Sub-device connectivity
    pub const HUB_ONLINE: &str = "Appliance.Hub.Online";
    /// Sub-device on/off
    pub const HUB_TOGGLEX: &str = "Appliance.Hub.ToggleX";
    /// Thermostat valve bulk state
    pub const HUB_MTS100_ALL: &str = "Appliance.Hub.Mts100.All";
    /// Sensor bulk state
    pub const HUB_SENSOR_ALL: &str = "Appliance.Hub.Sensor.All";
    /// Marks a device as a hub
    pub const HUB_DIGEST: &str = "Appliance.Digest.Hub";
    /// Reported ability map
    pub const SYSTEM_ABILITY: &str = "Appliance.System.Ability";
    /// Device was bound to the account
    pub const CONTROL_BIND: &str = "Appliance.Control.Bind";
    /// Device was removed from the account
    pub const CONTROL_UNBIND: &str = "Appliance.Control.Unbind";
}

/// A category of behaviour a device can support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Single-channel on/off
    Toggle,
    /// Multi-channel on/off
    ToggleX,
    /// Light control
    Light,
    /// Consumption history
    ConsumptionX,
    /// Power readings
    Electricity,
    /// Humidifier spray
    Spray,
    /// Garage door opener
    GarageDoor,
    /// Roller shutter
    RollerShutter,
    /// Thermostat mode
    ThermostatMode,
    /// Audio playback
    Mp3,
    /// Bulk state refresh
    SystemAll,
    /// Connectivity status
    SystemOnline,
    /// Do-not-disturb mode
    Dnd,
    /// Runtime statistics
    Runtime,
    /// Sub-device battery levels
    HubBattery,
    /// Sub-device connectivity
    HubOnline,
    /// Sub-device on/off
    HubToggleX,
    /// Thermostat valve bulk state
    HubMts100,
    /// Sensor bulk state
    HubSensor,
}

const ABILITY_TABLE: &[(&str, Capability)] = &[
    (abilities::TOGGLE, Capability::Toggle),
    (abilities::TOGGLEX, Capability::ToggleX),
    (abilities::LIGHT, Capability::Light),
    (abilities::CONSUMPTIONX, Capability::ConsumptionX),
    (abilities::ELECTRICITY, Capability::Electricity),
    (abilities::SPRAY, Capability::Spray),
    (abilities::GARAGE_DOOR_STATE, Capability::GarageDoor),
    (abilities::ROLLER_SHUTTER_STATE, Capability::RollerShutter),
    (abilities::THERMOSTAT_MODE, Capability::ThermostatMode),
    (abilities::MP3, Capability::Mp3),
    (abilities::SYSTEM_ALL, Capability::SystemAll),
    (abilities::SYSTEM_ONLINE, Capability::SystemOnline),
    (abilities::SYSTEM_DND_MODE, Capability::Dnd),
    (abilities::SYSTEM_RUNTIME, Capability::Runtime),
    (abilities::HUB_BATTERY, Capability::HubBattery),
    (abilities::HUB_ONLINE, Capability::HubOnline),
    (abilities::HUB_TOGGLEX, Capability::HubToggleX),
    (abilities::HUB_MTS100_ALL, Capability::HubMts100),
    (abilities::HUB_SENSOR_ALL, Capability::HubSensor),
];

impl Capability {
    /// Capability for an ability name, if the ability is known
    pub fn from_ability(name: &str) -> Option<Self> {
        ABILITY_TABLE
            .iter()
            .find(|(ability, _)| *ability == name)
            .map(|(_, capability)| *capability)
    }

    /// Namespace the capability's messages use
    pub fn namespace(&self) -> &'static str {
        ABILITY_TABLE
            .iter()
            .find(|(_, capability)| capability == self)
            .map(|(ability, _)| *ability)
            .unwrap_or_default()
    }

    /// Whether the capability's notifications address a hub's sub-devices
    pub fn is_hub_fanout(&self) -> bool {
        matches!(
            self,
            Capability::HubBattery
                | Capability::HubOnline
                | Capability::HubToggleX
                | Capability::HubMts100
                | Capability::HubSensor
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The entity a template's capabilities are attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseKind {
    /// A directly connected device
    Generic,
    /// A directly connected device that proxies sub-devices
    Hub,
    /// A device reachable only through a hub
    SubDevice,
}

impl BaseKind {
    /// Base kind implied by an ability map
    pub fn for_abilities(abilities: &AbilityMap) -> Self {
        if abilities.contains_key(abilities::HUB_DIGEST) {
            BaseKind::Hub
        } else {
            BaseKind::Generic
        }
    }
}

/// Cache key: devices agreeing on all three fields share a template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    /// Device type
    pub device_type: String,
    /// Hardware version
    pub hardware_version: String,
    /// Firmware version
    pub firmware_version: String,
}

impl TemplateKey {
    /// Create a new template key
    pub fn new(
        device_type: impl Into<String>,
        hardware_version: impl Into<String>,
        firmware_version: impl Into<String>,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            hardware_version: hardware_version.into(),
            firmware_version: firmware_version.into(),
        }
    }
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.device_type, self.hardware_version, self.firmware_version
        )
    }
}

/// The capabilities shared by a class of devices
#[derive(Debug, PartialEq, Eq)]
pub struct CapabilityTemplate {
    key: TemplateKey,
    capabilities: Vec<Capability>,
    base: BaseKind,
}

impl CapabilityTemplate {
    /// Compose a template from a reported ability map
    pub fn compose(key: TemplateKey, reported: &AbilityMap, base: BaseKind) -> Self {
        let mut capabilities: Vec<Capability> = Vec::new();

        for ability in reported.keys() {
            let extended = format!("{}X", ability);
            let chosen = reported
                .contains_key(&extended)
                .then(|| Capability::from_ability(&extended))
                .flatten()
                .or_else(|| Capability::from_ability(ability));

            match chosen {
                Some(capability) if !capabilities.contains(&capability) => {
                    capabilities.push(capability)
                }
                Some(_) => {}
                None => trace!("Skipping unknown ability {}", ability),
            }
        }

        Self {
            key,
            capabilities,
            base,
        }
    }

    /// The template's cache key
    pub fn key(&self) -> &TemplateKey {
        &self.key
    }

    /// Capabilities, in composition order
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// The base entity kind
    pub fn base(&self) -> BaseKind {
        self.base
    }

    /// Whether the template includes `capability`
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// The capability handling `namespace`, if any
    pub fn capability_for_namespace(&self, namespace: &str) -> Option<Capability> {
        self.capabilities
            .iter()
            .copied()
            .find(|capability| capability.namespace() == namespace)
    }
}

/// Builds devices from reported abilities, caching templates per [`TemplateKey`]
#[derive(Debug, Default)]
pub struct CapabilityFactory {
    templates: Mutex<HashMap<TemplateKey, Arc<CapabilityTemplate>>>,
    builds: AtomicUsize,
}

impl CapabilityFactory {
    /// Create a factory with an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached template for `key`, composing it on first use
    ///
    /// The cache lock is held across lookup, composition and insertion, so a
    /// key is composed exactly once even when callers race.
    pub fn template_for(
        &self,
        key: TemplateKey,
        reported: &AbilityMap,
        base: BaseKind,
    ) -> Arc<CapabilityTemplate> {
        let mut templates = self
            .templates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(template) = templates.get(&key) {
            trace!("Reusing capability template {}", key);
            return template.clone();
        }

        let template = Arc::new(CapabilityTemplate::compose(key.clone(), reported, base));
        self.builds.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Composed capability template {} with {:?} on {:?}",
            key,
            template.capabilities(),
            base
        );
        templates.insert(key, template.clone());
        template
    }

    /// Number of templates composed so far
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Number of cached templates
    pub fn cached_templates(&self) -> usize {
        self.templates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Build a directly connected device from its inventory record and abilities
    pub fn build_device(
        &self,
        record: &DeviceRecord,
        reported: &AbilityMap,
        manager: ManagerHandle,
    ) -> Arc<Device> {
        let key = TemplateKey::new(
            &record.device_type,
            &record.hardware_version,
            &record.firmware_version,
        );
        let template = self.template_for(key, reported, BaseKind::for_abilities(reported));
        Arc::new(Device::new(record, template, manager))
    }

    /// Build a sub-device attached to `hub`, using the hub's reported abilities
    pub fn build_subdevice(
        &self,
        hub: &Arc<Device>,
        record: &SubDeviceRecord,
        hub_abilities: &AbilityMap,
    ) -> Result<Arc<Device>> {
        let key = TemplateKey::new(
            &record.kind,
            hub.hardware_version(),
            hub.firmware_version(),
        );
        let template = self.template_for(key, hub_abilities, BaseKind::SubDevice);
        Ok(Arc::new(Device::new_subdevice(hub, record, template)?))
    }
}
