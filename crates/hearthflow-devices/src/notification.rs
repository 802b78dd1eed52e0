/*!
 * Push notifications and their observers.
 */
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::abilities;
use crate::device::Device;
use crate::error::Result;

/// Hardware and firmware details carried by a bind notification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindInfo {
    /// Device type
    pub device_type: String,
    /// Device sub-type
    pub sub_type: String,
    /// Hardware version
    pub hardware_version: String,
    /// Firmware version
    pub firmware_version: String,
    /// Native UUID reported by the device
    pub uuid: String,
    /// MAC address
    pub mac_address: String,
}

impl BindInfo {
    /// Extract bind details from a bind notification payload
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let bind = payload.get("bind")?;
        let hardware = bind.get("hardware")?;
        let field = |value: &Value, key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Some(Self {
            device_type: field(hardware, "type"),
            sub_type: field(hardware, "subType"),
            hardware_version: field(hardware, "version"),
            firmware_version: bind
                .get("firmware")
                .map(|firmware| field(firmware, "version"))
                .unwrap_or_default(),
            uuid: field(hardware, "uuid"),
            mac_address: field(hardware, "macAddress"),
        })
    }
}

/// A normalized push notification
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Namespace of the notification
    pub namespace: String,
    /// Native UUID of the device that sent it
    pub originating_uuid: String,
    /// Raw payload
    pub payload: Value,
    /// Present for bind notifications
    pub bind: Option<BindInfo>,
}

impl Notification {
    /// Build a notification, deriving namespace-specific fields
    pub fn new(namespace: impl Into<String>, originating_uuid: impl Into<String>, payload: Value) -> Self {
        let namespace = namespace.into();
        let bind = if namespace == abilities::CONTROL_BIND {
            BindInfo::from_payload(&payload)
        } else {
            None
        };

        Self {
            namespace,
            originating_uuid: originating_uuid.into(),
            payload,
            bind,
        }
    }

    /// Whether the device was removed from the account
    pub fn is_unbind(&self) -> bool {
        self.namespace == abilities::CONTROL_UNBIND
    }
}

/// Receives every push notification after device dispatch
#[async_trait]
pub trait NotificationObserver: Send + Sync {
    /// Handle a notification and the devices it was addressed to
    async fn on_notification(&self, notification: &Notification, devices: &[Arc<Device>]) -> Result<()>;
}
