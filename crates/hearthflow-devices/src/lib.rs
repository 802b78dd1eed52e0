/*!
 * hearthflow Devices
 *
 * This crate provides the device model, capability composition and broker
 * dispatch for hearthflow. A [`Manager`] connects to the vendor broker,
 * discovers devices from an inventory source and keeps their state current
 * from push notifications.
 */

#![warn(missing_docs)]

// Re-export core types
pub use hearthflow_core::prelude;

pub mod capability;
pub mod device;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod notification;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use capability::{AbilityMap, BaseKind, Capability, CapabilityFactory, CapabilityTemplate};
pub use device::{Channel, CommandExecutor, Device, DeviceInfo, ManagerHandle, OnlineStatus};
pub use discovery::{DeviceDiscoverer, DiscoveryOptions, DiscoveryResult, InventorySource};
pub use error::{DeviceError, Result};
pub use manager::{ConnectionEvent, ConnectionState, Credentials, Manager};
pub use notification::{Notification, NotificationObserver};
pub use protocol::Method;
pub use registry::{DeviceFilter, DeviceRegistry, RegistryEvent};
pub use transport::{MockTransport, Transport, TransportEvent};

#[cfg(feature = "mqtt")]
pub use transport::MqttTransport;

/// hearthflow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> std::result::Result<(), hearthflow_core::error::Error> {
    tracing::info!("hearthflow devices {} initialized", VERSION);
    Ok(())
}

/// Transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["mock"];

    #[cfg(feature = "mqtt")]
    transports.push("mqtt");

    transports
}
