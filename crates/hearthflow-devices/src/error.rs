/*!
 * Error type for device, registry and command operations.
 */
use std::time::Duration;

use thiserror::Error;

use hearthflow_core::error::Error as CoreError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The broker connection is not established
    #[error("Not connected to the broker")]
    NotConnected,

    /// The transport failed to carry a request
    #[error("Transport error: {0}")]
    Transport(String),

    /// An inbound message could not be decoded or failed verification
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No acknowledgement arrived before the deadline
    #[error("Command {namespace} to {target} timed out after {timeout:?}")]
    CommandTimeout {
        /// Namespace of the command
        namespace: String,
        /// Native UUID of the target device
        target: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// The device answered with an ERROR acknowledgement
    #[error("Device rejected the command: {payload}")]
    RemoteCommand {
        /// Payload of the error acknowledgement
        payload: serde_json::Value,
    },

    /// The requested entry is not registered
    #[error("Not found: {0}")]
    NotFound(String),

    /// More than one device claims the same native UUID
    #[error("{count} devices registered for native uuid {uuid}")]
    Ambiguous {
        /// The native UUID looked up
        uuid: String,
        /// Number of matching devices
        count: usize,
    },

    /// An inventory record was applied to a device with another identity
    #[error("Inventory record for {actual} cannot update device {expected}")]
    IdentityMismatch {
        /// The device's own native UUID
        expected: String,
        /// The UUID found in the record
        actual: String,
    },

    /// The device has no capability that provides the operation
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Sub-devices must issue commands through their hub
    #[error("Device {0} has no direct transport; commands must go through its hub")]
    DelegationRequired(String),

    /// The inventory source failed
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;
