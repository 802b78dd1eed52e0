/*!
 * Wire protocol for the device broker.
 *
 * This module builds topic names, client identities, message signatures and
 * the signed JSON envelope exchanged with devices. Everything here is part of
 * the broker's wire contract: changing a topic layout, the signed field order
 * or the digest breaks interoperability.
 */
use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use hearthflow_core::types::unix_timestamp;

use crate::error::{DeviceError, Result};

/// Payload version carried by every envelope
pub const PAYLOAD_VERSION: u8 = 1;

/// Lowercase hex MD5 digest of `input`
pub fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Message methods understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Read request
    Get,
    /// Write request
    Set,
    /// Unsolicited notification
    Push,
    /// Acknowledgement of a GET
    GetAck,
    /// Acknowledgement of a SET
    SetAck,
    /// Error acknowledgement
    Error,
}

impl Method {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Set => "SET",
            Method::Push => "PUSH",
            Method::GetAck => "GETACK",
            Method::SetAck => "SETACK",
            Method::Error => "ERROR",
        }
    }

    /// Whether this method acknowledges a request
    pub fn is_ack(&self) -> bool {
        matches!(self, Method::GetAck | Method::SetAck | Method::Error)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "SET" => Ok(Method::Set),
            "PUSH" => Ok(Method::Push),
            "GETACK" => Ok(Method::GetAck),
            "SETACK" => Ok(Method::SetAck),
            "ERROR" => Ok(Method::Error),
            other => Err(DeviceError::Protocol(format!("Unknown method {}", other))),
        }
    }
}

/// The identity this client presents to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Random application identifier, part of the response topic
    pub app_id: String,
    /// MQTT client identifier derived from the application identifier
    pub client_id: String,
}

/// Generate a fresh application and client identifier
pub fn generate_client_identity() -> ClientIdentity {
    let app_id = md5_hex(&format!("API{}", Uuid::new_v4()));
    let client_id = format!("app:{}", app_id);
    ClientIdentity { app_id, client_id }
}

/// Topic name builders
pub mod topics {
    /// Topic on which acknowledgements for this client arrive
    pub fn response_topic(account_id: &str, app_id: &str) -> String {
        format!("/app/{}-{}/subscribe", account_id, app_id)
    }

    /// Topic on which account-wide push notifications arrive
    pub fn account_notification_topic(account_id: &str) -> String {
        format!("/app/{}/subscribe", account_id)
    }

    /// Topic a device listens on for commands
    pub fn device_command_topic(device_uuid: &str) -> String {
        format!("/appliance/{}/subscribe", device_uuid)
    }

    /// Extract the device UUID from a `from` header such as `/appliance/{uuid}/publish`
    pub fn originating_uuid(from: &str) -> Option<&str> {
        let mut parts = from.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(""), Some(_), Some(uuid)) if !uuid.is_empty() => Some(uuid),
            _ => None,
        }
    }
}

/// MQTT password for an account: digest of the account id followed by the key
pub fn mqtt_password(account_id: &str, key: &str) -> String {
    md5_hex(&format!("{}{}", account_id, key))
}

/// Generate a new message identifier
pub fn generate_message_id() -> String {
    md5_hex(&Uuid::new_v4().simple().to_string())
}

/// Signature over `message_id`, `key` and `timestamp`, in that order
pub fn sign(message_id: &str, key: &str, timestamp: i64) -> String {
    md5_hex(&format!("{}{}{}", message_id, key, timestamp))
}

/// Check the signature carried by `header`
pub fn verify(header: &Header, key: &str) -> bool {
    sign(&header.message_id, key, header.timestamp) == header.sign
}

/// Envelope header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Topic the sender expects replies on (or the device's publish topic)
    pub from: String,
    /// Message identifier used to correlate acknowledgements
    pub message_id: String,
    /// Message method
    pub method: Method,
    /// Message namespace
    pub namespace: String,
    /// Payload version, always [`PAYLOAD_VERSION`]
    #[serde(default = "default_payload_version")]
    pub payload_version: u8,
    /// Signature, see [`sign`]
    pub sign: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
}

fn default_payload_version() -> u8 {
    PAYLOAD_VERSION
}

/// A signed message: header plus JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message header
    pub header: Header,
    /// Message payload
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Default::default())
}

impl Envelope {
    /// Build a signed request with a fresh message id and the current time
    pub fn request(method: Method, namespace: &str, payload: Value, from: &str, key: &str) -> Self {
        Self::request_at(
            method,
            namespace,
            payload,
            from,
            key,
            generate_message_id(),
            unix_timestamp(),
        )
    }

    /// Build a signed request with an explicit message id and timestamp
    pub fn request_at(
        method: Method,
        namespace: &str,
        payload: Value,
        from: &str,
        key: &str,
        message_id: String,
        timestamp: i64,
    ) -> Self {
        let sign = sign(&message_id, key, timestamp);
        Self {
            header: Header {
                from: from.to_string(),
                message_id,
                method,
                namespace: namespace.to_string(),
                payload_version: PAYLOAD_VERSION,
                sign,
                timestamp,
            },
            payload,
        }
    }

    /// Message identifier
    pub fn message_id(&self) -> &str {
        &self.header.message_id
    }
}

/// Serialize an envelope to its wire form
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse an envelope from its wire form
pub fn decode_envelope(raw: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(raw)
        .map_err(|e| DeviceError::Protocol(format!("Malformed envelope: {}", e)))
}
