/*!
 * Core data types for hearthflow.
 *
 * This module defines the fundamental data types shared by the hearthflow crates.
 */
use std::borrow::Borrow;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// An identifier assigned by the library to resources it tracks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for Id {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Seconds since the Unix epoch, as used on the wire
pub fn unix_timestamp() -> i64 {
    Utc::now().timestamp()
}
