//! Identity types for Kinlink.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::LinkError;

/// An opaque identifier chosen by the device itself.
///
/// The relay does not generate or verify these; it only requires them to be
/// non-empty.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a DeviceId, rejecting the empty string.
    pub fn new(id: impl Into<String>) -> Result<Self, LinkError> {
        let id = id.into();
        if id.is_empty() {
            return Err(LinkError::EmptyDeviceId);
        }
        Ok(Self(id))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

/// The role a device claims when it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Monitors one or more elders; redeems pairing codes.
    Guardian,
    /// Is monitored; issues pairing codes.
    Elder,
}

impl Role {
    /// Wire representation (`"guardian"` / `"elder"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guardian => "guardian",
            Role::Elder => "elder",
        }
    }

    /// The role on the other side of a pairing.
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Guardian => Role::Elder,
            Role::Elder => Role::Guardian,
        }
    }
}

impl FromStr for Role {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guardian" => Ok(Role::Guardian),
            "elder" => Ok(Role::Elder),
            other => Err(LinkError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
