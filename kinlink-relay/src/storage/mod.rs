//! Pairing storage for kinlink-relay.
//!
//! The router only needs [`PairingStore::has_pairing`]. Device registration
//! and pairing-code issuance live on [`SqliteStorage`] and are driven by the
//! HTTP API.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use kinlink_types::{DeviceId, Role};
use serde::Serialize;

/// Number of digits in a pairing code.
pub const CODE_DIGITS: usize = 6;

/// A device known to the pairing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device identifier.
    pub device_id: DeviceId,
    /// Registered role.
    #[serde(rename = "type")]
    pub role: Role,
    /// Unix timestamp (seconds) of first registration.
    pub created_at: i64,
}

/// An authorization for a guardian and an elder to exchange messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pairing {
    /// The guardian side.
    pub guardian_id: DeviceId,
    /// The elder side.
    pub elder_id: DeviceId,
    /// Unix timestamp (seconds) when the pairing was created.
    pub created_at: i64,
}

/// A freshly issued pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCode {
    /// Zero-padded numeric code.
    pub code: String,
    /// Elder that issued it.
    pub elder_id: DeviceId,
    /// Unix timestamp (seconds) after which the code is rejected.
    pub expires_at: i64,
}

/// Read-only pairing lookup used by the message router.
#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Whether `guardian_id` and `elder_id` are paired.
    ///
    /// An `Err` means the answer is unknown; callers must not treat it as
    /// a pairing.
    async fn has_pairing(
        &self,
        guardian_id: &DeviceId,
        elder_id: &DeviceId,
    ) -> Result<bool, StorageError>;
}
