//! Error types for kinlink-relay.

use kinlink_types::{DeviceId, Role};

/// Main error type for relay startup and background operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pairing store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Device has never been registered.
    #[error("device not found: {device_id}")]
    DeviceNotFound {
        /// The unknown device.
        device_id: DeviceId,
    },

    /// Device is registered under the other role.
    #[error("device {device_id} is not registered as {expected}")]
    RoleMismatch {
        /// The device in question.
        device_id: DeviceId,
        /// The role the operation required.
        expected: Role,
    },

    /// Pairing code is unknown, already used, or expired.
    #[error("invalid or expired pairing code")]
    InvalidCode,

    /// Could not find a free code after repeated attempts.
    #[error("no free pairing code after {attempts} attempts")]
    CodeSpaceExhausted {
        /// Number of collisions before giving up.
        attempts: u32,
    },

    /// Stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Reasons a routed envelope is bounced back to its sender.
///
/// The `Display` text is the exact `error` string clients receive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// Envelope has no usable `to`.
    #[error("Missing \"to\" field")]
    MissingRecipient,

    /// Guardian addressed an elder it is not paired with.
    #[error("Not paired with this elder")]
    NotPairedWithElder,

    /// Elder addressed a guardian it is not paired with.
    #[error("Not paired with this guardian")]
    NotPairedWithGuardian,

    /// Recipient has no live connection.
    #[error("Recipient is offline")]
    RecipientOffline,

    /// Authorization could not be checked.
    #[error("Internal server error")]
    Internal,

    /// Frame is not a JSON object.
    #[error("Invalid message format")]
    InvalidFormat,
}

impl RouteError {
    /// The pairing failure reported to a sender holding `role`.
    pub fn not_paired(role: Role) -> Self {
        match role.counterpart() {
            Role::Elder => RouteError::NotPairedWithElder,
            Role::Guardian => RouteError::NotPairedWithGuardian,
        }
    }
}

/// Why a connection attempt was refused before registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeRejection {
    /// `deviceId` or `type` missing or empty.
    #[error("Missing deviceId or type")]
    MissingIdentity,

    /// `type` is not `guardian` or `elder`.
    #[error("Invalid type: must be guardian or elder")]
    InvalidRole,

    /// Too many attempts for this device id.
    #[error("Too many connection attempts")]
    RateLimited,

    /// Registry is full.
    #[error("Server at capacity")]
    AtCapacity,
}

impl HandshakeRejection {
    /// WebSocket close code sent with the rejection.
    pub fn close_code(&self) -> u16 {
        match self {
            HandshakeRejection::AtCapacity => crate::connection::CLOSE_TRY_AGAIN_LATER,
            _ => crate::connection::CLOSE_POLICY_VIOLATION,
        }
    }
}

/// The registry already holds its maximum number of devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("registry is full ({max} connections)")]
pub struct RegistryFull {
    /// Capacity that was reached.
    pub max: usize,
}

/// Failure to queue a frame on a connection handle.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection's writer has gone away.
    #[error("connection is closed")]
    Closed,

    /// The frame could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] kinlink_types::LinkError),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
