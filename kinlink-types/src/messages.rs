//! Envelopes produced by the relay itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DeviceId, LinkError};

/// `type` of the acknowledgement sent right after a successful handshake.
pub const CONNECTION_ACK: &str = "CONNECTION_ACK";

/// `type` of every error envelope.
pub const ERROR: &str = "ERROR";

/// Server-originated envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Handshake accepted; the device is now addressable.
    #[serde(rename_all = "camelCase")]
    ConnectionAck {
        /// The identifier the device registered under
        device_id: DeviceId,
        /// Unix time in milliseconds
        timestamp: u64,
    },
    /// A frame could not be routed.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Correlation token copied from the failed envelope
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        /// Human-readable reason
        error: String,
        /// Unix time in milliseconds
        timestamp: u64,
    },
}

impl ServerMessage {
    /// Build an acknowledgement for `device_id`.
    pub fn ack(device_id: DeviceId, timestamp: u64) -> Self {
        ServerMessage::ConnectionAck {
            device_id,
            timestamp,
        }
    }

    /// Build an error envelope.
    pub fn error(error: impl Into<String>, request_id: Option<Value>, timestamp: u64) -> Self {
        ServerMessage::Error {
            request_id,
            error: error.into(),
            timestamp,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, LinkError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, LinkError> {
        Ok(serde_json::from_str(text)?)
    }
}
