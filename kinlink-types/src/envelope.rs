//! Envelope - the JSON object a device sends to reach its paired counterpart.
//!
//! The relay only reads three fields (`type`, `to`, `requestId`); everything
//! else, including `payload`, is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DeviceId, LinkError};

/// Field names the relay reads or writes.
mod field {
    pub const TYPE: &str = "type";
    pub const TO: &str = "to";
    pub const REQUEST_ID: &str = "requestId";
    pub const FROM: &str = "from";
    pub const FORWARDED_AT: &str = "forwardedAt";
}

/// A message frame received from a device.
///
/// Stored as the raw JSON object so unknown fields survive forwarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    /// Parse a text frame. Anything other than a JSON object is rejected.
    pub fn parse(text: &str) -> Result<Self, LinkError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(LinkError::NotAnObject),
        }
    }

    /// The application-level message type, if it is a string.
    pub fn message_type(&self) -> Option<&str> {
        self.0.get(field::TYPE).and_then(Value::as_str)
    }

    /// The addressed recipient, if present as a non-empty string.
    pub fn to(&self) -> Option<&str> {
        self.0
            .get(field::TO)
            .and_then(Value::as_str)
            .filter(|to| !to.is_empty())
    }

    /// The caller's correlation token, echoed verbatim on errors.
    pub fn request_id(&self) -> Option<&Value> {
        self.0.get(field::REQUEST_ID).filter(|v| !v.is_null())
    }

    /// Look up any other field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Stamp the envelope with its server-known sender and forwarding time.
    ///
    /// A client-supplied `from` or `forwardedAt` is overwritten.
    pub fn into_forwarded(mut self, from: &DeviceId, forwarded_at: u64) -> ForwardedEnvelope {
        self.0
            .insert(field::FROM.to_string(), Value::String(from.to_string()));
        self.0
            .insert(field::FORWARDED_AT.to_string(), Value::from(forwarded_at));
        ForwardedEnvelope(self.0)
    }
}

/// An envelope as delivered to the recipient: the original fields plus
/// `from` and `forwardedAt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForwardedEnvelope(Map<String, Value>);

impl ForwardedEnvelope {
    /// The sender stamped by the relay.
    pub fn from(&self) -> Option<&str> {
        self.0.get(field::FROM).and_then(Value::as_str)
    }

    /// Unix time in milliseconds at which the relay forwarded the message.
    pub fn forwarded_at(&self) -> Option<u64> {
        self.0.get(field::FORWARDED_AT).and_then(Value::as_u64)
    }

    /// Look up any field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String, LinkError> {
        Ok(serde_json::to_string(&self.0)?)
    }
}
