//! Error types for Kinlink wire types.

use thiserror::Error;

/// Errors that can occur while decoding or validating wire data.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Frame is not valid JSON
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame parsed but is not a JSON object
    #[error("envelope must be a JSON object")]
    NotAnObject,

    /// Device identifier was empty
    #[error("device id must not be empty")]
    EmptyDeviceId,

    /// Role claim was not `guardian` or `elder`
    #[error("invalid role: {0:?}")]
    InvalidRole(String),
}
