//! # kinlink-types
//!
//! Wire format types for the Kinlink guardian/elder relay.
//!
//! This crate provides the types shared by the relay and its clients:
//! - [`DeviceId`], [`Role`] - Identity claims made at connection time
//! - [`Envelope`], [`ForwardedEnvelope`] - Client messages and their relayed form
//! - [`ServerMessage`] - Envelopes produced by the relay itself
//! - [`LinkError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod messages;

pub use envelope::{Envelope, ForwardedEnvelope};
pub use error::LinkError;
pub use ids::{DeviceId, Role};
pub use messages::{ServerMessage, CONNECTION_ACK, ERROR};
