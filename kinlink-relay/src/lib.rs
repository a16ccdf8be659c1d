//! # kinlink-relay
//!
//! Pairing-gated WebSocket relay between guardian and elder devices.
//!
//! This crate implements a relay server that:
//! - Accepts WebSocket connections that claim a device id and a role
//! - Forwards JSON envelopes between connected devices
//! - Only forwards between a guardian and an elder that are paired
//! - Issues and redeems the pairing codes that create those pairings
//!
//! ## Architecture
//!
//! ```text
//! Guardian ──┐                    ┌── Elder
//!            │    WebSocket       │
//!            ├───────────────────►│
//!            │                    │
//!        ┌───┴────────────────────┴───┐
//!        │       kinlink-relay        │
//!        │  registry ─► router        │
//!        │  ┌─────────────────────┐   │
//!        │  │ SQLite (pairings)   │   │
//!        │  └─────────────────────┘   │
//!        └────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Devices connect to `/ws?deviceId=<id>&type=<guardian|elder>`:
//! - relay → device: `CONNECTION_ACK` on registration
//! - device → relay: any JSON object with a `to` field
//! - relay → recipient: the same object plus `from` and `forwardedAt`
//! - relay → device: `ERROR` when an envelope cannot be routed

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod limits;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
