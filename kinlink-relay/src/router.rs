//! Pairing-gated message routing.
//!
//! Every inbound envelope goes through the same checks, in order:
//! recipient present → sender and recipient paired → recipient online.
//! The first failing check is reported to the sender as an `ERROR`
//! envelope; if all pass the envelope is stamped and queued for the
//! recipient. Each check takes its own short-lived access to the store or
//! registry; nothing is held across the whole sequence.

use crate::connection::{unix_millis, ConnectionHandle};
use crate::error::RouteError;
use crate::registry::ConnectionRegistry;
use crate::server::RelayMetrics;
use crate::storage::PairingStore;
use kinlink_types::{DeviceId, Envelope, Role, ServerMessage};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// The connected device an envelope came from.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Identifier the device registered with.
    pub device_id: DeviceId,
    /// Role it claimed at handshake.
    pub role: Role,
    /// Its own connection, used for error replies.
    pub handle: ConnectionHandle,
}

/// Result of a routing attempt that passed every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's connection.
    Forwarded,
    /// Recipient's connection closed between lookup and send.
    Dropped,
}

/// Routes envelopes between paired, connected devices.
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    pairings: Arc<dyn PairingStore>,
    metrics: Arc<RelayMetrics>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    /// Create a router over a registry and a pairing store.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pairings: Arc<dyn PairingStore>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            registry,
            pairings,
            metrics,
        }
    }

    /// Route one envelope from `sender`.
    ///
    /// Outcomes are only observable through frames sent to the sender or the
    /// recipient.
    pub async fn route(&self, sender: &Peer, envelope: Envelope) {
        let request_id = envelope.request_id().cloned();
        match self.try_route(sender, envelope).await {
            Ok(Delivery::Forwarded) => {
                self.metrics.messages_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Delivery::Dropped) => {
                self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.metrics.routing_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Rejected envelope from {}: {}", sender.device_id, e);
                reply_error(sender, &e, request_id);
            }
        }
    }

    async fn try_route(&self, sender: &Peer, envelope: Envelope) -> Result<Delivery, RouteError> {
        let started_at = unix_millis();

        let recipient = envelope
            .to()
            .and_then(|to| DeviceId::new(to).ok())
            .ok_or(RouteError::MissingRecipient)?;

        let (guardian, elder) = match sender.role {
            Role::Guardian => (&sender.device_id, &recipient),
            Role::Elder => (&recipient, &sender.device_id),
        };

        match self.pairings.has_pairing(guardian, elder).await {
            Ok(true) => {}
            Ok(false) => return Err(RouteError::not_paired(sender.role)),
            Err(e) => {
                tracing::error!(
                    "Pairing check failed for guardian={} elder={}: {}",
                    guardian,
                    elder,
                    e
                );
                return Err(RouteError::Internal);
            }
        }

        let record = self
            .registry
            .lookup(&recipient)
            .ok_or(RouteError::RecipientOffline)?;

        let kind = envelope.message_type().unwrap_or("<untyped>").to_owned();
        let forwarded = envelope.into_forwarded(&sender.device_id, unix_millis().max(started_at));

        match record.handle.send_forwarded(&forwarded) {
            Ok(()) => {
                tracing::debug!(
                    "Forwarded {} from {} to {}",
                    kind,
                    sender.device_id,
                    recipient
                );
                Ok(Delivery::Forwarded)
            }
            Err(e) => {
                tracing::warn!(
                    "Dropped message from {} to {} ({}): {}",
                    sender.device_id,
                    recipient,
                    record.handle.id(),
                    e
                );
                Ok(Delivery::Dropped)
            }
        }
    }
}

/// Send an `ERROR` envelope back on the sender's own connection.
pub fn reply_error(sender: &Peer, error: &RouteError, request_id: Option<Value>) {
    let message = ServerMessage::error(error.to_string(), request_id, unix_millis());
    if let Err(e) = sender.handle.send_message(&message) {
        tracing::debug!("Could not report error to {}: {}", sender.device_id, e);
    }
}
