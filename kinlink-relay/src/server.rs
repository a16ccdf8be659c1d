//! Main LinkRelay server coordination.
//!
//! LinkRelay owns the connection registry, the pairing store, the router,
//! and the shared counters; sessions and HTTP handlers borrow it through an
//! `Arc`.

use crate::config::Config;
use crate::connection::CLOSE_GOING_AWAY;
use crate::error::Result;
use crate::limits::RateLimits;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::storage::{PairingStore, SqliteStorage};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::watch;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Connections that completed the handshake.
    pub connections_total: AtomicU64,
    /// Connection attempts refused before registration.
    pub handshake_rejections: AtomicU64,
    /// Frames read from devices (any kind but close/ping).
    pub frames_received: AtomicU64,
    /// Frames that were not a JSON object.
    pub malformed_frames: AtomicU64,
    /// Envelopes delivered to a recipient's connection.
    pub messages_forwarded: AtomicU64,
    /// Envelopes that passed every check but whose recipient had closed.
    pub messages_dropped: AtomicU64,
    /// Envelopes bounced back with an `ERROR`.
    pub routing_errors: AtomicU64,
    /// Requests refused by a rate limiter.
    pub rate_limit_hits: AtomicU64,
}

/// Main relay server.
pub struct LinkRelay {
    config: Config,
    storage: Arc<SqliteStorage>,
    registry: Arc<ConnectionRegistry>,
    router: MessageRouter,
    /// Rate limiters for handshakes and code redemption.
    rate_limits: RateLimits,
    metrics: Arc<RelayMetrics>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for LinkRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRelay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("connections", &self.registry.count())
            .finish_non_exhaustive()
    }
}

impl LinkRelay {
    /// Create a relay that authorizes against `storage`.
    pub fn new(config: Config, storage: SqliteStorage) -> Self {
        let storage = Arc::new(storage);
        let pairings: Arc<dyn PairingStore> = storage.clone();
        Self::with_pairings(config, storage, pairings)
    }

    /// Open the configured database and build a relay over it.
    pub async fn open(config: Config) -> Result<Self> {
        let storage = SqliteStorage::new(&config.storage.database).await?;
        Ok(Self::new(config, storage))
    }

    /// Create a relay whose router consults a different pairing source than
    /// the store backing the HTTP API.
    pub fn with_pairings(
        config: Config,
        storage: Arc<SqliteStorage>,
        pairings: Arc<dyn PairingStore>,
    ) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(RelayMetrics::default());
        let router = MessageRouter::new(registry.clone(), pairings, metrics.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            storage,
            registry,
            router,
            rate_limits,
            metrics,
            shutdown,
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Get a clone of the storage Arc for background tasks.
    pub fn storage_arc(&self) -> Arc<SqliteStorage> {
        self.storage.clone()
    }

    /// Get access to the live connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get access to the message router.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Number of registered devices.
    pub fn total_connections(&self) -> usize {
        self.registry.count()
    }

    /// Subscribe to the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tell every session to close and unregister.
    ///
    /// Sessions that are mid-frame finish it first. Handles are also sent a
    /// close frame directly so writers of already-finished sessions flush.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let handles = self.registry.handles();
        tracing::info!("Shutting down; closing {} connections", handles.len());
        for handle in handles {
            if let Err(e) = handle.close(CLOSE_GOING_AWAY, "Server shutting down") {
                tracing::debug!("Could not send close on {}: {}", handle.id(), e);
            }
        }
    }
}
