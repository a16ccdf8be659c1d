//! Live connection registry.
//!
//! Maps each connected device to the handle its messages are delivered on.
//! One entry per device id; a newer connection for the same id replaces the
//! older entry without closing it.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::RegistryFull;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kinlink_types::{DeviceId, Role};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

/// A registered, addressable device.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Identifier the device connected with.
    pub device_id: DeviceId,
    /// Role the device claimed.
    pub role: Role,
    /// Where to send its frames.
    pub handle: ConnectionHandle,
    /// When the registration happened.
    pub connected_at: SystemTime,
}

/// Concurrency-safe map of device id to live connection.
///
/// Entries are inserted and removed whole, so a lookup never sees a partial
/// record. Reads clone the record out; no shard lock outlives a call.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<DeviceId, ConnectionRecord>,
    /// Entries inserted and not yet removed. A slot is reserved before a new
    /// key is inserted, so this never undercounts the map.
    occupied: AtomicUsize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for `device_id`.
    ///
    /// Returns the superseded record, whose handle is left open.
    pub fn register(
        &self,
        device_id: DeviceId,
        role: Role,
        handle: ConnectionHandle,
    ) -> Option<ConnectionRecord> {
        // Unbounded inserts never report a full registry.
        self.insert(device_id, role, handle, None).unwrap_or(None)
    }

    /// Like [`register`](Self::register), but refuse a new device once
    /// `max` entries exist. Replacing an existing entry is always allowed.
    ///
    /// The capacity check and the insert happen under the entry's shard
    /// lock, so concurrent callers cannot push the registry past `max`.
    pub fn try_register(
        &self,
        device_id: DeviceId,
        role: Role,
        handle: ConnectionHandle,
        max: usize,
    ) -> Result<Option<ConnectionRecord>, RegistryFull> {
        self.insert(device_id, role, handle, Some(max))
    }

    fn insert(
        &self,
        device_id: DeviceId,
        role: Role,
        handle: ConnectionHandle,
        max: Option<usize>,
    ) -> Result<Option<ConnectionRecord>, RegistryFull> {
        let record = ConnectionRecord {
            device_id: device_id.clone(),
            role,
            handle,
            connected_at: SystemTime::now(),
        };

        let previous = match self.connections.entry(device_id) {
            Entry::Occupied(mut entry) => Some(entry.insert(record)),
            Entry::Vacant(entry) => {
                let reserved = self
                    .occupied
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match max {
                        Some(max) if n >= max => None,
                        _ => Some(n + 1),
                    });
                if reserved.is_err() {
                    return Err(RegistryFull {
                        max: max.unwrap_or(usize::MAX),
                    });
                }
                entry.insert(record);
                None
            }
        };

        tracing::debug!(
            "Registered {} (total: {})",
            previous
                .as_ref()
                .map(|p| format!("{} replacing {}", p.device_id, p.handle.id()))
                .unwrap_or_else(|| "new device".to_string()),
            self.count()
        );
        Ok(previous)
    }

    fn release(&self) {
        self.occupied.fetch_sub(1, Ordering::AcqRel);
    }

    /// Remove the record for `device_id` if present.
    pub fn unregister(&self, device_id: &DeviceId) {
        if self.connections.remove(device_id).is_some() {
            self.release();
            tracing::debug!("Unregistered {} (remaining: {})", device_id, self.count());
        }
    }

    /// Remove the record for `device_id` only if it still belongs to
    /// `connection_id`. Returns whether an entry was removed.
    pub fn unregister_connection(&self, device_id: &DeviceId, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(device_id, |_, record| record.handle.id() == connection_id)
            .is_some();
        if removed {
            self.release();
            tracing::debug!(
                "Unregistered {} on {} (remaining: {})",
                device_id,
                connection_id,
                self.count()
            );
        }
        removed
    }

    /// Current record for `device_id`.
    pub fn lookup(&self, device_id: &DeviceId) -> Option<ConnectionRecord> {
        self.connections.get(device_id).map(|entry| entry.value().clone())
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Handles of every live connection (used to broadcast shutdown).
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().handle.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel();

        assert!(registry.register(id("e1"), Role::Elder, handle.clone()).is_none());

        let record = registry.lookup(&id("e1")).unwrap();
        assert_eq!(record.role, Role::Elder);
        assert_eq!(record.handle.id(), handle.id());
        assert_eq!(registry.count(), 1);
        assert!(registry.lookup(&id("e2")).is_none());
    }

    #[test]
    fn registration_replaces() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = ConnectionHandle::channel();
        let (second, _rx2) = ConnectionHandle::channel();

        registry.register(id("d"), Role::Guardian, first.clone());
        let previous = registry.register(id("d"), Role::Guardian, second.clone());

        assert_eq!(previous.unwrap().handle.id(), first.id());
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.lookup(&id("d")).unwrap().handle.id(), second.id());
        // Superseded handle is not closed.
        assert!(first.is_open());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel();
        registry.register(id("keep"), Role::Elder, handle);

        registry.unregister(&id("absent"));
        assert_eq!(registry.count(), 1);

        registry.unregister(&id("keep"));
        registry.unregister(&id("keep"));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn stale_connection_cannot_evict_replacement() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = ConnectionHandle::channel();
        let (new, _rx2) = ConnectionHandle::channel();

        registry.register(id("d"), Role::Elder, old.clone());
        registry.register(id("d"), Role::Elder, new.clone());

        assert!(!registry.unregister_connection(&id("d"), old.id()));
        assert_eq!(registry.lookup(&id("d")).unwrap().handle.id(), new.id());

        assert!(registry.unregister_connection(&id("d"), new.id()));
        assert!(!registry.unregister_connection(&id("d"), new.id()));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn handles_cover_every_entry() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = ConnectionHandle::channel();
        let (b, _rx_b) = ConnectionHandle::channel();
        registry.register(id("a"), Role::Elder, a.clone());
        registry.register(id("b"), Role::Guardian, b.clone());

        let mut ids: Vec<_> = registry.handles().iter().map(|h| h.id().to_string()).collect();
        ids.sort();
        let mut expected = vec![a.id().to_string(), b.id().to_string()];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn try_register_enforces_capacity() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = ConnectionHandle::channel();
        let (b, _rx_b) = ConnectionHandle::channel();
        let (a2, _rx_a2) = ConnectionHandle::channel();

        assert!(registry.try_register(id("a"), Role::Elder, a.clone(), 1).unwrap().is_none());
        assert_eq!(
            registry.try_register(id("b"), Role::Guardian, b.clone(), 1).unwrap_err(),
            RegistryFull { max: 1 }
        );

        // Reconnecting an existing id does not need a free slot.
        let previous = registry.try_register(id("a"), Role::Elder, a2.clone(), 1).unwrap();
        assert_eq!(previous.unwrap().handle.id(), a.id());
        assert_eq!(registry.count(), 1);

        // Removal frees the slot.
        assert!(registry.unregister_connection(&id("a"), a2.id()));
        assert!(registry.try_register(id("b"), Role::Guardian, b, 1).is_ok());
    }

    #[test]
    fn concurrent_try_register_never_exceeds_capacity() {
        const THREADS: usize = 16;

        for _ in 0..50 {
            let registry = Arc::new(ConnectionRegistry::new());
            let barrier = Arc::new(Barrier::new(THREADS));

            let threads: Vec<_> = (0..THREADS)
                .map(|i| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        let (handle, rx) = ConnectionHandle::channel();
                        barrier.wait();
                        let admitted = registry
                            .try_register(id(&format!("device-{}", i)), Role::Elder, handle, 2)
                            .is_ok();
                        (admitted, rx)
                    })
                })
                .collect();

            let admitted = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|(admitted, _)| *admitted)
                .count();

            assert_eq!(admitted, 2);
            assert_eq!(registry.count(), 2);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_and_unregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, _rx) = ConnectionHandle::channel();
                let device = id(&format!("device-{}", i % 8));
                let conn = handle.id();
                registry.register(device.clone(), Role::Elder, handle);
                tokio::task::yield_now().await;
                if let Some(record) = registry.lookup(&device) {
                    assert_eq!(record.device_id, device);
                }
                registry.unregister_connection(&device, conn);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Each device's last registration is removed by its own connection.
        assert_eq!(registry.count(), 0);
    }
}
