//! Exclusive leases on physical devices
//!
//! A USB or CSI camera can only be opened by one process on its node. While
//! a device-bound workload is being torn down its pod may still hold the
//! device, so the deletion takes a lease on `(node, device_path)` and any
//! creation against the same key is refused until the lease is released.
//!
//! The lease map is shared by every deletion task. Each key is updated
//! atomically through the map's entry API, so at most one lease exists per
//! device.
//!
//! Creations against one device are serialized separately, through
//! [`DeviceLockTracker::creation_lock`], so that a creation checking the
//! store never gets in a deletion's way.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::DeviceKey;
use crate::Error;

/// A held lease
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceLease {
    /// Workload whose deletion holds the device
    pub holder: Uuid,
    /// When the lease was taken
    pub acquired_at: DateTime<Utc>,
}

/// Tracks which devices are leased
#[derive(Clone, Default)]
pub struct DeviceLockTracker {
    leases: Arc<DashMap<DeviceKey, DeviceLease>>,
    creations: Arc<DashMap<DeviceKey, Arc<Mutex<()>>>>,
}

impl DeviceLockTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease on `key` for `holder`
    ///
    /// Fails with `DeviceBusy` if any lease already exists for the key. The
    /// returned guard releases the lease when dropped.
    pub fn acquire(&self, key: DeviceKey, holder: Uuid) -> Result<LeaseGuard, Error> {
        match self.leases.entry(key.clone()) {
            Entry::Occupied(existing) => Err(busy(&key, existing.get().holder)),
            Entry::Vacant(slot) => {
                slot.insert(DeviceLease {
                    holder,
                    acquired_at: Utc::now(),
                });
                info!(device = %key, workload = %holder, "device lease acquired");
                Ok(LeaseGuard {
                    leases: self.leases.clone(),
                    key,
                    holder,
                    released: false,
                })
            }
        }
    }

    /// Wait for exclusive use of `key` among creations
    ///
    /// Held while a creation checks the store and inserts its row. Leases
    /// are not involved, so deletions never wait on it.
    pub async fn creation_lock(&self, key: &DeviceKey) -> OwnedMutexGuard<()> {
        let lock = self.creations.entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Refuse if `key` is leased
    pub fn ensure_free(&self, key: &DeviceKey) -> Result<(), Error> {
        match self.holder(key) {
            Some(holder) => Err(busy(key, holder)),
            None => Ok(()),
        }
    }

    /// Drop the lease on `key`, whoever holds it
    ///
    /// Returns the removed lease.
    pub fn release(&self, key: &DeviceKey) -> Option<DeviceLease> {
        let removed = self.leases.remove(key).map(|(_, lease)| lease);
        if let Some(lease) = &removed {
            info!(device = %key, workload = %lease.holder, "device lease released");
        }
        removed
    }

    /// Workload holding `key`, if any
    pub fn holder(&self, key: &DeviceKey) -> Option<Uuid> {
        self.leases.get(key).map(|lease| lease.holder)
    }

    /// Whether `key` is leased
    pub fn is_held(&self, key: &DeviceKey) -> bool {
        self.leases.contains_key(key)
    }

    /// Every current lease, sorted by key
    pub fn snapshot(&self) -> Vec<(DeviceKey, DeviceLease)> {
        let mut out: Vec<_> = self
            .leases
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn busy(key: &DeviceKey, holder: Uuid) -> Error {
    Error::DeviceBusy {
        node: key.node.clone(),
        device_path: key.device_path.clone(),
        holder,
    }
}

/// Releases its lease on drop
///
/// Only removes the lease if it still belongs to this holder, so a stale
/// guard cannot free a lease someone else took after an explicit release.
#[derive(Debug)]
pub struct LeaseGuard {
    leases: Arc<DashMap<DeviceKey, DeviceLease>>,
    key: DeviceKey,
    holder: Uuid,
    released: bool,
}

impl LeaseGuard {
    /// Leased device
    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    /// Release now instead of on drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let holder = self.holder;
        if self
            .leases
            .remove_if(&self.key, |_, lease| lease.holder == holder)
            .is_some()
        {
            info!(device = %self.key, workload = %holder, "device lease released");
        } else {
            debug!(device = %self.key, workload = %holder, "lease already gone");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DeviceKey {
        DeviceKey::new("edge1", "/dev/video0")
    }

    #[test]
    fn story_second_acquire_is_device_busy() {
        let tracker = DeviceLockTracker::new();
        let a = Uuid::new_v4();
        let _guard = tracker.acquire(key(), a).unwrap();

        match tracker.acquire(key(), Uuid::new_v4()) {
            Err(Error::DeviceBusy { holder, node, .. }) => {
                assert_eq!(holder, a);
                assert_eq!(node, "edge1");
            }
            other => panic!("expected DeviceBusy, got {other:?}"),
        }
        assert!(tracker.ensure_free(&key()).unwrap_err().is_retryable());
    }

    #[test]
    fn story_other_devices_are_independent() {
        let tracker = DeviceLockTracker::new();
        let _a = tracker.acquire(key(), Uuid::new_v4()).unwrap();
        let _b = tracker
            .acquire(DeviceKey::new("edge1", "/dev/video1"), Uuid::new_v4())
            .unwrap();
        let _c = tracker
            .acquire(DeviceKey::new("edge2", "/dev/video0"), Uuid::new_v4())
            .unwrap();
        assert_eq!(tracker.snapshot().len(), 3);
    }

    #[test]
    fn story_guard_releases_on_drop() {
        let tracker = DeviceLockTracker::new();
        {
            let _guard = tracker.acquire(key(), Uuid::new_v4()).unwrap();
            assert!(tracker.is_held(&key()));
        }
        assert!(!tracker.is_held(&key()));
        tracker.ensure_free(&key()).unwrap();
    }

    #[test]
    fn story_stale_guard_does_not_free_a_newer_lease() {
        let tracker = DeviceLockTracker::new();
        let first = tracker.acquire(key(), Uuid::new_v4()).unwrap();
        tracker.release(&key());

        let second = Uuid::new_v4();
        let _guard = tracker.acquire(key(), second).unwrap();
        drop(first);

        assert_eq!(tracker.holder(&key()), Some(second));
    }

    #[test]
    fn story_concurrent_acquires_grant_exactly_one() {
        let tracker = DeviceLockTracker::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let t = tracker.clone();
                std::thread::spawn(move || t.acquire(key(), Uuid::new_v4()).ok())
            })
            .collect();
        let guards: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 1);
        assert_eq!(tracker.holder(&key()), Some(guards[0].holder));
    }

    #[tokio::test]
    async fn story_creation_lock_serializes_without_leasing() {
        let tracker = DeviceLockTracker::new();
        let first = tracker.creation_lock(&key()).await;

        let waiting = {
            let t = tracker.clone();
            tokio::spawn(async move {
                let _second = t.creation_lock(&key()).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        // deletions are not held up by a creation in progress
        let lease = tracker.acquire(key(), Uuid::new_v4()).unwrap();
        assert!(tracker.is_held(&key()));
        lease.release();

        drop(first);
        waiting.await.unwrap();
    }
}
