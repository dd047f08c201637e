//! Per-volume serialization of node operations.
//!
//! Two RPCs for the same volume must not interleave their kernel-state
//! checks and mutations, otherwise both may see "not mounted" and mount
//! twice. RPCs for different volumes proceed in parallel.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::VolumeId;

type LockMap = DashMap<VolumeId, Arc<Mutex<()>>>;

/// Keyed async mutex, one key per volume id.
///
/// Entries exist only while some task holds or waits for the key.
#[derive(Debug, Clone, Default)]
pub struct VolumeLocks {
    locks: Arc<LockMap>,
}

/// Held while an operation on one volume runs; released on drop.
#[derive(Debug)]
pub struct VolumeGuard {
    volume_id: VolumeId,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task holds `volume_id`, then hold it.
    pub async fn acquire(&self, volume_id: &VolumeId) -> VolumeGuard {
        let mutex = Arc::clone(self.locks.entry(volume_id.clone()).or_default().value());
        let guard = mutex.lock_owned().await;
        VolumeGuard {
            volume_id: volume_id.clone(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of volumes currently held or waited for.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl VolumeGuard {
    pub fn volume_id(&self) -> &VolumeId {
        &self.volume_id
    }
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        // The map and this guard own one reference each; any more belong to
        // waiters, which still need the entry.
        self.locks
            .remove_if(&self.volume_id, |_, mutex| Arc::strong_count(mutex) <= 2);
        self.guard.take();
    }
}
