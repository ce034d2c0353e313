//! Per-volume mutual exclusion for node RPCs.
//!
//! Two RPCs for the same volume must never overlap; a second arrival fails
//! fast instead of queueing, and the orchestrator retries. RPCs for
//! different volumes run in parallel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Set of volume ids with an RPC in flight, guarded by one mutex.
pub struct SyncLock {
    in_flight: Mutex<HashSet<String>>,
}

impl SyncLock {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Try to claim the volume. Returns `false` without waiting when another
    /// RPC already holds it.
    pub fn add_volume_lock(&self, volume_id: &str) -> bool {
        let mut in_flight = self.in_flight.lock().expect("volume lock set poisoned");
        if in_flight.contains(volume_id) {
            debug!(volume_id = %volume_id, "volume lock is busy");
            return false;
        }
        in_flight.insert(volume_id.to_string());
        true
    }

    pub fn remove_volume_lock(&self, volume_id: &str) {
        let mut in_flight = self.in_flight.lock().expect("volume lock set poisoned");
        in_flight.remove(volume_id);
    }

    /// Claim the volume and get a guard that releases it on drop, so every
    /// exit path of an RPC unlocks.
    pub fn lock_volume(self: &Arc<Self>, volume_id: &str) -> Option<VolumeLockGuard> {
        if !self.add_volume_lock(volume_id) {
            return None;
        }
        Some(VolumeLockGuard {
            locks: self.clone(),
            volume_id: volume_id.to_string(),
        })
    }
}

impl Default for SyncLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct VolumeLockGuard {
    locks: Arc<SyncLock>,
    volume_id: String,
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        self.locks.remove_volume_lock(&self.volume_id);
    }
}
