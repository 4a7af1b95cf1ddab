//! Per-node table of the (pod, volume) pairs this daemon is responsible for.
//!
//! The table is an index, not the source of truth: it is rebuilt from the
//! communication volumes and the mount table on startup, and every entry can
//! be re-derived from those two at any time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::TargetPath;
use crate::error::FailureKind;

pub type VolumeKey = TargetPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumePhase {
    Requested,
    MountInProgress,
    Mounted,
    MountFailed(FailureKind),
    UnmountRequested,
    Unmounted,
    /// Records left behind by a pod that no longer exists on this node.
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub phase: VolumePhase,
    pub target: PathBuf,
    pub bucket: Option<String>,
}

#[derive(Default)]
pub struct VolumeTable {
    entries: Mutex<HashMap<VolumeKey, VolumeEntry>>,
    locks: Mutex<HashMap<VolumeKey, Arc<AsyncMutex<()>>>>,
}

impl VolumeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize publish/unpublish of one key. Other keys are unaffected.
    pub async fn lock(&self, key: &VolumeKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn set(&self, key: &VolumeKey, phase: VolumePhase, target: PathBuf, bucket: Option<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.clone(), VolumeEntry { phase, target, bucket });
    }

    pub fn set_phase(&self, key: &VolumeKey, phase: VolumePhase) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.phase = phase;
        }
    }

    pub fn get(&self, key: &VolumeKey) -> Option<VolumeEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    pub fn phase(&self, key: &VolumeKey) -> Option<VolumePhase> {
        self.get(key).map(|e| e.phase)
    }

    /// Forget a key once it is fully unmounted. Call with the key's lock held.
    pub fn remove(&self, key: &VolumeKey) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map and the caller's guard; anything more is a waiter.
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) <= 2) {
            locks.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, phase: VolumePhase) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|e| e.phase == phase).count()
    }
}
