//! Cluster-wide slot locking for migration admission.

use std::sync::{Mutex, PoisonError};

use tracing::warn;

use shoal_common::error::{ShoalError, ShoalResult};

use crate::slot::SlotBitmap;

/// Cluster-wide locking of slot sets during migration cut-over.
///
/// Admission control guarantees concurrent migrations operate on disjoint
/// slot sets; the sender itself only locks around its quiescent window.
pub trait MigrateManager: Send + Sync {
    /// Write-locks every slot in `slots` cluster-wide.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Cluster` when any requested slot is already held
    /// by another migration.
    fn lock_chunks(&self, slots: &SlotBitmap) -> ShoalResult<()>;

    /// Releases a lock previously taken with [`MigrateManager::lock_chunks`].
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Cluster` when the slots are not currently held.
    fn unlock_chunks(&self, slots: &SlotBitmap) -> ShoalResult<()>;
}

/// In-memory slot lock registry, the reference [`MigrateManager`].
#[derive(Debug, Default)]
pub struct ChunkLockManager {
    locked: Mutex<SlotBitmap>,
}

impl ChunkLockManager {
    /// Creates a manager with no slots locked.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether every slot in `slots` is currently locked.
    #[must_use]
    pub fn holds(&self, slots: &SlotBitmap) -> bool {
        slots.is_subset(&self.lock_bits())
    }

    /// Returns whether no slot is locked at all.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.lock_bits().is_empty()
    }

    fn lock_bits(&self) -> SlotBitmap {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MigrateManager for ChunkLockManager {
    fn lock_chunks(&self, slots: &SlotBitmap) -> ShoalResult<()> {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        if locked.intersects(slots) {
            warn!("slot lock rejected, requested set overlaps a held migration");
            return Err(ShoalError::Cluster(
                "slot set overlaps an in-flight migration lock".to_owned(),
            ));
        }
        for slot in slots.iter_set() {
            locked.set(slot);
        }
        Ok(())
    }

    fn unlock_chunks(&self, slots: &SlotBitmap) -> ShoalResult<()> {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        if !slots.is_subset(&locked) {
            return Err(ShoalError::Cluster(
                "unlock of slots that are not held".to_owned(),
            ));
        }
        for slot in slots.iter_set() {
            locked.clear(slot);
        }
        Ok(())
    }
}
