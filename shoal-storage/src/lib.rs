//! Storage-facing capability traits consumed by replication and migration.

pub mod binlog;
pub mod memory;

use std::sync::Arc;

use shoal_common::error::ShoalResult;
use shoal_common::ids::{BinlogId, SlotId, StoreId};

use binlog::BinlogEntry;

/// One materialized key-value record, both halves already encoded.
///
/// Migration code ships records opaquely; only the store interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Encoded record key.
    pub key: Vec<u8>,
    /// Encoded record value.
    pub value: Vec<u8>,
}

/// Shard lock modes understood by the segment manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared intent: admits concurrent writers, excludes exclusive holders.
    IntentShared,
    /// Exclusive: excludes every other holder.
    Exclusive,
}

/// One storage shard: a record keyspace plus its append-only binlog.
pub trait Store: Send + Sync {
    /// Opens a transaction over this shard.
    ///
    /// The transaction reads live data until [`StoreTransaction::set_snapshot`]
    /// pins a point-in-time view.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Store` when the engine cannot open a transaction.
    fn create_transaction(&self) -> ShoalResult<Box<dyn StoreTransaction + '_>>;

    /// Highest binlog id assigned so far, zero when the log is empty.
    fn highest_binlog_id(&self) -> BinlogId;
}

/// A transaction over one shard.
pub trait StoreTransaction {
    /// Pins the transaction to a point-in-time read view.
    ///
    /// Also remembers the binlog watermark at pin time; cursors opened
    /// afterwards never observe later writes.
    fn set_snapshot(&mut self);

    /// Iterates every record whose key hashes into `[begin, end)`, in
    /// ascending encoded-key order.
    fn slots_cursor(&self, begin: SlotId, end: SlotId) -> Box<dyn SlotCursor + '_>;

    /// Iterates binlog entries with ids in `(start_exclusive, end_inclusive]`,
    /// in ascending id order.
    fn binlog_cursor(
        &self,
        start_exclusive: BinlogId,
        end_inclusive: BinlogId,
    ) -> Box<dyn BinlogCursor + '_>;

    /// Highest binlog id visible to this transaction, `None` on an empty log.
    fn max_binlog_id(&self) -> Option<BinlogId>;

    /// Stages one key deletion; applied at [`StoreTransaction::commit`].
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Store` when the engine rejects the write.
    fn del_kv(&mut self, key: &[u8]) -> ShoalResult<()>;

    /// Applies staged writes atomically.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Store` when the engine fails to commit.
    fn commit(self: Box<Self>) -> ShoalResult<()>;
}

/// Record iterator over a slot range. Exhaustion is `None`; a storage fault
/// is `Some(Err)`.
pub trait SlotCursor {
    /// Returns the next record, a fault, or `None` when exhausted.
    fn next(&mut self) -> Option<ShoalResult<Record>>;
}

/// Binlog iterator over an id range, ascending. Exhaustion is `None`.
pub trait BinlogCursor {
    /// Returns the next entry, a fault, or `None` when exhausted.
    fn next(&mut self) -> Option<ShoalResult<BinlogEntry>>;
}

/// Hands out shard access under an explicit lock mode.
pub trait SegmentManager: Send + Sync {
    /// Opens one shard under `mode`, pinning the shard lock until the
    /// returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Store` for unknown shards or when the requested
    /// mode conflicts with a held lock.
    fn get_db(&self, store_id: StoreId, mode: LockMode) -> ShoalResult<ShardHandle>;
}

/// A shard reference plus the lock that protects it, released on drop.
pub struct ShardHandle {
    store: Arc<dyn Store>,
    _lock: ShardLockGuard,
}

impl ShardHandle {
    /// Builds a handle from a store and an already-acquired lock guard.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, lock: ShardLockGuard) -> Self {
        Self { store, _lock: lock }
    }

    /// The locked shard.
    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }
}

impl std::fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHandle").finish_non_exhaustive()
    }
}

/// RAII guard over one shard's lock table entry.
#[derive(Debug)]
pub struct ShardLockGuard {
    state: Arc<memory::ShardLockState>,
    mode: LockMode,
}

impl ShardLockGuard {
    pub(crate) fn new(state: Arc<memory::ShardLockState>, mode: LockMode) -> Self {
        Self { state, mode }
    }
}

impl Drop for ShardLockGuard {
    fn drop(&mut self) {
        self.state.release(self.mode);
    }
}
