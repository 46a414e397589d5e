//! In-memory reference implementation of the storage capabilities.
//!
//! Backs the migration test suites and small single-process deployments. The
//! record map and the binlog live under one mutex so every appended write
//! receives its id in arrival order, the property binlog replay relies on.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;

use shoal_cluster::slot::key_slot;
use shoal_common::error::{ShoalError, ShoalResult};
use shoal_common::ids::{BinlogId, SlotId, StoreId};

use crate::binlog::BinlogEntry;
use crate::{
    BinlogCursor, LockMode, Record, SegmentManager, ShardHandle, ShardLockGuard, SlotCursor,
    Store, StoreTransaction,
};

/// Hash-map store with an append-only binlog.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: HashMap<Vec<u8>, Vec<u8>>,
    binlog: Vec<BinlogEntry>,
    next_binlog_id: BinlogId,
}

impl StoreInner {
    fn assign_binlog_id(&mut self) -> BinlogId {
        self.next_binlog_id = self.next_binlog_id.saturating_add(1);
        self.next_binlog_id
    }

    fn highest_binlog_id(&self) -> BinlogId {
        self.binlog.last().map_or(0, |entry| entry.id)
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts one record and appends the matching binlog entry.
    pub fn put(&self, key: &[u8], value: &[u8]) -> BinlogId {
        let mut inner = self.lock_inner();
        let id = inner.assign_binlog_id();
        inner.records.insert(key.to_vec(), value.to_vec());
        inner
            .binlog
            .push(BinlogEntry::set(id, key.to_vec(), value.to_vec()));
        id
    }

    /// Deletes one record, appending a binlog entry when the key existed.
    pub fn del(&self, key: &[u8]) -> bool {
        let mut inner = self.lock_inner();
        if inner.records.remove(key).is_none() {
            return false;
        }
        let id = inner.assign_binlog_id();
        inner.binlog.push(BinlogEntry::del(id, key.to_vec()));
        true
    }

    /// Reads one record value.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lock_inner().records.get(key).cloned()
    }

    /// Number of live records.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.lock_inner().records.len()
    }

    fn lock_inner(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for InMemoryStore {
    fn create_transaction(&self) -> ShoalResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(InMemoryTransaction {
            store: self,
            snapshot: None,
            pending_deletes: Vec::new(),
        }))
    }

    fn highest_binlog_id(&self) -> BinlogId {
        self.lock_inner().highest_binlog_id()
    }
}

/// Transaction over [`InMemoryStore`].
///
/// Reads live data until `set_snapshot` clones a point-in-time view. Deletes
/// are staged and applied on commit, each producing its own binlog entry.
struct InMemoryTransaction<'a> {
    store: &'a InMemoryStore,
    snapshot: Option<SnapshotView>,
    pending_deletes: Vec<Vec<u8>>,
}

struct SnapshotView {
    records: HashMap<Vec<u8>, Vec<u8>>,
    binlog: Vec<BinlogEntry>,
}

impl InMemoryTransaction<'_> {
    fn visible_records(&self) -> Vec<Record> {
        let collect = |records: &HashMap<Vec<u8>, Vec<u8>>| {
            records
                .iter()
                .map(|(key, value)| Record {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect::<Vec<_>>()
        };
        match &self.snapshot {
            Some(view) => collect(&view.records),
            None => collect(&self.store.lock_inner().records),
        }
    }

    fn visible_binlog(&self) -> Vec<BinlogEntry> {
        match &self.snapshot {
            Some(view) => view.binlog.clone(),
            None => self.store.lock_inner().binlog.clone(),
        }
    }
}

impl StoreTransaction for InMemoryTransaction<'_> {
    fn set_snapshot(&mut self) {
        let inner = self.store.lock_inner();
        self.snapshot = Some(SnapshotView {
            records: inner.records.clone(),
            binlog: inner.binlog.clone(),
        });
    }

    fn slots_cursor(&self, begin: SlotId, end: SlotId) -> Box<dyn SlotCursor + '_> {
        let mut records = self
            .visible_records()
            .into_iter()
            .filter(|record| {
                let slot = key_slot(&record.key);
                begin <= slot && slot < end
            })
            .collect::<Vec<_>>();
        records.sort_unstable_by(|left, right| left.key.cmp(&right.key));
        Box::new(VecSlotCursor {
            records: records.into_iter(),
        })
    }

    fn binlog_cursor(
        &self,
        start_exclusive: BinlogId,
        end_inclusive: BinlogId,
    ) -> Box<dyn BinlogCursor + '_> {
        let entries = self
            .visible_binlog()
            .into_iter()
            .filter(|entry| start_exclusive < entry.id && entry.id <= end_inclusive)
            .collect::<Vec<_>>();
        Box::new(VecBinlogCursor {
            entries: entries.into_iter(),
        })
    }

    fn max_binlog_id(&self) -> Option<BinlogId> {
        match &self.snapshot {
            Some(view) => view.binlog.last().map(|entry| entry.id),
            None => {
                let inner = self.store.lock_inner();
                inner.binlog.last().map(|entry| entry.id)
            }
        }
    }

    fn del_kv(&mut self, key: &[u8]) -> ShoalResult<()> {
        self.pending_deletes.push(key.to_vec());
        Ok(())
    }

    fn commit(self: Box<Self>) -> ShoalResult<()> {
        let mut inner = self.store.lock_inner();
        for key in self.pending_deletes {
            if inner.records.remove(&key).is_none() {
                continue;
            }
            let id = inner.assign_binlog_id();
            inner.binlog.push(BinlogEntry::del(id, key));
        }
        Ok(())
    }
}

struct VecSlotCursor {
    records: std::vec::IntoIter<Record>,
}

impl SlotCursor for VecSlotCursor {
    fn next(&mut self) -> Option<ShoalResult<Record>> {
        self.records.next().map(Ok)
    }
}

struct VecBinlogCursor {
    entries: std::vec::IntoIter<BinlogEntry>,
}

impl BinlogCursor for VecBinlogCursor {
    fn next(&mut self) -> Option<ShoalResult<BinlogEntry>> {
        self.entries.next().map(Ok)
    }
}

/// Per-shard lock table entry shared between the manager and issued guards.
#[derive(Debug, Default)]
pub struct ShardLockState {
    inner: Mutex<LockCounts>,
}

#[derive(Debug, Default)]
struct LockCounts {
    intent_shared: usize,
    exclusive: bool,
}

impl ShardLockState {
    fn try_acquire(&self, mode: LockMode) -> bool {
        let mut counts = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match mode {
            LockMode::IntentShared => {
                if counts.exclusive {
                    return false;
                }
                counts.intent_shared += 1;
                true
            }
            LockMode::Exclusive => {
                if counts.exclusive || counts.intent_shared > 0 {
                    return false;
                }
                counts.exclusive = true;
                true
            }
        }
    }

    pub(crate) fn release(&self, mode: LockMode) {
        let mut counts = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match mode {
            LockMode::IntentShared => {
                counts.intent_shared = counts.intent_shared.saturating_sub(1);
            }
            LockMode::Exclusive => counts.exclusive = false,
        }
    }

    /// Number of intent-shared holders, for observability and tests.
    #[must_use]
    pub fn intent_shared_holders(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .intent_shared
    }
}

struct ShardSlot {
    store: Arc<InMemoryStore>,
    lock: Arc<ShardLockState>,
}

/// Registry of in-memory shards, the reference [`SegmentManager`].
#[derive(Default)]
pub struct InMemorySegmentManager {
    shards: Mutex<HashMap<StoreId, ShardSlot>>,
}

impl InMemorySegmentManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one shard under `store_id`, replacing any previous entry.
    pub fn register(&self, store_id: StoreId, store: Arc<InMemoryStore>) {
        let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        shards.insert(
            store_id,
            ShardSlot {
                store,
                lock: Arc::new(ShardLockState::default()),
            },
        );
    }

    /// Lock table entry for one shard, for observability and tests.
    #[must_use]
    pub fn lock_state(&self, store_id: StoreId) -> Option<Arc<ShardLockState>> {
        let shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        shards.get(&store_id).map(|slot| Arc::clone(&slot.lock))
    }
}

impl std::fmt::Debug for InMemorySegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySegmentManager")
            .finish_non_exhaustive()
    }
}

impl SegmentManager for InMemorySegmentManager {
    fn get_db(&self, store_id: StoreId, mode: LockMode) -> ShoalResult<ShardHandle> {
        let shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = shards.get(&store_id) else {
            return Err(ShoalError::Store(format!("unknown store {store_id}")));
        };
        if !slot.lock.try_acquire(mode) {
            return Err(ShoalError::Store(format!(
                "store {store_id} lock conflict for {mode:?}"
            )));
        }
        let guard = ShardLockGuard::new(Arc::clone(&slot.lock), mode);
        let store: Arc<dyn Store> = slot.store.clone();
        Ok(ShardHandle::new(store, guard))
    }
}
