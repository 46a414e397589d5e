//! Sender state machine driving snapshot, catch-up, cut-over, and reclamation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use shoal_cluster::manager::MigrateManager;
use shoal_cluster::slot::SlotBitmap;
use shoal_cluster::state::{ClusterNode, ClusterState};
use shoal_common::config::MigrateConfig;
use shoal_common::error::{ErrorKind, ShoalError, ShoalResult};
use shoal_common::ids::{BinlogId, NodeId, SlotId, StoreId};
use shoal_replication::send_slots_binlog;
use shoal_replication::wire::{PeerConnection, fmt_bulk, fmt_multi_bulk_len};
use shoal_storage::{LockMode, SegmentManager, ShardHandle, Store, StoreTransaction};

/// Records shipped between two `'1'` ack points of the snapshot stream.
const SNAPSHOT_BATCH_SIZE: u32 = 1000;
/// Ack deadline for batch (`'1'`) and slot-end (`'2'`) markers.
const BATCH_ACK_TIMEOUT: Duration = Duration::from_secs(100);
/// Ack deadline for the end-of-snapshot (`'3'`) marker.
const SNAPSHOT_END_ACK_TIMEOUT: Duration = Duration::from_secs(160);
/// Catch-up passes allowed before the migration is declared stuck.
const CATCHUP_PASS_BUDGET: u16 = 10;

const TAG_RECORD: &[u8] = b"0";
const TAG_BATCH_END: &[u8] = b"1";
const TAG_SLOT_END: &[u8] = b"2";
const TAG_SNAPSHOT_END: &[u8] = b"3";
const ACK_OK: &[u8] = b"+OK";

/// Linear migration state. `Failed` is a sink; the other states advance in
/// declaration order and are never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateSenderStatus {
    /// Created; snapshot streaming has not finished.
    SnapshotBegin,
    /// Snapshot acked by the destination.
    SnapshotDone,
    /// Binlog catch-up converged and the locked tail was drained.
    BinlogDone,
    /// Ownership flipped and recorded locally.
    MetachangeDone,
    /// Migration aborted with the given error category.
    Failed(ErrorKind),
}

impl MigrateSenderStatus {
    /// Position in the linear state order; `Failed` ranks last as the sink.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::SnapshotBegin => 0,
            Self::SnapshotDone => 1,
            Self::BinlogDone => 2,
            Self::MetachangeDone => 3,
            Self::Failed(_) => 4,
        }
    }

    /// Whether no further transition can happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::MetachangeDone | Self::Failed(_))
    }
}

/// Non-decreasing progress counters of one migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationCounters {
    /// Records shipped by the snapshot stream.
    pub snapshot_key_num: u64,
    /// Binlog entries shipped by catch-up and the locked tail drain.
    pub binlog_num: u64,
    /// Keys deleted by reclamation.
    pub del_num: u64,
    /// Keys whose deletion failed and were left behind.
    pub del_fail_num: u64,
    /// Slots fully reclaimed.
    pub del_slot_num: u64,
}

/// Replay window of the binlog chase.
///
/// `cur` is the exclusive lower bound of the next pass, `end` the inclusive
/// upper bound recorded when the chase converged. Before the snapshot pins a
/// watermark `cur` holds [`BinlogWatermark::UNSET`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinlogWatermark {
    /// Highest id already shipped; replay resumes above it.
    pub cur: BinlogId,
    /// Converged upper bound of the last pass.
    pub end: BinlogId,
}

impl BinlogWatermark {
    /// Sentinel for a watermark that has not been pinned yet.
    pub const UNSET: BinlogId = BinlogId::MAX;
}

/// Where the migrated slots are going.
pub struct DestinationDescriptor {
    /// Destination node id, resolved against cluster state on attach.
    pub node_id: NodeId,
    /// Destination shard id, echoed in `migrateend`.
    pub store_id: StoreId,
    /// Destination network address, for logs.
    pub addr: String,
    /// Live connection to the destination.
    pub conn: Box<dyn PeerConnection>,
}

/// Injected collaborators the sender drives but does not own.
#[derive(Clone)]
pub struct SenderContext {
    /// Shard access with intent-shared locking.
    pub segments: Arc<dyn SegmentManager>,
    /// Slot→owner metadata.
    pub cluster: Arc<dyn ClusterState>,
    /// Cluster-wide slot locking for the quiescent window.
    pub migrations: Arc<dyn MigrateManager>,
}

struct Destination {
    node: ClusterNode,
    store_id: StoreId,
    addr: String,
    conn: Box<dyn PeerConnection>,
}

/// Sending side of one slot-set migration.
///
/// Create one sender per migration, attach the destination, call
/// [`ChunkMigrateSender::send_chunk`], optionally reclaim with
/// [`ChunkMigrateSender::delete_chunks`], then discard the sender.
pub struct ChunkMigrateSender {
    slots: SlotBitmap,
    store_id: StoreId,
    context: SenderContext,
    config: MigrateConfig,
    status: MigrateSenderStatus,
    counters: MigrationCounters,
    consistency: bool,
    cur_binlog_id: BinlogId,
    end_binlog_id: BinlogId,
    dst: Option<Destination>,
    shard: Option<ShardHandle>,
}

impl ChunkMigrateSender {
    /// Creates a sender for one slot set on one local shard.
    #[must_use]
    pub fn new(
        slots: SlotBitmap,
        store_id: StoreId,
        context: SenderContext,
        config: MigrateConfig,
    ) -> Self {
        Self {
            slots,
            store_id,
            context,
            config,
            status: MigrateSenderStatus::SnapshotBegin,
            counters: MigrationCounters::default(),
            consistency: false,
            cur_binlog_id: BinlogWatermark::UNSET,
            end_binlog_id: 0,
            dst: None,
            shard: None,
        }
    }

    /// Attaches the destination, resolving its node through cluster state.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Cluster` when the node id is unknown.
    pub fn set_destination(&mut self, descriptor: DestinationDescriptor) -> ShoalResult<()> {
        let Some(node) = self.context.cluster.lookup_node(&descriptor.node_id) else {
            return Err(ShoalError::Cluster(format!(
                "unknown destination node {}",
                descriptor.node_id
            )));
        };
        self.dst = Some(Destination {
            node,
            store_id: descriptor.store_id,
            addr: descriptor.addr,
            conn: descriptor.conn,
        });
        Ok(())
    }

    /// Runs the migration to its terminal state: snapshot, binlog catch-up,
    /// then the cut-over handshake.
    ///
    /// Reclamation is not part of this call; run
    /// [`ChunkMigrateSender::delete_chunks`] afterwards when the storage
    /// should be reclaimed.
    ///
    /// # Errors
    ///
    /// Any phase failure aborts the migration, leaves the sender in
    /// `Failed(kind)`, and returns the error.
    pub fn send_chunk(&mut self) -> ShoalResult<()> {
        match self.run_to_metachange() {
            Ok(()) => Ok(()),
            Err(migrate_error) => {
                self.status = MigrateSenderStatus::Failed(migrate_error.kind());
                Err(migrate_error)
            }
        }
    }

    fn run_to_metachange(&mut self) -> ShoalResult<()> {
        info!(store = self.store_id, "send chunk begin");
        self.send_snapshot()?;
        self.set_sender_status(MigrateSenderStatus::SnapshotDone);
        info!(store = self.store_id, "send snapshot finished");

        self.send_binlog(CATCHUP_PASS_BUDGET)?;
        self.set_sender_status(MigrateSenderStatus::BinlogDone);
        info!(store = self.store_id, "send binlog finished");

        self.send_over()?;
        self.set_sender_status(MigrateSenderStatus::MetachangeDone);
        info!(store = self.store_id, "send chunk end");
        Ok(())
    }

    /// Streams a point-in-time view of every migrated slot.
    ///
    /// Pins the shard in intent-shared mode for the rest of the migration and
    /// records the binlog watermark the catch-up phase resumes from.
    fn send_snapshot(&mut self) -> ShoalResult<()> {
        let handle = self
            .context
            .segments
            .get_db(self.store_id, LockMode::IntentShared)?;
        // The watermark must cover every write visible to the snapshot view.
        self.cur_binlog_id = handle.store().highest_binlog_id();
        self.shard = Some(handle);

        let Self {
            shard,
            dst,
            slots,
            counters,
            store_id,
            ..
        } = self;
        let shard = shard
            .as_ref()
            .ok_or(ShoalError::InvalidState("shard handle not held"))?;
        let dst = dst
            .as_mut()
            .ok_or(ShoalError::InvalidState("destination not attached"))?;

        let mut txn = shard.store().create_transaction()?;
        txn.set_snapshot();
        info!(store = *store_id, "snapshot transaction pinned");

        let mut sent_slots = 0_u32;
        for slot in slots.iter_set() {
            let range_keys = send_range(dst.conn.as_mut(), txn.as_ref(), slot, *store_id)?;
            counters.snapshot_key_num += range_keys;
            sent_slots += 1;
        }

        dst.conn.write_data(TAG_SNAPSHOT_END)?;
        expect_ok_ack(dst.conn.as_mut(), SNAPSHOT_END_ACK_TIMEOUT)?;
        info!(
            store = *store_id,
            slots = sent_slots,
            keys = counters.snapshot_key_num,
            "snapshot stream complete"
        );
        Ok(())
    }

    /// Chases the binlog until the lag is below the configured distance, then
    /// locks the slots and drains the remaining tail.
    fn send_binlog(&mut self, max_passes: u16) -> ShoalResult<()> {
        let Self {
            shard,
            dst,
            slots,
            config,
            counters,
            cur_binlog_id,
            end_binlog_id,
            context,
            store_id,
            ..
        } = self;
        let shard = shard
            .as_ref()
            .ok_or(ShoalError::InvalidState("shard handle not held"))?;
        let dst = dst
            .as_mut()
            .ok_or(ShoalError::InvalidState("destination not attached"))?;
        let store = shard.store();
        let txn = store.create_transaction()?;
        let mut high = store.highest_binlog_id();
        info!(
            store = *store_id,
            dst = %dst.addr,
            cur = *cur_binlog_id,
            high,
            "send binlog begin"
        );

        if *cur_binlog_id < high {
            let mut passes = 0_u16;
            let mut converged = false;
            while passes < max_passes {
                let sent = catchup_range(
                    dst, store, *store_id, *cur_binlog_id, high, slots, config,
                )?;
                counters.binlog_num += sent;
                passes += 1;
                info!(
                    store = *store_id,
                    from = *cur_binlog_id,
                    to = high,
                    pass = passes,
                    "catch-up pass complete"
                );

                *cur_binlog_id = high;
                high = store.highest_binlog_id();
                let max_visible = txn.max_binlog_id().unwrap_or(0);
                let lag = max_visible.saturating_sub(*cur_binlog_id);
                if lag < config.migrate_distance {
                    *end_binlog_id = max_visible;
                    info!(
                        store = *store_id,
                        lag,
                        cur = *cur_binlog_id,
                        end = *end_binlog_id,
                        "catch-up converged"
                    );
                    converged = true;
                    break;
                }
            }
            if !converged {
                // The slot lock was never taken; the destination garbage
                // collects whatever it already received.
                return Err(ShoalError::Timeout(format!(
                    "binlog catch-up still behind after {max_passes} passes"
                )));
            }
        } else {
            *end_binlog_id = txn.max_binlog_id().unwrap_or(0);
        }

        if let Err(lock_error) = context.migrations.lock_chunks(slots) {
            error!(store = *store_id, %lock_error, "failed to lock slots for cut-over");
            return Err(ShoalError::Cluster("failed to lock slots".to_owned()));
        }

        // Taking the lock costs time; recompute the tail under it.
        let locked_high = txn.max_binlog_id().unwrap_or(0);
        if *cur_binlog_id < locked_high {
            info!(
                store = *store_id,
                cur = *cur_binlog_id,
                high = locked_high,
                "final catch-up under slot lock"
            );
            match catchup_range(
                dst,
                store,
                *store_id,
                *cur_binlog_id,
                locked_high,
                slots,
                config,
            ) {
                Ok(sent) => {
                    counters.binlog_num += sent;
                    *cur_binlog_id = locked_high;
                    *end_binlog_id = locked_high;
                }
                Err(drain_error) => {
                    error!(store = *store_id, %drain_error, "final catch-up failed");
                    if let Err(unlock_error) = context.migrations.unlock_chunks(slots) {
                        error!(store = *store_id, %unlock_error, "slot unlock failed after drain error");
                    }
                    return Err(ShoalError::Network(
                        "final binlog drain under slot lock failed".to_owned(),
                    ));
                }
            }
        }

        info!(
            store = *store_id,
            peer = %dst.conn.remote_repr(),
            cur = *cur_binlog_id,
            end = *end_binlog_id,
            total = counters.binlog_num,
            "binlog phase complete"
        );
        Ok(())
    }

    /// Cut-over handshake: announce `migrateend`, wait for the destination to
    /// take ownership, record the flip locally, release the slot lock.
    ///
    /// The lock is released on every path out of here, success or abort.
    fn send_over(&mut self) -> ShoalResult<()> {
        let flip = self.flip_ownership();
        let unlock = self.context.migrations.unlock_chunks(&self.slots);
        match (flip, unlock) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(unlock_error)) => {
                error!(store = self.store_id, %unlock_error, "slot unlock failed after ownership flip");
                Err(ShoalError::Cluster(
                    "slot unlock failed after ownership flip".to_owned(),
                ))
            }
            (Err(flip_error), unlock_result) => {
                if let Err(unlock_error) = unlock_result {
                    error!(store = self.store_id, %unlock_error, "slot unlock failed during cut-over abort");
                }
                Err(flip_error)
            }
        }
    }

    fn flip_ownership(&mut self) -> ShoalResult<()> {
        let Self {
            dst,
            slots,
            config,
            context,
            store_id,
            ..
        } = self;
        let dst = dst
            .as_mut()
            .ok_or(ShoalError::InvalidState("destination not attached"))?;

        let mut frame = Vec::new();
        fmt_multi_bulk_len(&mut frame, 3);
        fmt_bulk(&mut frame, b"migrateend");
        fmt_bulk(&mut frame, slots.to_bit_string().as_bytes());
        fmt_bulk(&mut frame, dst.store_id.to_string().as_bytes());
        if let Err(write_error) = dst.conn.write_data(&frame) {
            error!(store = *store_id, %write_error, "migrateend write failed");
            return Err(write_error);
        }

        // Gossip may already have flipped the metadata; then the handshake is
        // complete without an ack and set_slots would be a no-op.
        if slots_belong_to(context.cluster.as_ref(), slots, &dst.node) {
            info!(
                store = *store_id,
                dst = %dst.node.id,
                "ownership already converged, skipping migrateend ack"
            );
            return Ok(());
        }

        let ack_timeout = Duration::from_secs(config.binlog_rsp_timeout_secs);
        let reply = match dst.conn.read_line(ack_timeout) {
            Ok(reply) => reply,
            Err(read_error) => {
                error!(
                    dst_store = dst.store_id,
                    %read_error,
                    "no reply to migrateend"
                );
                return Err(ShoalError::Cluster("missing package".to_owned()));
            }
        };
        if reply != "+OK" {
            error!(
                dst_store = dst.store_id,
                %reply,
                "migrateend rejected by destination"
            );
            return Err(ShoalError::Network(format!(
                "migrateend reply was {reply:?}"
            )));
        }

        if let Err(meta_error) = context.cluster.set_slots(&dst.node, slots) {
            error!(store = *store_id, %meta_error, "failed to record destination ownership");
            return Err(ShoalError::Cluster(
                "failed to record destination ownership".to_owned(),
            ));
        }
        Ok(())
    }

    /// Reclaims migrated keys from the local store and audits the counters.
    ///
    /// Per-key delete failures are counted and left behind; commit failures
    /// abort. Afterwards `consistency` reports whether
    /// `del_num == snapshot_key_num + binlog_num`; a mismatch means the audit
    /// trail is non-tight (overwrites during migration), not data loss.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::InvalidState` before `send_chunk` pinned the
    /// shard, `ShoalError::Internal` on cursor faults, and `ShoalError::Store`
    /// on commit failure.
    pub fn delete_chunks(&mut self) -> ShoalResult<()> {
        let Self {
            shard,
            slots,
            counters,
            consistency,
            store_id,
            ..
        } = self;
        let shard = shard
            .as_ref()
            .ok_or(ShoalError::InvalidState("shard handle not held"))?;
        let store = shard.store();

        for slot in slots.iter_set() {
            let (deleted, failed) = delete_chunk(store, slot)?;
            counters.del_num += deleted;
            counters.del_fail_num += failed;
            counters.del_slot_num += 1;
        }
        info!(
            store = *store_id,
            deleted = counters.del_num,
            failed = counters.del_fail_num,
            slots = counters.del_slot_num,
            "reclamation finished"
        );

        if counters.del_num == counters.snapshot_key_num + counters.binlog_num {
            *consistency = true;
            info!(store = *store_id, "reclamation audit consistent");
        } else {
            warn!(
                store = *store_id,
                del = counters.del_num,
                snapshot = counters.snapshot_key_num,
                binlog = counters.binlog_num,
                "reclamation audit mismatch, destination still holds every key"
            );
        }
        Ok(())
    }

    /// Overrides the sender state. Callers must respect the linear order;
    /// states are never revisited.
    pub fn set_sender_status(&mut self, status: MigrateSenderStatus) {
        debug_assert!(status.rank() >= self.status.rank());
        self.status = status;
    }

    /// Current migration state.
    #[must_use]
    pub fn sender_status(&self) -> MigrateSenderStatus {
        self.status
    }

    /// Progress counters so far.
    #[must_use]
    pub fn counters(&self) -> MigrationCounters {
        self.counters
    }

    /// Whether the reclamation audit balanced exactly.
    #[must_use]
    pub fn consistency(&self) -> bool {
        self.consistency
    }

    /// Current replay window.
    #[must_use]
    pub fn binlog_watermark(&self) -> BinlogWatermark {
        BinlogWatermark {
            cur: self.cur_binlog_id,
            end: self.end_binlog_id,
        }
    }

    /// The migrated slot set.
    #[must_use]
    pub fn slots(&self) -> &SlotBitmap {
        &self.slots
    }
}

impl std::fmt::Debug for ChunkMigrateSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkMigrateSender")
            .field("store_id", &self.store_id)
            .field("slots", &self.slots.count())
            .field("status", &self.status)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

/// Ships one slot's records from the snapshot view, batching acks.
fn send_range(
    conn: &mut dyn PeerConnection,
    txn: &dyn StoreTransaction,
    slot: SlotId,
    store_id: StoreId,
) -> ShoalResult<u64> {
    let mut cursor = txn.slots_cursor(slot, slot + 1);
    let mut total: u64 = 0;
    let mut batched: u32 = 0;
    while let Some(next_record) = cursor.next() {
        let record = next_record.map_err(|cursor_error| {
            ShoalError::Internal(format!("slot cursor failed: {cursor_error}"))
        })?;
        let key_len = u32::try_from(record.key.len())
            .map_err(|_| ShoalError::Internal("record key exceeds u32::MAX".to_owned()))?;
        let value_len = u32::try_from(record.value.len())
            .map_err(|_| ShoalError::Internal("record value exceeds u32::MAX".to_owned()))?;

        let mut frame = Vec::with_capacity(1 + 4 + record.key.len() + 4 + record.value.len());
        frame.extend_from_slice(TAG_RECORD);
        frame.extend_from_slice(&key_len.to_le_bytes());
        frame.extend_from_slice(&record.key);
        frame.extend_from_slice(&value_len.to_le_bytes());
        frame.extend_from_slice(&record.value);
        conn.write_data(&frame)?;

        total += 1;
        batched += 1;
        if batched >= SNAPSHOT_BATCH_SIZE {
            conn.write_data(TAG_BATCH_END)?;
            expect_ok_ack(conn, BATCH_ACK_TIMEOUT)?;
            batched = 0;
        }
    }

    conn.write_data(TAG_SLOT_END)?;
    expect_ok_ack(conn, BATCH_ACK_TIMEOUT)?;
    info!(store = store_id, slot, keys = total, "slot snapshot shipped");
    Ok(total)
}

/// Reads the 3-byte ack of a snapshot marker; anything but `+OK` aborts.
fn expect_ok_ack(conn: &mut dyn PeerConnection, timeout: Duration) -> ShoalResult<()> {
    let ack = conn.read_exact(ACK_OK.len(), timeout)?;
    if ack != ACK_OK {
        error!(
            ack = %String::from_utf8_lossy(&ack),
            "snapshot ack is not +OK"
        );
        return Err(ShoalError::Internal(format!(
            "snapshot ack was {:?}",
            String::from_utf8_lossy(&ack)
        )));
    }
    Ok(())
}

/// One binlog replay pass `(start, end]` to the destination.
fn catchup_range(
    dst: &mut Destination,
    store: &dyn Store,
    src_store_id: StoreId,
    start: BinlogId,
    end: BinlogId,
    slots: &SlotBitmap,
    config: &MigrateConfig,
) -> ShoalResult<u64> {
    let shipped = send_slots_binlog(
        dst.conn.as_mut(),
        store,
        src_store_id,
        dst.store_id,
        start,
        end,
        false,
        slots,
        config,
    );
    if let Err(relay_error) = &shipped {
        error!(
            peer = %dst.conn.remote_repr(),
            %relay_error,
            "binlog catch-up to peer failed"
        );
    }
    shipped
}

/// Whether the cluster metadata already shows `node` owning every slot.
fn slots_belong_to(state: &dyn ClusterState, slots: &SlotBitmap, node: &ClusterNode) -> bool {
    for slot in slots.iter_set() {
        let owner = state.node_by_slot(slot);
        if owner.as_ref().map(|owned| owned.id.as_str()) != Some(node.id.as_str()) {
            warn!(slot, node = %node.id, "slot not owned by destination yet");
            return false;
        }
    }
    true
}

/// Deletes every record of one slot in a fresh write transaction.
///
/// Returns `(deleted, failed)` key counts for the audit.
fn delete_chunk(store: &dyn Store, slot: SlotId) -> ShoalResult<(u64, u64)> {
    let mut txn = store.create_transaction()?;
    let keys = {
        let mut cursor = txn.slots_cursor(slot, slot + 1);
        let mut keys = Vec::new();
        while let Some(next_record) = cursor.next() {
            let record = next_record.map_err(|cursor_error| {
                ShoalError::Internal(format!("reclaim cursor failed: {cursor_error}"))
            })?;
            keys.push(record.key);
        }
        keys
    };

    let mut deleted: u64 = 0;
    let mut failed: u64 = 0;
    for key in keys {
        match txn.del_kv(&key) {
            Ok(()) => deleted += 1,
            Err(delete_error) => {
                warn!(slot, %delete_error, "delete failed, key left behind");
                failed += 1;
            }
        }
    }
    txn.commit()?;
    info!(slot, deleted, failed, "slot reclaimed");
    Ok((deleted, failed))
}

#[cfg(test)]
mod tests;
