use super::{
    ChunkMigrateSender, DestinationDescriptor, MigrateSenderStatus, SenderContext,
};
use googletest::prelude::*;
use rstest::rstest;
use shoal_cluster::manager::ChunkLockManager;
use shoal_cluster::slot::{SlotBitmap, key_slot};
use shoal_cluster::state::{ClusterNode, ClusterState, StaticClusterState};
use shoal_common::config::MigrateConfig;
use shoal_common::error::{ErrorKind, ShoalError, ShoalResult};
use shoal_common::ids::{NodeId, SlotId, StoreId};
use shoal_replication::wire::PeerConnection;
use shoal_storage::memory::{InMemorySegmentManager, InMemoryStore};
use shoal_storage::Store;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SRC_STORE: StoreId = 1;
const DST_STORE: StoreId = 2;
const SRC_NODE: &str = "node-src";
const DST_NODE: &str = "node-dst";

type ReadHook = Box<dyn FnMut(usize) + Send>;

/// Peer double: records everything written, answers reads from a script,
/// and fires a hook before every read so tests can inject concurrent writes
/// at the protocol's natural suspension points.
struct ScriptedPeer {
    written: Arc<Mutex<Vec<u8>>>,
    exact_replies: VecDeque<Vec<u8>>,
    line_replies: VecDeque<ShoalResult<String>>,
    reads: usize,
    line_reads: Arc<AtomicUsize>,
    hook: Option<ReadHook>,
}

struct PeerProbe {
    written: Arc<Mutex<Vec<u8>>>,
    line_reads: Arc<AtomicUsize>,
}

impl ScriptedPeer {
    fn new() -> (Self, PeerProbe) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let line_reads = Arc::new(AtomicUsize::new(0));
        let peer = Self {
            written: Arc::clone(&written),
            exact_replies: VecDeque::new(),
            line_replies: VecDeque::new(),
            reads: 0,
            line_reads: Arc::clone(&line_reads),
            hook: None,
        };
        (peer, PeerProbe { written, line_reads })
    }

    fn with_hook(mut self, hook: ReadHook) -> Self {
        self.hook = Some(hook);
        self
    }

    fn with_line_replies(mut self, replies: Vec<ShoalResult<String>>) -> Self {
        self.line_replies = replies.into();
        self
    }

    fn with_exact_replies(mut self, replies: Vec<Vec<u8>>) -> Self {
        self.exact_replies = replies.into();
        self
    }

    fn fire_hook(&mut self) {
        let index = self.reads;
        self.reads += 1;
        if let Some(hook) = self.hook.as_mut() {
            hook(index);
        }
    }
}

impl PeerConnection for ScriptedPeer {
    fn write_data(&mut self, payload: &[u8]) -> ShoalResult<()> {
        self.written
            .lock()
            .expect("probe mutex should not be poisoned")
            .extend_from_slice(payload);
        Ok(())
    }

    fn read_exact(&mut self, len: usize, _timeout: Duration) -> ShoalResult<Vec<u8>> {
        self.fire_hook();
        let reply = self
            .exact_replies
            .pop_front()
            .unwrap_or_else(|| b"+OK".to_vec());
        assert_eq!(reply.len(), len, "scripted ack length must match the read");
        Ok(reply)
    }

    fn read_line(&mut self, _timeout: Duration) -> ShoalResult<String> {
        self.fire_hook();
        let _ = self.line_reads.fetch_add(1, Ordering::AcqRel);
        self.line_replies
            .pop_front()
            .unwrap_or_else(|| Ok("+OK".to_owned()))
    }

    fn remote_repr(&self) -> String {
        "scripted:0".to_owned()
    }
}

impl PeerProbe {
    fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .expect("probe mutex should not be poisoned")
            .clone()
    }

    fn written_contains(&self, needle: &[u8]) -> bool {
        let written = self.written();
        written.windows(needle.len()).any(|window| window == needle)
    }

    fn line_reads(&self) -> usize {
        self.line_reads.load(Ordering::Acquire)
    }
}

/// Cluster-state wrapper counting metadata mutations.
struct RecordingClusterState {
    inner: Arc<StaticClusterState>,
    set_slots_calls: AtomicUsize,
}

impl ClusterState for RecordingClusterState {
    fn node_by_slot(&self, slot: SlotId) -> Option<ClusterNode> {
        self.inner.node_by_slot(slot)
    }

    fn lookup_node(&self, id: &str) -> Option<ClusterNode> {
        self.inner.lookup_node(id)
    }

    fn set_slots(&self, node: &ClusterNode, slots: &SlotBitmap) -> ShoalResult<()> {
        let _ = self.set_slots_calls.fetch_add(1, Ordering::AcqRel);
        self.inner.set_slots(node, slots)
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    segments: Arc<InMemorySegmentManager>,
    cluster: Arc<RecordingClusterState>,
    locks: Arc<ChunkLockManager>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let segments = Arc::new(InMemorySegmentManager::new());
        segments.register(SRC_STORE, Arc::clone(&store));
        let inner_state = StaticClusterState::new(vec![
            ClusterNode {
                id: SRC_NODE.to_owned(),
                addr: "127.0.0.1:7000".to_owned(),
            },
            ClusterNode {
                id: DST_NODE.to_owned(),
                addr: "127.0.0.1:7001".to_owned(),
            },
        ]);
        Self {
            store,
            segments,
            cluster: Arc::new(RecordingClusterState {
                inner: inner_state,
                set_slots_calls: AtomicUsize::new(0),
            }),
            locks: Arc::new(ChunkLockManager::new()),
        }
    }

    fn sender_with_config(
        &self,
        slots: SlotBitmap,
        conn: Box<dyn PeerConnection>,
        config: MigrateConfig,
    ) -> ChunkMigrateSender {
        let context = SenderContext {
            segments: self.segments.clone(),
            cluster: self.cluster.clone(),
            migrations: self.locks.clone(),
        };
        let mut sender = ChunkMigrateSender::new(slots, SRC_STORE, context, config);
        sender
            .set_destination(DestinationDescriptor {
                node_id: DST_NODE.to_owned(),
                store_id: DST_STORE,
                addr: "127.0.0.1:7001".to_owned(),
                conn,
            })
            .expect("destination node should resolve");
        sender
    }

    fn sender(&self, slots: SlotBitmap, conn: Box<dyn PeerConnection>) -> ChunkMigrateSender {
        self.sender_with_config(slots, conn, MigrateConfig::default())
    }

    fn owner_of(&self, slot: SlotId) -> Option<NodeId> {
        self.cluster.node_by_slot(slot).map(|node| node.id)
    }

    fn seed_tagged_keys(&self, tag: &str, count: usize) -> SlotId {
        for index in 0..count {
            let _ = self.store.put(&tagged_key(tag, index), b"value");
        }
        slot_for_tag(tag)
    }
}

fn slot_for_tag(tag: &str) -> SlotId {
    key_slot(format!("{{{tag}}}").as_bytes())
}

fn tagged_key(tag: &str, index: usize) -> Vec<u8> {
    format!("{{{tag}}}:{index}").into_bytes()
}

/// Hook injecting `count` writes into the migrated slot on selected reads.
fn slot_writer_hook(
    store: Arc<InMemoryStore>,
    tag: &str,
    count: usize,
    active: impl Fn(usize) -> bool + Send + 'static,
) -> ReadHook {
    let tag = tag.to_owned();
    let mut injected = 0_usize;
    Box::new(move |read_index| {
        if !active(read_index) {
            return;
        }
        for _ in 0..count {
            let key = format!("{{{tag}}}:w{injected}").into_bytes();
            let _ = store.put(&key, b"injected");
            injected += 1;
        }
    })
}

#[rstest]
fn quiet_migration_flips_ownership_and_audits_clean() {
    let harness = Harness::new();
    let slot = harness.seed_tagged_keys("alpha", 5);
    let slots = SlotBitmap::from_slots(&[slot]);
    harness.cluster.inner.assign_slots(SRC_NODE, &slots);

    let (peer, probe) = ScriptedPeer::new();
    let mut sender = harness.sender(slots.clone(), Box::new(peer));
    sender.send_chunk().expect("quiet migration should succeed");

    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::MetachangeDone)
    );
    let counters = sender.counters();
    assert_that!(counters.snapshot_key_num, eq(5_u64));
    assert_that!(counters.binlog_num, eq(0_u64));
    assert_that!(&harness.owner_of(slot), eq(&Some(DST_NODE.to_owned())));
    assert_that!(harness.locks.is_idle(), eq(true));
    assert_that!(probe.written_contains(b"migrateend"), eq(true));
    assert_that!(
        probe.written_contains(slots.to_bit_string().as_bytes()),
        eq(true)
    );
    // No writes arrived, so the binlog stream never went out.
    assert_that!(probe.written_contains(b"migratebinlogs"), eq(false));

    sender
        .delete_chunks()
        .expect("reclamation should succeed after the flip");
    let counters = sender.counters();
    assert_that!(counters.del_num, eq(5_u64));
    assert_that!(counters.del_slot_num, eq(1_u64));
    assert_that!(sender.consistency(), eq(true));
    assert_that!(harness.store.key_count(), eq(0_usize));

    let watermark = sender.binlog_watermark();
    assert_that!(watermark.cur <= watermark.end, eq(true));
    assert_that!(
        watermark.end <= harness.store.highest_binlog_id(),
        eq(true)
    );

    // The shard's intent-shared lock is scoped to the sender.
    let shard_lock = harness
        .segments
        .lock_state(SRC_STORE)
        .expect("source shard should be registered");
    assert_that!(shard_lock.intent_shared_holders(), eq(1_usize));
    drop(sender);
    assert_that!(shard_lock.intent_shared_holders(), eq(0_usize));
}

#[rstest]
fn writes_during_snapshot_are_chased_and_shipped() {
    let harness = Harness::new();
    let slot = harness.seed_tagged_keys("beta", 1000);
    let slots = SlotBitmap::from_slots(&[slot]);
    harness.cluster.inner.assign_slots(SRC_NODE, &slots);

    // 67 writes land at each of the three snapshot ack points: 201 total,
    // all into the migrated slot, none visible to the pinned snapshot.
    let (peer, probe) = ScriptedPeer::new();
    let peer = peer.with_hook(slot_writer_hook(
        Arc::clone(&harness.store),
        "beta",
        67,
        |read_index| read_index < 3,
    ));
    let config = MigrateConfig {
        migrate_distance: 50,
        ..MigrateConfig::default()
    };
    let mut sender = harness.sender_with_config(slots, Box::new(peer), config);
    sender
        .send_chunk()
        .expect("migration should converge and flip");

    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::MetachangeDone)
    );
    let counters = sender.counters();
    assert_that!(counters.snapshot_key_num, eq(1000_u64));
    assert_that!(counters.binlog_num >= 200, eq(true));
    assert_that!(&harness.owner_of(slot), eq(&Some(DST_NODE.to_owned())));
    assert_that!(harness.locks.is_idle(), eq(true));
    assert_that!(probe.written_contains(b"migratebinlogs"), eq(true));

    let watermark = sender.binlog_watermark();
    assert_that!(watermark.cur <= watermark.end, eq(true));
    assert_that!(
        watermark.end <= harness.store.highest_binlog_id(),
        eq(true)
    );
}

#[rstest]
fn catchup_that_never_converges_times_out_without_locking() {
    let harness = Harness::new();
    let slot = harness.seed_tagged_keys("gamma", 5);
    let slots = SlotBitmap::from_slots(&[slot]);
    harness.cluster.inner.assign_slots(SRC_NODE, &slots);

    // A sustained writer outruns the configured distance on every pass.
    let (peer, probe) = ScriptedPeer::new();
    let peer = peer.with_hook(slot_writer_hook(
        Arc::clone(&harness.store),
        "gamma",
        60,
        |_| true,
    ));
    let config = MigrateConfig {
        migrate_distance: 50,
        ..MigrateConfig::default()
    };
    let mut sender = harness.sender_with_config(slots, Box::new(peer), config);

    let migrate_error = sender
        .send_chunk()
        .expect_err("catch-up must exhaust its pass budget");
    assert_that!(migrate_error.kind(), eq(ErrorKind::Timeout));
    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::Failed(ErrorKind::Timeout))
    );
    // The quiescent window never started: no lock, no cut-over command.
    assert_that!(harness.locks.is_idle(), eq(true));
    assert_that!(probe.written_contains(b"migrateend"), eq(false));
    assert_that!(&harness.owner_of(slot), eq(&Some(SRC_NODE.to_owned())));
    assert_that!(
        harness.cluster.set_slots_calls.load(Ordering::Acquire),
        eq(0_usize)
    );
}

#[rstest]
fn peer_nack_on_migrateend_unlocks_and_keeps_ownership() {
    let harness = Harness::new();
    let slot = harness.seed_tagged_keys("delta", 3);
    let slots = SlotBitmap::from_slots(&[slot]);
    harness.cluster.inner.assign_slots(SRC_NODE, &slots);

    let (peer, _probe) = ScriptedPeer::new();
    let peer = peer.with_line_replies(vec![Ok("-ERR not ready".to_owned())]);
    let mut sender = harness.sender(slots, Box::new(peer));

    let migrate_error = sender
        .send_chunk()
        .expect_err("a nacked migrateend must abort");
    assert_that!(migrate_error.kind(), eq(ErrorKind::Network));
    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::Failed(ErrorKind::Network))
    );
    assert_that!(harness.locks.is_idle(), eq(true));
    assert_that!(&harness.owner_of(slot), eq(&Some(SRC_NODE.to_owned())));
    assert_that!(
        harness.cluster.set_slots_calls.load(Ordering::Acquire),
        eq(0_usize)
    );
}

#[rstest]
fn missing_migrateend_reply_is_a_cluster_error() {
    let harness = Harness::new();
    let slot = harness.seed_tagged_keys("theta", 2);
    let slots = SlotBitmap::from_slots(&[slot]);
    harness.cluster.inner.assign_slots(SRC_NODE, &slots);

    let (peer, _probe) = ScriptedPeer::new();
    let peer = peer.with_line_replies(vec![Err(ShoalError::Network(
        "read from scripted:0 timed out".to_owned(),
    ))]);
    let mut sender = harness.sender(slots, Box::new(peer));

    let migrate_error = sender
        .send_chunk()
        .expect_err("a silent peer must abort the cut-over");
    assert_that!(migrate_error.kind(), eq(ErrorKind::Cluster));
    assert_that!(harness.locks.is_idle(), eq(true));
    assert_that!(&harness.owner_of(slot), eq(&Some(SRC_NODE.to_owned())));
}

#[rstest]
fn already_converged_ownership_skips_ack_and_set_slots() {
    let harness = Harness::new();
    let slot = harness.seed_tagged_keys("epsilon", 4);
    let slots = SlotBitmap::from_slots(&[slot]);
    // Gossip has already flipped the metadata before the cut-over.
    harness.cluster.inner.assign_slots(DST_NODE, &slots);

    let (peer, probe) = ScriptedPeer::new();
    let mut sender = harness.sender(slots, Box::new(peer));
    sender
        .send_chunk()
        .expect("converged metadata should short-circuit to success");

    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::MetachangeDone)
    );
    assert_that!(probe.written_contains(b"migrateend"), eq(true));
    // No ack was awaited and the no-op metadata write was skipped.
    assert_that!(probe.line_reads(), eq(0_usize));
    assert_that!(
        harness.cluster.set_slots_calls.load(Ordering::Acquire),
        eq(0_usize)
    );
    assert_that!(harness.locks.is_idle(), eq(true));
}

#[rstest]
fn double_overwrite_makes_audit_mismatch_without_data_loss() {
    let harness = Harness::new();
    let slot = harness.seed_tagged_keys("zeta", 1);
    let slots = SlotBitmap::from_slots(&[slot]);
    harness.cluster.inner.assign_slots(SRC_NODE, &slots);

    // The one migrated key is overwritten twice while the snapshot streams.
    let store = Arc::clone(&harness.store);
    let key = tagged_key("zeta", 0);
    let (peer, _probe) = ScriptedPeer::new();
    let peer = peer.with_hook(Box::new(move |read_index| {
        if read_index == 0 {
            let _ = store.put(&key, b"second");
            let _ = store.put(&key, b"third");
        }
    }));
    let mut sender = harness.sender(slots, Box::new(peer));
    sender.send_chunk().expect("migration should succeed");
    sender
        .delete_chunks()
        .expect("reclamation should succeed after the flip");

    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::MetachangeDone)
    );
    let counters = sender.counters();
    assert_that!(counters.snapshot_key_num, eq(1_u64));
    assert_that!(counters.binlog_num, eq(2_u64));
    assert_that!(counters.del_num, eq(1_u64));
    assert_that!(
        counters.del_num < counters.snapshot_key_num + counters.binlog_num,
        eq(true)
    );
    assert_that!(sender.consistency(), eq(false));
    assert_that!(harness.store.key_count(), eq(0_usize));
    assert_that!(&harness.owner_of(slot), eq(&Some(DST_NODE.to_owned())));
}

#[rstest]
fn empty_slot_bitmap_still_completes_the_handshake() {
    let harness = Harness::new();
    let slots = SlotBitmap::new();

    let (peer, probe) = ScriptedPeer::new();
    let mut sender = harness.sender(slots, Box::new(peer));
    sender
        .send_chunk()
        .expect("empty migration should succeed");

    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::MetachangeDone)
    );
    let counters = sender.counters();
    assert_that!(counters.snapshot_key_num, eq(0_u64));
    assert_that!(counters.binlog_num, eq(0_u64));
    let written = probe.written();
    // The stream degenerates to the end-of-snapshot marker plus migrateend.
    assert_that!(written.first(), eq(Some(&b'3')));
    assert_that!(probe.written_contains(b"migrateend"), eq(true));
    assert_that!(harness.locks.is_idle(), eq(true));
}

#[rstest]
fn final_drain_failure_unlocks_and_fails_as_network() {
    let harness = Harness::new();
    let slot = harness.seed_tagged_keys("eta", 5);
    let slots = SlotBitmap::from_slots(&[slot]);
    harness.cluster.inner.assign_slots(SRC_NODE, &slots);

    // Writes land during the snapshot and again while the convergence pass
    // acks, so a tail remains to drain under the slot lock; that drain's ack
    // is a nack.
    let (peer, probe) = ScriptedPeer::new();
    let peer = peer
        .with_hook(slot_writer_hook(
            Arc::clone(&harness.store),
            "eta",
            10,
            |read_index| read_index == 0 || read_index == 2,
        ))
        .with_line_replies(vec![Ok("+OK".to_owned()), Ok("-ERR busy".to_owned())]);
    let config = MigrateConfig {
        migrate_distance: 50,
        ..MigrateConfig::default()
    };
    let mut sender = harness.sender_with_config(slots, Box::new(peer), config);

    let migrate_error = sender
        .send_chunk()
        .expect_err("a failed locked drain must abort");
    assert_that!(migrate_error.kind(), eq(ErrorKind::Network));
    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::Failed(ErrorKind::Network))
    );
    assert_that!(harness.locks.is_idle(), eq(true));
    assert_that!(probe.written_contains(b"migrateend"), eq(false));
    assert_that!(&harness.owner_of(slot), eq(&Some(SRC_NODE.to_owned())));
}

#[rstest]
fn snapshot_nack_aborts_as_internal() {
    let harness = Harness::new();
    let slot = harness.seed_tagged_keys("iota", 2);
    let slots = SlotBitmap::from_slots(&[slot]);
    harness.cluster.inner.assign_slots(SRC_NODE, &slots);

    let (peer, _probe) = ScriptedPeer::new();
    let peer = peer.with_exact_replies(vec![b"-NO".to_vec()]);
    let mut sender = harness.sender(slots, Box::new(peer));

    let migrate_error = sender
        .send_chunk()
        .expect_err("a nacked snapshot marker must abort");
    assert_that!(migrate_error.kind(), eq(ErrorKind::Internal));
    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::Failed(ErrorKind::Internal))
    );
    assert_that!(harness.locks.is_idle(), eq(true));

    // The shard lock is released once the failed sender is discarded.
    let shard_lock = harness
        .segments
        .lock_state(SRC_STORE)
        .expect("source shard should be registered");
    drop(sender);
    assert_that!(shard_lock.intent_shared_holders(), eq(0_usize));
}

#[rstest]
fn send_chunk_without_destination_is_invalid_state() {
    let harness = Harness::new();
    let context = SenderContext {
        segments: harness.segments.clone(),
        cluster: harness.cluster.clone(),
        migrations: harness.locks.clone(),
    };
    let mut sender = ChunkMigrateSender::new(
        SlotBitmap::from_slots(&[1]),
        SRC_STORE,
        context,
        MigrateConfig::default(),
    );

    let migrate_error = sender
        .send_chunk()
        .expect_err("sending without a destination must fail");
    assert_that!(migrate_error.kind(), eq(ErrorKind::State));
    assert_that!(
        sender.sender_status(),
        eq(MigrateSenderStatus::Failed(ErrorKind::State))
    );
}

#[rstest]
fn delete_chunks_before_send_chunk_is_invalid_state() {
    let harness = Harness::new();
    let (peer, _probe) = ScriptedPeer::new();
    let mut sender = harness.sender(SlotBitmap::from_slots(&[1]), Box::new(peer));

    let reclaim_error = sender
        .delete_chunks()
        .expect_err("reclaiming before the migration must fail");
    assert_that!(reclaim_error.kind(), eq(ErrorKind::State));
}

#[rstest]
fn unknown_destination_node_is_rejected_at_attach() {
    let harness = Harness::new();
    let context = SenderContext {
        segments: harness.segments.clone(),
        cluster: harness.cluster.clone(),
        migrations: harness.locks.clone(),
    };
    let mut sender = ChunkMigrateSender::new(
        SlotBitmap::from_slots(&[1]),
        SRC_STORE,
        context,
        MigrateConfig::default(),
    );

    let (peer, _probe) = ScriptedPeer::new();
    let attach_error = sender
        .set_destination(DestinationDescriptor {
            node_id: "node-ghost".to_owned(),
            store_id: DST_STORE,
            addr: "127.0.0.1:9999".to_owned(),
            conn: Box::new(peer),
        })
        .expect_err("an unknown node must be rejected");
    assert_that!(attach_error.kind(), eq(ErrorKind::Cluster));
}

#[rstest]
fn status_order_is_linear_with_failed_as_sink() {
    let order = [
        MigrateSenderStatus::SnapshotBegin,
        MigrateSenderStatus::SnapshotDone,
        MigrateSenderStatus::BinlogDone,
        MigrateSenderStatus::MetachangeDone,
    ];
    for pair in order.windows(2) {
        assert_that!(pair[0].rank() < pair[1].rank(), eq(true));
        assert_that!(pair[0].is_terminal(), eq(pair[0] == MigrateSenderStatus::MetachangeDone));
    }
    let failed = MigrateSenderStatus::Failed(ErrorKind::Network);
    assert_that!(failed.is_terminal(), eq(true));
    assert_that!(
        failed.rank() > MigrateSenderStatus::MetachangeDone.rank(),
        eq(true)
    );
}
