//! Canonical identifier types used across cluster, storage, and replication.

/// Redis-compatible cluster slot identifier.
pub type SlotId = u16;

/// Number of hash slots in the cluster keyspace.
pub const CLUSTER_SLOTS: usize = 16_384;

/// Highest valid slot identifier.
pub const MAX_SLOT_ID: SlotId = (CLUSTER_SLOTS - 1) as SlotId;

/// Numeric storage-shard identifier inside a single process.
pub type StoreId = u32;

/// Monotonically increasing write-ahead-log entry identifier.
pub type BinlogId = u64;

/// Cluster-wide node identifier (hex runid, as gossip reports it).
pub type NodeId = String;
