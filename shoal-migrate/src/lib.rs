//! Chunk migration sender: the sending side of a live slot-range hand-off.
//!
//! A sender ships a point-in-time snapshot of the migrated slots while the
//! source keeps accepting writes, chases the binlog until the residual lag is
//! small, then flips slot ownership inside a short quiescent window held under
//! the cluster-wide slot lock. Storage, cluster metadata, slot locking, and
//! the peer connection are injected capabilities so the sender stays testable
//! against in-memory fakes.

pub mod sender;

pub use sender::{
    BinlogWatermark, ChunkMigrateSender, DestinationDescriptor, MigrateSenderStatus,
    MigrationCounters, SenderContext,
};
