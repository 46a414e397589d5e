//! Binlog entry model for the shard write-ahead log.

use shoal_common::ids::BinlogId;

/// Binlog operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogOp {
    /// Key upsert; the entry carries the new value.
    Set,
    /// Key deletion; the entry's value is empty.
    Del,
}

/// One append-only write-ahead-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogEntry {
    /// Monotonically increasing log identifier.
    pub id: BinlogId,
    /// Operation kind.
    pub op: BinlogOp,
    /// Encoded record key.
    pub key: Vec<u8>,
    /// Encoded record value, empty for deletions.
    pub value: Vec<u8>,
}

impl BinlogEntry {
    /// Builds an upsert entry.
    #[must_use]
    pub fn set(id: BinlogId, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            id,
            op: BinlogOp::Set,
            key,
            value,
        }
    }

    /// Builds a deletion entry.
    #[must_use]
    pub fn del(id: BinlogId, key: Vec<u8>) -> Self {
        Self {
            id,
            op: BinlogOp::Del,
            key,
            value: Vec::new(),
        }
    }
}
