//! Replication plumbing: wire codec, peer connection, and binlog relay.

pub mod codec;
pub mod relay;
pub mod wire;

pub use relay::send_slots_binlog;
