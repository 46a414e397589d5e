//! Slot-filtered binlog relay to a migration destination.

use std::time::Duration;

use tracing::{debug, error};

use shoal_cluster::slot::{SlotBitmap, key_slot};
use shoal_common::config::MigrateConfig;
use shoal_common::error::{ShoalError, ShoalResult};
use shoal_common::ids::{BinlogId, StoreId};
use shoal_storage::Store;

use crate::codec::encode_binlog_entry;
use crate::wire::{PeerConnection, fmt_bulk, fmt_multi_bulk_len};

/// Command name carrying a batch of binlog payloads.
const BINLOG_CMD: &[u8] = b"migratebinlogs";
/// Keepalive command sent when a heartbeat is requested and the range is empty.
const HEARTBEAT_CMD: &[u8] = b"binlog_heartbeat";

/// Ships binlog entries `(start_exclusive, end_inclusive]` whose keys hash
/// into `slots`, in ascending id order, and waits for the peer's ack.
///
/// Entries outside the bitmap are skipped on this side; the caller's range
/// cursor still advances across them. Returns the number of entries shipped.
/// With `need_heartbeat` set and nothing to ship, a keepalive command is sent
/// instead so an idle link does not go dark.
///
/// # Errors
///
/// Returns `ShoalError::Store` when the range cannot be read,
/// `ShoalError::Network` on connection failures, and `ShoalError::Internal`
/// when the peer acks with anything but `+OK`.
#[allow(clippy::too_many_arguments)]
pub fn send_slots_binlog(
    conn: &mut dyn PeerConnection,
    store: &dyn Store,
    src_store_id: StoreId,
    dst_store_id: StoreId,
    start_exclusive: BinlogId,
    end_inclusive: BinlogId,
    need_heartbeat: bool,
    slots: &SlotBitmap,
    config: &MigrateConfig,
) -> ShoalResult<u64> {
    let txn = store.create_transaction()?;
    let mut payloads = Vec::new();
    let mut cursor = txn.binlog_cursor(start_exclusive, end_inclusive);
    while let Some(entry) = cursor.next() {
        let entry = entry?;
        if !slots.contains(key_slot(&entry.key)) {
            continue;
        }
        payloads.push(encode_binlog_entry(&entry)?);
    }
    drop(cursor);

    let ack_timeout = Duration::from_secs(config.binlog_rsp_timeout_secs);
    if payloads.is_empty() {
        if need_heartbeat {
            let mut frame = Vec::new();
            fmt_multi_bulk_len(&mut frame, 2);
            fmt_bulk(&mut frame, HEARTBEAT_CMD);
            fmt_bulk(&mut frame, src_store_id.to_string().as_bytes());
            conn.write_data(&frame)?;
            await_ok(conn, ack_timeout, src_store_id)?;
        }
        return Ok(0);
    }

    let sent = payloads.len() as u64;
    let mut frame = Vec::new();
    fmt_multi_bulk_len(&mut frame, 2 + payloads.len());
    fmt_bulk(&mut frame, BINLOG_CMD);
    fmt_bulk(&mut frame, dst_store_id.to_string().as_bytes());
    for payload in &payloads {
        fmt_bulk(&mut frame, payload);
    }

    if let Err(send_error) = conn.write_data(&frame) {
        error!(
            store = src_store_id,
            peer = %conn.remote_repr(),
            %send_error,
            "binlog relay write failed"
        );
        return Err(send_error);
    }
    await_ok(conn, ack_timeout, src_store_id)?;

    debug!(
        store = src_store_id,
        start = start_exclusive,
        end = end_inclusive,
        sent,
        "binlog range relayed"
    );
    Ok(sent)
}

fn await_ok(
    conn: &mut dyn PeerConnection,
    timeout: Duration,
    src_store_id: StoreId,
) -> ShoalResult<()> {
    let reply = conn.read_line(timeout)?;
    if reply != "+OK" {
        error!(
            store = src_store_id,
            peer = %conn.remote_repr(),
            %reply,
            "binlog relay ack is not +OK"
        );
        return Err(ShoalError::Internal(format!(
            "binlog relay ack was {reply:?}"
        )));
    }
    Ok(())
}
