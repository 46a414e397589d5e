//! Binary codec for binlog entries crossing the migration wire.
//!
//! All integers are little-endian; length fields are `u32`. The encoding must
//! stay stable for the duration of one migration, both sides are built from
//! the same revision.

use shoal_common::error::{ShoalError, ShoalResult};
use shoal_storage::binlog::{BinlogEntry, BinlogOp};

const OP_SET: u8 = 0;
const OP_DEL: u8 = 1;

/// Encodes one binlog entry into wire bytes.
///
/// # Errors
///
/// Returns `ShoalError::Internal` when a field exceeds the `u32` length limit.
pub fn encode_binlog_entry(entry: &BinlogEntry) -> ShoalResult<Vec<u8>> {
    let mut output = Vec::with_capacity(8 + 1 + 4 + entry.key.len() + 4 + entry.value.len());
    output.extend_from_slice(&entry.id.to_le_bytes());
    output.push(match entry.op {
        BinlogOp::Set => OP_SET,
        BinlogOp::Del => OP_DEL,
    });
    write_len_prefixed_bytes(&mut output, &entry.key)?;
    write_len_prefixed_bytes(&mut output, &entry.value)?;
    Ok(output)
}

/// Decodes one binlog entry from wire bytes.
///
/// # Errors
///
/// Returns `ShoalError::Internal` when the payload is truncated, carries an
/// unknown op, or has trailing bytes.
pub fn decode_binlog_entry(payload: &[u8]) -> ShoalResult<BinlogEntry> {
    let mut cursor = PayloadCursor::new(payload);

    let id = cursor.read_u64()?;
    let op = match cursor.read_u8()? {
        OP_SET => BinlogOp::Set,
        OP_DEL => BinlogOp::Del,
        other => {
            return Err(codec_error(format!("unknown binlog op {other}")));
        }
    };

    let key_len = usize::try_from(cursor.read_u32()?)
        .map_err(|_| codec_error("key length exceeds platform limits"))?;
    let key = cursor.read_vec(key_len)?;

    let value_len = usize::try_from(cursor.read_u32()?)
        .map_err(|_| codec_error("value length exceeds platform limits"))?;
    let value = cursor.read_vec(value_len)?;

    cursor.ensure_fully_consumed()?;
    Ok(BinlogEntry { id, op, key, value })
}

fn write_len_prefixed_bytes(output: &mut Vec<u8>, payload: &[u8]) -> ShoalResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| codec_error("field length exceeds u32::MAX"))?;
    output.extend_from_slice(&len.to_le_bytes());
    output.extend_from_slice(payload);
    Ok(())
}

fn codec_error(message: impl Into<String>) -> ShoalError {
    ShoalError::Internal(format!("binlog payload error: {}", message.into()))
}

/// Stateful byte reader that tracks decoding position for robust error messages.
#[derive(Debug)]
struct PayloadCursor<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> PayloadCursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0 }
    }

    fn read_u8(&mut self) -> ShoalResult<u8> {
        let bytes = self.read_slice(1)?;
        Ok(bytes[0])
    }

    fn read_u32(&mut self) -> ShoalResult<u32> {
        let bytes = self.read_slice(4)?;
        let mut array = [0_u8; 4];
        array.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(array))
    }

    fn read_u64(&mut self) -> ShoalResult<u64> {
        let bytes = self.read_slice(8)?;
        let mut array = [0_u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(array))
    }

    fn read_vec(&mut self, len: usize) -> ShoalResult<Vec<u8>> {
        Ok(self.read_slice(len)?.to_vec())
    }

    fn read_slice(&mut self, len: usize) -> ShoalResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| codec_error("offset overflow while decoding"))?;
        if end > self.payload.len() {
            return Err(codec_error(format!(
                "unexpected end of payload at byte offset {} while reading {len} bytes",
                self.offset
            )));
        }

        let bytes = &self.payload[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn ensure_fully_consumed(&self) -> ShoalResult<()> {
        if self.offset == self.payload.len() {
            return Ok(());
        }
        Err(codec_error(format!(
            "trailing bytes after binlog body: consumed {}, total {}",
            self.offset,
            self.payload.len()
        )))
    }
}
