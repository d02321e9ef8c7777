// src/core/cell.rs

//! Minimal cell/key serialization understood by the replay and replication
//! pipelines.
//!
//! A commit-log block payload is a table-identifier prefix followed by a
//! sequence of (key, value) pairs. The encoding preserves the original
//! revision and delete flag of every cell, so re-delivery of the same batch
//! produces the same final cell state on the receiving cluster.

use crate::core::TesseraError;
use crate::core::types::TableId;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Flag bit marking a delete tombstone rather than an insert.
const FLAG_DELETE: u8 = 0x01;

/// One decoded cell key. The revision is the cluster-assigned commit
/// timestamp; deduplication at the destination happens on (row, revision).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellKey {
    pub row: String,
    pub revision: i64,
    pub delete: bool,
}

impl CellKey {
    pub fn new(row: impl Into<String>, revision: i64, delete: bool) -> Self {
        Self {
            row: row.into(),
            revision,
            delete,
        }
    }
}

/// Appends the table-identifier prefix of a block payload.
pub fn encode_table_prefix(buf: &mut BytesMut, table: &TableId) {
    buf.put_u16_le(table.id.len() as u16);
    buf.put_slice(table.id.as_bytes());
    buf.put_u32_le(table.generation);
}

/// Decodes the table-identifier prefix of a block payload.
pub fn decode_table_prefix(buf: &mut Bytes) -> Result<TableId, TesseraError> {
    if buf.remaining() < 2 {
        return Err(TesseraError::BadKey("truncated table prefix".into()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len + 4 {
        return Err(TesseraError::BadKey("truncated table id".into()));
    }
    let id = buf.split_to(len);
    let id = std::str::from_utf8(&id)
        .map_err(|_| TesseraError::BadKey("table id is not utf-8".into()))?
        .to_string();
    let generation = buf.get_u32_le();
    Ok(TableId { id, generation })
}

/// Appends one (key, value) pair.
pub fn encode_cell(buf: &mut BytesMut, key: &CellKey, value: &[u8]) {
    buf.put_u16_le(key.row.len() as u16);
    buf.put_slice(key.row.as_bytes());
    buf.put_u8(if key.delete { FLAG_DELETE } else { 0 });
    buf.put_i64_le(key.revision);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

/// Decodes the next (key, value) pair, or `None` at a clean end of payload.
/// Truncation anywhere inside a pair is a `BadKey` error.
pub fn decode_cell(buf: &mut Bytes) -> Result<Option<(CellKey, Bytes)>, TesseraError> {
    if !buf.has_remaining() {
        return Ok(None);
    }
    if buf.remaining() < 2 {
        return Err(TesseraError::BadKey("truncated row length".into()));
    }
    let row_len = buf.get_u16_le() as usize;
    if buf.remaining() < row_len + 1 + 8 + 4 {
        return Err(TesseraError::BadKey("truncated key".into()));
    }
    let row = buf.split_to(row_len);
    let row = std::str::from_utf8(&row)
        .map_err(|_| TesseraError::BadKey("row is not utf-8".into()))?
        .to_string();
    let flags = buf.get_u8();
    let revision = buf.get_i64_le();
    let value_len = buf.get_u32_le() as usize;
    if buf.remaining() < value_len {
        return Err(TesseraError::BadKey("truncated value".into()));
    }
    let value = buf.split_to(value_len);
    Ok(Some((
        CellKey {
            row,
            revision,
            delete: flags & FLAG_DELETE != 0,
        },
        value,
    )))
}
