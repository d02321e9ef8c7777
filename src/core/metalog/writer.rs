// src/core/metalog/writer.rs

//! Append-only metalog writer.
//!
//! Records are framed as `[len u32][crc32 u32][bincode bytes]`, little
//! endian. The crc covers the bincode bytes; a torn trailing frame is
//! recognized by the reader and dropped.

use super::reader::MetalogReader;
use super::{Entity, Record};
use crate::core::TesseraError;
use crate::core::dfs::Dfs;
use bincode::config;
use bytes::{BufMut, Bytes, BytesMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

pub(super) const RECORD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub struct MetalogWriter {
    dfs: Arc<dyn Dfs>,
    path: String,
    next_id: AtomicU64,
    // Appends are serialized so interleaved frames cannot tear each other.
    append_lock: Mutex<()>,
}

impl MetalogWriter {
    /// Opens the metalog at `path`, returning the writer plus the recovered
    /// entity states (latest state per entity id, removals applied).
    pub async fn open(
        dfs: Arc<dyn Dfs>,
        path: impl Into<String>,
    ) -> Result<(Self, BTreeMap<u64, Entity>), TesseraError> {
        let path = path.into();
        let entities = MetalogReader::read(&dfs, &path).await?;
        let next_id = entities.keys().max().map_or(1, |max| max + 1);
        Ok((
            Self {
                dfs,
                path,
                next_id: AtomicU64::new(next_id),
                append_lock: Mutex::new(()),
            },
            entities,
        ))
    }

    /// Allocates a fresh entity id.
    pub fn next_entity_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends the full current state of an entity and syncs.
    pub async fn record_state(&self, entity: &Entity) -> Result<(), TesseraError> {
        self.append(&Record::State(entity.clone())).await
    }

    /// Appends several entity states in one durable batch.
    pub async fn record_states(&self, entities: &[Entity]) -> Result<(), TesseraError> {
        let _guard = self.append_lock.lock().await;
        for entity in entities {
            let frame = Self::frame(&Record::State(entity.clone()))?;
            self.dfs.append(&self.path, frame).await?;
        }
        self.dfs.sync(&self.path).await
    }

    /// Appends a removal tombstone for an entity id and syncs.
    pub async fn record_removal(&self, entity_id: u64) -> Result<(), TesseraError> {
        self.append(&Record::Removal(entity_id)).await
    }

    async fn append(&self, record: &Record) -> Result<(), TesseraError> {
        let frame = Self::frame(record)?;
        let _guard = self.append_lock.lock().await;
        self.dfs.append(&self.path, frame).await?;
        self.dfs.sync(&self.path).await
    }

    fn frame(record: &Record) -> Result<Bytes, TesseraError> {
        let body = bincode::encode_to_vec(record, config::standard())?;
        let mut buf = BytesMut::with_capacity(8 + body.len());
        buf.put_u32_le(body.len() as u32);
        buf.put_u32_le(RECORD_CRC.checksum(&body));
        buf.put_slice(&body);
        Ok(buf.freeze())
    }
}
