// src/core/metalog/reader.rs

//! Metalog reader: replays the record frames and reduces them to the latest
//! state per entity id.

use super::writer::RECORD_CRC;
use super::{Entity, Record};
use crate::core::TesseraError;
use crate::core::dfs::Dfs;
use bincode::config;
use bytes::Buf;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub struct MetalogReader;

impl MetalogReader {
    /// Reads all frames of the metalog at `path`. A missing file yields an
    /// empty state; a torn trailing frame ends the replay cleanly; a crc
    /// mismatch mid-file is a hard `Metalog` error.
    pub async fn read(
        dfs: &Arc<dyn Dfs>,
        path: &str,
    ) -> Result<BTreeMap<u64, Entity>, TesseraError> {
        let mut data = match dfs.read(path).await {
            Ok(data) => data,
            Err(TesseraError::FileNotFound(_)) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };

        let mut entities = BTreeMap::new();
        while data.remaining() >= 8 {
            let len = data.get_u32_le() as usize;
            let crc = data.get_u32_le();
            if data.remaining() < len {
                warn!("{}: torn trailing metalog frame, stopping replay", path);
                break;
            }
            let body = data.split_to(len);
            if RECORD_CRC.checksum(&body) != crc {
                return Err(TesseraError::Metalog(format!(
                    "{path}: record crc mismatch"
                )));
            }
            let (record, _): (Record, usize) =
                bincode::decode_from_slice(&body, config::standard())?;
            match record {
                Record::State(entity) => {
                    entities.insert(entity.id(), entity);
                }
                Record::Removal(id) => {
                    entities.remove(&id);
                }
            }
        }
        if data.has_remaining() {
            warn!(
                "{}: {} trailing bytes after last frame, ignored",
                path,
                data.remaining()
            );
        }
        Ok(entities)
    }
}
