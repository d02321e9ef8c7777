// src/core/commitlog/writer.rs

//! Commit-log writer: appends self-delimited blocks to the current fragment.
//!
//! The writer is single-owner (the serving range server); readers open their
//! own independent handles on the DFS and observe whatever blocks are durable
//! at the moment of the scan.

use super::block::{
    BlockHeader, COMPRESSION_NONE, COMPRESSION_ZSTD, MAGIC_DATA, MAGIC_EOF, MAGIC_LINK, fletcher32,
};
use super::{MARK_SUFFIX, fragment_path, parse_fragment_id};
use crate::core::TesseraError;
use crate::core::dfs::Dfs;
use crate::core::types::FragmentId;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const ZSTD_LEVEL: i32 = 3;

pub struct CommitLogWriter {
    dfs: Arc<dyn Dfs>,
    log_dir: String,
    cluster_id: u64,
    compress: bool,
    current: Mutex<FragmentId>,
}

impl CommitLogWriter {
    /// Opens (or creates) a commit log directory, resuming after the highest
    /// existing fragment.
    pub async fn open(
        dfs: Arc<dyn Dfs>,
        log_dir: impl Into<String>,
        cluster_id: u64,
        compress: bool,
    ) -> Result<Self, TesseraError> {
        let log_dir = log_dir.into();
        dfs.mkdirs(&log_dir).await?;
        let next = dfs
            .readdir(&log_dir)
            .await?
            .iter()
            .filter(|e| !e.is_directory)
            .filter_map(|e| parse_fragment_id(&e.name))
            .max()
            .map_or(0, |max| max + 1);
        debug!("Commit log {} opens at fragment {}", log_dir, next);
        Ok(Self {
            dfs,
            log_dir,
            cluster_id,
            compress,
            current: Mutex::new(next),
        })
    }

    pub fn log_dir(&self) -> &str {
        &self.log_dir
    }

    pub async fn current_fragment(&self) -> FragmentId {
        *self.current.lock().await
    }

    /// Appends one payload block stamped with `revision` and this writer's
    /// cluster of origin.
    pub async fn write(&self, payload: &[u8], revision: i64) -> Result<(), TesseraError> {
        self.write_block(MAGIC_DATA, payload, revision, self.cluster_id, self.compress)
            .await
    }

    /// Appends a payload block with an explicit origin-cluster id. Used by the
    /// replication sink, which must not stamp foreign data as locally
    /// originated (cluster id 0 is never re-replicated).
    pub async fn write_with_cluster_id(
        &self,
        payload: &[u8],
        revision: i64,
        cluster_id: u64,
    ) -> Result<(), TesseraError> {
        self.write_block(MAGIC_DATA, payload, revision, cluster_id, self.compress)
            .await
    }

    /// Links another log directory into this one: readers of this log must
    /// also scan `dir`.
    pub async fn link_log(&self, dir: &str, revision: i64) -> Result<(), TesseraError> {
        info!("Linking log {} into {}", dir, self.log_dir);
        self.write_block(
            MAGIC_LINK,
            dir.trim_end_matches('/').as_bytes(),
            revision,
            self.cluster_id,
            false,
        )
        .await?;
        self.sync().await
    }

    /// Explicit fsync of the current fragment file.
    pub async fn sync(&self) -> Result<(), TesseraError> {
        let id = *self.current.lock().await;
        self.dfs.sync(&fragment_path(&self.log_dir, id)).await
    }

    /// Writes the end-of-fragment block, closes the file, and drops a
    /// `<id>.mark` marker.
    pub async fn close(&self) -> Result<(), TesseraError> {
        let id = *self.current.lock().await;
        self.write_block(MAGIC_EOF, &[], 0, self.cluster_id, false)
            .await?;
        let path = fragment_path(&self.log_dir, id);
        self.dfs.sync(&path).await?;
        self.dfs.close(&path).await?;
        self.dfs
            .append(&format!("{path}{MARK_SUFFIX}"), Bytes::new())
            .await?;
        Ok(())
    }

    /// Closes the current fragment and starts the next one.
    pub async fn roll(&self) -> Result<FragmentId, TesseraError> {
        self.close().await?;
        let mut current = self.current.lock().await;
        *current += 1;
        Ok(*current)
    }

    async fn write_block(
        &self,
        magic: &[u8; 10],
        payload: &[u8],
        revision: i64,
        cluster_id: u64,
        compress: bool,
    ) -> Result<(), TesseraError> {
        let mut header = BlockHeader::new(magic, revision, cluster_id);
        header.data_checksum = fletcher32(payload);
        header.data_len = payload.len() as u32;

        // Store compressed only when it actually helps.
        let compressed = if compress && !payload.is_empty() {
            match zstd::bulk::compress(payload, ZSTD_LEVEL) {
                Ok(z) if z.len() < payload.len() => Some(z),
                _ => None,
            }
        } else {
            None
        };

        let body: &[u8] = compressed.as_deref().unwrap_or(payload);
        header.compression = if compressed.is_some() {
            COMPRESSION_ZSTD
        } else {
            COMPRESSION_NONE
        };
        header.data_zlen = body.len() as u32;

        let mut buf = BytesMut::with_capacity(header.encoded_length() + body.len());
        header.encode(&mut buf);
        buf.extend_from_slice(body);

        let id = *self.current.lock().await;
        self.dfs
            .append(&fragment_path(&self.log_dir, id), buf.freeze())
            .await?;
        Ok(())
    }
}
