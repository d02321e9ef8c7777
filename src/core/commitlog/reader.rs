// src/core/commitlog/reader.rs

//! Commit-log readers.
//!
//! [`BlockStream`] scans a single fragment file and yields verified,
//! decompressed blocks. [`CommitLogReader`] walks a whole log directory in
//! fragment order, follows LINK blocks into transfer logs, and accumulates
//! the set of linked directories it encountered.

use super::block::{BlockHeader, BlockKind, COMPRESSION_ZSTD, HeaderDecode, fletcher32};
use super::{fragment_path, is_marker_file, parse_fragment_id};
use crate::core::TesseraError;
use crate::core::dfs::Dfs;
use crate::core::types::FragmentId;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// One verified block out of a fragment.
#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub kind: BlockKind,
    /// Decompressed payload for data blocks, the linked directory path bytes
    /// for link blocks, empty for EOF.
    pub payload: Bytes,
}

impl Block {
    /// Directory named by a LINK block body.
    pub fn linked_dir(&self) -> Result<String, TesseraError> {
        std::str::from_utf8(&self.payload)
            .map(|s| s.trim_end_matches('/').to_string())
            .map_err(|_| TesseraError::CorruptCommitLog("link block body is not utf-8".into()))
    }
}

/// Sequential scanner over one fragment file.
pub struct BlockStream {
    path: String,
    data: Bytes,
    offset: usize,
    eof: bool,
}

impl BlockStream {
    pub async fn open(dfs: &Arc<dyn Dfs>, path: &str) -> Result<Self, TesseraError> {
        Self::open_at(dfs, path, 0).await
    }

    /// Opens the fragment and resumes scanning at `offset`. Used by tailing
    /// readers (the replication slave) that re-open a live fragment to pick
    /// up freshly appended blocks.
    pub async fn open_at(
        dfs: &Arc<dyn Dfs>,
        path: &str,
        offset: usize,
    ) -> Result<Self, TesseraError> {
        let data = dfs.read(path).await?;
        Ok(Self {
            path: path.to_string(),
            data,
            offset,
            eof: false,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Yields the next block, or `None` at a clean end of stream. A
    /// zero-length fragment and an unfinished trailing block are both clean
    /// ends; checksum and framing violations are `CorruptCommitLog`.
    pub fn next(&mut self) -> Result<Option<Block>, TesseraError> {
        if self.eof || self.offset >= self.data.len() {
            return Ok(None);
        }
        let remaining = &self.data[self.offset..];
        let (header, header_len) = match BlockHeader::decode(remaining)? {
            HeaderDecode::Header(header, len) => (header, len),
            HeaderDecode::Truncated => {
                debug!(
                    "{}: truncated trailing header at offset {}, end of scan",
                    self.path, self.offset
                );
                self.eof = true;
                return Ok(None);
            }
        };

        let kind = header.kind().expect("decode validated magic");
        if kind == BlockKind::Eof {
            self.eof = true;
            self.offset += header_len;
            return Ok(Some(Block {
                header,
                kind,
                payload: Bytes::new(),
            }));
        }

        let body_start = self.offset + header_len;
        let body_end = body_start + header.data_zlen as usize;
        if body_end > self.data.len() {
            // Crash mid-append: the header made it out but the payload did
            // not. Not corruption.
            warn!(
                "{}: truncated trailing block at offset {} ({} of {} payload bytes), end of scan",
                self.path,
                self.offset,
                self.data.len() - body_start,
                header.data_zlen
            );
            self.eof = true;
            return Ok(None);
        }

        let raw = self.data.slice(body_start..body_end);
        let payload = if header.compression == COMPRESSION_ZSTD {
            let inflated = zstd::bulk::decompress(&raw, header.data_len as usize).map_err(|e| {
                TesseraError::CorruptCommitLog(format!("{}: inflate failed: {e}", self.path))
            })?;
            Bytes::from(inflated)
        } else {
            raw
        };

        if payload.len() != header.data_len as usize {
            return Err(TesseraError::CorruptCommitLog(format!(
                "{}: payload length {} != header length {}",
                self.path,
                payload.len(),
                header.data_len
            )));
        }
        if fletcher32(&payload) != header.data_checksum {
            return Err(TesseraError::CorruptCommitLog(format!(
                "{}: payload checksum mismatch at offset {}",
                self.path, self.offset
            )));
        }

        self.offset = body_end;
        Ok(Some(Block {
            header,
            kind,
            payload,
        }))
    }
}

/// Lists the fragment ids present in a log directory, in ascending order.
pub async fn list_fragment_ids(
    dfs: &Arc<dyn Dfs>,
    log_dir: &str,
) -> Result<Vec<FragmentId>, TesseraError> {
    let entries = match dfs.readdir(log_dir).await {
        Ok(entries) => entries,
        Err(TesseraError::FileNotFound(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut ids: Vec<FragmentId> = entries
        .iter()
        .filter(|e| !e.is_directory && !is_marker_file(&e.name) && !e.name.ends_with(".purged"))
        .filter_map(|e| parse_fragment_id(&e.name))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Walks a log directory fragment by fragment, yielding data blocks and
/// descending into linked transfer logs.
pub struct CommitLogReader {
    dfs: Arc<dyn Dfs>,
    pending: VecDeque<(String, FragmentId)>,
    pending_dirs: VecDeque<String>,
    stream: Option<BlockStream>,
    linked_logs: Vec<String>,
    last_fragment: Option<(String, FragmentId)>,
    latest_revision: Option<i64>,
}

impl CommitLogReader {
    /// Opens a reader over all fragments of `log_dir`.
    pub async fn open(dfs: Arc<dyn Dfs>, log_dir: &str) -> Result<Self, TesseraError> {
        let ids = list_fragment_ids(&dfs, log_dir).await?;
        Ok(Self::with_fragments(dfs, log_dir, ids))
    }

    /// Opens a reader over an explicit subset of fragments.
    pub fn with_fragments(dfs: Arc<dyn Dfs>, log_dir: &str, ids: Vec<FragmentId>) -> Self {
        Self {
            dfs,
            pending: ids.into_iter().map(|id| (log_dir.to_string(), id)).collect(),
            pending_dirs: VecDeque::new(),
            stream: None,
            linked_logs: Vec::new(),
            last_fragment: None,
            latest_revision: None,
        }
    }

    /// Every LINK block body observed so far, deduplicated in order.
    pub fn linked_logs(&self) -> &[String] {
        &self.linked_logs
    }

    pub fn last_fragment_id(&self) -> Option<FragmentId> {
        self.last_fragment.as_ref().map(|(_, id)| *id)
    }

    pub fn last_fragment_path(&self) -> Option<String> {
        self.last_fragment
            .as_ref()
            .map(|(dir, id)| fragment_path(dir, *id))
    }

    /// Highest revision of any data block yielded so far.
    pub fn latest_revision(&self) -> Option<i64> {
        self.latest_revision
    }

    /// Yields the next data block across all fragments and linked logs.
    pub async fn next(&mut self) -> Result<Option<Block>, TesseraError> {
        loop {
            if self.stream.is_none() && !self.advance_fragment().await? {
                return Ok(None);
            }
            let stream = self.stream.as_mut().expect("advanced above");
            match stream.next()? {
                Some(block) => match block.kind {
                    BlockKind::Data => {
                        self.latest_revision = Some(
                            self.latest_revision
                                .map_or(block.header.revision, |r| r.max(block.header.revision)),
                        );
                        return Ok(Some(block));
                    }
                    BlockKind::Link => {
                        let dir = block.linked_dir()?;
                        if !self.linked_logs.contains(&dir) {
                            debug!("Following linked log {}", dir);
                            self.linked_logs.push(dir.clone());
                            self.pending_dirs.push_back(dir);
                        }
                    }
                    BlockKind::Eof => {
                        self.stream = None;
                    }
                },
                None => {
                    self.stream = None;
                }
            }
        }
    }

    async fn advance_fragment(&mut self) -> Result<bool, TesseraError> {
        loop {
            if let Some((dir, id)) = self.pending.pop_front() {
                let path = fragment_path(&dir, id);
                match BlockStream::open(&self.dfs, &path).await {
                    Ok(stream) => {
                        self.last_fragment = Some((dir, id));
                        self.stream = Some(stream);
                        return Ok(true);
                    }
                    Err(TesseraError::FileNotFound(_)) => {
                        // Purged (or vanished) fragment; skip it.
                        debug!("Fragment {} missing, skipping", path);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            match self.pending_dirs.pop_front() {
                Some(dir) => {
                    let ids = list_fragment_ids(&self.dfs, &dir).await?;
                    self.pending
                        .extend(ids.into_iter().map(|id| (dir.clone(), id)));
                }
                None => return Ok(false),
            }
        }
    }
}
