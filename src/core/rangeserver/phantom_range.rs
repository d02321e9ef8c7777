// src/core/rangeserver/phantom_range.rs

//! A range being staged on a recovery destination.
//!
//! The phantom range accumulates replayed fragment data, then (at prepare
//! time) writes the keys that fall inside its boundaries into a freshly
//! created phantom commit log. Its lifecycle flags are cumulative and only
//! ever set: LOADED -> REPLAYED -> PREPARED -> COMMITTED.

use crate::core::TesseraError;
use crate::core::cell::{decode_cell, encode_cell, encode_table_prefix};
use crate::core::commitlog::{CommitLogReader, CommitLogWriter};
use crate::core::dfs::Dfs;
use crate::core::types::{FragmentId, QualifiedRange, RangeState, range_state};
use bytes::{Bytes, BytesMut};
use crc::{CRC_64_ECMA_182, Crc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const LOG_NAME_HASH: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PhantomFlags: u8 {
        const LOADED    = 0x01;
        const REPLAYED  = 0x02;
        const PREPARED  = 0x04;
        const COMMITTED = 0x08;
    }
}

/// Replayed payloads for one fragment.
#[derive(Debug, Default)]
pub struct FragmentData {
    payloads: Vec<Bytes>,
    complete: bool,
}

pub struct PhantomRange {
    pub spec: QualifiedRange,
    pub source_state: RangeState,
    pub schema_generation: u32,
    fragments: BTreeMap<FragmentId, FragmentData>,
    flags: PhantomFlags,
    pub phantom_logname: Option<String>,
    pub split_logname: Option<String>,
    pub log_is_empty: bool,
    /// Transfer logs this range will contribute to `RemoveOkLogs` at commit.
    pub linked_logs: Vec<String>,
    pub entity_id: u64,
}

impl PhantomRange {
    pub fn new(
        spec: QualifiedRange,
        source_state: RangeState,
        schema_generation: u32,
        fragments: &[FragmentId],
        entity_id: u64,
    ) -> Self {
        Self {
            spec,
            source_state,
            schema_generation,
            fragments: fragments
                .iter()
                .map(|id| (*id, FragmentData::default()))
                .collect(),
            flags: PhantomFlags::LOADED,
            phantom_logname: None,
            split_logname: None,
            log_is_empty: true,
            linked_logs: Vec::new(),
            entity_id,
        }
    }

    pub fn flags(&self) -> PhantomFlags {
        self.flags
    }

    pub fn loaded(&self) -> bool {
        self.flags.contains(PhantomFlags::LOADED)
    }

    pub fn replayed(&self) -> bool {
        self.flags.contains(PhantomFlags::REPLAYED)
    }

    pub fn prepared(&self) -> bool {
        self.flags.contains(PhantomFlags::PREPARED)
    }

    pub fn committed(&self) -> bool {
        self.flags.contains(PhantomFlags::COMMITTED)
    }

    pub fn set_replayed(&mut self) {
        self.flags |= PhantomFlags::REPLAYED;
    }

    pub fn set_prepared(&mut self) {
        self.flags |= PhantomFlags::PREPARED;
    }

    pub fn set_committed(&mut self) {
        self.flags |= PhantomFlags::COMMITTED;
    }

    /// Appends replayed data for `fragment`. Returns false when the fragment
    /// bucket was already complete (the payload is dropped).
    pub fn add_fragment_data(&mut self, fragment: FragmentId, payload: Bytes) -> bool {
        let data = self.fragments.entry(fragment).or_default();
        if data.complete {
            return false;
        }
        data.payloads.push(payload);
        data.complete = true;
        true
    }

    /// Drops buffered data of fragments that never completed, so a fresh
    /// replay attempt starts clean.
    pub fn purge_incomplete_fragments(&mut self) {
        for data in self.fragments.values_mut() {
            if !data.complete {
                data.payloads.clear();
            }
        }
    }

    /// Builds the phantom commit log for this range: replays every buffered
    /// key whose row lies inside the range into the phantom log (stamped with
    /// a fresh revision), routes out-of-range keys to the split log when the
    /// source range died mid-split or mid-relinquish, then scans the phantom
    /// log to determine emptiness.
    pub async fn populate_range_and_log(
        &mut self,
        dfs: &Arc<dyn Dfs>,
        log_dir_base: &str,
        cluster_id: u64,
        compress: bool,
        revision: i64,
    ) -> Result<(), TesseraError> {
        let base_state = self.source_state.base_state();
        let mut split_log: Option<CommitLogWriter> = None;

        if self.source_state.is_split_or_relinquish() {
            // The phantom log continues the original transfer log when one
            // was already installed.
            let logname = match &self.phantom_logname {
                Some(name) => name.clone(),
                None => self.create_log(dfs, log_dir_base).await?,
            };
            self.phantom_logname = Some(logname);
            if matches!(
                base_state,
                range_state::SPLIT_LOG_INSTALLED | range_state::SPLIT_SHRUNK
            ) {
                if let Some(transfer_log) = &self.source_state.transfer_log {
                    split_log = Some(
                        CommitLogWriter::open(dfs.clone(), transfer_log.clone(), cluster_id, compress)
                            .await?,
                    );
                }
            }
        } else {
            let logname = match &self.source_state.transfer_log {
                Some(log) if !log.is_empty() => log.clone(),
                _ => self.create_log(dfs, log_dir_base).await?,
            };
            self.phantom_logname = Some(logname);
        }

        let phantom_logname = self.phantom_logname.clone().expect("set above");
        let phantom_log =
            CommitLogWriter::open(dfs.clone(), phantom_logname.clone(), cluster_id, compress)
                .await?;

        for data in self.fragments.values() {
            // Blocks keep the standard framing (table prefix + cells) so the
            // phantom log reads like any other commit log once linked.
            let mut in_range = BytesMut::new();
            let mut split_off = BytesMut::new();
            encode_table_prefix(&mut in_range, &self.spec.table);
            encode_table_prefix(&mut split_off, &self.spec.table);
            let prefix_len = in_range.len();
            for payload in &data.payloads {
                let mut cursor = payload.clone();
                while let Some((key, value)) = decode_cell(&mut cursor)? {
                    if self.spec.range.contains(&key.row) {
                        encode_cell(&mut in_range, &key, &value);
                    } else if split_log.is_some() {
                        encode_cell(&mut split_off, &key, &value);
                    }
                }
            }
            if in_range.len() > prefix_len {
                phantom_log.write(&in_range, revision).await?;
            }
            if let (Some(log), true) = (&split_log, split_off.len() > prefix_len) {
                log.write(&split_off, revision).await?;
            }
        }

        if let Some(log) = &split_log {
            log.sync().await?;
            log.close().await?;
            self.split_logname = self.source_state.transfer_log.clone();
            info!(
                "Created split log {:?} for range {}",
                self.split_logname, self.spec
            );
        }
        phantom_log.sync().await?;
        phantom_log.close().await?;
        info!("Created phantom log {} for range {}", phantom_logname, self.spec);

        // Scan the log back to decide emptiness (it may contain data from an
        // earlier transfer too).
        let mut reader = CommitLogReader::open(dfs.clone(), &phantom_logname).await?;
        while reader.next().await?.is_some() {}
        self.log_is_empty = reader.latest_revision().is_none();
        Ok(())
    }

    /// Picks a fresh, collision-free log directory for this range.
    async fn create_log(
        &self,
        dfs: &Arc<dyn Dfs>,
        log_dir_base: &str,
    ) -> Result<String, TesseraError> {
        let digest = LOG_NAME_HASH.checksum(self.spec.range.end_row.as_bytes());
        let mut seq = 0u32;
        loop {
            let logname = format!(
                "{}/{}/{:016x}-{}",
                log_dir_base, self.spec.table.id, digest, seq
            );
            if !dfs.exists(&logname).await? {
                dfs.mkdirs(&logname).await?;
                return Ok(logname);
            }
            seq += 1;
        }
    }
}
