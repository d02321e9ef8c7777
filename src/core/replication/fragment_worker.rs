// src/core/replication/fragment_worker.rs

//! Processes one assigned fragment: streams its blocks, filters out foreign
//! and unreplicated data, and ships the rest to every destination cluster of
//! each table.
//!
//! LINK blocks push the named directory onto an in-worker queue that is fully
//! processed before the originally assigned fragment is reported finished,
//! so the master never re-assigns a fragment whose transfer logs are still
//! in flight.

use super::client::ReplicationSlaveClient;
use crate::core::TesseraError;
use crate::core::cell::decode_table_prefix;
use crate::core::comm::CommRegistry;
use crate::core::commitlog::block::BlockKind;
use crate::core::commitlog::reader::{BlockStream, list_fragment_ids};
use crate::core::commitlog::{PURGED_SUFFIX, fragment_path};
use crate::core::dfs::Dfs;
use crate::core::protocol::WireError;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long to wait for fresh data when a live fragment ends without an EOF
/// block.
const LIVE_FRAGMENT_POLL: Duration = Duration::from_millis(500);
/// Give up tailing an un-closed fragment after this many idle polls and
/// report what was shipped so far.
const LIVE_FRAGMENT_MAX_IDLE_POLLS: u32 = 20;

/// Outcome of one fully processed fragment queue entry.
pub struct FragmentOutcome {
    pub fragment: String,
    pub error: Option<WireError>,
    pub offset: u64,
}

pub struct FragmentWorker {
    dfs: Arc<dyn Dfs>,
    registry: Arc<CommRegistry>,
    local_cluster_id: u64,
    /// table id -> destination cluster names.
    table_routes: HashMap<String, Vec<String>>,
    /// table id -> fully qualified table name.
    table_names: HashMap<String, String>,
    /// cluster name -> that cluster's slave addresses.
    clusters: HashMap<String, Vec<SocketAddr>>,
    retry_limit: u32,
    timeout: Duration,
    clients: HashMap<String, ReplicationSlaveClient>,
    fragment_queue: VecDeque<String>,
    linked_logs: Vec<String>,
}

impl FragmentWorker {
    pub fn new(
        dfs: Arc<dyn Dfs>,
        registry: Arc<CommRegistry>,
        local_cluster_id: u64,
        table_routes: HashMap<String, Vec<String>>,
        table_names: HashMap<String, String>,
        clusters: HashMap<String, Vec<SocketAddr>>,
        retry_limit: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            dfs,
            registry,
            local_cluster_id,
            table_routes,
            table_names,
            clusters,
            retry_limit,
            timeout,
            clients: HashMap::new(),
            fragment_queue: VecDeque::new(),
            linked_logs: Vec::new(),
        }
    }

    /// Runs the whole queue seeded with `fragment`. Returns the outcome of
    /// the original fragment (reported last), the outcomes of intermediate
    /// linked fragments (reported as they complete), and the accumulated
    /// linked-log directories.
    pub async fn run(
        mut self,
        fragment: String,
    ) -> (FragmentOutcome, Vec<FragmentOutcome>, Vec<String>) {
        self.fragment_queue.push_back(fragment.clone());
        let mut intermediate = Vec::new();
        let mut original_outcome = None;

        while let Some(current) = self.fragment_queue.pop_front() {
            info!("Processing fragment {}", current);
            let (error, offset) = match self.replicate_fragment(&current).await {
                Ok(offset) => (None, offset),
                Err(e) => {
                    error!("{}: {}", current, e);
                    (Some(WireError::from(&e)), 0)
                }
            };
            let outcome = FragmentOutcome {
                fragment: current.clone(),
                error,
                offset,
            };
            if current == fragment {
                original_outcome = Some(outcome);
            } else {
                intermediate.push(outcome);
            }
        }

        (
            original_outcome.expect("seed fragment always processed"),
            intermediate,
            self.linked_logs.clone(),
        )
    }

    /// Streams one fragment to its destinations. Tails live fragments until
    /// an EOF block appears or the data stops growing; a vanished file is
    /// retried under its `.purged` name.
    async fn replicate_fragment(&mut self, fragment: &str) -> Result<u64, TesseraError> {
        let mut offset = 0usize;
        let mut idle_polls = 0u32;
        loop {
            let mut stream = match BlockStream::open_at(&self.dfs, fragment, offset).await {
                Ok(stream) => stream,
                Err(TesseraError::FileNotFound(_)) => {
                    if fragment.ends_with(PURGED_SUFFIX) {
                        return Err(TesseraError::FileNotFound(fragment.to_string()));
                    }
                    // The owner purged it mid-scan; resume under the purged
                    // name from the top (re-delivery is idempotent).
                    info!(
                        "File {} not found; enqueueing purged file {}{}",
                        fragment, fragment, PURGED_SUFFIX
                    );
                    self.fragment_queue
                        .push_back(format!("{fragment}{PURGED_SUFFIX}"));
                    return Ok(offset as u64);
                }
                Err(e) => return Err(e),
            };

            let mut saw_eof = false;
            let mut progressed = false;
            loop {
                let block = match stream.next() {
                    Ok(Some(block)) => block,
                    Ok(None) => break,
                    Err(e) => {
                        // One poison fragment must never halt replication;
                        // the master quarantines it on our report.
                        return Err(e);
                    }
                };
                progressed = true;
                match block.kind {
                    BlockKind::Eof => {
                        debug!("{}: reached EOF", fragment);
                        saw_eof = true;
                        break;
                    }
                    BlockKind::Link => {
                        let log_dir = block.linked_dir()?;
                        info!("Enqueueing linked fragments in {}", log_dir);
                        self.enqueue_linked_log(&log_dir).await?;
                        self.linked_logs.push(log_dir);
                    }
                    BlockKind::Data => {
                        // Only blocks originated by the local cluster are
                        // shipped; everything else would loop.
                        let origin = block.header.cluster_id;
                        if origin == 0 || origin != self.local_cluster_id {
                            debug!("{}: cluster id {} differs, skipping", fragment, origin);
                            continue;
                        }
                        self.process_block(fragment, block.payload).await?;
                    }
                }
                offset = stream.offset();
            }
            offset = stream.offset();

            if saw_eof {
                return Ok(offset as u64);
            }
            // Unfinished trailing data: the fragment may still be written.
            idle_polls = if progressed { 0 } else { idle_polls + 1 };
            if idle_polls >= LIVE_FRAGMENT_MAX_IDLE_POLLS {
                debug!("{}: no growth after {} polls, finishing", fragment, idle_polls);
                return Ok(offset as u64);
            }
            tokio::time::sleep(LIVE_FRAGMENT_POLL).await;
        }
    }

    async fn enqueue_linked_log(&mut self, log_dir: &str) -> Result<(), TesseraError> {
        for id in list_fragment_ids(&self.dfs, log_dir).await? {
            self.fragment_queue.push_back(fragment_path(log_dir, id));
        }
        Ok(())
    }

    /// Routes one decoded payload block: skipped entirely when its table is
    /// not replicated, otherwise shipped to one slave of every destination
    /// cluster listed for the table.
    async fn process_block(
        &mut self,
        fragment: &str,
        payload: bytes::Bytes,
    ) -> Result<(), TesseraError> {
        let mut cursor = payload.clone();
        let table = decode_table_prefix(&mut cursor)?;
        let Some(destinations) = self.table_routes.get(&table.id).cloned() else {
            debug!("{}: table {} is not replicated", fragment, table.id);
            return Ok(());
        };
        let table_name = self
            .table_names
            .get(&table.id)
            .cloned()
            .unwrap_or_else(|| table.id.clone());

        // The batch keeps the original cell encoding (revisions and delete
        // flags included), so re-delivery converges at the destination.
        let batch = cursor.to_vec();
        for cluster in destinations {
            debug!(
                "{}: sending {} bytes of table '{}' to cluster {}",
                fragment,
                batch.len(),
                table_name,
                cluster
            );
            self.send_to_cluster(&cluster, &table_name, batch.clone())
                .await?;
        }
        Ok(())
    }

    /// Sends a batch to one slave of `cluster`, rotating through its slave
    /// list on transient errors, up to the retry limit.
    async fn send_to_cluster(
        &mut self,
        cluster: &str,
        table_name: &str,
        batch: Vec<u8>,
    ) -> Result<(), TesseraError> {
        for attempt in 0..self.retry_limit {
            if !self.clients.contains_key(cluster) {
                let addrs = self.clusters.get(cluster).cloned().unwrap_or_default();
                match ReplicationSlaveClient::new(addrs, self.registry.clone(), self.timeout) {
                    Ok(client) => {
                        self.clients.insert(cluster.to_string(), client);
                    }
                    Err(e) => {
                        // No receivers known; the next assign_fragments round
                        // refreshes the list.
                        return Err(e);
                    }
                }
            }
            let client = self.clients.get(cluster).expect("inserted above");
            match client.update(table_name, batch.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Failed sending {} bytes of table {} to cluster {} (attempt {}): {}",
                        batch.len(),
                        table_name,
                        cluster,
                        attempt + 1,
                        e
                    );
                    client.rotate();
                    tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await;
                }
            }
        }
        Err(TesseraError::ReplicationClusterNotFound(format!(
            "giving up sending to {cluster}, too many errors"
        )))
    }
}
