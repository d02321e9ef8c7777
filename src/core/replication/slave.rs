// src/core/replication/slave.rs

//! The replication slave: polls its local master for fragment assignments,
//! spawns a worker per fragment, and on the receiving side applies batches
//! shipped from remote clusters.

use super::client::ReplicationMasterClient;
use super::fragment_worker::{FragmentOutcome, FragmentWorker};
use crate::config::Config;
use crate::core::TesseraError;
use crate::core::cell::decode_cell;
use crate::core::comm::{CommRegistry, RpcService};
use crate::core::commitlog::CommitLogWriter;
use crate::core::dfs::Dfs;
use crate::core::hyperspace::{Hyperspace, SessionId, try_lock_exclusive};
use crate::core::protocol::{RpcRequest, RpcResponse};
use crate::core::queue::{ApplicationQueue, WorkItem};
use crate::core::types::Location;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

struct SlaveState {
    clusters: HashMap<String, Vec<SocketAddr>>,
    table_routes: HashMap<String, Vec<String>>,
    table_names: HashMap<String, String>,
    /// Fragments currently assigned to this slave and in flight.
    fragments: HashSet<String>,
}

pub struct ReplicationSlave {
    config: Config,
    location: Location,
    dfs: Arc<dyn Dfs>,
    hyperspace: Arc<dyn Hyperspace>,
    session: SessionId,
    registry: Arc<CommRegistry>,
    queue: Arc<ApplicationQueue>,
    master: ReplicationMasterClient,
    state: Mutex<SlaveState>,
    /// Writers for batches received from remote clusters, one per table.
    sink_logs: tokio::sync::Mutex<HashMap<String, Arc<CommitLogWriter>>>,
    revision: AtomicI64,
}

impl ReplicationSlave {
    pub async fn new(
        config: Config,
        dfs: Arc<dyn Dfs>,
        hyperspace: Arc<dyn Hyperspace>,
        registry: Arc<CommRegistry>,
        queue: Arc<ApplicationQueue>,
    ) -> Result<Arc<Self>, TesseraError> {
        let location =
            Location::from_host_port(&config.host, config.replication.slave_port);
        let master_addr: SocketAddr = format!("{}:{}", config.host, config.replication.master_port)
            .parse()
            .map_err(|e| TesseraError::Config(format!("bad master address: {e}")))?;
        let master = ReplicationMasterClient::new(
            vec![master_addr],
            registry.clone(),
            config.replication.request_timeout,
        );
        let session = hyperspace.create_session();
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;
        Ok(Arc::new(Self {
            config,
            location,
            dfs,
            hyperspace,
            session,
            registry,
            queue,
            master,
            state: Mutex::new(SlaveState {
                clusters: HashMap::new(),
                table_routes: HashMap::new(),
                table_names: HashMap::new(),
                fragments: HashSet::new(),
            }),
            sink_logs: tokio::sync::Mutex::new(HashMap::new()),
            revision: AtomicI64::new(now_nanos),
        }))
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Claims this slave's identity in Hyperspace; the master watches the
    /// lock to detect slave death.
    pub async fn lock_slave_id(&self) -> Result<(), TesseraError> {
        let dir = format!("{}/replication", self.config.toplevel_dir);
        self.hyperspace.mkdir(&dir).await?;
        let path = format!("{dir}/{}", self.location);
        loop {
            match try_lock_exclusive(&self.hyperspace, self.session, &path).await {
                Ok(_) => {
                    info!("This slave's location is {}", self.location);
                    return Ok(());
                }
                Err(TesseraError::LockConflict(_)) => {
                    info!("Waiting for exclusive lock on {}", path);
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll loop: ask the master for work on every tick.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.replication.scan_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Replication slave {} shutting down", self.location);
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.update_state().await {
                        warn!("assign_fragments failed, will retry later: {}", e);
                    }
                }
            }
        }
    }

    /// One round of `assign_fragments`: refresh the routing tables and spawn
    /// a worker for every newly assigned fragment.
    pub async fn update_state(self: &Arc<Self>) -> Result<(), TesseraError> {
        let mut last_err = None;
        for _ in 0..3 {
            match self
                .master
                .assign_fragments(&self.location, &self.config.host, self.config.replication.slave_port)
                .await
            {
                Ok((fragments, clusters, table_routes, table_names)) => {
                    let new_fragments = {
                        let mut state = self.state.lock();
                        state.clusters = clusters
                            .into_iter()
                            .map(|(cluster, addrs)| {
                                (
                                    cluster,
                                    addrs.iter().filter_map(|a| a.parse().ok()).collect(),
                                )
                            })
                            .collect();
                        state.table_routes = table_routes.into_iter().collect();
                        state.table_names = table_names.into_iter().collect();

                        let mut fresh = Vec::new();
                        for fragment in fragments {
                            if state.fragments.contains(&fragment) {
                                debug!("Fragment {} already scheduled, skipping", fragment);
                                continue;
                            }
                            state.fragments.insert(fragment.clone());
                            fresh.push(fragment);
                        }
                        fresh
                    };
                    for fragment in new_fragments {
                        info!("Fragment {} newly assigned", fragment);
                        self.spawn_worker(fragment);
                    }
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("three failed attempts"))
    }

    /// One worker per fragment, serialized per fragment path through the
    /// application queue.
    fn spawn_worker(self: &Arc<Self>, fragment: String) {
        let slave = self.clone();
        let group_id = {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            fragment.hash(&mut hasher);
            hasher.finish()
        };
        self.queue.add(WorkItem::grouped(
            group_id,
            Box::pin(async move {
                let (table_routes, table_names, clusters) = {
                    let state = slave.state.lock();
                    (
                        state.table_routes.clone(),
                        state.table_names.clone(),
                        state.clusters.clone(),
                    )
                };
                let worker = FragmentWorker::new(
                    slave.dfs.clone(),
                    slave.registry.clone(),
                    slave.config.cluster.id,
                    table_routes,
                    table_names,
                    clusters,
                    slave.config.replication.update_retry_limit,
                    slave.config.replication.request_timeout,
                );
                let (original, intermediate, linked_logs) = worker.run(fragment.clone()).await;

                // Linked fragments are reported as they complete; the
                // original fragment is reported last, with the accumulated
                // linked-log list, so the master can re-assign the whole
                // chain if anything failed.
                for outcome in intermediate {
                    slave.report_finished(outcome, Vec::new()).await;
                }
                slave.report_finished(original, linked_logs).await;
                slave.state.lock().fragments.remove(&fragment);
            }),
        ));
    }

    async fn report_finished(&self, outcome: FragmentOutcome, linked_logs: Vec<String>) {
        for retry in 0..10u32 {
            match self
                .master
                .finished_fragment(
                    &outcome.fragment,
                    outcome.error.clone(),
                    outcome.offset,
                    linked_logs.clone(),
                )
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    error!("finished_fragment({}) failed: {}", outcome.fragment, e);
                    tokio::time::sleep(std::time::Duration::from_secs(1 + 2 * retry as u64)).await;
                }
            }
        }
        error!(
            "Giving up reporting fragment {}; the master will reassign it",
            outcome.fragment
        );
    }

    /// Receiving side of the data path: a batch shipped from a remote
    /// cluster is appended to the local replication sink log for its table.
    /// Blocks are stamped with origin-cluster id 0, which the local
    /// replication pipeline never ships again.
    pub async fn apply_update(&self, table_name: &str, payload: Vec<u8>) -> Result<(), TesseraError> {
        // Validate the batch before touching disk.
        let mut cursor = Bytes::from(payload.clone());
        let mut count = 0usize;
        while let Some((_key, _value)) = decode_cell(&mut cursor)? {
            count += 1;
        }
        debug!(
            "Applying replicated batch of {} cells for table '{}'",
            count, table_name
        );

        let log = {
            let mut sinks = self.sink_logs.lock().await;
            match sinks.get(table_name) {
                Some(log) => log.clone(),
                None => {
                    let dir = format!(
                        "{}/replicated/{}",
                        self.config.toplevel_dir, table_name
                    );
                    let log = Arc::new(
                        CommitLogWriter::open(
                            self.dfs.clone(),
                            dir,
                            self.config.cluster.id,
                            self.config.commitlog.compress,
                        )
                        .await?,
                    );
                    sinks.insert(table_name.to_string(), log.clone());
                    log
                }
            }
        };
        let revision = self.revision.fetch_add(1, Ordering::Relaxed);
        log.write_with_cluster_id(&payload, revision, 0).await?;
        log.sync().await
    }

    pub fn status(&self) -> String {
        let state = self.state.lock();
        format!(
            "location={} in_flight={} clusters={} tables={}",
            self.location,
            state.fragments.len(),
            state.clusters.len(),
            state.table_routes.len()
        )
    }
}

/// RPC surface of a replication slave.
pub struct ReplicationSlaveService(pub Arc<ReplicationSlave>);

#[async_trait]
impl RpcService for ReplicationSlaveService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, TesseraError> {
        let slave = &self.0;
        match request {
            RpcRequest::SlaveUpdate {
                table_name,
                payload,
            } => {
                slave.apply_update(&table_name, payload).await?;
                Ok(RpcResponse::Ok)
            }
            RpcRequest::Status => Ok(RpcResponse::Status {
                text: slave.status(),
            }),
            RpcRequest::Shutdown => Err(TesseraError::ShuttingDown),
            other => Err(TesseraError::Protocol(format!(
                "command {} not handled by a replication slave",
                other.command_code()
            ))),
        }
    }
}
