// src/core/rangeserver/mod.rs

//! The range server: serves ranges, and on the recovery path acts as both a
//! replay worker (reading a dead server's commit-log fragments) and a
//! destination (staging phantom ranges and flipping them live).

pub mod phantom_map;
pub mod phantom_range;
pub mod replay_buffer;
pub mod table_info;

use crate::config::Config;
use crate::core::TesseraError;
use crate::core::cell::{CellKey, decode_cell, decode_table_prefix, encode_cell, encode_table_prefix};
use crate::core::comm::{CommRegistry, MasterClient, RpcService};
use crate::core::commitlog::{CommitLogReader, CommitLogWriter};
use crate::core::dfs::Dfs;
use crate::core::hyperspace::{HandleId, Hyperspace, OpenFlags, SessionId, try_lock_exclusive};
use crate::core::metalog::{Entity, MetalogWriter, RemoveOkLogsEntity};
use crate::core::protocol::{RpcRequest, RpcResponse, WireError};
use crate::core::queue::{ApplicationQueue, WorkItem};
use crate::core::types::{
    FragmentId, Location, QualifiedRange, RangeState, RangeType, TableId,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
use phantom_map::PhantomRangeMap;
use phantom_range::PhantomRange;
use replay_buffer::ReplayBuffer;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use table_info::{RangeRec, TableInfoMap};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Per-failed-source phantom maps, each behind its own write lock.
type FailoverMap = SyncMutex<HashMap<Location, Arc<Mutex<PhantomRangeMap>>>>;

pub struct RangeServer {
    pub config: Config,
    pub location: Location,
    dfs: Arc<dyn Dfs>,
    hyperspace: Arc<dyn Hyperspace>,
    session: SessionId,
    registry: Arc<CommRegistry>,
    master: MasterClient,
    queue: Arc<ApplicationQueue>,
    live_map: TableInfoMap,
    failover_map: FailoverMap,
    rsml_writer: Arc<MetalogWriter>,
    logs: Mutex<HashMap<RangeType, Arc<CommitLogWriter>>>,
    remove_ok_logs: SyncMutex<RemoveOkLogsEntity>,
    revision: AtomicI64,
    location_handle: SyncMutex<Option<HandleId>>,
}

impl RangeServer {
    /// Builds the server: recovers the rsml, rebuilds the live map, and
    /// registers the `RemoveOkLogs` entity.
    pub async fn new(
        config: Config,
        location: Location,
        dfs: Arc<dyn Dfs>,
        hyperspace: Arc<dyn Hyperspace>,
        registry: Arc<CommRegistry>,
        queue: Arc<ApplicationQueue>,
    ) -> Result<Arc<Self>, TesseraError> {
        let master_addr: SocketAddr = config
            .master_addr
            .parse()
            .map_err(|e| TesseraError::Config(format!("bad master_addr: {e}")))?;
        let master = MasterClient::new(&registry, master_addr, config.replication.request_timeout);

        let rsml_path = format!(
            "{}/servers/{}/log/rsml",
            config.toplevel_dir, location
        );
        let (rsml_writer, entities) = MetalogWriter::open(dfs.clone(), rsml_path).await?;
        let rsml_writer = Arc::new(rsml_writer);

        let live_map = TableInfoMap::new();
        let mut remove_ok = None;
        {
            let mut arena = live_map.write();
            for entity in entities.into_values() {
                match entity {
                    Entity::Range(range_entity) => {
                        // Phantom entities belong to an interrupted recovery;
                        // the coordinator's retry will re-stage them.
                        if !range_entity.state.is_phantom() {
                            arena.add_range(RangeRec::from_entity(range_entity));
                        }
                    }
                    Entity::RemoveOkLogs(e) => remove_ok = Some(e),
                    _ => {}
                }
            }
        }
        let remove_ok_logs = remove_ok.unwrap_or_else(|| RemoveOkLogsEntity {
            id: rsml_writer.next_entity_id(),
            log_dirs: Default::default(),
        });

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
            master,
            queue,
            live_map,
            failover_map: SyncMutex::new(HashMap::new()),
            rsml_writer,
            logs: Mutex::new(HashMap::new()),
            remove_ok_logs: SyncMutex::new(remove_ok_logs),
            revision: AtomicI64::new(now_nanos),
            location_handle: SyncMutex::new(None),
        }))
    }

    pub fn hyperspace_session(&self) -> SessionId {
        self.session
    }

    /// Claims this server's location: the `run/location` file locally and the
    /// exclusive lock on `/servers/<location>` in Hyperspace.
    pub async fn claim_location(&self) -> Result<(), TesseraError> {
        let run_dir = format!("{}/run", self.config.data_dir);
        std::fs::create_dir_all(&run_dir)?;
        let location_file = format!("{run_dir}/location");
        match std::fs::read_to_string(&location_file) {
            Ok(stored) => {
                let stored = stored.trim();
                if stored != self.location.as_str() {
                    return Err(TesseraError::Config(format!(
                        "run/location holds '{stored}' but this server is '{}'; \
                         delete the file only after the old location was recovered",
                        self.location
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::write(&location_file, self.location.as_str())?;
            }
            Err(e) => return Err(e.into()),
        }

        let path = format!("{}/servers/{}", self.config.toplevel_dir, self.location);
        let handle = try_lock_exclusive(&self.hyperspace, self.session, &path).await?;
        *self.location_handle.lock() = Some(handle);
        info!("Claimed location {} ({})", self.location, path);
        Ok(())
    }

    /// Announces this server to the coordinator.
    pub async fn register_with_master(&self) -> Result<(), TesseraError> {
        self.master
            .register_server(&self.location, &self.config.host, self.config.port)
            .await
    }

    pub fn next_revision(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::Relaxed)
    }

    fn log_dir(&self, range_type: RangeType) -> String {
        format!(
            "{}/servers/{}/log/{}",
            self.config.toplevel_dir,
            self.location,
            range_type.log_dir_name()
        )
    }

    /// Lazily opened per-class commit log.
    pub async fn class_log(&self, range_type: RangeType) -> Result<Arc<CommitLogWriter>, TesseraError> {
        let mut logs = self.logs.lock().await;
        if let Some(log) = logs.get(&range_type) {
            return Ok(log.clone());
        }
        let writer = Arc::new(
            CommitLogWriter::open(
                self.dfs.clone(),
                self.log_dir(range_type),
                self.config.cluster.id,
                self.config.commitlog.compress,
            )
            .await?,
        );
        logs.insert(range_type, writer.clone());
        Ok(writer)
    }

    /// The normal assignment path: makes a range live on this server and
    /// persists its entity. (Splits and moves funnel through here too.)
    pub async fn load_range(
        &self,
        table: TableId,
        range: crate::core::types::RangeSpec,
        state: RangeState,
    ) -> Result<(), TesseraError> {
        let spec = QualifiedRange::new(table, range);
        if self.live_map.is_live(&spec) {
            return Err(TesseraError::RangeAlreadyLoaded(spec.to_string()));
        }
        let rec = RangeRec {
            spec,
            state,
            needs_compaction: false,
            load_acknowledged: true,
            entity_id: self.rsml_writer.next_entity_id(),
            original_transfer_log: None,
        };
        self.rsml_writer
            .record_state(&Entity::Range(rec.to_entity()))
            .await?;
        self.live_map.write().add_range(rec);
        Ok(())
    }

    /// The update path: appends a block of cells for `table` to the proper
    /// commit log, stamped with a fresh revision and this cluster's id.
    ///
    /// When the revision allocator has outrun the wall clock by more than the
    /// tolerated skew, the update is aborted rather than silently reordered:
    /// a retried write would violate revision ordering.
    pub async fn update(
        &self,
        table: &TableId,
        cells: &[(CellKey, Bytes)],
    ) -> Result<(), TesseraError> {
        const MAX_CLOCK_SKEW_NANOS: i64 = 3_000_000_000;
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;
        if self.revision.load(Ordering::Relaxed) > now_nanos + MAX_CLOCK_SKEW_NANOS {
            return Err(TesseraError::ClockSkewExceeded);
        }
        let range_type = if table.is_metadata() {
            RangeType::Metadata
        } else if table.is_system() {
            RangeType::System
        } else {
            RangeType::User
        };
        let mut payload = BytesMut::new();
        encode_table_prefix(&mut payload, table);
        for (key, value) in cells {
            encode_cell(&mut payload, key, value);
        }
        let log = self.class_log(range_type).await?;
        log.write(&payload, self.next_revision()).await?;
        log.sync().await
    }

    pub fn is_live(&self, spec: &QualifiedRange) -> bool {
        self.live_map.is_live(spec)
    }

    pub fn live_map(&self) -> &TableInfoMap {
        &self.live_map
    }

    fn group_id_for(source: &Location) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        source.hash(&mut hasher);
        hasher.finish()
    }

    // --- Phantom range protocol (destination side) ---

    fn phantom_map_of(&self, source: &Location) -> Option<Arc<Mutex<PhantomRangeMap>>> {
        self.failover_map.lock().get(source).cloned()
    }

    pub async fn handle_phantom_load(
        &self,
        source: Location,
        plan_generation: u32,
        fragments: Vec<FragmentId>,
        ranges: Vec<QualifiedRange>,
        states: Vec<RangeState>,
    ) -> Result<RpcResponse, TesseraError> {
        info!(
            "phantom_load source={}, plan_generation={}, num_fragments={}, num_ranges={}",
            source,
            plan_generation,
            fragments.len(),
            ranges.len()
        );
        if ranges.is_empty() || ranges.len() != states.len() {
            return Err(TesseraError::Protocol(
                "phantom_load ranges/states mismatch".into(),
            ));
        }
        if self.live_map.all_live(&ranges) {
            return Err(TesseraError::RangesAlreadyLive(format!(
                "{} ranges of {}",
                ranges.len(),
                source
            )));
        }

        let map = {
            let mut failover = self.failover_map.lock();
            failover
                .entry(source.clone())
                .or_insert_with(|| Arc::new(Mutex::new(PhantomRangeMap::new(plan_generation))))
                .clone()
        };
        let mut map = map.lock().await;

        if plan_generation < map.plan_generation() {
            return Err(TesseraError::PlanGenerationMismatch {
                supplied: plan_generation,
                installed: map.plan_generation(),
            });
        }
        if plan_generation > map.plan_generation() {
            info!(
                "phantom map for {} superseded: generation {} -> {}",
                source,
                map.plan_generation(),
                plan_generation
            );
            map.reset(plan_generation);
        } else if map.loaded() {
            return Ok(RpcResponse::Ok);
        }

        for (mut range, state) in ranges.into_iter().zip(states) {
            if self.live_map.is_live(&range) {
                continue;
            }
            // The server's schema generation wins over a stale caller.
            if let Some(generation) = self.live_map.read().schema_generation(&range.table.id) {
                if generation > range.table.generation {
                    warn!(
                        "Table generation mismatch in phantom load ({} < {}), upgrading",
                        range.table.generation, generation
                    );
                    range.table.generation = generation;
                }
            }
            let schema_generation = range.table.generation;
            let entity_id = self.rsml_writer.next_entity_id();
            map.insert(PhantomRange::new(
                range,
                state,
                schema_generation,
                &fragments,
                entity_id,
            ));
        }
        map.set_loaded();
        Ok(RpcResponse::Ok)
    }

    pub async fn handle_phantom_update(
        &self,
        source: Location,
        plan_generation: u32,
        range: QualifiedRange,
        fragment: FragmentId,
        payload: Vec<u8>,
    ) -> Result<RpcResponse, TesseraError> {
        let map = self
            .phantom_map_of(&source)
            .ok_or_else(|| TesseraError::PhantomRangeMapNotFound(source.clone()))?;
        let mut map = map.lock().await;

        if plan_generation != map.plan_generation() {
            return Err(TesseraError::PlanGenerationMismatch {
                supplied: plan_generation,
                installed: map.plan_generation(),
            });
        }
        if map.replayed() {
            return Ok(RpcResponse::Ok);
        }
        if let Some(phantom) = map.get_mut(&range) {
            if !phantom.replayed() && !phantom.add_fragment_data(fragment, Bytes::from(payload)) {
                return Err(TesseraError::FragmentAlreadyProcessed(format!(
                    "fragment {fragment} completely received for range {range}"
                )));
            }
        }
        Ok(RpcResponse::Ok)
    }

    /// Queued behind the source's group so phases for one recovery never
    /// interleave.
    fn spawn_phantom_prepare(
        self: &Arc<Self>,
        op_id: u64,
        source: Location,
        plan_generation: u32,
        ranges: Vec<QualifiedRange>,
    ) {
        let server = self.clone();
        self.queue.add(WorkItem::grouped(
            Self::group_id_for(&source),
            Box::pin(async move {
                let error = match server
                    .phantom_prepare_ranges(&source, ranges)
                    .await
                {
                    Ok(()) => None,
                    Err(e) => {
                        error!("phantom_prepare_ranges failed: {}", e);
                        Some(WireError::from(&e))
                    }
                };
                if let Err(e) = server
                    .master
                    .phantom_prepare_complete(op_id, &server.location, plan_generation, error)
                    .await
                {
                    error!("phantom_prepare_complete failed: {}", e);
                }
            }),
        ));
    }

    pub async fn phantom_prepare_ranges(
        &self,
        source: &Location,
        ranges: Vec<QualifiedRange>,
    ) -> Result<(), TesseraError> {
        let map = self
            .phantom_map_of(source)
            .ok_or_else(|| TesseraError::PhantomRangeMapNotFound(source.clone()))?;
        let mut map = map.lock().await;

        if map.prepared() {
            return Ok(());
        }
        if !map.loaded() {
            return Err(TesseraError::Internal(format!(
                "phantom map for {source} not loaded"
            )));
        }
        // The coordinator only issues prepare after the replay phase
        // completed, so the map's replay flag is settled here.
        map.set_replayed();

        let log_dir_base = format!(
            "{}/servers/{}/log/phantom",
            self.config.toplevel_dir, self.location
        );
        let mut entities = Vec::new();
        for spec in &ranges {
            let revision = self.next_revision();
            let Some(phantom) = map.get_mut(spec) else {
                continue;
            };
            if phantom.prepared() {
                continue;
            }
            phantom
                .populate_range_and_log(
                    &self.dfs,
                    &log_dir_base,
                    self.config.cluster.id,
                    self.config.commitlog.compress,
                    revision,
                )
                .await?;

            // Non-empty phantom logs are linked into the class commit log so
            // the staged data survives this server's own crash.
            if !phantom.log_is_empty {
                let logname = phantom.phantom_logname.clone().expect("populated above");
                let log = self.class_log(spec.range_type()).await?;
                log.link_log(&logname, revision).await?;
                phantom.linked_logs.push(logname);
            }

            let mut state = phantom.source_state.clone();
            state.set_phantom();
            state.transfer_log = phantom.phantom_logname.clone();
            let rec = RangeRec {
                spec: spec.clone(),
                state,
                needs_compaction: false,
                load_acknowledged: false,
                entity_id: phantom.entity_id,
                original_transfer_log: phantom.split_logname.clone(),
            };
            entities.push(Entity::Range(rec.to_entity()));
            phantom.set_prepared();
        }

        // Every step persists its outcome before the reply, so a crashed
        // receiver re-executes from its last durable flag.
        self.rsml_writer.record_states(&entities).await?;
        map.set_prepared();
        Ok(())
    }

    fn spawn_phantom_commit(
        self: &Arc<Self>,
        op_id: u64,
        source: Location,
        plan_generation: u32,
        ranges: Vec<QualifiedRange>,
    ) {
        let server = self.clone();
        self.queue.add(WorkItem::grouped(
            Self::group_id_for(&source),
            Box::pin(async move {
                let error = match server.phantom_commit_ranges(&source, ranges).await {
                    Ok(()) => None,
                    Err(e) => {
                        error!("phantom_commit_ranges failed: {}", e);
                        Some(WireError::from(&e))
                    }
                };
                if let Err(e) = server
                    .master
                    .phantom_commit_complete(op_id, &server.location, plan_generation, error)
                    .await
                {
                    error!("phantom_commit_complete failed: {}", e);
                }
            }),
        ));
    }

    pub async fn phantom_commit_ranges(
        self: &Arc<Self>,
        source: &Location,
        ranges: Vec<QualifiedRange>,
    ) -> Result<(), TesseraError> {
        // All ranges already live: an earlier commit finished the job.
        if self.live_map.all_live(&ranges) {
            self.failover_map.lock().remove(source);
            return Ok(());
        }

        let map_arc = self
            .phantom_map_of(source)
            .ok_or_else(|| TesseraError::PhantomRangeMapNotFound(source.clone()))?;
        let mut map = map_arc.lock().await;

        if map.committed() {
            return Ok(());
        }
        if !map.prepared() {
            return Err(TesseraError::Internal(format!(
                "phantom map for {source} committed before prepare"
            )));
        }

        let mut entities = Vec::new();
        let mut commit_recs = Vec::new();
        let mut linked_logs = Vec::new();
        for spec in &ranges {
            let Some(phantom) = map.get_mut(spec) else {
                continue;
            };
            if phantom.committed() {
                continue;
            }

            let mut state = phantom.source_state.clone();
            state.clear_phantom();
            state.transfer_log = phantom.phantom_logname.clone();
            let rec = RangeRec {
                spec: spec.clone(),
                state,
                needs_compaction: true,
                load_acknowledged: false,
                entity_id: phantom.entity_id,
                original_transfer_log: phantom.split_logname.clone(),
            };
            linked_logs.extend(phantom.linked_logs.iter().cloned());

            // Take ownership: Location column of the METADATA row, or the
            // Hyperspace root attribute for the root range.
            info!("Taking ownership of range {}", spec);
            if spec.is_root() {
                self.write_root_location().await?;
            } else {
                self.write_metadata_location(spec).await?;
            }

            entities.push(Entity::Range(rec.to_entity()));
            commit_recs.push(rec);
            phantom.set_committed();
        }

        // One critical section: extend RemoveOkLogs, persist all entities
        // durably, then merge the phantom ranges into the live map.
        let remove_ok_entity = {
            let mut remove_ok = self.remove_ok_logs.lock();
            remove_ok.log_dirs.extend(linked_logs);
            remove_ok.clone()
        };
        entities.push(Entity::RemoveOkLogs(remove_ok_entity));
        self.rsml_writer.record_states(&entities).await?;
        {
            let mut arena = self.live_map.write();
            for rec in commit_recs {
                arena.add_range(rec);
            }
        }

        map.set_committed();
        drop(map);
        self.failover_map.lock().remove(source);
        Ok(())
    }

    /// Garbage-collects transfer logs recorded in `RemoveOkLogs`: each one
    /// gets a durable removal task, a `purged-directory` marker (so the
    /// replication master's scan can reclaim it), and is dropped from the
    /// entity.
    pub async fn maintenance_tick(&self) -> Result<(), TesseraError> {
        let dirs: Vec<String> = {
            let remove_ok = self.remove_ok_logs.lock();
            remove_ok.log_dirs.iter().cloned().collect()
        };
        for dir in dirs {
            let task = crate::core::metalog::TaskEntity {
                id: self.rsml_writer.next_entity_id(),
                task: crate::core::metalog::TaskKind::RemoveTransferLog {
                    log_dir: dir.clone(),
                },
            };
            self.rsml_writer
                .record_state(&Entity::Task(task.clone()))
                .await?;

            if self.dfs.exists(&dir).await? {
                let marker = format!(
                    "{}/{}",
                    dir.trim_end_matches('/'),
                    crate::core::commitlog::PURGED_DIRECTORY_MARKER
                );
                self.dfs.append(&marker, Bytes::from_static(b"1")).await?;
                self.dfs.close(&marker).await?;
            }

            let entity = {
                let mut remove_ok = self.remove_ok_logs.lock();
                remove_ok.log_dirs.remove(&dir);
                remove_ok.clone()
            };
            self.rsml_writer
                .record_state(&Entity::RemoveOkLogs(entity))
                .await?;
            self.rsml_writer.record_removal(task.id).await?;
        }
        Ok(())
    }

    /// Releases the location lock and closes the commit logs.
    pub async fn shutdown(&self) -> Result<(), TesseraError> {
        let handle = self.location_handle.lock().take();
        if let Some(handle) = handle {
            self.hyperspace.close(handle).await?;
        }
        let logs: Vec<Arc<CommitLogWriter>> = self.logs.lock().await.values().cloned().collect();
        for log in logs {
            log.close().await?;
        }
        Ok(())
    }

    /// Writes `Location = self` into the METADATA row of the range.
    async fn write_metadata_location(&self, spec: &QualifiedRange) -> Result<(), TesseraError> {
        let row = format!("{}:{}", spec.table.id, spec.range.end_row);
        let key = CellKey::new(row, self.next_revision(), false);
        let metadata = TableId::new(crate::core::types::METADATA_TABLE_ID, 0);
        let mut payload = BytesMut::new();
        encode_table_prefix(&mut payload, &metadata);
        encode_cell(&mut payload, &key, self.location.as_str().as_bytes());
        let log = self.class_log(RangeType::Metadata).await?;
        log.write(&payload, key.revision).await?;
        log.sync().await
    }

    /// Root failover: the root range's owner lives in a Hyperspace attribute.
    async fn write_root_location(&self) -> Result<(), TesseraError> {
        let path = format!("{}/root", self.config.toplevel_dir);
        let handle = self
            .hyperspace
            .open(
                self.session,
                &path,
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .await?;
        self.hyperspace
            .attr_set(handle, "Location", self.location.as_str().as_bytes())
            .await?;
        self.hyperspace.close(handle).await
    }

    pub async fn handle_acknowledge_load(
        &self,
        ranges: Vec<QualifiedRange>,
    ) -> Result<RpcResponse, TesseraError> {
        let mut results = Vec::with_capacity(ranges.len());
        let mut arena = self.live_map.write();
        for spec in ranges {
            match arena.range_id_of(&spec) {
                Some(id) => {
                    if let Some(rec) = arena.range_mut(id) {
                        rec.load_acknowledged = true;
                    }
                    results.push((spec, None));
                }
                None => {
                    let err = WireError::RangeNotFound(spec.to_string());
                    results.push((spec, Some(err)));
                }
            }
        }
        Ok(RpcResponse::AcknowledgeLoad { results })
    }

    // --- Replay worker side ---

    #[allow(clippy::too_many_arguments)]
    fn spawn_replay_fragments(
        self: &Arc<Self>,
        op_id: u64,
        attempt: u32,
        source: Location,
        range_type: RangeType,
        plan_generation: u32,
        fragments: Vec<FragmentId>,
        receiver_plan: crate::core::balance::ReceiverPlan,
        receiver_addrs: Vec<(Location, String)>,
        replay_timeout: Duration,
    ) {
        let server = self.clone();
        self.queue.add(WorkItem::grouped(
            op_id,
            Box::pin(async move {
                let result = server
                    .replay_fragments(
                        op_id,
                        attempt,
                        &source,
                        range_type,
                        plan_generation,
                        fragments,
                        receiver_plan,
                        receiver_addrs,
                        replay_timeout,
                    )
                    .await;
                let (errors, success) = match result {
                    Ok(()) => (Vec::new(), true),
                    Err(e) => {
                        error!("replay_fragments failed: {}", e);
                        (Vec::new(), false)
                    }
                };
                if let Err(e) = server
                    .master
                    .replay_complete(op_id, attempt, &server.location, plan_generation, errors, success)
                    .await
                {
                    error!("replay_complete failed: {}", e);
                }
            }),
        ));
    }

    /// Reads the failed server's fragments and streams key/value batches to
    /// the eventual receiver of each range, heartbeating the coordinator.
    #[allow(clippy::too_many_arguments)]
    async fn replay_fragments(
        &self,
        op_id: u64,
        attempt: u32,
        source: &Location,
        range_type: RangeType,
        plan_generation: u32,
        fragments: Vec<FragmentId>,
        receiver_plan: crate::core::balance::ReceiverPlan,
        receiver_addrs: Vec<(Location, String)>,
        replay_timeout: Duration,
    ) -> Result<(), TesseraError> {
        info!(
            "replay_fragments op_id={} attempt={} source={} type={} num_fragments={}",
            op_id,
            attempt,
            source,
            range_type,
            fragments.len()
        );
        let log_dir = format!(
            "{}/servers/{}/log/{}",
            self.config.toplevel_dir,
            source,
            range_type.log_dir_name()
        );
        let addrs: HashMap<Location, SocketAddr> = receiver_addrs
            .into_iter()
            .filter_map(|(loc, addr)| addr.parse().ok().map(|a| (loc, a)))
            .collect();
        let mut buffer = ReplayBuffer::new(
            source.clone(),
            plan_generation,
            receiver_plan,
            addrs,
            self.registry.clone(),
            self.config.replication.request_timeout,
        );

        let mut reader = CommitLogReader::with_fragments(self.dfs.clone(), &log_dir, fragments);
        let heartbeat_every = replay_timeout / 2;
        let mut last_heartbeat = tokio::time::Instant::now();
        let mut current_fragment: Option<FragmentId> = None;
        let mut pair_count = 0usize;

        while let Some(block) = reader.next().await? {
            let fragment = reader.last_fragment_id().expect("inside a fragment");
            match current_fragment {
                None => buffer.set_current_fragment(fragment),
                Some(last) if last != fragment => {
                    buffer.flush().await?;
                    buffer.set_current_fragment(fragment);
                }
                _ => {}
            }
            current_fragment = Some(fragment);

            let mut payload = block.payload;
            let table = decode_table_prefix(&mut payload)?;
            while let Some((key, value)) = decode_cell(&mut payload)? {
                buffer.add(&table, &key, &value);
                pair_count += 1;
            }

            if last_heartbeat.elapsed() >= heartbeat_every {
                if let Err(e) = self
                    .master
                    .replay_status(op_id, attempt, &self.location, plan_generation)
                    .await
                {
                    warn!("replay_status failed: {}", e);
                }
                last_heartbeat = tokio::time::Instant::now();
            }
        }
        buffer.flush().await?;
        info!(
            "Finished replaying {} key/value pairs from {}",
            pair_count, log_dir
        );
        Ok(())
    }
}

/// RPC surface of a range server.
pub struct RangeServerService(pub Arc<RangeServer>);

#[async_trait]
impl RpcService for RangeServerService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, TesseraError> {
        let server = &self.0;
        match request {
            RpcRequest::PhantomLoad {
                source,
                plan_generation,
                fragments,
                ranges,
                states,
            } => {
                server
                    .handle_phantom_load(source, plan_generation, fragments, ranges, states)
                    .await
            }
            RpcRequest::PhantomUpdate {
                source,
                plan_generation,
                range,
                fragment,
                payload,
            } => {
                server
                    .handle_phantom_update(source, plan_generation, range, fragment, payload)
                    .await
            }
            RpcRequest::PhantomPrepareRanges {
                op_id,
                source,
                plan_generation,
                ranges,
            } => {
                // Reply immediately; the result arrives asynchronously via
                // phantom_prepare_complete.
                server.spawn_phantom_prepare(op_id, source, plan_generation, ranges);
                Ok(RpcResponse::Ok)
            }
            RpcRequest::PhantomCommitRanges {
                op_id,
                source,
                plan_generation,
                ranges,
            } => {
                server.spawn_phantom_commit(op_id, source, plan_generation, ranges);
                Ok(RpcResponse::Ok)
            }
            RpcRequest::AcknowledgeLoad { ranges } => server.handle_acknowledge_load(ranges).await,
            RpcRequest::ReplayFragments {
                op_id,
                attempt,
                source,
                range_type,
                plan_generation,
                fragments,
                receiver_plan,
                receiver_addrs,
                replay_timeout_ms,
            } => {
                server.spawn_replay_fragments(
                    op_id,
                    attempt,
                    source,
                    range_type,
                    plan_generation,
                    fragments,
                    receiver_plan,
                    receiver_addrs,
                    Duration::from_millis(replay_timeout_ms.max(1000)),
                );
                Ok(RpcResponse::Ok)
            }
            RpcRequest::Status => Ok(RpcResponse::Status {
                text: format!(
                    "location={} live_ranges={}",
                    server.location,
                    server.live_map.read().all_ranges().len()
                ),
            }),
            RpcRequest::Shutdown => Err(TesseraError::ShuttingDown),
            other => Err(TesseraError::Protocol(format!(
                "command {} not handled by a range server",
                other.command_code()
            ))),
        }
    }
}
