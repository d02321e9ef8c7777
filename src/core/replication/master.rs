// src/core/replication/master.rs

//! The replication master: one active instance per source cluster, fenced by
//! an exclusive Hyperspace lock on `/replication/master`.
//!
//! Its control loop scans the DFS for commit-log fragments that require
//! replication, garbage-collects fragments and directories whose contents
//! were fully shipped, refreshes the receiver lists of every known remote
//! cluster, and hands unassigned fragments to slaves with exclusive
//! ownership. A fragment is in exactly one of {unassigned, assigned,
//! finished} at all times.

use super::TableSchema;
use super::client::ReplicationMasterClient;
use crate::config::Config;
use crate::core::TesseraError;
use crate::core::comm::{CommRegistry, RpcService};
use crate::core::commitlog::{
    DELETED_SUFFIX, MARK_SUFFIX, PURGED_DIRECTORY_MARKER, PURGED_SUFFIX, TMP_SUFFIX,
};
use crate::core::dfs::{Dfs, join};
use crate::core::hyperspace::{Hyperspace, HyperspaceEvent, SessionId, try_lock_exclusive};
use crate::core::metalog::{
    Entity, MetalogWriter, ReplicationMasterEntity, SchemaUpdateEntity, SchemaUpdateKind,
};
use crate::core::notification::{NotificationHook, Severity};
use crate::core::protocol::{RpcRequest, RpcResponse, WireError};
use crate::core::types::Location;
use async_trait::async_trait;
use crc::{CRC_64_ECMA_182, Crc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const ERROR_DIR_HASH: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

struct MasterState {
    entity: ReplicationMasterEntity,
    /// Runtime-only: registered local slaves and their addresses.
    known_slaves: HashMap<Location, SocketAddr>,
    /// Runtime-only: remote cluster name -> that cluster's slave addresses.
    cluster_slaves: HashMap<String, Vec<String>>,
}

pub struct ReplicationMaster {
    config: Config,
    dfs: Arc<dyn Dfs>,
    hyperspace: Arc<dyn Hyperspace>,
    session: SessionId,
    registry: Arc<CommRegistry>,
    notifier: Arc<dyn NotificationHook>,
    mml_writer: Arc<MetalogWriter>,
    entity_id: u64,
    state: Mutex<MasterState>,
    servers_dir: String,
}

impl ReplicationMaster {
    pub async fn new(
        config: Config,
        dfs: Arc<dyn Dfs>,
        hyperspace: Arc<dyn Hyperspace>,
        registry: Arc<CommRegistry>,
        notifier: Arc<dyn NotificationHook>,
    ) -> Result<Arc<Self>, TesseraError> {
        let mml_path = format!("{}/replication/master-metalog", config.toplevel_dir);
        let (mml_writer, entities) = MetalogWriter::open(dfs.clone(), mml_path).await?;
        let mml_writer = Arc::new(mml_writer);

        let mut entity = None;
        for e in entities.into_values() {
            if let Entity::ReplicationMasterState(e) = e {
                entity = Some(e);
            }
        }
        let (entity, entity_id) = match entity {
            Some(e) => {
                let id = e.id;
                (e, id)
            }
            None => {
                let id = mml_writer.next_entity_id();
                (
                    ReplicationMasterEntity {
                        id,
                        ..Default::default()
                    },
                    id,
                )
            }
        };

        let servers_dir = format!("{}/servers", config.toplevel_dir);
        let session = hyperspace.create_session();
        Ok(Arc::new(Self {
            config,
            dfs,
            hyperspace,
            session,
            registry,
            notifier,
            mml_writer,
            entity_id,
            state: Mutex::new(MasterState {
                entity,
                known_slaves: HashMap::new(),
                cluster_slaves: HashMap::new(),
            }),
            servers_dir,
        }))
    }

    /// Blocks until this process holds the cluster-wide master lock.
    pub async fn obtain_master_lock(&self) -> Result<(), TesseraError> {
        let dir = format!("{}/replication", self.config.toplevel_dir);
        self.hyperspace.mkdir(&dir).await?;
        let path = format!("{dir}/master");
        let mut reported = false;
        loop {
            match try_lock_exclusive(&self.hyperspace, self.session, &path).await {
                Ok(handle) => {
                    let value = format!(
                        "{}:{}",
                        self.config.host, self.config.replication.master_port
                    );
                    self.hyperspace
                        .attr_set(handle, "location", value.as_bytes())
                        .await?;
                    info!("Obtained lock on '{}'", path);
                    return Ok(());
                }
                Err(TesseraError::LockConflict(_)) => {
                    if !reported {
                        info!("Lock on '{}' is held elsewhere, entering retry loop", path);
                        reported = true;
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Control loop: scan, GC, refresh receivers.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.replication.scan_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Replication master shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.scan_dfs().await {
                        error!("DFS scan failed: {}", e);
                    }
                    self.update_recipients().await;
                }
            }
        }
    }

    /// Walks every range server's user log plus all known transfer logs,
    /// classifying fragments and garbage-collecting what was fully shipped.
    pub async fn scan_dfs(&self) -> Result<(), TesseraError> {
        let (linked_logs, replicated_tables) = {
            let state = self.state.lock();
            (
                state.entity.linked_logs.clone(),
                state.entity.replicated_tables.clone(),
            )
        };

        let mut found = BTreeSet::new();
        let subdirs = match self.dfs.readdir(&self.servers_dir).await {
            Ok(entries) => entries,
            Err(TesseraError::FileNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        for dirent in &subdirs {
            if !dirent.is_directory || !dirent.name.starts_with("rs") {
                continue;
            }
            let server = join(&self.servers_dir, &dirent.name);
            // log/user is the replication input; class logs only shed their
            // purged files.
            self.scan_directory(&join(&server, "log/user"), &mut found)
                .await;
            self.remove_purged_directories(
                &join(&server, "log"),
                &linked_logs,
                &replicated_tables,
                0,
            )
            .await;
            for class in ["log/root", "log/metadata", "log/system"] {
                self.remove_purged_files(&join(&server, class)).await;
            }
        }

        for log_dir in &linked_logs {
            debug!("Scanning linked log {}", log_dir);
            self.scan_directory(log_dir, &mut found).await;
            self.remove_purged_directories(log_dir, &linked_logs, &replicated_tables, 1)
                .await;
        }

        // Classify what the walk produced.
        let mut to_delete = Vec::new();
        {
            let mut state = self.state.lock();
            let entity = &mut state.entity;
            entity.unassigned_fragments.clear();
            for fragment in found {
                let (original, purged) = if let Some(stripped) = fragment.strip_suffix(PURGED_SUFFIX)
                {
                    (stripped.to_string(), fragment.clone())
                } else {
                    (fragment.clone(), format!("{fragment}{PURGED_SUFFIX}"))
                };

                let finished = entity.finished_fragments.contains(&original)
                    || entity.finished_fragments.contains(&purged);
                let assigned = entity.assigned_fragments.contains_key(&original)
                    || entity.assigned_fragments.contains_key(&purged);

                if finished && fragment.ends_with(PURGED_SUFFIX) {
                    // Shipped and purged by its owner: physically delete.
                    info!("Fragment {} was replicated and purged, deleting", fragment);
                    to_delete.push(fragment.clone());
                    entity.finished_fragments.remove(&original);
                    entity.finished_fragments.remove(&purged);
                } else if finished {
                    debug!("Fragment {} already finished, skipping", fragment);
                } else if assigned {
                    debug!("Fragment {} already assigned, skipping", fragment);
                } else {
                    debug!("Adding {} to the unassigned fragments", fragment);
                    entity.unassigned_fragments.insert(fragment);
                }
            }
        }

        for fragment in to_delete {
            let tombstone = format!(
                "{}{}",
                fragment.trim_end_matches(PURGED_SUFFIX),
                DELETED_SUFFIX
            );
            if let Err(e) = self.dfs.rename(&fragment, &tombstone).await {
                warn!("Could not delete {}: {}", fragment, e);
            }
        }
        Ok(())
    }

    async fn scan_directory(&self, directory: &str, fragments: &mut BTreeSet<String>) {
        let dirents = match self.dfs.readdir(directory).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for dirent in dirents {
            if dirent.is_directory
                || dirent.name == PURGED_DIRECTORY_MARKER
                || dirent.name.ends_with(MARK_SUFFIX)
                || dirent.name.ends_with(TMP_SUFFIX)
                || dirent.name.ends_with(DELETED_SUFFIX)
            {
                continue;
            }
            if dirent.length == 0 {
                debug!("{}/{} is empty, skipping", directory, dirent.name);
                continue;
            }
            fragments.insert(join(directory, &dirent.name));
        }
    }

    /// A directory carrying the `purged-directory` marker is deletable once
    /// every other file in it was replicated, or when it belongs to a table
    /// whose schema no longer requests replication. Recurses into
    /// subdirectories; returns true when `directory` itself was removed.
    async fn remove_purged_directories(
        &self,
        directory: &str,
        linked_logs: &BTreeSet<String>,
        replicated_tables: &std::collections::BTreeMap<String, Vec<String>>,
        level: u32,
    ) -> bool {
        let dirents = match self.dfs.readdir(directory).await {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        if dirents.is_empty() {
            return false;
        }

        let mut found_marker = false;
        let mut all_purged = true;
        let mut not_replicated = false;
        {
            let state = self.state.lock();
            for dirent in &dirents {
                // The class-log subdirectories are never GC'd from here.
                if level == 0
                    && matches!(dirent.name.as_str(), "user" | "metadata" | "root" | "system")
                {
                    continue;
                }
                let path = join(directory, &dirent.name);
                if dirent.name == PURGED_DIRECTORY_MARKER {
                    found_marker = true;
                    // Transfer logs reported by a slave are known-shipped.
                    if linked_logs.contains(directory) {
                        break;
                    }
                    // A table directory that is no longer replicated can go
                    // regardless of its contents.
                    if let Some(table_id) = table_id_of_log_dir(directory) {
                        if !replicated_tables.contains_key(&table_id) {
                            not_replicated = true;
                            break;
                        }
                    }
                    continue;
                }
                if dirent.is_directory || dirent.name.ends_with(DELETED_SUFFIX) {
                    continue;
                }
                let original = path
                    .strip_suffix(PURGED_SUFFIX)
                    .unwrap_or(&path)
                    .to_string();
                if state.entity.finished_fragments.contains(&path)
                    || state.entity.finished_fragments.contains(&original)
                {
                    continue;
                }
                all_purged = false;
                break;
            }
        }

        if found_marker && (all_purged || not_replicated) {
            info!("Removing purged directory {}", directory);
            if self.dfs.rmdir(directory).await.is_ok() {
                let mut state = self.state.lock();
                for dirent in &dirents {
                    let path = join(directory, &dirent.name);
                    let original = path
                        .strip_suffix(PURGED_SUFFIX)
                        .unwrap_or(&path)
                        .to_string();
                    state.entity.finished_fragments.remove(&path);
                    state.entity.finished_fragments.remove(&original);
                }
                state.entity.linked_logs.remove(directory);
                return true;
            }
            return false;
        }

        for dirent in &dirents {
            if !dirent.is_directory {
                continue;
            }
            let path = join(directory, &dirent.name);
            Box::pin(self.remove_purged_directories(
                &path,
                linked_logs,
                replicated_tables,
                level + 1,
            ))
            .await;
        }
        false
    }

    /// Class logs (root/metadata/system) are never replicated; their purged
    /// fragments are renamed to tombstones right away.
    async fn remove_purged_files(&self, directory: &str) {
        let dirents = match self.dfs.readdir(directory).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for dirent in dirents {
            if !dirent.name.ends_with(PURGED_SUFFIX) {
                continue;
            }
            let path = join(directory, &dirent.name);
            let tombstone = format!(
                "{}{}",
                path.trim_end_matches(PURGED_SUFFIX),
                DELETED_SUFFIX
            );
            info!("Removing purged file {}", path);
            if let Err(e) = self.dfs.rename(&path, &tombstone).await {
                warn!("Could not remove {}: {}", path, e);
                continue;
            }
            let mut state = self.state.lock();
            state.entity.finished_fragments.remove(&path);
            state
                .entity
                .finished_fragments
                .remove(path.trim_end_matches(PURGED_SUFFIX));
        }
    }

    /// Installs a freshly fetched receiver list for one remote cluster.
    pub fn update_receivers(&self, cluster: &str, receivers: Vec<String>) {
        if receivers.is_empty() {
            return;
        }
        for receiver in &receivers {
            debug!("New receiver for cluster {}: {}", cluster, receiver);
        }
        self.state
            .lock()
            .cluster_slaves
            .insert(cluster.to_string(), receivers);
    }

    /// Asks every known remote cluster's master for its current slave list.
    pub async fn update_recipients(&self) {
        let known: Vec<String> = self.state.lock().entity.known_clusters.iter().cloned().collect();
        for cluster in known {
            let Some(remote) = self
                .config
                .cluster
                .remotes
                .iter()
                .find(|r| r.name == cluster)
            else {
                warn!("No master addresses configured for cluster '{}'", cluster);
                continue;
            };
            let addrs: Vec<SocketAddr> = remote
                .masters
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect();
            let client = ReplicationMasterClient::new(
                addrs,
                self.registry.clone(),
                self.config.replication.request_timeout,
            );
            match client.get_receiver_list().await {
                Ok(receivers) if !receivers.is_empty() => {
                    debug!("Cluster {} has {} receivers", cluster, receivers.len());
                    self.state.lock().cluster_slaves.insert(cluster, receivers);
                }
                Ok(_) => {}
                Err(e) => warn!("Could not refresh receivers of '{}': {}", cluster, e),
            }
        }
    }

    /// Hands a quota of unassigned fragments to a slave, registering it (and
    /// a death watch on its Hyperspace file) on first contact. The routing
    /// maps are returned unconditionally: a slave mid-fragment may need an
    /// updated receiver list even when no new fragments are offered.
    #[allow(clippy::type_complexity)]
    pub fn assign_fragments(
        self: &Arc<Self>,
        location: &Location,
        addr: SocketAddr,
    ) -> (
        Vec<String>,
        Vec<(String, Vec<String>)>,
        Vec<(String, Vec<String>)>,
        Vec<(String, String)>,
    ) {
        let mut state = self.state.lock();
        if !state.known_slaves.contains_key(location) {
            info!("Registering replication slave {} ({})", location, addr);
            state.known_slaves.insert(location.clone(), addr);
            self.watch_slave(location.clone());
        }

        let clusters: Vec<(String, Vec<String>)> = state
            .cluster_slaves
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let table_routes: Vec<(String, Vec<String>)> = state
            .entity
            .replicated_tables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let table_names: Vec<(String, String)> = state
            .entity
            .table_names
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut fragments = Vec::new();
        if !state.entity.unassigned_fragments.is_empty()
            && !state.entity.replicated_tables.is_empty()
            && !state.cluster_slaves.is_empty()
        {
            let unassigned = state.entity.unassigned_fragments.len();
            let slaves = state.known_slaves.len().max(1);
            let quota = unassigned.div_ceil(slaves);
            for _ in 0..quota {
                let Some(fragment) = state.entity.unassigned_fragments.pop_first() else {
                    break;
                };
                info!("Assigning fragment {} to {}", fragment, location);
                state
                    .entity
                    .assigned_fragments
                    .insert(fragment.clone(), location.clone());
                fragments.push(fragment);
            }
        } else {
            debug!(
                "Not assigning fragments: unassigned={}, replicated={}, clusters={}",
                state.entity.unassigned_fragments.len(),
                state.entity.replicated_tables.len(),
                state.cluster_slaves.len()
            );
        }

        let entity = state.entity.clone();
        drop(state);
        self.persist_in_background(entity);
        (fragments, clusters, table_routes, table_names)
    }

    /// Completion report from a slave. On error the fragment is quarantined
    /// under a hashed name and the administrator notified, but the slave is
    /// unblocked either way.
    pub async fn finished_fragment(
        &self,
        fragment: &str,
        error: Option<WireError>,
        _offset: u64,
        linked_logs: Vec<String>,
    ) -> Result<(), TesseraError> {
        if let Some(err) = &error {
            let digest = ERROR_DIR_HASH.checksum(fragment.as_bytes());
            let error_dir = format!("{}/replicator/errors", self.servers_dir);
            let new_path = format!("{error_dir}/{digest:016x}");
            error!(
                "Replication of fragment {} failed ({:?}); moving to {}",
                fragment, err, new_path
            );
            self.dfs.mkdirs(&error_dir).await?;
            if let Err(e) = self.dfs.rename(fragment, &new_path).await {
                warn!("Could not quarantine {}: {}", fragment, e);
            }
            self.notifier.notify(
                Severity::Error,
                &format!("Replication of {fragment} failed"),
                &format!(
                    "The fragment could not be replicated ({err:?}) and was moved to {new_path}.\n\
                     It will not be retried automatically."
                ),
            );
        }

        let entity = {
            let mut state = self.state.lock();
            for log_dir in linked_logs {
                info!("Adding linked log dir {}", log_dir);
                state.entity.linked_logs.insert(log_dir);
            }
            state.entity.assigned_fragments.remove(fragment);
            if error.is_none() {
                state.entity.finished_fragments.insert(fragment.to_string());
            }
            state.entity.clone()
        };
        self.persist(entity).await
    }

    /// Local schema change: refresh the routing tables and push the update
    /// to every destination cluster's master.
    pub async fn handle_schema_update(
        &self,
        kind: SchemaUpdateKind,
        table_id: &str,
        table_name: &str,
        schema_json: &str,
    ) -> Result<(), TesseraError> {
        let schema = TableSchema::from_json(schema_json)?;
        let destinations = schema.replication_clusters.clone();
        let entity = {
            let mut state = self.state.lock();
            if destinations.is_empty() || kind == SchemaUpdateKind::DropTable {
                info!("Replication disabled for {}", table_id);
                state.entity.replicated_tables.remove(table_id);
                state.entity.table_names.remove(table_id);
            } else {
                info!(
                    "Table {} ({}) is replicated to {:?}",
                    table_id, table_name, destinations
                );
                state
                    .entity
                    .replicated_tables
                    .insert(table_id.to_string(), destinations.clone());
                state
                    .entity
                    .table_names
                    .insert(table_id.to_string(), table_name.to_string());
                for cluster in &destinations {
                    state.entity.known_clusters.insert(cluster.clone());
                }
            }
            state.entity.clone()
        };
        self.persist(entity).await?;

        for cluster in &destinations {
            let Some(remote) = self
                .config
                .cluster
                .remotes
                .iter()
                .find(|r| &r.name == cluster)
            else {
                return Err(TesseraError::ReplicationClusterNotFound(cluster.clone()));
            };
            let addrs: Vec<SocketAddr> = remote
                .masters
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect();
            let client = ReplicationMasterClient::new(
                addrs,
                self.registry.clone(),
                self.config.replication.request_timeout,
            );
            info!("Sending schema update ({}) to {}", table_name, cluster);
            client
                .apply_schema_update(kind, table_name, schema_json)
                .await?;
        }
        Ok(())
    }

    /// Applies a schema update pushed by a remote cluster, fenced by the
    /// schema generation and stripped of its replication clause so updates
    /// never propagate recursively.
    pub async fn apply_schema_update(
        &self,
        kind: SchemaUpdateKind,
        table_name: &str,
        schema_json: &str,
    ) -> Result<(), TesseraError> {
        let mut schema = TableSchema::from_json(schema_json)?;
        {
            let state = self.state.lock();
            if let Some(known) = state.entity.table_generations.get(table_name) {
                if *known >= schema.generation {
                    warn!(
                        "Skipping schema update for {}: generation {} is not newer than {}",
                        table_name, schema.generation, known
                    );
                    return Ok(());
                }
            }
        }
        schema.replication_clusters.clear();

        info!("Applying schema update ({:?}) for {}", kind, table_name);
        let update_entity = SchemaUpdateEntity {
            id: self.mml_writer.next_entity_id(),
            kind,
            table_name: table_name.to_string(),
            table_id: schema.id.clone(),
            schema_json: schema.to_json()?,
        };
        self.mml_writer
            .record_state(&Entity::SchemaUpdate(update_entity))
            .await?;

        let entity = {
            let mut state = self.state.lock();
            state
                .entity
                .table_generations
                .insert(table_name.to_string(), schema.generation);
            state.entity.clone()
        };
        self.persist(entity).await
    }

    /// A slave's Hyperspace lock released: its assignments go back to the
    /// unassigned pool.
    pub async fn handle_slave_disconnect(&self, location: &Location) {
        let entity = {
            let mut state = self.state.lock();
            if state.known_slaves.remove(location).is_none() {
                return;
            }
            info!("Local replication slave {} disconnected", location);
            let reassign: Vec<String> = state
                .entity
                .assigned_fragments
                .iter()
                .filter(|(_, owner)| *owner == location)
                .map(|(fragment, _)| fragment.clone())
                .collect();
            for fragment in reassign {
                info!("Reassigning fragment {}", fragment);
                state.entity.assigned_fragments.remove(&fragment);
                state.entity.unassigned_fragments.insert(fragment);
            }
            state.entity.clone()
        };
        if let Err(e) = self.persist(entity).await {
            error!("Could not persist after slave disconnect: {}", e);
        }
    }

    pub fn receiver_list(&self) -> Vec<String> {
        self.state
            .lock()
            .known_slaves
            .values()
            .map(|addr| addr.to_string())
            .collect()
    }

    pub fn status(&self) -> String {
        let state = self.state.lock();
        format!(
            "slaves={} unassigned={} assigned={} finished={} tables={}",
            state.known_slaves.len(),
            state.entity.unassigned_fragments.len(),
            state.entity.assigned_fragments.len(),
            state.entity.finished_fragments.len(),
            state.entity.replicated_tables.len()
        )
    }

    fn watch_slave(self: &Arc<Self>, location: Location) {
        let path = format!("{}/replication/{}", self.config.toplevel_dir, location);
        let mut events = self.hyperspace.subscribe(&path);
        let master = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let HyperspaceEvent::LockReleased { .. } = event;
                match master.upgrade() {
                    Some(master) => master.handle_slave_disconnect(&location).await,
                    None => return,
                }
            }
        });
    }

    fn persist_in_background(self: &Arc<Self>, entity: ReplicationMasterEntity) {
        let master = self.clone();
        tokio::spawn(async move {
            if let Err(e) = master.persist(entity).await {
                error!("Could not persist replication master state: {}", e);
            }
        });
    }

    async fn persist(&self, entity: ReplicationMasterEntity) -> Result<(), TesseraError> {
        self.mml_writer
            .record_state(&Entity::ReplicationMasterState(entity))
            .await
    }

    /// Snapshot of the three fragment sets, for status tooling and tests.
    /// A fragment is in exactly one of them at any time.
    pub fn fragment_sets(
        &self,
    ) -> (BTreeSet<String>, HashMap<String, Location>, BTreeSet<String>) {
        let state = self.state.lock();
        (
            state.entity.unassigned_fragments.clone(),
            state
                .entity
                .assigned_fragments
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            state.entity.finished_fragments.clone(),
        )
    }
}

/// Table id encoded in a log directory path, e.g. `.../log/phantom/<table>/...`.
fn table_id_of_log_dir(directory: &str) -> Option<String> {
    let mut parts = directory.rsplit('/');
    let _leaf = parts.next()?;
    let candidate = parts.next()?;
    (!candidate.is_empty() && candidate != "log").then(|| candidate.to_string())
}

/// RPC surface of the replication master.
pub struct ReplicationMasterService(pub Arc<ReplicationMaster>);

#[async_trait]
impl RpcService for ReplicationMasterService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, TesseraError> {
        let master = &self.0;
        match request {
            RpcRequest::AssignFragments {
                location,
                host,
                port,
            } => {
                let addr: SocketAddr = format!("{host}:{port}")
                    .parse()
                    .map_err(|e| TesseraError::Protocol(format!("bad slave address: {e}")))?;
                let (fragments, clusters, table_routes, table_names) =
                    master.assign_fragments(&location, addr);
                Ok(RpcResponse::AssignFragments {
                    fragments,
                    clusters,
                    table_routes,
                    table_names,
                })
            }
            RpcRequest::FinishedFragment {
                fragment,
                error,
                offset,
                linked_logs,
            } => {
                master
                    .finished_fragment(&fragment, error, offset, linked_logs)
                    .await?;
                Ok(RpcResponse::Ok)
            }
            RpcRequest::GetReceiverList => Ok(RpcResponse::ReceiverList {
                slaves: master.receiver_list(),
            }),
            RpcRequest::NotifySchemaUpdate {
                kind,
                table_name,
                table_id,
                schema_json,
            } => {
                master
                    .handle_schema_update(kind, &table_id, &table_name, &schema_json)
                    .await?;
                Ok(RpcResponse::Ok)
            }
            RpcRequest::ApplySchemaUpdate {
                kind,
                table_name,
                schema_json,
            } => {
                master
                    .apply_schema_update(kind, &table_name, &schema_json)
                    .await?;
                Ok(RpcResponse::Ok)
            }
            RpcRequest::Status => Ok(RpcResponse::Status {
                text: master.status(),
            }),
            RpcRequest::Shutdown => Err(TesseraError::ShuttingDown),
            other => Err(TesseraError::Protocol(format!(
                "command {} not handled by the replication master",
                other.command_code()
            ))),
        }
    }
}
