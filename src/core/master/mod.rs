// src/core/master/mod.rs

//! The coordinator: tracks range servers, detects failures through
//! Hyperspace, and drives recovery operations.

pub mod connection_manager;
pub mod recover_ranges;
pub mod recover_server;
pub mod recovery_state;

use crate::config::Config;
use crate::core::TesseraError;
use crate::core::balance::BalancePlanAuthority;
use crate::core::comm::{CommRegistry, RangeServerClient, RpcService};
use crate::core::dfs::Dfs;
use crate::core::hyperspace::{Hyperspace, HyperspaceEvent, SessionId};
use crate::core::metalog::{Entity, MetalogWriter, RecoverServerRangesEntity};
use crate::core::notification::NotificationHook;
use crate::core::protocol::{RpcRequest, RpcResponse};
use crate::core::types::Location;
use async_trait::async_trait;
use connection_manager::RangeServerConnectionManager;
use recover_server::OperationRecover;
use recovery_state::RecoveryState;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};

/// Everything the recovery state machines need, created in dependency order
/// (DFS, Hyperspace, metalog, authority) and passed explicitly.
pub struct MasterContext {
    pub config: Config,
    pub dfs: Arc<dyn Dfs>,
    pub hyperspace: Arc<dyn Hyperspace>,
    pub hyperspace_session: SessionId,
    pub mml_writer: Arc<MetalogWriter>,
    pub bpa: Arc<BalancePlanAuthority>,
    pub rsc_manager: Arc<RangeServerConnectionManager>,
    pub recovery_state: RecoveryState,
    pub rs_client: RangeServerClient,
    pub notifier: Arc<dyn NotificationHook>,
}

impl MasterContext {
    pub fn servers_dir(&self) -> String {
        format!("{}/servers", self.config.toplevel_dir)
    }

    pub fn server_file(&self, location: &Location) -> String {
        format!("{}/{}", self.servers_dir(), location)
    }
}

pub struct Master {
    ctx: Arc<MasterContext>,
    operations: Mutex<Vec<Arc<Mutex<OperationRecover>>>>,
}

impl Master {
    /// Builds the coordinator, seeding the balance plan authority and any
    /// open recovery operations from the coordinator metalog.
    pub async fn new(
        config: Config,
        dfs: Arc<dyn Dfs>,
        hyperspace: Arc<dyn Hyperspace>,
        registry: Arc<CommRegistry>,
        notifier: Arc<dyn NotificationHook>,
    ) -> Result<Arc<Self>, TesseraError> {
        let session = hyperspace.create_session();
        let mml_path = format!("{}/master/mml", config.toplevel_dir);
        let (mml_writer, entities) = MetalogWriter::open(dfs.clone(), mml_path).await?;
        let mml_writer = Arc::new(mml_writer);

        let rsc_manager = Arc::new(RangeServerConnectionManager::new());

        let mut bpa_entity = None;
        let mut recover_entities = Vec::new();
        let mut subop_entities: Vec<RecoverServerRangesEntity> = Vec::new();
        for entity in entities.into_values() {
            match entity {
                Entity::BalancePlanAuthority(e) => bpa_entity = Some(e),
                Entity::RecoverServer(e) => recover_entities.push(e),
                Entity::RecoverServerRanges(e) => subop_entities.push(e),
                _ => {}
            }
        }

        let bpa = BalancePlanAuthority::new(
            dfs.clone(),
            config.toplevel_dir.clone(),
            rsc_manager.clone(),
            mml_writer.clone(),
            bpa_entity,
        )
        .await?;

        let rs_client = RangeServerClient::new(
            registry.clone(),
            rsc_manager.clone(),
            config.replication.request_timeout,
        );

        let ctx = Arc::new(MasterContext {
            config,
            dfs,
            hyperspace,
            hyperspace_session: session,
            mml_writer,
            bpa,
            rsc_manager,
            recovery_state: RecoveryState::new(),
            rs_client,
            notifier,
        });

        let mut operations = Vec::new();
        for entity in recover_entities {
            let subs = subop_entities
                .iter()
                .filter(|s| s.location == entity.location)
                .cloned()
                .collect();
            info!("Resuming recovery of {} from metalog", entity.location);
            operations.push(Arc::new(Mutex::new(OperationRecover::from_entities(
                entity, subs,
            ))));
        }

        Ok(Arc::new(Self {
            ctx,
            operations: Mutex::new(operations),
        }))
    }

    pub fn context(&self) -> Arc<MasterContext> {
        self.ctx.clone()
    }

    /// Scheduler loop: re-enters every open operation on each tick.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.ctx.config.failover.scheduler_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Master scheduler shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One scheduler tick: drive every open operation, drop the finished ones.
    pub async fn tick(&self) {
        let operations = self.operations.lock().await.clone();
        for op in &operations {
            let mut op = op.lock().await;
            if op.is_done() {
                continue;
            }
            if let Err(e) = op.execute(&self.ctx).await {
                error!("RecoverServer {}: {}", op.location(), e);
                // Structural errors self-heal through the plan-freshness
                // gate on the next tick; only persistent failures escalate.
                if !e.is_structural() {
                    op.note_failure(&self.ctx, &e);
                }
            }
        }
        let mut operations = self.operations.lock().await;
        let mut kept = Vec::new();
        for op in operations.drain(..) {
            if !op.lock().await.is_done() {
                kept.push(op);
            }
        }
        *operations = kept;
    }

    /// Reacts to the loss of a range server: marks it disconnected and opens
    /// a recovery operation unless one is already running.
    pub async fn server_failed(&self, location: Location) {
        self.ctx.rsc_manager.disconnect_server(&location);
        if self.ctx.rsc_manager.is_recovering(&location) {
            return;
        }
        let mut operations = self.operations.lock().await;
        for op in operations.iter() {
            if op.lock().await.location() == &location {
                return;
            }
        }
        warn!("RangeServer {} lost, starting recovery", location);
        self.ctx.rsc_manager.set_recovering(&location, true);
        let entity_id = self.ctx.mml_writer.next_entity_id();
        operations.push(Arc::new(Mutex::new(OperationRecover::new(
            entity_id, location,
        ))));
    }

    /// Watches the server's Hyperspace file; a released lock means the
    /// server's session died.
    fn watch_server(self: &Arc<Self>, location: Location) {
        let path = self.ctx.server_file(&location);
        let mut events = self.ctx.hyperspace.subscribe(&path);
        let master = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let HyperspaceEvent::LockReleased { .. } = event;
                let Some(master) = master.upgrade() else {
                    return;
                };
                // The recovery op itself re-locks the file; only a release
                // while the server is considered connected signals death.
                let connected = master
                    .ctx
                    .rsc_manager
                    .find(&location)
                    .is_some_and(|c| c.connected);
                if connected {
                    master.server_failed(location.clone()).await;
                }
            }
        });
    }
}

/// RPC surface of the coordinator.
pub struct MasterService(pub Arc<Master>);

#[async_trait]
impl RpcService for MasterService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, TesseraError> {
        let master = &self.0;
        let ctx = &master.ctx;
        match request {
            RpcRequest::RegisterServer {
                location,
                hostname,
                port,
            } => {
                let addr = format!("{hostname}:{port}")
                    .parse()
                    .map_err(|e| TesseraError::Protocol(format!("bad server address: {e}")))?;
                ctx.rsc_manager.connect_server(location.clone(), hostname, addr);
                master.watch_server(location);
                Ok(RpcResponse::Ok)
            }
            RpcRequest::PhantomPrepareComplete {
                op_id,
                location,
                error,
                ..
            } => {
                if let Some(future) = ctx.recovery_state.lookup_prepare_future(op_id) {
                    match error {
                        None => future.success(&location),
                        Some(e) => future.failure(&location, e),
                    }
                }
                Ok(RpcResponse::Ok)
            }
            RpcRequest::PhantomCommitComplete {
                op_id,
                location,
                error,
                ..
            } => {
                if let Some(future) = ctx.recovery_state.lookup_commit_future(op_id) {
                    match error {
                        None => future.success(&location),
                        Some(e) => future.failure(&location, e),
                    }
                }
                Ok(RpcResponse::Ok)
            }
            RpcRequest::ReplayComplete {
                op_id,
                attempt,
                fragment_errors,
                success,
                ..
            } => {
                if let Some(counter) = ctx.recovery_state.replay_counter(op_id) {
                    counter.complete(attempt, fragment_errors, success);
                }
                Ok(RpcResponse::Ok)
            }
            RpcRequest::ReplayStatus { op_id, attempt, .. } => {
                if let Some(counter) = ctx.recovery_state.replay_counter(op_id) {
                    counter.heartbeat(attempt);
                }
                Ok(RpcResponse::Ok)
            }
            RpcRequest::Status => Ok(RpcResponse::Status {
                text: format!(
                    "servers={} connected={} plans_empty={}",
                    ctx.rsc_manager.server_count(),
                    ctx.rsc_manager.connected_servers().len(),
                    ctx.bpa.is_empty()
                ),
            }),
            RpcRequest::Shutdown => Err(TesseraError::ShuttingDown),
            other => Err(TesseraError::Protocol(format!(
                "command {} not handled by the master",
                other.command_code()
            ))),
        }
    }
}
