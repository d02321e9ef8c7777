// src/server/mod.rs

//! Process wiring: builds the DFS, Hyperspace and comm layers, then starts
//! the requested subsystem. Creation order is fixed: DFS -> Hyperspace ->
//! context -> state machines.

use crate::config::Config;
use crate::core::cluster::ClusterIdManager;
use crate::core::comm::{self, CommRegistry, RpcService};
use crate::core::dfs::{Dfs, LocalDfs};
use crate::core::hyperspace::{Hyperspace, LocalHyperspace};
use crate::core::master::{Master, MasterService};
use crate::core::notification::LogNotificationHook;
use crate::core::queue::ApplicationQueue;
use crate::core::rangeserver::{RangeServer, RangeServerService};
use crate::core::replication::master::{ReplicationMaster, ReplicationMasterService};
use crate::core::replication::slave::{ReplicationSlave, ReplicationSlaveService};
use crate::core::types::Location;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

const QUEUE_WORKERS: usize = 8;

fn build_dfs(config: &Config) -> Arc<dyn Dfs> {
    Arc::new(LocalDfs::new(format!("{}/dfs", config.data_dir)))
}

fn build_hyperspace() -> Arc<dyn Hyperspace> {
    // The bundled in-process lock service; a real deployment plugs a
    // networked implementation behind the same trait.
    Arc::new(LocalHyperspace::new())
}

async fn serve_on(
    addr: &str,
    service: Arc<dyn RpcService>,
    shutdown: &broadcast::Sender<()>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    let rx = shutdown.subscribe();
    tokio::spawn(comm::serve(listener, service, rx));
    Ok(())
}

async fn wait_for_ctrl_c(shutdown: broadcast::Sender<()>) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown.send(());
    Ok(())
}

/// Runs the coordinator.
pub async fn run_master(config: Config) -> Result<()> {
    let dfs = build_dfs(&config);
    let hyperspace = build_hyperspace();
    let registry = CommRegistry::new();
    let notifier = Arc::new(LogNotificationHook);
    let master = Master::new(config.clone(), dfs, hyperspace, registry, notifier).await?;

    let (shutdown, _) = broadcast::channel(1);
    serve_on(
        &config.master_addr,
        Arc::new(MasterService(master.clone())),
        &shutdown,
    )
    .await?;
    tokio::spawn(master.run(shutdown.subscribe()));
    wait_for_ctrl_c(shutdown).await
}

/// Runs a range server.
pub async fn run_rangeserver(config: Config) -> Result<()> {
    let dfs = build_dfs(&config);
    let hyperspace = build_hyperspace();
    let registry = CommRegistry::new();
    let queue = ApplicationQueue::new(QUEUE_WORKERS);
    let location = Location::from_host_port(&config.host, config.port);
    let addr = format!("{}:{}", config.host, config.port);

    let session = hyperspace.create_session();
    let cluster_ids = ClusterIdManager::new(hyperspace.clone(), session, &config.toplevel_dir);
    cluster_ids.ensure_cluster_id(config.cluster.id).await?;

    let server = RangeServer::new(
        config.clone(),
        location,
        dfs,
        hyperspace,
        registry,
        queue.clone(),
    )
    .await?;
    server.claim_location().await?;

    let (shutdown, _) = broadcast::channel(1);
    serve_on(&addr, Arc::new(RangeServerService(server.clone())), &shutdown).await?;
    server.register_with_master().await?;

    // Transfer-log GC runs alongside the serving loop.
    let gc_server = server.clone();
    let mut gc_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = gc_shutdown.recv() => return,
                _ = interval.tick() => {
                    if let Err(e) = gc_server.maintenance_tick().await {
                        tracing::warn!("Maintenance tick failed: {}", e);
                    }
                }
            }
        }
    });

    let result = wait_for_ctrl_c(shutdown).await;
    queue.quiesce().await;
    server.shutdown().await?;
    result
}

/// Runs the per-cluster replication master.
pub async fn run_replication_master(config: Config) -> Result<()> {
    let dfs = build_dfs(&config);
    let hyperspace = build_hyperspace();
    let registry = CommRegistry::new();
    let notifier = Arc::new(LogNotificationHook);
    let master = ReplicationMaster::new(config.clone(), dfs, hyperspace, registry, notifier).await?;
    master.obtain_master_lock().await?;

    let addr = format!("{}:{}", config.host, config.replication.master_port);
    let (shutdown, _) = broadcast::channel(1);
    serve_on(
        &addr,
        Arc::new(ReplicationMasterService(master.clone())),
        &shutdown,
    )
    .await?;
    tokio::spawn(master.run(shutdown.subscribe()));
    wait_for_ctrl_c(shutdown).await
}

/// Runs a replication slave.
pub async fn run_replication_slave(config: Config) -> Result<()> {
    let dfs = build_dfs(&config);
    let hyperspace = build_hyperspace();
    let registry = CommRegistry::new();
    let queue = ApplicationQueue::new(QUEUE_WORKERS);
    let slave = ReplicationSlave::new(config.clone(), dfs, hyperspace, registry, queue.clone()).await?;
    slave.lock_slave_id().await?;

    let addr = format!("{}:{}", config.host, config.replication.slave_port);
    let (shutdown, _) = broadcast::channel(1);
    serve_on(
        &addr,
        Arc::new(ReplicationSlaveService(slave.clone())),
        &shutdown,
    )
    .await?;
    tokio::spawn(slave.run(shutdown.subscribe()));
    let result = wait_for_ctrl_c(shutdown).await;
    queue.quiesce().await;
    result
}
