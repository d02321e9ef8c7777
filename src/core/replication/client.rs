// src/core/replication/client.rs

//! Clients for the replication control and data paths.

use crate::core::TesseraError;
use crate::core::comm::CommRegistry;
use crate::core::metalog::SchemaUpdateKind;
use crate::core::protocol::{RpcRequest, RpcResponse, WireError};
use crate::core::types::Location;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

/// Client to a replication master, local or remote. Remote clusters list
/// several master addresses; only one holds the master lock at a time, so
/// calls fail over through the list on connection errors.
pub struct ReplicationMasterClient {
    addrs: Vec<SocketAddr>,
    current: AtomicUsize,
    registry: Arc<CommRegistry>,
    timeout: Duration,
}

impl ReplicationMasterClient {
    pub fn new(
        addrs: Vec<SocketAddr>,
        registry: Arc<CommRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            addrs,
            current: AtomicUsize::new(0),
            registry,
            timeout,
        }
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, TesseraError> {
        if self.addrs.is_empty() {
            return Err(TesseraError::ReplicationClusterNotFound(
                "no master addresses".into(),
            ));
        }
        let mut last_err = None;
        for _ in 0..self.addrs.len() {
            let idx = self.current.load(Ordering::Relaxed) % self.addrs.len();
            let addr = self.addrs[idx];
            match self
                .registry
                .get(addr)
                .call(request.clone(), self.timeout)
                .await
            {
                Ok(response) => return response.into_result(),
                Err(e @ (TesseraError::Connection(_) | TesseraError::RequestTimeout(_))) => {
                    warn!("Replication master {} unreachable: {}", addr, e);
                    self.current.fetch_add(1, Ordering::Relaxed);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            TesseraError::ReplicationClusterNotFound("all masters unreachable".into())
        }))
    }

    #[allow(clippy::type_complexity)]
    pub async fn assign_fragments(
        &self,
        location: &Location,
        host: &str,
        port: u16,
    ) -> Result<
        (
            Vec<String>,
            Vec<(String, Vec<String>)>,
            Vec<(String, Vec<String>)>,
            Vec<(String, String)>,
        ),
        TesseraError,
    > {
        match self
            .call(RpcRequest::AssignFragments {
                location: location.clone(),
                host: host.to_string(),
                port,
            })
            .await?
        {
            RpcResponse::AssignFragments {
                fragments,
                clusters,
                table_routes,
                table_names,
            } => Ok((fragments, clusters, table_routes, table_names)),
            other => Err(TesseraError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }

    pub async fn finished_fragment(
        &self,
        fragment: &str,
        error: Option<WireError>,
        offset: u64,
        linked_logs: Vec<String>,
    ) -> Result<(), TesseraError> {
        match self
            .call(RpcRequest::FinishedFragment {
                fragment: fragment.to_string(),
                error,
                offset,
                linked_logs,
            })
            .await?
        {
            RpcResponse::Ok => Ok(()),
            other => Err(TesseraError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }

    pub async fn get_receiver_list(&self) -> Result<Vec<String>, TesseraError> {
        match self.call(RpcRequest::GetReceiverList).await? {
            RpcResponse::ReceiverList { slaves } => Ok(slaves),
            other => Err(TesseraError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }

    pub async fn notify_schema_update(
        &self,
        kind: SchemaUpdateKind,
        table_name: &str,
        table_id: &str,
        schema_json: &str,
    ) -> Result<(), TesseraError> {
        match self
            .call(RpcRequest::NotifySchemaUpdate {
                kind,
                table_name: table_name.to_string(),
                table_id: table_id.to_string(),
                schema_json: schema_json.to_string(),
            })
            .await?
        {
            RpcResponse::Ok => Ok(()),
            other => Err(TesseraError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }

    pub async fn apply_schema_update(
        &self,
        kind: SchemaUpdateKind,
        table_name: &str,
        schema_json: &str,
    ) -> Result<(), TesseraError> {
        match self
            .call(RpcRequest::ApplySchemaUpdate {
                kind,
                table_name: table_name.to_string(),
                schema_json: schema_json.to_string(),
            })
            .await?
        {
            RpcResponse::Ok => Ok(()),
            other => Err(TesseraError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }
}

/// Client to one remote cluster's slaves for the data path. Picks a slave
/// uniformly at random on creation and round-robins only on errors; an
/// in-flight fragment finishes on the destination it started with.
pub struct ReplicationSlaveClient {
    addrs: Vec<SocketAddr>,
    current: AtomicUsize,
    registry: Arc<CommRegistry>,
    timeout: Duration,
}

impl ReplicationSlaveClient {
    pub fn new(
        addrs: Vec<SocketAddr>,
        registry: Arc<CommRegistry>,
        timeout: Duration,
    ) -> Result<Self, TesseraError> {
        if addrs.is_empty() {
            return Err(TesseraError::ReplicationClusterNotFound(
                "no slaves available".into(),
            ));
        }
        let start = rand::thread_rng().gen_range(0..addrs.len());
        Ok(Self {
            addrs,
            current: AtomicUsize::new(start),
            registry,
            timeout,
        })
    }

    pub fn current_addr(&self) -> SocketAddr {
        self.addrs[self.current.load(Ordering::Relaxed) % self.addrs.len()]
    }

    /// Advances to the next slave; called by the worker on transient errors.
    pub fn rotate(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn update(&self, table_name: &str, payload: Vec<u8>) -> Result<(), TesseraError> {
        let addr = self.current_addr();
        match self
            .registry
            .get(addr)
            .call(
                RpcRequest::SlaveUpdate {
                    table_name: table_name.to_string(),
                    payload,
                },
                self.timeout,
            )
            .await?
            .into_result()?
        {
            RpcResponse::Ok => Ok(()),
            other => Err(TesseraError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }
}
