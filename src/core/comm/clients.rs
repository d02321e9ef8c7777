// src/core/comm/clients.rs

//! Typed client wrappers over the raw RPC transport.

use super::{CommRegistry, RpcClient};
use crate::core::TesseraError;
use crate::core::balance::ReceiverPlan;
use crate::core::master::connection_manager::RangeServerConnectionManager;
use crate::core::protocol::{RpcRequest, RpcResponse, WireError};
use crate::core::types::{FragmentId, Location, QualifiedRange, RangeState, RangeType};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Client the coordinator uses to drive destination range servers, resolving
/// proxy names through the connection manager.
pub struct RangeServerClient {
    registry: Arc<CommRegistry>,
    rsc_manager: Arc<RangeServerConnectionManager>,
    timeout: Duration,
}

impl RangeServerClient {
    pub fn new(
        registry: Arc<CommRegistry>,
        rsc_manager: Arc<RangeServerConnectionManager>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            rsc_manager,
            timeout,
        }
    }

    fn resolve(&self, location: &Location) -> Result<Arc<RpcClient>, TesseraError> {
        let addr = self
            .rsc_manager
            .addr_of(location)
            .ok_or_else(|| TesseraError::Connection(format!("no address for {location}")))?;
        Ok(self.registry.get(addr))
    }

    async fn call_ok(
        &self,
        location: &Location,
        request: RpcRequest,
    ) -> Result<(), TesseraError> {
        let client = self.resolve(location)?;
        match client.call(request, self.timeout).await?.into_result()? {
            RpcResponse::Ok => Ok(()),
            other => Err(TesseraError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }

    pub async fn phantom_load(
        &self,
        dest: &Location,
        source: &Location,
        plan_generation: u32,
        fragments: Vec<FragmentId>,
        ranges: Vec<QualifiedRange>,
        states: Vec<RangeState>,
    ) -> Result<(), TesseraError> {
        self.call_ok(
            dest,
            RpcRequest::PhantomLoad {
                source: source.clone(),
                plan_generation,
                fragments,
                ranges,
                states,
            },
        )
        .await
    }

    pub async fn phantom_update(
        &self,
        dest: &Location,
        source: &Location,
        plan_generation: u32,
        range: QualifiedRange,
        fragment: FragmentId,
        payload: Vec<u8>,
    ) -> Result<(), TesseraError> {
        self.call_ok(
            dest,
            RpcRequest::PhantomUpdate {
                source: source.clone(),
                plan_generation,
                range,
                fragment,
                payload,
            },
        )
        .await
    }

    pub async fn phantom_prepare_ranges(
        &self,
        dest: &Location,
        op_id: u64,
        source: &Location,
        plan_generation: u32,
        ranges: Vec<QualifiedRange>,
    ) -> Result<(), TesseraError> {
        self.call_ok(
            dest,
            RpcRequest::PhantomPrepareRanges {
                op_id,
                source: source.clone(),
                plan_generation,
                ranges,
            },
        )
        .await
    }

    pub async fn phantom_commit_ranges(
        &self,
        dest: &Location,
        op_id: u64,
        source: &Location,
        plan_generation: u32,
        ranges: Vec<QualifiedRange>,
    ) -> Result<(), TesseraError> {
        self.call_ok(
            dest,
            RpcRequest::PhantomCommitRanges {
                op_id,
                source: source.clone(),
                plan_generation,
                ranges,
            },
        )
        .await
    }

    pub async fn acknowledge_load(
        &self,
        dest: &Location,
        ranges: Vec<QualifiedRange>,
    ) -> Result<Vec<(QualifiedRange, Option<WireError>)>, TesseraError> {
        let client = self.resolve(dest)?;
        match client
            .call(RpcRequest::AcknowledgeLoad { ranges }, self.timeout)
            .await?
            .into_result()?
        {
            RpcResponse::AcknowledgeLoad { results } => Ok(results),
            other => Err(TesseraError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn replay_fragments(
        &self,
        dest: &Location,
        op_id: u64,
        attempt: u32,
        source: &Location,
        range_type: RangeType,
        plan_generation: u32,
        fragments: Vec<FragmentId>,
        receiver_plan: ReceiverPlan,
        replay_timeout: Duration,
    ) -> Result<(), TesseraError> {
        // The destination streams key/value batches straight to the
        // receivers, so it gets their proxy names resolved up front.
        let receiver_addrs = receiver_plan
            .locations()
            .into_iter()
            .filter_map(|loc| {
                self.rsc_manager
                    .addr_of(&loc)
                    .map(|addr| (loc, addr.to_string()))
            })
            .collect();
        self.call_ok(
            dest,
            RpcRequest::ReplayFragments {
                op_id,
                attempt,
                source: source.clone(),
                range_type,
                plan_generation,
                fragments,
                receiver_plan,
                receiver_addrs,
                replay_timeout_ms: replay_timeout.as_millis() as u64,
            },
        )
        .await
    }
}

/// Client a range server uses to talk back to the coordinator.
pub struct MasterClient {
    client: Arc<RpcClient>,
    timeout: Duration,
}

impl MasterClient {
    pub fn new(registry: &CommRegistry, addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            client: registry.get(addr),
            timeout,
        }
    }

    async fn call_ok(&self, request: RpcRequest) -> Result<(), TesseraError> {
        match self
            .client
            .call(request, self.timeout)
            .await?
            .into_result()?
        {
            RpcResponse::Ok => Ok(()),
            other => Err(TesseraError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }

    pub async fn register_server(
        &self,
        location: &Location,
        hostname: &str,
        port: u16,
    ) -> Result<(), TesseraError> {
        self.call_ok(RpcRequest::RegisterServer {
            location: location.clone(),
            hostname: hostname.to_string(),
            port,
        })
        .await
    }

    pub async fn phantom_prepare_complete(
        &self,
        op_id: u64,
        location: &Location,
        plan_generation: u32,
        error: Option<WireError>,
    ) -> Result<(), TesseraError> {
        self.call_ok(RpcRequest::PhantomPrepareComplete {
            op_id,
            location: location.clone(),
            plan_generation,
            error,
        })
        .await
    }

    pub async fn phantom_commit_complete(
        &self,
        op_id: u64,
        location: &Location,
        plan_generation: u32,
        error: Option<WireError>,
    ) -> Result<(), TesseraError> {
        self.call_ok(RpcRequest::PhantomCommitComplete {
            op_id,
            location: location.clone(),
            plan_generation,
            error,
        })
        .await
    }

    pub async fn replay_complete(
        &self,
        op_id: u64,
        attempt: u32,
        location: &Location,
        plan_generation: u32,
        fragment_errors: Vec<(FragmentId, WireError)>,
        success: bool,
    ) -> Result<(), TesseraError> {
        self.call_ok(RpcRequest::ReplayComplete {
            op_id,
            attempt,
            location: location.clone(),
            plan_generation,
            fragment_errors,
            success,
        })
        .await
    }

    pub async fn replay_status(
        &self,
        op_id: u64,
        attempt: u32,
        location: &Location,
        plan_generation: u32,
    ) -> Result<(), TesseraError> {
        self.call_ok(RpcRequest::ReplayStatus {
            op_id,
            attempt,
            location: location.clone(),
            plan_generation,
        })
        .await
    }
}
