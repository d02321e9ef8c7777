// src/core/protocol/messages.rs

//! Request and response payloads for every command the core exposes.

use super::{RpcHeader, command};
use crate::core::TesseraError;
use crate::core::balance::ReceiverPlan;
use crate::core::metalog::SchemaUpdateKind;
use crate::core::types::{FragmentId, Location, QualifiedRange, RangeState, RangeType};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Errors that cross the wire. A compact mirror of the `TesseraError` kinds
/// the calling state machines dispatch on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum WireError {
    RangesAlreadyLive(String),
    RangeNotFound(String),
    TableNotFound(String),
    GenerationMismatch { supplied: u32, installed: u32 },
    PlanGenerationMismatch { supplied: u32, installed: u32 },
    PhantomRangeMapNotFound(String),
    FragmentAlreadyProcessed(String),
    RequestTimeout(String),
    CorruptCommitLog(String),
    BadKey(String),
    ClockSkewExceeded,
    ReplicationClusterNotFound(String),
    ShuttingDown,
    Other(String),
}

impl From<&TesseraError> for WireError {
    fn from(e: &TesseraError) -> Self {
        match e {
            TesseraError::RangesAlreadyLive(s) => WireError::RangesAlreadyLive(s.clone()),
            TesseraError::RangeNotFound(s) => WireError::RangeNotFound(s.clone()),
            TesseraError::TableNotFound(s) => WireError::TableNotFound(s.clone()),
            TesseraError::GenerationMismatch {
                supplied,
                installed,
            } => WireError::GenerationMismatch {
                supplied: *supplied,
                installed: *installed,
            },
            TesseraError::PlanGenerationMismatch {
                supplied,
                installed,
            } => WireError::PlanGenerationMismatch {
                supplied: *supplied,
                installed: *installed,
            },
            TesseraError::PhantomRangeMapNotFound(loc) => {
                WireError::PhantomRangeMapNotFound(loc.as_str().to_string())
            }
            TesseraError::FragmentAlreadyProcessed(s) => {
                WireError::FragmentAlreadyProcessed(s.clone())
            }
            TesseraError::RequestTimeout(s) => WireError::RequestTimeout(s.clone()),
            TesseraError::CorruptCommitLog(s) => WireError::CorruptCommitLog(s.clone()),
            TesseraError::BadKey(s) => WireError::BadKey(s.clone()),
            TesseraError::ClockSkewExceeded => WireError::ClockSkewExceeded,
            TesseraError::ReplicationClusterNotFound(s) => {
                WireError::ReplicationClusterNotFound(s.clone())
            }
            TesseraError::ShuttingDown => WireError::ShuttingDown,
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for TesseraError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::RangesAlreadyLive(s) => TesseraError::RangesAlreadyLive(s),
            WireError::RangeNotFound(s) => TesseraError::RangeNotFound(s),
            WireError::TableNotFound(s) => TesseraError::TableNotFound(s),
            WireError::GenerationMismatch {
                supplied,
                installed,
            } => TesseraError::GenerationMismatch {
                supplied,
                installed,
            },
            WireError::PlanGenerationMismatch {
                supplied,
                installed,
            } => TesseraError::PlanGenerationMismatch {
                supplied,
                installed,
            },
            WireError::PhantomRangeMapNotFound(s) => {
                TesseraError::PhantomRangeMapNotFound(Location::new(s))
            }
            WireError::FragmentAlreadyProcessed(s) => TesseraError::FragmentAlreadyProcessed(s),
            WireError::RequestTimeout(s) => TesseraError::RequestTimeout(s),
            WireError::CorruptCommitLog(s) => TesseraError::CorruptCommitLog(s),
            WireError::BadKey(s) => TesseraError::BadKey(s),
            WireError::ClockSkewExceeded => TesseraError::ClockSkewExceeded,
            WireError::ReplicationClusterNotFound(s) => {
                TesseraError::ReplicationClusterNotFound(s)
            }
            WireError::ShuttingDown => TesseraError::ShuttingDown,
            WireError::Other(s) => TesseraError::Internal(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum RpcRequest {
    // --- Recovery: coordinator -> destination range server ---
    PhantomLoad {
        source: Location,
        plan_generation: u32,
        fragments: Vec<FragmentId>,
        ranges: Vec<QualifiedRange>,
        states: Vec<RangeState>,
    },
    PhantomUpdate {
        source: Location,
        plan_generation: u32,
        range: QualifiedRange,
        fragment: FragmentId,
        payload: Vec<u8>,
    },
    PhantomPrepareRanges {
        op_id: u64,
        source: Location,
        plan_generation: u32,
        ranges: Vec<QualifiedRange>,
    },
    PhantomCommitRanges {
        op_id: u64,
        source: Location,
        plan_generation: u32,
        ranges: Vec<QualifiedRange>,
    },
    AcknowledgeLoad {
        ranges: Vec<QualifiedRange>,
    },
    ReplayFragments {
        op_id: u64,
        attempt: u32,
        source: Location,
        range_type: RangeType,
        plan_generation: u32,
        fragments: Vec<FragmentId>,
        receiver_plan: ReceiverPlan,
        /// Proxy-name resolution for the receivers in the plan.
        receiver_addrs: Vec<(Location, String)>,
        replay_timeout_ms: u64,
    },

    // --- Recovery: destination -> coordinator (async completions) ---
    PhantomPrepareComplete {
        op_id: u64,
        location: Location,
        plan_generation: u32,
        error: Option<WireError>,
    },
    PhantomCommitComplete {
        op_id: u64,
        location: Location,
        plan_generation: u32,
        error: Option<WireError>,
    },
    ReplayComplete {
        op_id: u64,
        attempt: u32,
        location: Location,
        plan_generation: u32,
        fragment_errors: Vec<(FragmentId, WireError)>,
        success: bool,
    },
    ReplayStatus {
        op_id: u64,
        attempt: u32,
        location: Location,
        plan_generation: u32,
    },

    /// Range server announcing itself to the coordinator.
    RegisterServer {
        location: Location,
        hostname: String,
        port: u16,
    },

    // --- Replication master <-> slave ---
    AssignFragments {
        location: Location,
        host: String,
        port: u16,
    },
    FinishedFragment {
        fragment: String,
        error: Option<WireError>,
        offset: u64,
        linked_logs: Vec<String>,
    },
    GetReceiverList,
    NotifySchemaUpdate {
        kind: SchemaUpdateKind,
        table_name: String,
        table_id: String,
        schema_json: String,
    },
    ApplySchemaUpdate {
        kind: SchemaUpdateKind,
        table_name: String,
        schema_json: String,
    },

    // --- Slave -> remote slave ---
    SlaveUpdate {
        table_name: String,
        payload: Vec<u8>,
    },

    Status,
    Shutdown,
}

impl RpcRequest {
    pub fn command_code(&self) -> u16 {
        match self {
            RpcRequest::PhantomLoad { .. } => command::PHANTOM_LOAD,
            RpcRequest::PhantomUpdate { .. } => command::PHANTOM_UPDATE,
            RpcRequest::PhantomPrepareRanges { .. } => command::PHANTOM_PREPARE_RANGES,
            RpcRequest::PhantomCommitRanges { .. } => command::PHANTOM_COMMIT_RANGES,
            RpcRequest::AcknowledgeLoad { .. } => command::ACKNOWLEDGE_LOAD,
            RpcRequest::ReplayFragments { .. } => command::REPLAY_FRAGMENTS,
            RpcRequest::PhantomPrepareComplete { .. } => command::PHANTOM_PREPARE_COMPLETE,
            RpcRequest::PhantomCommitComplete { .. } => command::PHANTOM_COMMIT_COMPLETE,
            RpcRequest::ReplayComplete { .. } => command::REPLAY_COMPLETE,
            RpcRequest::ReplayStatus { .. } => command::REPLAY_STATUS,
            RpcRequest::RegisterServer { .. } => command::REGISTER_SERVER,
            RpcRequest::AssignFragments { .. } => command::ASSIGN_FRAGMENTS,
            RpcRequest::FinishedFragment { .. } => command::FINISHED_FRAGMENT,
            RpcRequest::GetReceiverList => command::GET_RECEIVER_LIST,
            RpcRequest::NotifySchemaUpdate { .. } => command::NOTIFY_SCHEMA_UPDATE,
            RpcRequest::ApplySchemaUpdate { .. } => command::APPLY_SCHEMA_UPDATE,
            RpcRequest::SlaveUpdate { .. } => command::SLAVE_UPDATE,
            RpcRequest::Status => command::STATUS,
            RpcRequest::Shutdown => command::SHUTDOWN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum RpcResponse {
    Ok,
    Error(WireError),
    /// Per-range acknowledge results; `None` means acknowledged.
    AcknowledgeLoad {
        results: Vec<(QualifiedRange, Option<WireError>)>,
    },
    /// Everything a replication slave needs for its next round of work.
    AssignFragments {
        fragments: Vec<String>,
        clusters: Vec<(String, Vec<String>)>,
        table_routes: Vec<(String, Vec<String>)>,
        table_names: Vec<(String, String)>,
    },
    ReceiverList {
        slaves: Vec<String>,
    },
    Status {
        text: String,
    },
}

impl RpcResponse {
    /// Collapses a response into the `Result` shape the typed clients expose.
    pub fn into_result(self) -> Result<RpcResponse, TesseraError> {
        match self {
            RpcResponse::Error(e) => Err(e.into()),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum RpcBody {
    Request(RpcRequest),
    Response(RpcResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Envelope {
    pub header: RpcHeader,
    pub body: RpcBody,
}

impl Envelope {
    pub fn request(id: u64, timeout_ms: u32, request: RpcRequest) -> Self {
        Self {
            header: RpcHeader::request(request.command_code(), id, timeout_ms),
            body: RpcBody::Request(request),
        }
    }

    pub fn response(id: u64, response: RpcResponse) -> Self {
        Self {
            header: RpcHeader::response(id),
            body: RpcBody::Response(response),
        }
    }
}
