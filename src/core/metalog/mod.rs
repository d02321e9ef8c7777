// src/core/metalog/mod.rs

//! The metalog: an append-only log of state-machine entities on the DFS,
//! used to recover in-process state across restarts.
//!
//! Every persisted record is one variant of the [`Entity`] enum; encode and
//! decode dispatch on the tag. Each range server keeps its own metalog (the
//! rsml), the coordinator keeps one for the balance plan authority and open
//! recovery operations, and the replication master persists its scan state
//! as a single entity.

pub mod reader;
pub mod writer;

pub use reader::MetalogReader;
pub use writer::MetalogWriter;

use crate::core::types::{Location, QualifiedRange, RangeSpec, RangeState, RangeType, TableId};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Persisted states of the per-server recovery operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum RecoverState {
    Initial,
    IssueRequests,
    Finalize,
    Done,
}

/// Persisted states of a per-range-type recovery sub-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum RecoverRangesState {
    Initial,
    PhantomLoad,
    ReplayFragments,
    Prepare,
    Commit,
    Acknowledge,
    Done,
}

/// A range as persisted in the range-server metalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RangeEntity {
    pub id: u64,
    pub table: TableId,
    pub range: RangeSpec,
    pub state: RangeState,
    pub needs_compaction: bool,
    pub load_acknowledged: bool,
    /// Transfer log of the range before a split/relinquish was interrupted.
    pub original_transfer_log: Option<String>,
}

/// The set of transfer-log directories that are safe to purge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RemoveOkLogsEntity {
    pub id: u64,
    pub log_dirs: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RecoverServerEntity {
    pub id: u64,
    pub location: Location,
    pub state: RecoverState,
    /// Ranges read from the failed server's rsml, bucketed by range type.
    pub ranges_by_type: Vec<Vec<(QualifiedRange, RangeState)>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RecoverServerRangesEntity {
    pub id: u64,
    pub location: Location,
    pub range_type: RangeType,
    pub attempt: u32,
    pub state: RecoverRangesState,
}

/// The balance plan authority's entire persisted state; rewritten in full on
/// every mutation so readers always observe a consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct BalancePlanAuthorityEntity {
    pub id: u64,
    pub generation: u32,
    pub plans: Vec<(Location, Vec<Option<crate::core::balance::RecoveryPlan>>)>,
    pub moves: Vec<crate::core::types::RangeMoveSpec>,
}

/// Everything the replication master needs to resume scanning after restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct ReplicationMasterEntity {
    pub id: u64,
    pub known_clusters: BTreeSet<String>,
    pub unassigned_fragments: BTreeSet<String>,
    pub assigned_fragments: BTreeMap<String, Location>,
    pub finished_fragments: BTreeSet<String>,
    pub table_generations: BTreeMap<String, u32>,
    pub replicated_tables: BTreeMap<String, Vec<String>>,
    pub table_names: BTreeMap<String, String>,
    pub linked_logs: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum SchemaUpdateKind {
    CreateTable,
    AlterTable,
    DropTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SchemaUpdateEntity {
    pub id: u64,
    pub kind: SchemaUpdateKind,
    pub table_name: String,
    pub table_id: String,
    pub schema_json: String,
}

/// Pending asynchronous work queued through the metalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum TaskKind {
    RemoveTransferLog {
        log_dir: String,
    },
    AcknowledgeRelinquish {
        location: Location,
        table: TableId,
        range: RangeSpec,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct TaskEntity {
    pub id: u64,
    pub task: TaskKind,
}

/// The tagged-variant entity written to every metalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum Entity {
    Range(RangeEntity),
    RemoveOkLogs(RemoveOkLogsEntity),
    BalancePlanAuthority(BalancePlanAuthorityEntity),
    RecoverServer(RecoverServerEntity),
    RecoverServerRanges(RecoverServerRangesEntity),
    ReplicationMasterState(ReplicationMasterEntity),
    SchemaUpdate(SchemaUpdateEntity),
    Task(TaskEntity),
}

impl Entity {
    pub fn id(&self) -> u64 {
        match self {
            Entity::Range(e) => e.id,
            Entity::RemoveOkLogs(e) => e.id,
            Entity::BalancePlanAuthority(e) => e.id,
            Entity::RecoverServer(e) => e.id,
            Entity::RecoverServerRanges(e) => e.id,
            Entity::ReplicationMasterState(e) => e.id,
            Entity::SchemaUpdate(e) => e.id,
            Entity::Task(e) => e.id,
        }
    }
}

/// One framed record in the log: a full entity state or a removal tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum Record {
    State(Entity),
    Removal(u64),
}
