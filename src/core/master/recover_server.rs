// src/core/master/recover_server.rs

//! The per-failed-server recovery operation.
//!
//! States: INITIAL -> ISSUE_REQUESTS -> FINALIZE -> DONE. INITIAL acquires
//! the failed server's Hyperspace lock (failure to acquire means the server
//! is actually alive and recovery aborts), parses its rsml and installs the
//! recovery plan. ISSUE_REQUESTS drives one RecoverRanges sub-operation per
//! non-empty range-type bucket, root before metadata before system before
//! user. FINALIZE tears the server's state down; success is permanent.

use super::MasterContext;
use super::recover_ranges::OperationRecoverRanges;
use crate::core::TesseraError;
use crate::core::hyperspace::{HandleId, try_lock_exclusive};
use crate::core::metalog::{
    Entity, MetalogReader, RecoverServerEntity, RecoverServerRangesEntity, RecoverState,
};
use crate::core::notification::Severity;
use crate::core::types::{Location, QualifiedRange, RangeState, RangeType};
use std::sync::Arc;
use tracing::{info, warn};

/// Consecutive failures after which the administrator is alerted. The
/// operation itself is never dropped.
const FAILURE_ALERT_THRESHOLD: u32 = 10;

pub struct OperationRecover {
    entity_id: u64,
    location: Location,
    state: RecoverState,
    ranges_by_type: [Vec<(QualifiedRange, RangeState)>; 4],
    hyperspace_handle: Option<HandleId>,
    sub_ops: Vec<OperationRecoverRanges>,
    consecutive_failures: u32,
}

impl OperationRecover {
    pub fn new(entity_id: u64, location: Location) -> Self {
        Self {
            entity_id,
            location,
            state: RecoverState::Initial,
            ranges_by_type: Default::default(),
            hyperspace_handle: None,
            sub_ops: Vec::new(),
            consecutive_failures: 0,
        }
    }

    /// Rebuilds the operation (and its sub-operations) from metalog entities
    /// after a coordinator restart.
    pub fn from_entities(
        entity: RecoverServerEntity,
        sub_entities: Vec<RecoverServerRangesEntity>,
    ) -> Self {
        let mut ranges_by_type: [Vec<(QualifiedRange, RangeState)>; 4] = Default::default();
        for (idx, bucket) in entity.ranges_by_type.into_iter().enumerate().take(4) {
            ranges_by_type[idx] = bucket;
        }
        let mut sub_ops: Vec<OperationRecoverRanges> = sub_entities
            .into_iter()
            .map(OperationRecoverRanges::from_entity)
            .collect();
        sub_ops.sort_by_key(|s| s.range_type().index());
        Self {
            entity_id: entity.id,
            location: entity.location,
            state: entity.state,
            ranges_by_type,
            hyperspace_handle: None,
            sub_ops,
            consecutive_failures: 0,
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn is_done(&self) -> bool {
        self.state == RecoverState::Done
    }

    /// Counts an execute() failure; the operation stays open but repeated
    /// failure raises an administrator alert.
    pub fn note_failure(&mut self, ctx: &Arc<MasterContext>, error: &TesseraError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures % FAILURE_ALERT_THRESHOLD == 0 {
            ctx.notifier.notify(
                Severity::Error,
                &format!("Recovery of {} keeps failing", self.location),
                &format!(
                    "RangeServer {} could not be recovered after {} attempts.\n\
                     Last error: {}\n\
                     Manual intervention may be required.",
                    self.location, self.consecutive_failures, error
                ),
            );
        }
    }

    pub async fn execute(&mut self, ctx: &Arc<MasterContext>) -> Result<(), TesseraError> {
        if self.state == RecoverState::Done {
            return Ok(());
        }

        if !self.acquire_server_lock(ctx).await? {
            // The server re-acquired its own lock: it restarted and is alive.
            info!(
                "RangeServer {} holds its own lock again, aborting recovery",
                self.location
            );
            ctx.rsc_manager.set_recovering(&self.location, false);
            self.state = RecoverState::Done;
            ctx.mml_writer.record_removal(self.entity_id).await?;
            return Ok(());
        }

        if self.state == RecoverState::Initial {
            self.notify_start(ctx);
            self.read_rsml(ctx).await?;
            ctx.bpa
                .create_recovery_plan(&self.location, self.ranges_by_type.clone())
                .await?;
            self.create_sub_ops(ctx);
            self.state = RecoverState::IssueRequests;
            self.persist(ctx).await?;
        }

        if self.state == RecoverState::IssueRequests {
            // Strict cross-type ordering: a sub-operation only runs once its
            // predecessor types are done.
            let mut all_done = true;
            for idx in 0..self.sub_ops.len() {
                if self.sub_ops[idx].is_done() {
                    continue;
                }
                self.sub_ops[idx].execute(ctx).await?;
                if !self.sub_ops[idx].is_done() {
                    all_done = false;
                    break;
                }
            }
            if !all_done {
                return Ok(());
            }
            self.state = RecoverState::Finalize;
            self.persist(ctx).await?;
        }

        if self.state == RecoverState::Finalize {
            self.clear_server_state(ctx).await?;
            self.state = RecoverState::Done;
            self.consecutive_failures = 0;
            ctx.notifier.notify(
                Severity::Notice,
                &format!("Recovery of {} complete", self.location),
                &format!(
                    "All ranges of RangeServer {} have been moved to other servers.",
                    self.location
                ),
            );
        }
        Ok(())
    }

    async fn acquire_server_lock(&mut self, ctx: &Arc<MasterContext>) -> Result<bool, TesseraError> {
        if self.hyperspace_handle.is_some() {
            return Ok(true);
        }
        let path = ctx.server_file(&self.location);
        match try_lock_exclusive(&ctx.hyperspace, ctx.hyperspace_session, &path).await {
            Ok(handle) => {
                info!("Acquired lock on '{}', starting recovery", path);
                ctx.hyperspace
                    .attr_set(handle, "removed", b"")
                    .await?;
                self.hyperspace_handle = Some(handle);
                Ok(true)
            }
            Err(TesseraError::LockConflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Parses the failed server's range-server metalog and buckets its ranges
    /// by type. Ranges that were themselves phantom are skipped (whoever was
    /// recovering them deals with them); their half-built transfer logs are
    /// removed.
    async fn read_rsml(&mut self, ctx: &Arc<MasterContext>) -> Result<(), TesseraError> {
        let rsml_path = format!("{}/log/rsml", ctx.server_file(&self.location));
        let entities = MetalogReader::read(&ctx.dfs, &rsml_path).await?;
        self.ranges_by_type = Default::default();
        for entity in entities.into_values() {
            let Entity::Range(range_entity) = entity else {
                continue;
            };
            if range_entity.state.is_phantom() {
                if let Some(transfer_log) = &range_entity.state.transfer_log {
                    if let Err(e) = ctx.dfs.rmdir(transfer_log).await {
                        warn!("Could not remove stale transfer log {}: {}", transfer_log, e);
                    }
                }
                continue;
            }
            let range = QualifiedRange::new(range_entity.table, range_entity.range);
            let idx = range.range_type().index();
            self.ranges_by_type[idx].push((range, range_entity.state));
        }
        for range_type in RangeType::ALL {
            let count = self.ranges_by_type[range_type.index()].len();
            if count > 0 {
                info!(
                    "{} {} ranges to recover for {}",
                    count, range_type, self.location
                );
            }
        }
        Ok(())
    }

    fn create_sub_ops(&mut self, ctx: &Arc<MasterContext>) {
        self.sub_ops = RangeType::ALL
            .into_iter()
            .filter(|t| !self.ranges_by_type[t.index()].is_empty())
            .map(|t| {
                OperationRecoverRanges::new(
                    ctx.mml_writer.next_entity_id(),
                    self.location.clone(),
                    t,
                )
            })
            .collect();
    }

    /// Permanent teardown: the failed server must manually delete its
    /// `run/location` file to rejoin.
    async fn clear_server_state(&mut self, ctx: &Arc<MasterContext>) -> Result<(), TesseraError> {
        for sub in &self.sub_ops {
            ctx.mml_writer.record_removal(sub.entity_id()).await?;
        }
        ctx.bpa.remove_recovery_plan(&self.location).await?;
        ctx.rsc_manager.erase_server(&self.location);
        if let Some(handle) = self.hyperspace_handle.take() {
            ctx.hyperspace.close(handle).await?;
        }
        ctx.hyperspace
            .unlink(&ctx.server_file(&self.location))
            .await?;
        ctx.mml_writer.record_removal(self.entity_id).await?;
        Ok(())
    }

    fn notify_start(&self, ctx: &Arc<MasterContext>) {
        let total = ctx.rsc_manager.server_count();
        let up = ctx.rsc_manager.connected_servers().len();
        let quorum = ctx.config.failover.quorum_percentage;
        let mut required = (total * quorum as usize) / 100;
        if required == 0 {
            required = 1;
        }
        ctx.notifier.notify(
            Severity::Notice,
            &format!("RangeServer {} is being recovered", self.location),
            &format!(
                "The RangeServer {} is no longer available and is about to be\n\
                 recovered. All of its ranges are moved to other machines.\n\
                 After fixing the failing node, delete the file \"run/location\"\n\
                 in its data directory before restarting it.\n\
                 \n\
                 {} server(s) total, {} up, {} down.\n\
                 Recovery continues only while at least {} servers ({}%) are running.",
                self.location,
                total,
                up,
                total - up,
                required,
                quorum
            ),
        );
    }

    async fn persist(&self, ctx: &Arc<MasterContext>) -> Result<(), TesseraError> {
        let mut entities: Vec<Entity> = self
            .sub_ops
            .iter()
            .map(|s| Entity::RecoverServerRanges(s.to_entity()))
            .collect();
        entities.push(Entity::RecoverServer(RecoverServerEntity {
            id: self.entity_id,
            location: self.location.clone(),
            state: self.state,
            ranges_by_type: self.ranges_by_type.to_vec(),
        }));
        ctx.mml_writer.record_states(&entities).await
    }
}
